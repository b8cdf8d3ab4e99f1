//! Copy, move and folder download across providers.
//!
//! Backends that can do a copy or move themselves (same bucket, same
//! directory tree) are asked to. Everything else is relayed: the source is
//! downloaded, hashed on the way through, and uploaded to the destination
//! one chunk at a time as the destination pulls. A move deletes its source
//! only after the destination confirmed the upload.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use stowage_common::{Error, Metadata, Result, StoragePath};
use stowage_stream::{HashStream, HashWriter, ZipCompression, ZipEntry, ZipStream};

use crate::provider::{ConflictPolicy, DownloadOptions, Provider};

/// Extensions whose content is already compressed; zipped without deflate.
const COMPRESSED_EXTENSIONS: &[&str] = &[
    ".7z", ".bz2", ".gif", ".gz", ".jpeg", ".jpg", ".mov", ".mp3", ".mp4", ".png", ".rar",
    ".webm", ".webp", ".xz", ".zip",
];

/// Copy or move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferKind {
    Copy,
    Move,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::Copy => "copy",
            TransferKind::Move => "move",
        })
    }
}

/// Naming options for a copy or move.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Name to give the object when `dst` is a folder.
    #[serde(default)]
    pub rename: Option<String>,
    #[serde(default)]
    pub conflict: ConflictPolicy,
}

impl TransferOptions {
    pub fn with_rename(mut self, rename: impl Into<String>) -> Self {
        self.rename = Some(rename.into());
        self
    }

    pub fn with_conflict(mut self, conflict: ConflictPolicy) -> Self {
        self.conflict = conflict;
        self
    }
}

/// Copy `src` on `source` to `dst` on `dest`.
///
/// A folder `dst` receives the object under its own name (or
/// `options.rename`). Returns the new metadata and whether the destination
/// object was created rather than overwritten.
pub async fn copy(
    source: &dyn Provider,
    dest: &dyn Provider,
    src: &StoragePath,
    dst: &StoragePath,
    options: &TransferOptions,
) -> Result<(Metadata, bool)> {
    transfer(TransferKind::Copy, source, dest, src, dst, options).await
}

/// Move `src` on `source` to `dst` on `dest`. See [`copy`].
pub async fn move_(
    source: &dyn Provider,
    dest: &dyn Provider,
    src: &StoragePath,
    dst: &StoragePath,
    options: &TransferOptions,
) -> Result<(Metadata, bool)> {
    transfer(TransferKind::Move, source, dest, src, dst, options).await
}

/// Run a copy or move.
pub async fn transfer(
    kind: TransferKind,
    source: &dyn Provider,
    dest: &dyn Provider,
    src: &StoragePath,
    dst: &StoragePath,
    options: &TransferOptions,
) -> Result<(Metadata, bool)> {
    if !dest.capabilities().writable {
        return Err(Error::ReadOnlyProvider(dest.name().to_string()));
    }
    if kind == TransferKind::Move {
        if !source.capabilities().writable {
            return Err(Error::ReadOnlyProvider(source.name().to_string()));
        }
        if src.is_root() {
            return Err(Error::InvalidInput(
                "The root folder of a provider cannot be moved".to_string(),
            ));
        }
    }

    let (target, exists) = dest
        .handle_naming(src, dst, options.rename.as_deref(), options.conflict)
        .await?;
    if target.is_root() {
        return Err(Error::InvalidInput(format!(
            "Cannot {} onto the root folder of {}",
            kind,
            dest.name()
        )));
    }

    if source.shares_storage_root(dest)
        && (target.materialized_path() == src.materialized_path() || target.is_descendant_of(src))
    {
        return Err(Error::InvalidInput(format!(
            "Cannot {} {} onto {}",
            kind,
            src.materialized_path(),
            target.materialized_path()
        )));
    }

    let native = match kind {
        TransferKind::Copy => source.can_intra_copy(dest, src),
        TransferKind::Move => source.can_intra_move(dest, src),
    };
    info!(
        "{} {}:{} -> {}:{} ({})",
        kind,
        source.name(),
        src.materialized_path(),
        dest.name(),
        target.materialized_path(),
        if native { "native" } else { "relay" }
    );

    if native {
        return match kind {
            TransferKind::Copy => source.intra_copy(dest, src, &target).await,
            TransferKind::Move => source.intra_move(dest, src, &target).await,
        };
    }

    let metadata = relay(source, dest, src, &target, exists).await?;
    if kind == TransferKind::Move {
        source.delete(src, false).await?;
        debug!("Deleted moved source {}", src.materialized_path());
    }
    Ok((metadata, !exists))
}

/// Download-and-upload `src` to `dst`, recursing into folders.
fn relay<'a>(
    source: &'a dyn Provider,
    dest: &'a dyn Provider,
    src: &'a StoragePath,
    dst: &'a StoragePath,
    exists: bool,
) -> BoxFuture<'a, Result<Metadata>> {
    Box::pin(async move {
        if src.is_folder() {
            relay_folder(source, dest, src, dst, exists).await
        } else {
            relay_file(source, dest, src, dst).await
        }
    })
}

async fn relay_folder(
    source: &dyn Provider,
    dest: &dyn Provider,
    src: &StoragePath,
    dst: &StoragePath,
    exists: bool,
) -> Result<Metadata> {
    if exists {
        dest.delete(dst, false).await?;
    }
    let folder = dest.create_folder(dst).await?;

    let listing = source
        .metadata(src, None)
        .await?
        .listing()
        .ok_or_else(|| Error::NotFound(src.materialized_path()))?;

    let mut children = Vec::with_capacity(listing.len());
    for child in listing {
        let child_src = source
            .revalidate_path(src, child.name(), child.is_folder())
            .await?;
        let child_dst = dest
            .revalidate_path(dst, child.name(), child.is_folder())
            .await?;
        children.push(relay(source, dest, &child_src, &child_dst, false).await?);
    }

    Ok(match folder {
        Metadata::Folder(folder) => Metadata::Folder(folder.with_children(children)),
        other => other,
    })
}

async fn relay_file(
    source: &dyn Provider,
    dest: &dyn Provider,
    src: &StoragePath,
    dst: &StoragePath,
) -> Result<Metadata> {
    let stream = source.download(src, DownloadOptions::default()).await?;
    let md5 = HashWriter::md5();
    let stream = HashStream::new(stream).with_writer(md5.clone());

    let (metadata, _) = dest
        .upload(Box::new(stream), dst, ConflictPolicy::Replace)
        .await?;

    let observed = md5.hexdigest();
    if let Some(reported) = metadata.hash("md5") {
        if reported != observed {
            warn!(
                "Checksum mismatch relaying {} to {}: sent {}, destination has {}",
                src.materialized_path(),
                dst.materialized_path(),
                observed,
                reported
            );
            return Err(Error::UploadChecksumMismatch {
                algorithm: "md5".to_string(),
                expected: observed,
                actual: reported.to_string(),
            });
        }
    }
    debug!(
        "Relayed {} bytes to {}",
        md5.bytes_written(),
        dst.materialized_path()
    );
    Ok(metadata)
}

/// Stream a file or folder tree from `provider` as a zip archive.
///
/// The tree is listed up front; file contents are opened one at a time as
/// the archive is read. Empty folders get directory entries.
pub async fn zip(provider: Arc<dyn Provider>, path: &StoragePath) -> Result<ZipStream> {
    if path.is_file() {
        let modified = provider
            .metadata(path, None)
            .await?
            .entry()
            .and_then(|m| m.modified_utc());
        return Ok(ZipStream::new(vec![zip_file_entry(
            provider,
            path.clone(),
            path.name().to_string(),
            modified,
        )]));
    }

    let mut entries = Vec::new();
    let mut pending = VecDeque::from([path.clone()]);
    while let Some(folder) = pending.pop_front() {
        let listing = provider
            .metadata(&folder, None)
            .await?
            .listing()
            .ok_or_else(|| Error::NotFound(folder.materialized_path()))?;

        if listing.is_empty() && folder != *path {
            let name = folder.relative_to(path).unwrap_or_default().join("/");
            entries.push(ZipEntry::directory(name));
            continue;
        }

        for child in listing {
            let child_path = provider
                .revalidate_path(&folder, child.name(), child.is_folder())
                .await?;
            if child.is_folder() {
                pending.push_back(child_path);
            } else {
                let name = child_path.relative_to(path).unwrap_or_default().join("/");
                entries.push(zip_file_entry(
                    provider.clone(),
                    child_path,
                    name,
                    child.modified_utc(),
                ));
            }
        }
    }

    debug!(
        "Zipping {} entries from {}:{}",
        entries.len(),
        provider.name(),
        path.materialized_path()
    );
    Ok(ZipStream::new(entries))
}

fn zip_file_entry(
    provider: Arc<dyn Provider>,
    path: StoragePath,
    name: String,
    modified: Option<chrono::DateTime<chrono::Utc>>,
) -> ZipEntry {
    let compression = if is_compressed(&name) {
        ZipCompression::Stored
    } else {
        ZipCompression::Deflated
    };
    let entry = ZipEntry::deferred(name, move || async move {
        provider.download(&path, DownloadOptions::default()).await
    })
    .with_compression(compression);
    match modified {
        Some(modified) => entry.with_modified(modified),
        None => entry,
    }
}

fn is_compressed(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    COMPRESSED_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use crate::readonly::ReadOnlyProvider;
    use async_trait::async_trait;
    use stowage_common::MetadataResponse;
    use stowage_stream::{read_to_end, BoxStream, StringStream};

    fn path(raw: &str) -> StoragePath {
        StoragePath::parse(raw).unwrap()
    }

    async fn put(provider: &dyn Provider, raw: &str, data: &'static str) {
        provider
            .upload(Box::new(StringStream::new(data)), &path(raw), ConflictPolicy::Replace)
            .await
            .unwrap();
    }

    async fn read(provider: &dyn Provider, raw: &str) -> Vec<u8> {
        let mut stream = provider
            .download(&path(raw), DownloadOptions::default())
            .await
            .unwrap();
        read_to_end(&mut stream, 7).await.unwrap().to_vec()
    }

    /// Destination that reports a digest other than the one it was sent.
    struct Corrupting(MemoryProvider);

    #[async_trait]
    impl Provider for Corrupting {
        fn name(&self) -> &str {
            "corrupting"
        }

        async fn validate_path(&self, raw: &str) -> Result<StoragePath> {
            self.0.validate_path(raw).await
        }

        async fn metadata(
            &self,
            path: &StoragePath,
            revision: Option<&str>,
        ) -> Result<MetadataResponse> {
            self.0.metadata(path, revision).await
        }

        async fn download(
            &self,
            path: &StoragePath,
            options: DownloadOptions,
        ) -> Result<BoxStream> {
            self.0.download(path, options).await
        }

        async fn upload(
            &self,
            stream: BoxStream,
            path: &StoragePath,
            conflict: ConflictPolicy,
        ) -> Result<(Metadata, bool)> {
            let (metadata, created) = self.0.upload(stream, path, conflict).await?;
            let Metadata::File(file) = metadata else {
                return Ok((metadata, created));
            };
            Ok((Metadata::File(file.with_hash("md5", "0".repeat(32))), created))
        }

        async fn delete(&self, path: &StoragePath, confirm_root_delete: bool) -> Result<()> {
            self.0.delete(path, confirm_root_delete).await
        }
    }

    #[tokio::test]
    async fn test_relay_copy_between_stores() {
        let source = MemoryProvider::new().named("left");
        let dest = MemoryProvider::new().named("right");
        put(&source, "/docs/a.txt", "alpha").await;
        put(&source, "/docs/sub/b.txt", "beta").await;

        assert!(!source.can_intra_copy(&dest, &path("/docs/")));
        let (metadata, created) = copy(
            &source,
            &dest,
            &path("/docs/"),
            &path("/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap();

        assert!(created);
        assert!(metadata.is_folder());
        assert_eq!(metadata.provider(), "right");
        assert_eq!(read(&dest, "/docs/sub/b.txt").await, b"beta");
        assert_eq!(read(&source, "/docs/a.txt").await, b"alpha");
    }

    #[tokio::test]
    async fn test_relay_move_deletes_source_after_upload() {
        let source = MemoryProvider::new();
        let dest = MemoryProvider::new();
        put(&source, "/a.txt", "alpha").await;

        let (metadata, created) = move_(
            &source,
            &dest,
            &path("/a.txt"),
            &path("/b.txt"),
            &TransferOptions::default(),
        )
        .await
        .unwrap();

        assert!(created);
        assert_eq!(metadata.name(), "b.txt");
        assert!(!source.exists(&path("/a.txt")).await.unwrap());
        assert_eq!(read(&dest, "/b.txt").await, b"alpha");
    }

    #[tokio::test]
    async fn test_rename_and_overwrite_flag() {
        let source = MemoryProvider::new();
        let dest = MemoryProvider::new();
        put(&source, "/a.txt", "alpha").await;
        put(&dest, "/target/renamed.txt", "old").await;

        let options = TransferOptions::default().with_rename("renamed.txt");
        let (metadata, created) = copy(&source, &dest, &path("/a.txt"), &path("/target/"), &options)
            .await
            .unwrap();

        assert!(!created);
        assert_eq!(metadata.path(), "/target/renamed.txt");
        assert_eq!(read(&dest, "/target/renamed.txt").await, b"alpha");
    }

    #[tokio::test]
    async fn test_warn_conflict_fails_fast() {
        let source = MemoryProvider::new();
        let dest = MemoryProvider::new();
        put(&source, "/a.txt", "alpha").await;
        put(&dest, "/a.txt", "taken").await;

        let options = TransferOptions::default().with_conflict(ConflictPolicy::Warn);
        let err = copy(&source, &dest, &path("/a.txt"), &path("/"), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamingConflict(_)));
        assert_eq!(read(&dest, "/a.txt").await, b"taken");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_move_source() {
        let source = MemoryProvider::new();
        let dest = Corrupting(MemoryProvider::new());
        put(&source, "/a.txt", "alpha").await;

        let err = move_(
            &source,
            &dest,
            &path("/a.txt"),
            &path("/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::UploadChecksumMismatch { .. }));
        assert!(source.exists(&path("/a.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_refuses_to_copy_folder_into_itself() {
        let provider = MemoryProvider::new();
        put(&provider, "/dir/a.txt", "alpha").await;

        let err = copy(
            &provider,
            &provider,
            &path("/dir/"),
            &path("/dir/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_copy_root_contents_into_folder() {
        let source = MemoryProvider::new().named("left");
        let dest = MemoryProvider::new().named("right");
        put(&source, "/a.txt", "alpha").await;
        put(&source, "/docs/b.txt", "beta").await;

        let (metadata, created) = copy(
            &source,
            &dest,
            &StoragePath::root(),
            &path("/backup/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap();

        assert!(created);
        assert_eq!(metadata.path(), "/backup/");
        assert_eq!(read(&dest, "/backup/a.txt").await, b"alpha");
        assert_eq!(read(&dest, "/backup/docs/b.txt").await, b"beta");

        let options = TransferOptions::default().with_rename("snapshot");
        let (metadata, _) = copy(&source, &dest, &StoragePath::root(), &path("/"), &options)
            .await
            .unwrap();
        assert_eq!(metadata.path(), "/snapshot/");
        assert_eq!(read(&dest, "/snapshot/docs/b.txt").await, b"beta");
    }

    #[tokio::test]
    async fn test_copy_root_onto_root_or_itself_refused() {
        let source = MemoryProvider::new();
        let dest = MemoryProvider::new();
        put(&source, "/a.txt", "alpha").await;
        put(&dest, "/keep.txt", "mine").await;

        let err = copy(
            &source,
            &dest,
            &StoragePath::root(),
            &StoragePath::root(),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(read(&dest, "/keep.txt").await, b"mine");

        let err = copy(
            &source,
            &source,
            &StoragePath::root(),
            &path("/backup/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!source.exists(&path("/backup/")).await.unwrap());
    }

    #[tokio::test]
    async fn test_read_only_destination_rejected_up_front() {
        let source = MemoryProvider::new();
        put(&source, "/a.txt", "alpha").await;
        let dest = ReadOnlyProvider::new(Arc::new(MemoryProvider::new()));

        let err = copy(&source, &dest, &path("/a.txt"), &path("/"), &TransferOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 501);

        let err = move_(&dest, &source, &path("/a.txt"), &path("/b.txt"), &TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyProvider(_)));
    }

    #[tokio::test]
    async fn test_zip_folder_tree() {
        let provider: Arc<dyn Provider> = Arc::new(MemoryProvider::new());
        put(provider.as_ref(), "/pack/readme.txt", "read me").await;
        put(provider.as_ref(), "/pack/img/photo.jpg", "jpeg").await;
        provider.create_folder(&path("/pack/empty/")).await.unwrap();

        let mut archive = zip(provider, &path("/pack/")).await.unwrap();
        let bytes = read_to_end(&mut archive, 64).await.unwrap();

        let text = String::from_utf8_lossy(&bytes);
        assert!(bytes.starts_with(b"PK\x03\x04"));
        assert!(text.contains("readme.txt"));
        assert!(text.contains("img/photo.jpg"));
        assert!(text.contains("empty/"));
        // Stored entries keep their content verbatim.
        assert!(text.contains("jpeg"));
    }

    #[test]
    fn test_compressed_extensions() {
        assert!(is_compressed("a/B.JPG"));
        assert!(is_compressed("x.tar.gz"));
        assert!(!is_compressed("notes.txt"));
    }
}
