//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use stowage_common::{
    Error, FileMetadata, FolderMetadata, GatewayConfig, Metadata, MetadataResponse, Result,
    StoragePath,
};
use stowage_stream::{BoxStream, ByteStream, FileStream, HashStream, HashWriter};

use crate::provider::{check_root_delete, ConflictPolicy, DownloadOptions, Provider};

/// Prefix of in-progress upload files, hidden from listings.
const STAGING_PREFIX: &str = ".stowage-";

/// Local filesystem storage provider.
///
/// Serves a directory as the provider's base folder. `/` maps to the
/// directory itself; nothing above it is reachable.
pub struct LocalProvider {
    name: String,
    root: PathBuf,
    chunk_size: usize,
}

impl LocalProvider {
    /// Create a new local provider with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Invalid path
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(root, &GatewayConfig::default())
    }

    pub fn with_config(root: impl AsRef<Path>, config: &GatewayConfig) -> Result<Self> {
        let root = root.as_ref();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(root)?;
        }
        let root = std::fs::canonicalize(root)?;

        Ok(Self {
            name: "local".to_string(),
            root,
            chunk_size: config.stream.chunk_size,
        })
    }

    /// Rename the provider as rendered in metadata.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Convert a StoragePath to a filesystem path.
    fn to_fs_path(&self, path: &StoragePath) -> PathBuf {
        let mut fs_path = self.root.clone();
        for name in path.names() {
            fs_path.push(name);
        }
        fs_path
    }

    /// Filesystem metadata, or NotFound when nothing of `path`'s kind is there.
    async fn stat(&self, path: &StoragePath) -> Result<std::fs::Metadata> {
        match fs::metadata(self.to_fs_path(path)).await {
            Ok(meta) if meta.is_dir() == path.is_folder() => Ok(meta),
            Ok(_) => Err(Error::NotFound(path.materialized_path())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Error::NotFound(path.materialized_path()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn describe_file(provider: &str, path: &StoragePath, fs_meta: &std::fs::Metadata) -> FileMetadata {
        let modified: DateTime<Utc> = fs_meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());

        // Changes with content (mtime, size) and identity (path).
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}::{}::{}",
            modified.timestamp_nanos_opt().unwrap_or_default(),
            fs_meta.len(),
            path.materialized_path()
        ));
        let etag = hex::encode(hasher.finalize());

        let mut metadata = FileMetadata::new(provider, path, fs_meta.len(), etag).with_modified(modified);
        if let Ok(created) = fs_meta.created() {
            metadata = metadata.with_created(created.into());
        }
        metadata
    }

    fn describe_folder(provider: &str, path: &StoragePath, fs_meta: &std::fs::Metadata) -> Metadata {
        let mut folder = FolderMetadata::new(provider, path);
        if let Ok(modified) = fs_meta.modified() {
            folder = folder.with_modified(modified.into());
        }
        Metadata::Folder(folder)
    }

    async fn list(&self, provider: &str, path: &StoragePath) -> Result<Vec<Metadata>> {
        let mut results = Vec::new();
        let mut entries = fs::read_dir(self.to_fs_path(path)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            let fs_meta = entry.metadata().await?;
            let Ok(child) = path.child(name, None, fs_meta.is_dir()) else {
                continue;
            };
            results.push(if fs_meta.is_dir() {
                Self::describe_folder(provider, &child, &fs_meta)
            } else {
                Metadata::File(Self::describe_file(provider, &child, &fs_meta))
            });
        }

        results.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(results)
    }

    /// Metadata for `path` as seen by `provider`, folders with children.
    async fn describe(&self, provider: &str, path: &StoragePath) -> Result<Metadata> {
        let fs_meta = self.stat(path).await?;
        if path.is_folder() {
            let children = self.list(provider, path).await?;
            let mut folder = FolderMetadata::new(provider, path).with_children(children);
            if let Ok(modified) = fs_meta.modified() {
                folder = folder.with_modified(modified.into());
            }
            Ok(Metadata::Folder(folder))
        } else {
            Ok(Metadata::File(Self::describe_file(provider, path, &fs_meta)))
        }
    }

    /// Clear `target` for an in-place copy or move. Returns whether it existed.
    async fn clear_target(&self, target: &Path) -> Result<bool> {
        match fs::symlink_metadata(target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(target).await?,
            Ok(_) => fs::remove_file(target).await?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        Ok(true)
    }

    async fn write_stream(&self, stream: &mut dyn ByteStream, target: &Path) -> Result<()> {
        let mut file = fs::File::create(target).await?;
        while let Some(chunk) = stream.read(self.chunk_size).await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

async fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst).await?;
        let mut entries = fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_root(&self) -> Option<String> {
        Some(format!("local:{}", self.root.display()))
    }

    fn can_intra_copy(&self, other: &dyn Provider, _path: &StoragePath) -> bool {
        self.shares_storage_root(other) && other.capabilities().writable
    }

    fn can_intra_move(&self, other: &dyn Provider, path: &StoragePath) -> bool {
        self.can_intra_copy(other, path)
    }

    async fn validate_path(&self, raw: &str) -> Result<StoragePath> {
        StoragePath::parse(raw)
    }

    async fn metadata(
        &self,
        path: &StoragePath,
        revision: Option<&str>,
    ) -> Result<MetadataResponse> {
        if let Some(revision) = revision {
            return Err(Error::UnsupportedAction(format!(
                "{} does not keep revisions (asked for {})",
                self.name, revision
            )));
        }

        let fs_meta = self.stat(path).await?;
        if path.is_folder() {
            Ok(MetadataResponse::Listing(self.list(&self.name, path).await?))
        } else {
            Ok(MetadataResponse::Entry(Metadata::File(Self::describe_file(
                &self.name, path, &fs_meta,
            ))))
        }
    }

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<BoxStream> {
        if path.is_folder() {
            return Err(Error::download(
                400,
                format!("{} is a folder; download it as a zip", path.materialized_path()),
            ));
        }
        if options.revision.is_some() {
            return Err(Error::UnsupportedAction(format!(
                "{} does not keep revisions",
                self.name
            )));
        }
        self.stat(path).await?;

        let fs_path = self.to_fs_path(path);
        Ok(match &options.range {
            Some(range) => Box::new(FileStream::open_range(&fs_path, range).await?),
            None => Box::new(FileStream::open(&fs_path).await?),
        })
    }

    async fn upload(
        &self,
        stream: BoxStream,
        path: &StoragePath,
        conflict: ConflictPolicy,
    ) -> Result<(Metadata, bool)> {
        if path.is_folder() {
            return Err(Error::upload(
                400,
                format!("Cannot upload to folder path {}", path),
            ));
        }
        let (path, exists) = self.handle_name_conflict(path, conflict).await?;

        let fs_path = self.to_fs_path(&path);
        if fs::metadata(&fs_path).await.is_ok_and(|meta| meta.is_dir()) {
            return Err(Error::NamingConflict(path.name().to_string()));
        }
        let parent = fs_path
            .parent()
            .ok_or_else(|| Error::upload(400, format!("Cannot upload to {}", path)))?;
        fs::create_dir_all(parent).await?;

        // Write next to the target and rename, so readers never see a
        // half-written file.
        let staging = parent.join(format!("{}{}.part", STAGING_PREFIX, Uuid::new_v4()));
        let md5 = HashWriter::md5();
        let mut stream = HashStream::new(stream).with_writer(md5.clone());
        if let Err(e) = self.write_stream(&mut stream, &staging).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }
        fs::rename(&staging, &fs_path).await?;

        let fs_meta = fs::metadata(&fs_path).await?;
        let metadata = Self::describe_file(&self.name, &path, &fs_meta).with_hash("md5", md5.hexdigest());
        Ok((Metadata::File(metadata), !exists))
    }

    async fn delete(&self, path: &StoragePath, confirm_root_delete: bool) -> Result<()> {
        check_root_delete(path, confirm_root_delete)?;
        self.stat(path).await?;

        let fs_path = self.to_fs_path(path);
        if path.is_root() {
            let mut entries = fs::read_dir(&fs_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                self.clear_target(&entry.path()).await?;
            }
        } else if path.is_folder() {
            fs::remove_dir_all(&fs_path).await?;
        } else {
            fs::remove_file(&fs_path).await?;
        }
        Ok(())
    }

    async fn create_folder(&self, path: &StoragePath) -> Result<Metadata> {
        if !path.is_folder() {
            return Err(Error::create_folder(
                400,
                format!("{} is not a folder path", path),
            ));
        }

        let fs_path = self.to_fs_path(path);
        if fs::symlink_metadata(&fs_path).await.is_ok() {
            return Err(Error::FolderNamingConflict(path.name().to_string()));
        }
        fs::create_dir_all(&fs_path).await?;

        let fs_meta = fs::metadata(&fs_path).await?;
        Ok(Self::describe_folder(&self.name, path, &fs_meta))
    }

    async fn intra_copy(
        &self,
        dest: &dyn Provider,
        src: &StoragePath,
        dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        self.stat(src).await?;
        let from = self.to_fs_path(src);
        let to = self.to_fs_path(dst);

        let existed = self.clear_target(&to).await?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        if src.is_folder() {
            copy_dir(&from, &to).await?;
        } else {
            fs::copy(&from, &to).await?;
        }

        Ok((self.describe(dest.name(), dst).await?, !existed))
    }

    async fn intra_move(
        &self,
        dest: &dyn Provider,
        src: &StoragePath,
        dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        self.stat(src).await?;
        let from = self.to_fs_path(src);
        let to = self.to_fs_path(dst);

        let existed = self.clear_target(&to).await?;
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&from, &to).await?;

        Ok((self.describe(dest.name(), dst).await?, !existed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_stream::{read_to_end, ByteRange, StringStream};
    use tempfile::TempDir;

    fn path(raw: &str) -> StoragePath {
        StoragePath::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_upload_onto_folder_name_conflicts() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        provider.create_folder(&path("/x/")).await.unwrap();

        let err = provider
            .upload(
                Box::new(StringStream::new("file")),
                &path("/x"),
                ConflictPolicy::Replace,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamingConflict(_)));
        assert_eq!(err.status_code(), 409);
        assert!(temp.path().join("x").is_dir());
    }

    #[tokio::test]
    async fn test_local_upload_download() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();

        let (metadata, created) = provider
            .upload(
                Box::new(StringStream::new("Hello, Local!")),
                &path("/nested/test.txt"),
                ConflictPolicy::Replace,
            )
            .await
            .unwrap();
        assert!(created);
        assert_eq!(metadata.size(), Some(13));
        assert!(metadata.hash("md5").is_some());
        assert!(temp.path().join("nested/test.txt").exists());

        let mut stream = provider
            .download(&path("/nested/test.txt"), DownloadOptions::range(ByteRange::new(7, None)))
            .await
            .unwrap();
        let data = read_to_end(&mut stream, 4).await.unwrap();
        assert_eq!(&data[..], b"Local!");
    }

    #[tokio::test]
    async fn test_etag_changes_with_content() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();

        let (first, _) = provider
            .upload(Box::new(StringStream::new("one")), &path("/f"), ConflictPolicy::Replace)
            .await
            .unwrap();
        let again = provider.metadata(&path("/f"), None).await.unwrap().entry().unwrap();
        assert_eq!(first.etag(), again.etag());

        let (second, created) = provider
            .upload(Box::new(StringStream::new("three")), &path("/f"), ConflictPolicy::Replace)
            .await
            .unwrap();
        assert!(!created);
        assert_ne!(first.etag(), second.etag());
    }

    #[tokio::test]
    async fn test_listing_is_sorted_and_hides_staging_files() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("b.txt"), b"b").unwrap();
        std::fs::write(temp.path().join("a.txt"), b"a").unwrap();
        std::fs::write(temp.path().join(".stowage-123.part"), b"x").unwrap();
        std::fs::create_dir(temp.path().join("dir")).unwrap();

        let listing = provider
            .metadata(&StoragePath::root(), None)
            .await
            .unwrap()
            .listing()
            .unwrap();
        let names: Vec<&str> = listing.iter().map(|m| m.name()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "dir"]);
        assert!(listing[2].is_folder());
    }

    #[tokio::test]
    async fn test_revisions_unsupported() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::new(temp.path()).unwrap();
        std::fs::write(temp.path().join("a.txt"), b"a").unwrap();

        assert!(matches!(
            provider.revisions(&path("/a.txt")).await,
            Err(Error::UnsupportedAction(_))
        ));
    }

    #[tokio::test]
    async fn test_two_mounts_of_one_directory_move_in_place() {
        let temp = TempDir::new().unwrap();
        let left = LocalProvider::new(temp.path()).unwrap().named("left");
        let right = LocalProvider::new(temp.path()).unwrap().named("right");
        std::fs::create_dir_all(temp.path().join("src/inner")).unwrap();
        std::fs::write(temp.path().join("src/inner/f.txt"), b"f").unwrap();

        assert!(left.can_intra_move(&right, &path("/src/")));
        let (metadata, created) = left
            .intra_move(&right, &path("/src/"), &path("/moved/"))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(metadata.provider(), "right");
        assert!(!temp.path().join("src").exists());
        assert!(temp.path().join("moved/inner/f.txt").exists());
    }
}
