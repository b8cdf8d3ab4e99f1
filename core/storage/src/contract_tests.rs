//! Behaviour every adapter must share, run against each reference adapter.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;

use stowage_common::{Error, GatewayConfig, Kind, Metadata, MetadataResponse, Result, StoragePath};
use stowage_stream::{read_to_end, BoxStream, ByteRange, HashStream, HashWriter, StringStream};

use crate::local::LocalProvider;
use crate::memory::MemoryProvider;
use crate::provider::{ConflictPolicy, DownloadOptions, Provider};
use crate::readonly::ReadOnlyProvider;
use crate::transfer::{self, TransferOptions};

struct Fixture {
    provider: Arc<dyn Provider>,
    _dir: Option<TempDir>,
}

fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.upload.block_threshold = 1024 * 1024;
    config.upload.block_size = 256 * 1024;
    config
}

fn memory() -> Fixture {
    Fixture {
        provider: Arc::new(MemoryProvider::with_config(&config())),
        _dir: None,
    }
}

fn local() -> Fixture {
    let dir = TempDir::new().unwrap();
    Fixture {
        provider: Arc::new(LocalProvider::with_config(dir.path(), &config()).unwrap()),
        _dir: Some(dir),
    }
}

fn fixtures() -> Vec<Fixture> {
    vec![memory(), local()]
}

fn path(raw: &str) -> StoragePath {
    StoragePath::parse(raw).unwrap()
}

async fn put(provider: &dyn Provider, raw: &str, data: impl Into<Bytes>) -> Metadata {
    provider
        .upload(
            Box::new(StringStream::new(data)),
            &path(raw),
            ConflictPolicy::Replace,
        )
        .await
        .unwrap()
        .0
}

async fn md5_of(provider: &dyn Provider, raw: &str) -> String {
    let md5 = HashWriter::md5();
    let stream = provider
        .download(&path(raw), DownloadOptions::default())
        .await
        .unwrap();
    let mut stream = HashStream::new(stream).with_writer(md5.clone());
    read_to_end(&mut stream, 64 * 1024).await.unwrap();
    md5.hexdigest()
}

/// Consumes the upload, then fails as a backend would after a broken commit.
struct FailingUpload(MemoryProvider);

#[async_trait]
impl Provider for FailingUpload {
    fn name(&self) -> &str {
        "failing"
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

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<BoxStream> {
        self.0.download(path, options).await
    }

    async fn upload(
        &self,
        mut stream: BoxStream,
        _path: &StoragePath,
        _conflict: ConflictPolicy,
    ) -> Result<(Metadata, bool)> {
        read_to_end(&mut stream, 1024).await?;
        Err(Error::upload(507, "Insufficient storage"))
    }

    async fn delete(&self, path: &StoragePath, confirm_root_delete: bool) -> Result<()> {
        self.0.delete(path, confirm_root_delete).await
    }
}

#[tokio::test]
async fn test_large_upload_reports_writer_digest() {
    let data = Bytes::from((0..10 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect::<Vec<u8>>());

    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        let md5 = HashWriter::md5();
        let stream = HashStream::new(StringStream::new(data.clone())).with_writer(md5.clone());

        let (uploaded, created) = provider
            .upload(Box::new(stream), &path("/a/b/file.bin"), ConflictPolicy::Replace)
            .await
            .unwrap();
        assert!(created);
        assert_eq!(uploaded.hash("md5"), Some(md5.hexdigest().as_str()));

        let metadata = provider
            .metadata(&path("/a/b/file.bin"), None)
            .await
            .unwrap()
            .entry()
            .unwrap();
        assert_eq!(metadata.kind(), Kind::File);
        assert_eq!(metadata.size(), Some(10_485_760));
        assert_eq!(metadata.etag(), uploaded.etag());
        assert_eq!(md5_of(provider, "/a/b/file.bin").await, md5.hexdigest());
    }

    // Content-addressed store: the etag is the digest itself.
    let fixture = memory();
    let md5 = HashWriter::md5();
    let stream = HashStream::new(StringStream::new(data)).with_writer(md5.clone());
    fixture
        .provider
        .upload(Box::new(stream), &path("/a/b/file.bin"), ConflictPolicy::Replace)
        .await
        .unwrap();
    let metadata = fixture
        .provider
        .metadata(&path("/a/b/file.bin"), None)
        .await
        .unwrap()
        .entry()
        .unwrap();
    assert_eq!(metadata.etag(), Some(md5.hexdigest().as_str()));
}

#[tokio::test]
async fn test_create_folder_twice_conflicts() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();

        let folder = provider.create_folder(&path("/newdir/")).await.unwrap();
        assert_eq!(folder.kind(), Kind::Folder);
        assert_eq!(folder.name(), "newdir");
        assert_eq!(folder.path(), "/newdir/");

        let err = provider.create_folder(&path("/newdir/")).await.unwrap_err();
        assert!(matches!(err, Error::FolderNamingConflict(_)));
        assert_eq!(err.status_code(), 409);
    }
}

#[tokio::test]
async fn test_keep_policy_never_collides() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();

        let mut names = Vec::new();
        for _ in 0..3 {
            let (metadata, created) = provider
                .upload(
                    Box::new(StringStream::new("same")),
                    &path("/docs/report.pdf"),
                    ConflictPolicy::Keep,
                )
                .await
                .unwrap();
            assert!(created);
            names.push(metadata.name().to_string());
        }
        assert_eq!(names, vec!["report.pdf", "report (1).pdf", "report (2).pdf"]);

        let listing = provider
            .metadata(&path("/docs/"), None)
            .await
            .unwrap()
            .listing()
            .unwrap();
        assert_eq!(listing.len(), 3);
    }
}

#[tokio::test]
async fn test_warn_policy_fails_on_collision() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/x.txt", "first").await;

        let err = provider
            .upload(
                Box::new(StringStream::new("second")),
                &path("/x.txt"),
                ConflictPolicy::Warn,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamingConflict(_)));
        let mut stream = provider
            .download(&path("/x.txt"), DownloadOptions::default())
            .await
            .unwrap();
        assert_eq!(&read_to_end(&mut stream, 16).await.unwrap()[..], b"first");
    }
}

#[tokio::test]
async fn test_root_delete_requires_confirmation() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/keep/me.txt", "data").await;

        let err = provider.delete(&StoragePath::root(), false).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(provider.exists(&path("/keep/me.txt")).await.unwrap());

        provider.delete(&StoragePath::root(), true).await.unwrap();
        let listing = provider
            .metadata(&StoragePath::root(), None)
            .await
            .unwrap()
            .listing()
            .unwrap();
        assert!(listing.is_empty());
    }
}

#[tokio::test]
async fn test_strict_validation_checks_kind() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/dir/file.txt", "data").await;

        assert!(provider.validate_v1_path("/dir/").await.unwrap().is_folder());
        assert!(provider.validate_v1_path("/dir/file.txt").await.unwrap().is_file());
        assert!(matches!(
            provider.validate_v1_path("/dir/file.txt/").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            provider.validate_v1_path("/dir").await,
            Err(Error::NotFound(_))
        ));
        assert!(provider.validate_v1_path("/").await.unwrap().is_root());
    }
}

#[tokio::test]
async fn test_range_download() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/digits.txt", "0123456789").await;

        let mut stream = provider
            .download(
                &path("/digits.txt"),
                DownloadOptions::range(ByteRange::new(2, Some(5))),
            )
            .await
            .unwrap();
        assert_eq!(stream.size(), Some(4));
        assert_eq!(&read_to_end(&mut stream, 3).await.unwrap()[..], b"2345");

        let err = provider
            .download(
                &path("/digits.txt"),
                DownloadOptions::range(ByteRange::new(10, None)),
            )
            .await;
        assert!(err.is_err());
    }
}

#[tokio::test]
async fn test_reversed_range_is_rejected() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/digits.txt", "0123456789").await;

        let result = provider
            .download(
                &path("/digits.txt"),
                DownloadOptions::range(ByteRange::new(5, Some(2))),
            )
            .await;
        assert!(
            matches!(result, Err(Error::InvalidInput(_))),
            "{} accepted a reversed range",
            fixture.provider.name()
        );
    }
}

#[tokio::test]
async fn test_cross_provider_copy_preserves_digest() {
    let pairs = [(memory(), local()), (local(), memory())];
    for (source, dest) in pairs {
        let source = source.provider.as_ref();
        let dest_provider = dest.provider.as_ref();
        put(source, "/src/blob.bin", vec![7u8; 300 * 1024]).await;
        assert!(!source.can_intra_copy(dest_provider, &path("/src/blob.bin")));

        let (metadata, created) = transfer::copy(
            source,
            dest_provider,
            &path("/src/blob.bin"),
            &path("/dst/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap();
        assert!(created);
        assert_eq!(metadata.materialized_path(), "/dst/blob.bin");
        assert_eq!(
            md5_of(dest_provider, "/dst/blob.bin").await,
            md5_of(source, "/src/blob.bin").await
        );
    }
}

#[tokio::test]
async fn test_move_keeps_source_until_upload_succeeds() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/move/me.txt", "payload").await;

        let failing = FailingUpload(MemoryProvider::new());
        let err = transfer::move_(
            provider,
            &failing,
            &path("/move/me.txt"),
            &path("/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 507);
        assert!(provider.exists(&path("/move/me.txt")).await.unwrap());

        let dest = MemoryProvider::new();
        transfer::move_(
            provider,
            &dest,
            &path("/move/me.txt"),
            &path("/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap();
        assert!(!provider.exists(&path("/move/me.txt")).await.unwrap());
        assert!(dest.exists(&path("/me.txt")).await.unwrap());
    }
}

#[tokio::test]
async fn test_folder_move_within_one_store() {
    for fixture in fixtures() {
        let provider = fixture.provider.as_ref();
        put(provider, "/tree/a.txt", "a").await;
        put(provider, "/tree/deep/b.txt", "b").await;

        let (metadata, created) = transfer::move_(
            provider,
            provider,
            &path("/tree/"),
            &path("/renamed/"),
            &TransferOptions::default().with_rename("moved"),
        )
        .await
        .unwrap();
        assert!(created);
        assert_eq!(metadata.materialized_path(), "/renamed/moved/");
        assert!(!provider.exists(&path("/tree/")).await.unwrap());
        assert!(provider
            .exists(&path("/renamed/moved/deep/b.txt"))
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn test_copy_out_of_read_only_source() {
    for fixture in fixtures() {
        let inner = fixture.provider.clone();
        put(inner.as_ref(), "/ro/note.txt", "read me").await;
        let source = ReadOnlyProvider::new(inner);
        let dest = memory();

        let (metadata, _) = transfer::copy(
            &source,
            dest.provider.as_ref(),
            &path("/ro/"),
            &path("/"),
            &TransferOptions::default(),
        )
        .await
        .unwrap();
        assert!(metadata.is_folder());
        assert_eq!(
            md5_of(dest.provider.as_ref(), "/ro/note.txt").await,
            md5_of(&source, "/ro/note.txt").await
        );

        // Writing into it is refused before any byte moves.
        let err = transfer::copy(
            dest.provider.as_ref(),
            &source,
            &path("/ro/note.txt"),
            &path("/elsewhere.txt"),
            &TransferOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status_code(), 501);
        assert!(!source.exists(&path("/elsewhere.txt")).await.unwrap());
    }
}
