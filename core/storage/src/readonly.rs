//! Read-only provider wrapper.
//!
//! Wraps another provider and rejects every mutation before it reaches the
//! backend. Reads, listings and downloads pass straight through.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use stowage_common::{
    Capabilities, Error, Metadata, MetadataResponse, Result, RevisionMetadata, StoragePath,
};
use stowage_stream::BoxStream;

use crate::provider::{ConflictPolicy, DownloadOptions, Provider};

/// Read-only view of a provider.
#[derive(Clone)]
pub struct ReadOnlyProvider {
    inner: Arc<dyn Provider>,
}

impl ReadOnlyProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    fn reject(&self, action: &str, path: &StoragePath) -> Error {
        info!(provider = self.name(), %path, "Rejecting {} on read-only provider", action);
        Error::ReadOnlyProvider(self.name().to_string())
    }
}

#[async_trait]
impl Provider for ReadOnlyProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_only()
    }

    fn storage_root(&self) -> Option<String> {
        self.inner.storage_root()
    }

    fn can_duplicate_names(&self) -> bool {
        self.inner.can_duplicate_names()
    }

    // Copying out only reads from this side, so the backend may still do it
    // natively. Moving out would delete here.
    fn can_intra_copy(&self, other: &dyn Provider, path: &StoragePath) -> bool {
        self.inner.can_intra_copy(other, path)
    }

    async fn validate_path(&self, raw: &str) -> Result<StoragePath> {
        self.inner.validate_path(raw).await
    }

    async fn validate_v1_path(&self, raw: &str) -> Result<StoragePath> {
        self.inner.validate_v1_path(raw).await
    }

    async fn revalidate_path(
        &self,
        base: &StoragePath,
        name: &str,
        folder: bool,
    ) -> Result<StoragePath> {
        self.inner.revalidate_path(base, name, folder).await
    }

    async fn metadata(
        &self,
        path: &StoragePath,
        revision: Option<&str>,
    ) -> Result<MetadataResponse> {
        self.inner.metadata(path, revision).await
    }

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<BoxStream> {
        self.inner.download(path, options).await
    }

    async fn upload(
        &self,
        _stream: BoxStream,
        path: &StoragePath,
        _conflict: ConflictPolicy,
    ) -> Result<(Metadata, bool)> {
        Err(self.reject("upload", path))
    }

    async fn delete(&self, path: &StoragePath, _confirm_root_delete: bool) -> Result<()> {
        Err(self.reject("delete", path))
    }

    async fn create_folder(&self, path: &StoragePath) -> Result<Metadata> {
        Err(self.reject("create_folder", path))
    }

    async fn revisions(&self, path: &StoragePath) -> Result<Vec<RevisionMetadata>> {
        self.inner.revisions(path).await
    }

    async fn intra_copy(
        &self,
        dest: &dyn Provider,
        src: &StoragePath,
        dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        self.inner.intra_copy(dest, src, dst).await
    }

    async fn intra_move(
        &self,
        _dest: &dyn Provider,
        src: &StoragePath,
        _dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        Err(self.reject("move", src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProvider;
    use stowage_stream::{read_to_end, StringStream};

    async fn seeded() -> (Arc<MemoryProvider>, ReadOnlyProvider) {
        let inner = Arc::new(MemoryProvider::new());
        inner
            .upload(
                Box::new(StringStream::new("kept")),
                &StoragePath::parse("/doc.txt").unwrap(),
                ConflictPolicy::Replace,
            )
            .await
            .unwrap();
        let wrapped = ReadOnlyProvider::new(inner.clone());
        (inner, wrapped)
    }

    #[tokio::test]
    async fn test_reads_pass_through() {
        let (_, provider) = seeded().await;
        let path = provider.validate_v1_path("/doc.txt").await.unwrap();

        let mut stream = provider.download(&path, DownloadOptions::default()).await.unwrap();
        assert_eq!(&read_to_end(&mut stream, 16).await.unwrap()[..], b"kept");
        assert!(!provider.capabilities().writable);
    }

    #[tokio::test]
    async fn test_mutations_are_rejected_before_the_backend() {
        let (inner, provider) = seeded().await;
        let path = StoragePath::parse("/doc.txt").unwrap();

        let err = provider
            .upload(Box::new(StringStream::new("new")), &path, ConflictPolicy::Replace)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 501);

        assert!(matches!(
            provider.delete(&path, false).await,
            Err(Error::ReadOnlyProvider(_))
        ));
        assert!(matches!(
            provider
                .create_folder(&StoragePath::parse("/dir/").unwrap())
                .await,
            Err(Error::ReadOnlyProvider(_))
        ));

        // Untouched underneath.
        let entry = inner.metadata(&path, None).await.unwrap().entry().unwrap();
        assert_eq!(entry.size(), Some(4));
    }

    #[tokio::test]
    async fn test_never_moves_in_place() {
        let (inner, provider) = seeded().await;
        let other = inner.share("other");
        let path = StoragePath::parse("/doc.txt").unwrap();

        assert!(provider.can_intra_copy(&other, &path));
        assert!(!provider.can_intra_move(&other, &path));
    }
}
