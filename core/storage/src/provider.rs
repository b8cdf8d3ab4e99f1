//! The provider contract every backend adapter implements.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use stowage_common::{
    Capabilities, Error, Metadata, MetadataResponse, Result, RevisionMetadata, StoragePath,
};
use stowage_stream::{BoxStream, ByteRange};

/// What to do when an upload or create target already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Overwrite the existing object.
    #[default]
    Replace,
    /// Keep both: the new object gets a `name (n).ext` suffix.
    Keep,
    /// Fail with a naming conflict.
    Warn,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConflictPolicy::Replace => "replace",
            ConflictPolicy::Keep => "keep",
            ConflictPolicy::Warn => "warn",
        })
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replace" => Ok(ConflictPolicy::Replace),
            "keep" => Ok(ConflictPolicy::Keep),
            "warn" => Ok(ConflictPolicy::Warn),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict policy '{}', expected replace, keep or warn",
                other
            ))),
        }
    }
}

/// Options for [`Provider::download`].
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub range: Option<ByteRange>,
    pub revision: Option<String>,
}

impl DownloadOptions {
    pub fn range(range: ByteRange) -> Self {
        Self {
            range: Some(range),
            revision: None,
        }
    }

    pub fn revision(revision: impl Into<String>) -> Self {
        Self {
            range: None,
            revision: Some(revision.into()),
        }
    }
}

/// Refuse to delete a provider's configured root unless confirmed.
///
/// Adapters call this before touching the backend.
pub fn check_root_delete(path: &StoragePath, confirm_root_delete: bool) -> Result<()> {
    if path.is_root() && !confirm_root_delete {
        return Err(Error::delete(
            400,
            "confirm_delete=1 is required for deleting the root provider folder",
        ));
    }
    Ok(())
}

/// Backend adapter interface.
///
/// Implementations translate these operations into backend calls. They hold
/// credentials and configuration only; nothing about in-flight transfers, so
/// one instance can serve concurrent requests.
///
/// Copy and move between providers live in [`crate::transfer`], which uses
/// the intra hooks below when a backend can do the work itself.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name as rendered in metadata (e.g. "memory", "local").
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::read_write()
    }

    /// Identity of the underlying store; two providers with the same root
    /// see the same objects.
    fn storage_root(&self) -> Option<String> {
        None
    }

    fn shares_storage_root(&self, other: &dyn Provider) -> bool {
        matches!(
            (self.storage_root(), other.storage_root()),
            (Some(a), Some(b)) if a == b
        )
    }

    /// Whether two siblings may carry the same name.
    fn can_duplicate_names(&self) -> bool {
        false
    }

    fn can_intra_copy(&self, _other: &dyn Provider, _path: &StoragePath) -> bool {
        false
    }

    fn can_intra_move(&self, _other: &dyn Provider, _path: &StoragePath) -> bool {
        false
    }

    /// Resolve a raw path without talking to the backend.
    async fn validate_path(&self, raw: &str) -> Result<StoragePath>;

    /// Resolve a raw path and confirm it exists with the kind its trailing
    /// slash claims.
    async fn validate_v1_path(&self, raw: &str) -> Result<StoragePath> {
        let path = self.validate_path(raw).await?;
        if path.is_root() {
            return Ok(path);
        }

        let found = match self.metadata(&path, None).await? {
            MetadataResponse::Listing(_) => path.is_folder(),
            MetadataResponse::Entry(metadata) => metadata.kind() == path.kind(),
        };
        if !found {
            return Err(Error::NotFound(path.materialized_path()));
        }
        Ok(path)
    }

    /// Build the path of `name` below `base`, consulting the backend for an
    /// identifier where the backend addresses objects by id.
    async fn revalidate_path(
        &self,
        base: &StoragePath,
        name: &str,
        folder: bool,
    ) -> Result<StoragePath> {
        base.child(name, None, folder)
    }

    /// Describe a file, or list a folder.
    async fn metadata(
        &self,
        path: &StoragePath,
        revision: Option<&str>,
    ) -> Result<MetadataResponse>;

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<BoxStream>;

    /// Store `stream` at `path`, consuming it to the end.
    ///
    /// Returns the new metadata and whether the object was created (as
    /// opposed to overwritten).
    async fn upload(
        &self,
        stream: BoxStream,
        path: &StoragePath,
        conflict: ConflictPolicy,
    ) -> Result<(Metadata, bool)>;

    /// Delete a file or a folder tree.
    ///
    /// Deleting the root requires `confirm_root_delete`; see
    /// [`check_root_delete`].
    async fn delete(&self, path: &StoragePath, confirm_root_delete: bool) -> Result<()>;

    async fn create_folder(&self, path: &StoragePath) -> Result<Metadata> {
        Err(Error::UnsupportedAction(format!(
            "{} does not support creating folders ({})",
            self.name(),
            path
        )))
    }

    async fn revisions(&self, path: &StoragePath) -> Result<Vec<RevisionMetadata>> {
        Err(Error::UnsupportedAction(format!(
            "{} does not keep revisions ({})",
            self.name(),
            path
        )))
    }

    async fn intra_copy(
        &self,
        _dest: &dyn Provider,
        src: &StoragePath,
        _dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        Err(Error::UnsupportedAction(format!(
            "{} cannot copy {} in place",
            self.name(),
            src
        )))
    }

    async fn intra_move(
        &self,
        _dest: &dyn Provider,
        src: &StoragePath,
        _dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        Err(Error::UnsupportedAction(format!(
            "{} cannot move {} in place",
            self.name(),
            src
        )))
    }

    async fn exists(&self, path: &StoragePath) -> Result<bool> {
        match self.metadata(path, None).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Apply `conflict` to `path`.
    ///
    /// Returns the path to write to and whether something already exists
    /// there.
    async fn handle_name_conflict(
        &self,
        path: &StoragePath,
        conflict: ConflictPolicy,
    ) -> Result<(StoragePath, bool)> {
        let exists = self.exists(path).await?;
        if !exists || conflict == ConflictPolicy::Replace {
            return Ok((path.clone(), exists));
        }
        if conflict == ConflictPolicy::Warn {
            return Err(Error::NamingConflict(path.name().to_string()));
        }

        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidPath("The root path cannot be renamed".to_string()))?;
        let mut candidate = path.clone();
        loop {
            candidate = candidate.increment_name()?;
            candidate = self
                .revalidate_path(&parent, candidate.name(), candidate.is_folder())
                .await?;
            if !self.exists(&candidate).await? {
                return Ok((candidate, false));
            }
        }
    }

    /// Work out where a copied or moved `src` lands below or at `dst`.
    ///
    /// A folder destination receives `src` under its own name, or under
    /// `rename` when given. A root `src` has no name, so without `rename`
    /// its children land directly in `dst`. The conflict policy is then
    /// applied to the result.
    async fn handle_naming(
        &self,
        src: &StoragePath,
        dst: &StoragePath,
        rename: Option<&str>,
        conflict: ConflictPolicy,
    ) -> Result<(StoragePath, bool)> {
        if src.is_folder() && dst.is_file() {
            return Err(Error::InvalidPath(format!(
                "Destination {} must be a folder if the source is",
                dst
            )));
        }

        let target = match (dst.is_folder(), rename) {
            (true, None) if src.is_root() => dst.clone(),
            (true, rename) => {
                self.revalidate_path(dst, rename.unwrap_or(src.name()), src.is_folder())
                    .await?
            }
            (false, _) => dst.clone(),
        };
        self.handle_name_conflict(&target, conflict).await
    }
}
