//! In-memory storage provider.
//!
//! Behaves like an object store: writing `/a/b/file` creates the folders
//! above it, a file and a folder may share a name, and every overwrite keeps
//! the previous content as a revision. Several providers can be mounted over
//! one store, in which case copies and moves between them happen in place.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use stowage_common::{
    Error, FileMetadata, FolderMetadata, GatewayConfig, Metadata, MetadataResponse, Result,
    RevisionMetadata, StoragePath, UploadConfig,
};
use stowage_stream::{
    read_to_end, BoxStream, ByteStream, HashStream, HashWriter, StringStream,
};

use crate::blocks::{BlockSink, BlockUploadPlan};
use crate::provider::{check_root_delete, ConflictPolicy, DownloadOptions, Provider};

#[derive(Debug, Clone)]
struct Version {
    version: u64,
    data: Bytes,
    md5: String,
    modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct FileEntry {
    current: Version,
    content_type: Option<String>,
    created: DateTime<Utc>,
    previous: Vec<Version>,
}

impl FileEntry {
    fn version(&self, revision: Option<&str>) -> Option<&Version> {
        match revision {
            None => Some(&self.current),
            Some(rev) => std::iter::once(&self.current)
                .chain(self.previous.iter())
                .find(|v| v.version.to_string() == rev),
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    File(FileEntry),
    Folder { modified: DateTime<Utc> },
}

type Entries = BTreeMap<String, Entry>;

/// Shared backing store.
struct Store {
    id: Uuid,
    entries: RwLock<Entries>,
    staged: Mutex<HashMap<String, Bytes>>,
}

impl Store {
    fn new() -> Self {
        let mut entries = Entries::new();
        entries.insert(
            "/".to_string(),
            Entry::Folder {
                modified: Utc::now(),
            },
        );
        Self {
            id: Uuid::new_v4(),
            entries: RwLock::new(entries),
            staged: Mutex::new(HashMap::new()),
        }
    }

    /// Join staged blocks in `ids` order and drop them from staging.
    fn commit_blocks(&self, ids: &[String]) -> Result<Bytes> {
        let mut staged = self.staged.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = BytesMut::new();
        for id in ids {
            let block = staged
                .remove(id)
                .ok_or_else(|| Error::upload(500, format!("Block {} was never staged", id)))?;
            data.extend_from_slice(&block);
        }
        Ok(data.freeze())
    }
}

#[async_trait]
impl BlockSink for Store {
    async fn put_block(&self, block_id: &str, block: &mut dyn ByteStream) -> Result<()> {
        let data = read_to_end(block, 64 * 1024).await?;
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(block_id.to_string(), data);
        Ok(())
    }
}

/// In-memory storage provider.
///
/// Useful for testing and development. All data is stored in memory and
/// lost once the last provider over the store is dropped.
#[derive(Clone)]
pub struct MemoryProvider {
    name: String,
    store: Arc<Store>,
    upload: UploadConfig,
    chunk_size: usize,
}

impl MemoryProvider {
    /// Create a new empty memory provider.
    pub fn new() -> Self {
        Self::with_config(&GatewayConfig::default())
    }

    pub fn with_config(config: &GatewayConfig) -> Self {
        Self {
            name: "memory".to_string(),
            store: Arc::new(Store::new()),
            upload: config.upload.clone(),
            chunk_size: config.stream.chunk_size,
        }
    }

    /// Rename the provider as rendered in metadata.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Another provider over the same store.
    pub fn share(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Number of block uploads staged but not committed.
    pub fn staged_blocks(&self) -> usize {
        self.store
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn entries(&self) -> RwLockReadGuard<'_, Entries> {
        self.store.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, Entries> {
        self.store.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn describe_file(
        provider: &str,
        path: &StoragePath,
        file: &FileEntry,
        version: &Version,
    ) -> Metadata {
        let mut metadata = FileMetadata::new(provider, path, version.data.len() as u64, &version.md5)
            .with_modified(version.modified)
            .with_created(file.created)
            .with_hash("md5", &version.md5)
            .with_extra("version", json!(version.version.to_string()));
        if let Some(content_type) = &file.content_type {
            metadata = metadata.with_content_type(content_type);
        }
        Metadata::File(metadata)
    }

    fn describe_folder(provider: &str, path: &StoragePath, modified: DateTime<Utc>) -> Metadata {
        Metadata::Folder(FolderMetadata::new(provider, path).with_modified(modified))
    }

    fn children(provider: &str, entries: &Entries, path: &StoragePath) -> Result<Vec<Metadata>> {
        let prefix = key(path);
        let mut children = Vec::new();
        for (child_key, entry) in entries.range(prefix.clone()..) {
            let Some(relative) = child_key.strip_prefix(&prefix) else {
                break;
            };
            let name = relative.trim_end_matches('/');
            if relative.is_empty() || name.contains('/') {
                continue;
            }
            let metadata = match entry {
                Entry::File(file) => {
                    let child = path.child(name, None, false)?;
                    Self::describe_file(provider, &child, file, &file.current)
                }
                Entry::Folder { modified } => {
                    let child = path.child(name, None, true)?;
                    Self::describe_folder(provider, &child, *modified)
                }
            };
            children.push(metadata);
        }
        Ok(children)
    }

    /// Metadata for whatever lives at `path`, folders with their children.
    fn describe(provider: &str, entries: &Entries, path: &StoragePath) -> Result<Metadata> {
        match entries.get(&key(path)) {
            Some(Entry::File(file)) if path.is_file() => {
                Ok(Self::describe_file(provider, path, file, &file.current))
            }
            Some(Entry::Folder { modified }) if path.is_folder() => {
                let children = Self::children(provider, entries, path)?;
                match Self::describe_folder(provider, path, *modified) {
                    Metadata::Folder(folder) => Ok(Metadata::Folder(folder.with_children(children))),
                    other => Ok(other),
                }
            }
            _ => Err(Error::NotFound(path.materialized_path())),
        }
    }

    /// Copy the subtree at `src` to `dst` inside the shared store.
    ///
    /// Returns whether `dst` existed before.
    fn copy_tree(entries: &mut Entries, src: &StoragePath, dst: &StoragePath) -> Result<bool> {
        let src_key = key(src);
        let dst_key = key(dst);

        let copied: Vec<(String, Entry)> = if src.is_folder() {
            entries
                .range(src_key.clone()..)
                .take_while(|(k, _)| k.starts_with(&src_key))
                .map(|(k, v)| (format!("{}{}", dst_key, &k[src_key.len()..]), v.clone()))
                .collect()
        } else {
            entries
                .get(&src_key)
                .filter(|entry| matches!(entry, Entry::File(_)))
                .map(|entry| vec![(dst_key.clone(), entry.clone())])
                .unwrap_or_default()
        };
        if copied.is_empty() {
            return Err(Error::NotFound(src.materialized_path()));
        }

        let existed = entries.contains_key(&dst_key);
        remove_tree(entries, &dst_key);
        ensure_parents(entries, dst);
        entries.extend(copied);
        Ok(existed)
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Store key: the materialized path, folders with a trailing slash.
fn key(path: &StoragePath) -> String {
    path.materialized_path()
}

fn ensure_parents(entries: &mut Entries, path: &StoragePath) {
    let now = Utc::now();
    let mut parent = path.parent();
    while let Some(folder) = parent {
        entries
            .entry(key(&folder))
            .or_insert(Entry::Folder { modified: now });
        parent = folder.parent();
    }
}

/// Remove the entry at `key` and, for folders, everything below it.
fn remove_tree(entries: &mut Entries, key: &str) -> bool {
    if key.ends_with('/') {
        let doomed: Vec<String> = entries
            .range(key.to_string()..)
            .take_while(|(k, _)| k.starts_with(key))
            .map(|(k, _)| k.clone())
            .collect();
        for k in &doomed {
            entries.remove(k);
        }
        !doomed.is_empty()
    } else {
        entries.remove(key).is_some()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn storage_root(&self) -> Option<String> {
        Some(format!("memory:{}", self.store.id))
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
        let entries = self.entries();
        match entries.get(&key(path)) {
            Some(Entry::Folder { .. }) if path.is_folder() => Ok(MetadataResponse::Listing(
                Self::children(&self.name, &entries, path)?,
            )),
            Some(Entry::File(file)) if path.is_file() => {
                let version = file.version(revision).ok_or_else(|| {
                    Error::NotFound(format!(
                        "Revision {} of {}",
                        revision.unwrap_or_default(),
                        path.materialized_path()
                    ))
                })?;
                Ok(MetadataResponse::Entry(Self::describe_file(
                    &self.name, path, file, version,
                )))
            }
            _ => Err(Error::NotFound(path.materialized_path())),
        }
    }

    async fn download(&self, path: &StoragePath, options: DownloadOptions) -> Result<BoxStream> {
        if path.is_folder() {
            return Err(Error::download(
                400,
                format!("{} is a folder; download it as a zip", path.materialized_path()),
            ));
        }

        let entries = self.entries();
        let Some(Entry::File(file)) = entries.get(&key(path)) else {
            return Err(Error::NotFound(path.materialized_path()));
        };
        let version = file
            .version(options.revision.as_deref())
            .ok_or_else(|| Error::NotFound(format!("Revision of {}", path.materialized_path())))?;

        let data = match &options.range {
            Some(range) => {
                let (start, end) = range.resolve(version.data.len() as u64)?;
                version.data.slice(start as usize..=end as usize)
            }
            None => version.data.clone(),
        };
        let mut stream = StringStream::new(data);
        if let Some(content_type) = &file.content_type {
            stream = stream.with_content_type(content_type);
        }
        Ok(Box::new(stream))
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

        let content_type = stream.content_type().map(String::from);
        let md5 = HashWriter::md5();
        let mut stream = HashStream::new(stream).with_writer(md5.clone());
        let data = if BlockUploadPlan::should_chunk(stream.size(), &self.upload) {
            let plan = BlockUploadPlan::new(self.upload.block_size);
            let ids = plan
                .upload_blocks(&mut stream, self.store.as_ref(), self.chunk_size)
                .await?;
            debug!("Committing {} blocks for {}", ids.len(), path);
            self.store.commit_blocks(&ids)?
        } else {
            read_to_end(&mut stream, self.chunk_size).await?
        };

        let now = Utc::now();
        let mut entries = self.entries_mut();
        ensure_parents(&mut entries, &path);
        let key = key(&path);
        let entry = match entries.remove(&key) {
            Some(Entry::File(mut file)) => {
                let version = file.current.version + 1;
                let previous = std::mem::replace(
                    &mut file.current,
                    Version {
                        version,
                        data,
                        md5: md5.hexdigest(),
                        modified: now,
                    },
                );
                file.previous.insert(0, previous);
                file.content_type = content_type.or(file.content_type);
                file
            }
            _ => FileEntry {
                current: Version {
                    version: 1,
                    data,
                    md5: md5.hexdigest(),
                    modified: now,
                },
                content_type,
                created: now,
                previous: Vec::new(),
            },
        };

        let metadata = Self::describe_file(&self.name, &path, &entry, &entry.current);
        entries.insert(key, Entry::File(entry));
        Ok((metadata, !exists))
    }

    async fn delete(&self, path: &StoragePath, confirm_root_delete: bool) -> Result<()> {
        check_root_delete(path, confirm_root_delete)?;

        let mut entries = self.entries_mut();
        if path.is_root() {
            entries.retain(|k, _| k == "/");
            return Ok(());
        }
        if !remove_tree(&mut entries, &key(path)) {
            return Err(Error::NotFound(path.materialized_path()));
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

        let mut entries = self.entries_mut();
        let folder_key = key(path);
        let file_key = folder_key.trim_end_matches('/');
        if entries.contains_key(&folder_key) || entries.contains_key(file_key) {
            return Err(Error::FolderNamingConflict(path.name().to_string()));
        }

        let now = Utc::now();
        ensure_parents(&mut entries, path);
        entries.insert(folder_key, Entry::Folder { modified: now });
        Ok(Self::describe_folder(&self.name, path, now))
    }

    async fn revisions(&self, path: &StoragePath) -> Result<Vec<RevisionMetadata>> {
        let entries = self.entries();
        let Some(Entry::File(file)) = entries.get(&key(path)) else {
            return Err(Error::NotFound(path.materialized_path()));
        };

        Ok(std::iter::once(&file.current)
            .chain(file.previous.iter())
            .map(|v| {
                RevisionMetadata::new(v.version.to_string(), v.modified)
                    .with_extra("md5", json!(v.md5))
            })
            .collect())
    }

    async fn intra_copy(
        &self,
        dest: &dyn Provider,
        src: &StoragePath,
        dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        let mut entries = self.entries_mut();
        let existed = Self::copy_tree(&mut entries, src, dst)?;
        let metadata = Self::describe(dest.name(), &entries, dst)?;
        Ok((metadata, !existed))
    }

    async fn intra_move(
        &self,
        dest: &dyn Provider,
        src: &StoragePath,
        dst: &StoragePath,
    ) -> Result<(Metadata, bool)> {
        let mut entries = self.entries_mut();
        let existed = Self::copy_tree(&mut entries, src, dst)?;
        remove_tree(&mut entries, &key(src));
        let metadata = Self::describe(dest.name(), &entries, dst)?;
        Ok((metadata, !existed))
    }
}
