//! Normalized metadata descriptors.
//!
//! Every provider answers "what is this" with the same shapes. Backend data
//! that cannot be normalized (checksums, version ids, webview links) travels
//! in `extra`. Metadata is built fresh for every query and is never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::LinksConfig;
use crate::path::{Kind, StoragePath};

/// Metadata for a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub provider: String,
    pub name: String,
    /// Identifier-addressed path used for backend lookups.
    pub path: String,
    /// Human-readable path.
    pub materialized_path: String,
    /// Changes whenever content or identity changes.
    pub etag: String,
    pub size: u64,
    pub content_type: Option<String>,
    /// Modification time as reported by the backend.
    pub modified: Option<String>,
    pub modified_utc: Option<DateTime<Utc>>,
    pub created_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl FileMetadata {
    /// Create file metadata for a path.
    pub fn new(
        provider: impl Into<String>,
        path: &StoragePath,
        size: u64,
        etag: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            name: path.name().to_string(),
            path: path.identifier_path(),
            materialized_path: path.materialized_path(),
            etag: etag.into(),
            size,
            content_type: None,
            modified: None,
            modified_utc: None,
            created_utc: None,
            extra: Map::new(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the modification time; the raw string is rendered as RFC 3339.
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified.to_rfc3339());
        self.modified_utc = Some(modified);
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created_utc = Some(created);
        self
    }

    /// Record a content checksum under `extra.hashes`.
    pub fn with_hash(mut self, algorithm: &str, hexdigest: impl Into<String>) -> Self {
        let hashes = self
            .extra
            .entry("hashes")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(map) = hashes {
            map.insert(algorithm.to_string(), Value::String(hexdigest.into()));
        }
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Metadata for a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderMetadata {
    pub provider: String,
    pub name: String,
    pub path: String,
    pub materialized_path: String,
    pub etag: Option<String>,
    pub modified: Option<String>,
    pub modified_utc: Option<DateTime<Utc>>,
    pub created_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    /// Pre-fetched children, when the backend returned them for free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Metadata>>,
}

impl FolderMetadata {
    pub fn new(provider: impl Into<String>, path: &StoragePath) -> Self {
        Self {
            provider: provider.into(),
            name: path.name().to_string(),
            path: path.identifier_path(),
            materialized_path: path.materialized_path(),
            etag: None,
            modified: None,
            modified_utc: None,
            created_utc: None,
            extra: Map::new(),
            children: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified.to_rfc3339());
        self.modified_utc = Some(modified);
        self
    }

    pub fn with_children(mut self, children: Vec<Metadata>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Metadata for either kind of entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Metadata {
    File(FileMetadata),
    Folder(FolderMetadata),
}

impl Metadata {
    pub fn kind(&self) -> Kind {
        match self {
            Metadata::File(_) => Kind::File,
            Metadata::Folder(_) => Kind::Folder,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Metadata::File(_))
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Metadata::Folder(_))
    }

    pub fn provider(&self) -> &str {
        match self {
            Metadata::File(m) => &m.provider,
            Metadata::Folder(m) => &m.provider,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Metadata::File(m) => &m.name,
            Metadata::Folder(m) => &m.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Metadata::File(m) => &m.path,
            Metadata::Folder(m) => &m.path,
        }
    }

    pub fn materialized_path(&self) -> &str {
        match self {
            Metadata::File(m) => &m.materialized_path,
            Metadata::Folder(m) => &m.materialized_path,
        }
    }

    pub fn etag(&self) -> Option<&str> {
        match self {
            Metadata::File(m) => Some(&m.etag),
            Metadata::Folder(m) => m.etag.as_deref(),
        }
    }

    /// Byte size; `None` for folders.
    pub fn size(&self) -> Option<u64> {
        match self {
            Metadata::File(m) => Some(m.size),
            Metadata::Folder(_) => None,
        }
    }

    pub fn modified_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            Metadata::File(m) => m.modified_utc,
            Metadata::Folder(m) => m.modified_utc,
        }
    }

    pub fn extra(&self) -> &Map<String, Value> {
        match self {
            Metadata::File(m) => &m.extra,
            Metadata::Folder(m) => &m.extra,
        }
    }

    /// Checksum reported by the backend for `algorithm`, if any.
    pub fn hash(&self, algorithm: &str) -> Option<&str> {
        self.extra()
            .get("hashes")
            .and_then(|hashes| hashes.get(algorithm))
            .and_then(Value::as_str)
    }

    /// Render the JSON shape handed to the transport shim.
    pub fn serialize(&self, links: Option<&Links>) -> Value {
        let mut out = json!({
            "kind": self.kind(),
            "name": self.name(),
            "path": self.path(),
            "materialized": self.materialized_path(),
            "provider": self.provider(),
            "etag": self.etag(),
            "extra": self.extra(),
        });

        match self {
            Metadata::File(m) => {
                out["size"] = json!(m.size);
                out["contentType"] = json!(m.content_type);
                out["modified"] = json!(m.modified);
                out["modified_utc"] = json!(m.modified_utc);
                out["created_utc"] = json!(m.created_utc);
            }
            Metadata::Folder(m) => {
                out["size"] = Value::Null;
                out["modified"] = json!(m.modified);
                out["modified_utc"] = json!(m.modified_utc);
                out["created_utc"] = json!(m.created_utc);
            }
        }

        if let Some(links) = links {
            out["links"] = json!(links);
        }
        out
    }
}

/// Result of a metadata query: a single entry, or a folder listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataResponse {
    Entry(Metadata),
    Listing(Vec<Metadata>),
}

impl MetadataResponse {
    /// The single entry, if this is not a listing.
    pub fn entry(self) -> Option<Metadata> {
        match self {
            MetadataResponse::Entry(metadata) => Some(metadata),
            MetadataResponse::Listing(_) => None,
        }
    }

    /// The listing, if this is one.
    pub fn listing(self) -> Option<Vec<Metadata>> {
        match self {
            MetadataResponse::Entry(_) => None,
            MetadataResponse::Listing(children) => Some(children),
        }
    }
}

/// A named past version of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    pub version: String,
    /// Query parameter name the backend uses for versions ("version", "revision").
    pub version_identifier: String,
    pub modified: Option<String>,
    pub modified_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl RevisionMetadata {
    pub fn new(version: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            version: version.into(),
            version_identifier: "version".to_string(),
            modified: Some(modified.to_rfc3339()),
            modified_utc: Some(modified),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn serialize(&self) -> Value {
        json!({
            "version": self.version,
            "versionIdentifier": self.version_identifier,
            "modified": self.modified,
            "modified_utc": self.modified_utc,
            "extra": self.extra,
        })
    }
}

/// What a provider lets callers do, used to null out links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub writable: bool,
}

impl Capabilities {
    pub fn read_write() -> Self {
        Self { writable: true }
    }

    pub fn read_only() -> Self {
        Self { writable: false }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::read_write()
    }
}

/// Operation links rendered with metadata; `None` for operations the
/// provider cannot perform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Links {
    pub delete: Option<String>,
    pub upload: Option<String>,
    #[serde(rename = "move")]
    pub move_to: Option<String>,
    pub download: Option<String>,
    pub new_folder: Option<String>,
}

/// Builds [`Links`] under a configured base URL.
#[derive(Debug, Clone)]
pub struct LinkBuilder {
    base_url: String,
}

impl LinkBuilder {
    pub fn new(config: &LinksConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn links(&self, metadata: &Metadata, capabilities: Capabilities) -> Links {
        let url = format!("{}/{}{}", self.base_url, metadata.provider(), metadata.path());
        let writable = capabilities.writable;

        match metadata {
            Metadata::File(_) => Links {
                delete: writable.then(|| url.clone()),
                upload: writable.then(|| format!("{}?kind=file", url)),
                move_to: writable.then(|| url.clone()),
                download: Some(url),
                new_folder: None,
            },
            Metadata::Folder(_) => Links {
                delete: writable.then(|| url.clone()),
                upload: writable.then(|| format!("{}?kind=file", url)),
                move_to: writable.then(|| url.clone()),
                download: None,
                new_folder: writable.then(|| format!("{}?kind=folder", url)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> Metadata {
        let path = StoragePath::parse("/a/b/file.bin").unwrap();
        Metadata::File(
            FileMetadata::new("memory", &path, 10, "etag-1")
                .with_content_type("application/octet-stream")
                .with_hash("md5", "abc123"),
        )
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = sample_file();
        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: Metadata = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, metadata);
        assert_eq!(deserialized.kind(), Kind::File);
        assert_eq!(deserialized.hash("md5"), Some("abc123"));
    }

    #[test]
    fn test_folder_has_no_size() {
        let path = StoragePath::parse("/newdir/").unwrap();
        let metadata = Metadata::Folder(FolderMetadata::new("memory", &path));
        assert_eq!(metadata.size(), None);
        assert_eq!(metadata.name(), "newdir");
        assert_eq!(metadata.path(), "/newdir/");
    }

    #[test]
    fn test_links_for_writable_file() {
        let builder = LinkBuilder::new(&LinksConfig {
            base_url: "http://localhost:7777/v1/resources/abc/providers/".to_string(),
        });
        let links = builder.links(&sample_file(), Capabilities::read_write());

        assert_eq!(
            links.download.as_deref(),
            Some("http://localhost:7777/v1/resources/abc/providers/memory/a/b/file.bin")
        );
        assert!(links.upload.unwrap().ends_with("?kind=file"));
        assert!(links.new_folder.is_none());
    }

    #[test]
    fn test_links_for_read_only_provider() {
        let builder = LinkBuilder::new(&LinksConfig::default());
        let links = builder.links(&sample_file(), Capabilities::read_only());

        assert!(links.delete.is_none());
        assert!(links.upload.is_none());
        assert!(links.move_to.is_none());
        assert!(links.download.is_some());

        let rendered = sample_file().serialize(Some(&links));
        assert!(rendered["links"]["delete"].is_null());
        assert_eq!(rendered["kind"], "file");
        assert_eq!(rendered["size"], 10);
    }
}
