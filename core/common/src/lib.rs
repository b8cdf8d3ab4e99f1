//! Common types shared across the Stowage gateway crates.
//!
//! This crate holds the provider-independent vocabulary: the error
//! taxonomy every backend failure is mapped into, the path identity model,
//! the normalized metadata descriptors and the configuration structs that
//! are assembled once at process start.

pub mod config;
pub mod error;
pub mod metadata;
pub mod path;

pub use config::{
    GatewayConfig, HttpConfig, LinksConfig, RetryConfig, StreamConfig, TaskConfig, UploadConfig,
};
pub use error::{Error, ErrorPayload, Result};
pub use metadata::{
    Capabilities, FileMetadata, FolderMetadata, LinkBuilder, Links, Metadata, MetadataResponse,
    RevisionMetadata,
};
pub use path::{Kind, PathSegment, SegmentContext, StoragePath};
