//! Storage provider abstraction for Stowage.
//!
//! Every backend is reached through the [`Provider`] trait. Adapters
//! translate its operations into backend calls; copy, move and folder
//! downloads are written once in [`transfer`] on top of it.
//!
//! # Design Principles
//! - Provider isolation: callers never name a concrete adapter
//! - Async operations: All I/O operations are async
//! - Streaming support: payloads move chunk by chunk, never buffered whole
//! - Unified error semantics: backend failures leave as `stowage_common::Error`

pub mod blocks;
pub mod http;
pub mod local;
pub mod memory;
pub mod provider;
pub mod readonly;
pub mod registry;
pub mod retry;
pub mod transfer;

#[cfg(test)]
mod contract_tests;

pub use blocks::{BlockSink, BlockUploadPlan};
pub use http::{BackendClient, BackendRequest, ErrorMapper};
pub use local::LocalProvider;
pub use memory::MemoryProvider;
pub use provider::{check_root_delete, ConflictPolicy, DownloadOptions, Provider};
pub use readonly::ReadOnlyProvider;
pub use registry::{create_default_registry, ProviderFactory, ProviderRegistry};
pub use retry::RetryExecutor;
pub use transfer::{TransferKind, TransferOptions};
