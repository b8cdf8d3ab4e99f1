//! Background copy and move tasks for Stowage.
//!
//! Long transfers are handed to a [`TaskPool`] instead of running inside the
//! request that asked for them. Each task moves through
//! `PENDING -> STARTED -> SUCCESS | FAILURE`; terminal records stay
//! queryable in the [`TaskStore`] until they expire. Tasks cannot be
//! cancelled once started.

pub mod pool;
pub mod store;

pub use pool::{Submission, TaskPool, TaskRequest};
pub use store::{spawn_sweeper, TaskId, TaskResult, TaskState, TaskStatus, TaskStore};
