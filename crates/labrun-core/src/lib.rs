//! # labrun-core
//!
//! Shared primitives for the labrun experiment orchestrator.
//!
//! This crate provides the foundational pieces used by every labrun component:
//!
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//! - **Storage**: Object storage contract with in-memory and `object_store` backends
//! - **Locking**: A storage-backed distributed lock with TTL expiry
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use labrun_core::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let storage = Arc::new(MemoryBackend::new());
//! let lock = DistributedLock::new(storage, "locks/projects/7/submission.lock");
//!
//! if let Some(guard) = lock.try_acquire(Duration::from_secs(30)).await? {
//!     // critical section
//!     guard.release().await?;
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod lock;
pub mod observability;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::lock::{DistributedLock, LockGuard, LockInfo};
    pub use crate::storage::{
        MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition,
        WriteResult,
    };
}

pub use error::{Error, Result};
pub use lock::{DistributedLock, LockGuard, LockInfo};
pub use observability::{LogFormat, init_logging};
pub use storage::{
    MemoryBackend, ObjectMeta, ObjectStoreBackend, StorageBackend, WritePrecondition, WriteResult,
};
