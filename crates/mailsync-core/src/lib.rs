//! # mailsync-core
//!
//! Protocol-agnostic synchronization core for offline-capable mail clients.
//!
//! This crate provides:
//! - **Backoff endpoint** - failure tracking with exponential retry delays
//! - **Connection broker** - one serialized connection per incoming account
//! - **Sync window sizer** - adaptive time windows for folder sync passes
//! - **Job driver** - durable, per-folder ordered mutation queue with retries
//! - **Folder block cache** - size-bounded header/body blocks with accuracy
//!   ranges and a purge policy
//!
//! POP3 and IMAP backends plug in by implementing [`ProtocolClient`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod backoff;
pub mod broker;
pub mod cache;
pub mod config;
mod error;
pub mod jobs;
mod model;
pub mod protocol;
pub mod window;

#[cfg(test)]
mod testing;

pub use account::{IncomingAccount, SyncReport};
pub use backoff::{BackoffEndpoint, EndpointState};
pub use broker::{BrokerStatus, ConnectionBroker, ConnectionLease, ConnectionState};
pub use cache::{BlockRepository, CachedBody, CachedHeader, FolderBlockCache};
pub use config::{SharedConfig, SyncConfig, SyncOverrides};
pub use error::{ConnectError, ConnectErrorKind, Error, ProtocolError, ProtocolErrorKind, Result};
pub use jobs::{
    JobDriver, JobId, JobStatus, JobTicket, MutationJob, MutationStore, OperationType,
    SqliteMutationStore,
};
pub use model::{AccountId, DateRange, FolderId, MessageUid};
pub use protocol::{
    Connection, Direction, NoopReporter, ProblemReporter, ProtocolClient, SyncBatch, SyncRequest,
};
pub use window::{SyncWindow, WindowAction, WindowAdvice, next_window};
