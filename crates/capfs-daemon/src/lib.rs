//! capfs Daemon - local filesystem backend and capability RPC
//!
//! This crate provides:
//! - The reference backend serving a host directory as capabilities
//! - The streaming engines behind `list`, `read` and `write`
//! - A symmetric capability RPC layer over any byte stream (Unix sockets in
//!   the standalone server)
//! - Client helpers for path resolution, listing and transfers
//!
//! # Architecture
//!
//! Long-running operations never block the call that starts them:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              RPC dispatch (one task per call)               │
//! │  list / read / write open the host resource, spawn, return  │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ CancellationToken
//!                               │ (returned as the cancel handle)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Background stream task                     │
//! │  - owns the host file descriptor                            │
//! │  - awaits each push/write before producing the next         │
//! │  - checks cancellation at every suspension point            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod listing;
pub mod local;
pub mod net;
pub mod persist;
pub mod resolve;
pub mod rpc;
pub mod server;
pub mod transfer;

use capfs_core::FsError;

pub use client::{ClientError, FsClient};
pub use listing::{spawn_listing, EntryCollector, EntrySource, Listing};
pub use local::{BackendOptions, LocalBackend, LocalNode};
pub use persist::NodeToken;
pub use resolve::{ensure_directories, open_path, resolve, resolve_path, OpenedNode};
pub use rpc::RpcConnection;
pub use server::{FsServer, ServerConfig, ServerError};
pub use transfer::{spawn_read, spawn_write, ByteCollector, Transfer, WriteSink};

/// How a background stream task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Source exhausted (or failed on the host side) and `done` was delivered
    Completed,
    /// The cancel handle fired; `done` was not delivered
    Cancelled,
    /// The consumer rejected a push/write or `done`
    Aborted(FsError),
}

/// Chunks buffered between a write sink and the task that owns the file
pub const WRITE_QUEUE_DEPTH: usize = 4;
