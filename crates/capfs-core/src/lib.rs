//! capfs Core - Shared types, capability traits, and protocol definitions
//!
//! This crate contains the contract shared by every capfs backend and every
//! consumer of the filesystem protocol. It has no dependencies on sockets or
//! host filesystem code.

pub mod capability;
pub mod error;
pub mod path;
pub mod protocol;
pub mod types;

pub use capability::*;
pub use error::*;
pub use protocol::*;
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default number of directory entries per pushed batch
pub const DEFAULT_ENTRY_BATCH_SIZE: usize = 1024;

/// Default chunk size for byte transfers (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
