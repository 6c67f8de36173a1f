//! Capability interfaces
//!
//! Every object a peer can invoke is one of the traits below. Local backends
//! implement them directly; the RPC layer implements them again as proxies
//! that forward each call over a connection. Callers cannot tell the two
//! apart.
//!
//! Filesystem nodes come in four leaf flavours, selected once from
//! `(kind, writable)` and carried in the closed [`Capability`] enum:
//!
//! ```text
//!              Node (stat, save)
//!             /                \
//!      Directory               File
//!   (list, walk)              (read)
//!         |                      |
//!   RwDirectory               RwFile
//! (create, mkdir, delete)   (write, set_exec, truncate)
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, FsResult};
use crate::types::{CapKind, DirectoryEntry, NodeKind, StatInfo};

#[async_trait]
pub trait Node: Send + Sync {
    async fn stat(&self) -> FsResult<StatInfo>;

    /// Serialize this node's identity into an opaque token that the
    /// backend's [`MainView::restore`] turns back into a live capability.
    async fn save(&self) -> FsResult<Vec<u8>>;
}

#[async_trait]
pub trait Directory: Node {
    /// Start streaming the directory's entries into `sink`.
    ///
    /// Returns as soon as the stream is running. The handle stops the
    /// producer; after cancellation `done` is never called.
    async fn list(&self, sink: Arc<dyn EntrySink>) -> FsResult<CancelHandle>;

    /// Narrow to a single child.
    async fn walk(&self, name: &str) -> FsResult<Capability>;
}

#[async_trait]
pub trait RwDirectory: Directory {
    /// Create (or open, if it already exists) a file. Never truncates.
    async fn create(&self, name: &str, executable: bool) -> FsResult<Arc<dyn RwFile>>;

    async fn mkdir(&self, name: &str) -> FsResult<Arc<dyn RwDirectory>>;

    async fn delete(&self, name: &str) -> FsResult<()>;
}

#[async_trait]
pub trait File: Node {
    /// Copy up to `amount` bytes starting at `start_at` into `sink`.
    /// An `amount` of 0 reads to end of file.
    async fn read(
        &self,
        start_at: i64,
        amount: u64,
        sink: Arc<dyn ByteStream>,
    ) -> FsResult<CancelHandle>;
}

#[async_trait]
pub trait RwFile: File {
    /// Open a write session. `start_at` is an absolute offset, or
    /// [`APPEND`] to start at the current end of file.
    async fn write(&self, start_at: i64) -> FsResult<WriteSession>;

    async fn set_exec(&self, exec: bool) -> FsResult<()>;

    async fn truncate(&self, size: u64) -> FsResult<()>;
}

/// `start_at` sentinel for [`RwFile::write`]
pub const APPEND: i64 = -1;

/// Receiver side of a directory listing
#[async_trait]
pub trait EntrySink: Send + Sync {
    async fn push(&self, entries: Vec<DirectoryEntry>) -> FsResult<()>;

    async fn done(&self) -> FsResult<()>;
}

/// Generic byte transfer capability
#[async_trait]
pub trait ByteStream: Send + Sync {
    async fn write(&self, data: Vec<u8>) -> FsResult<()>;

    /// No more data will follow.
    async fn done(&self) -> FsResult<()>;

    /// Hint about the total number of bytes about to be written.
    async fn expect_size(&self, _size: u64) -> FsResult<()> {
        Ok(())
    }
}

/// Lets the initiator of a long-running operation stop it early.
///
/// Cancellation is cooperative: the operation notices at its next
/// suspension point. Cancelling twice is a no-op.
pub trait Cancel: Send + Sync {
    fn cancel(&self);
}

pub type CancelHandle = Arc<dyn Cancel>;

impl Cancel for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self)
    }
}

/// Result of [`RwFile::write`]
pub struct WriteSession {
    pub sink: Arc<dyn ByteStream>,
    pub cancel: CancelHandle,
}

/// Entry point handed out on bootstrap
#[async_trait]
pub trait MainView: Send + Sync {
    /// The root directory capability
    async fn root(&self) -> FsResult<Capability>;

    /// Turn a token produced by [`Node::save`] back into a live capability.
    async fn restore(&self, token: &[u8]) -> FsResult<Capability>;
}

/// A filesystem capability of a known leaf kind
#[derive(Clone)]
pub enum Capability {
    Directory(Arc<dyn Directory>),
    RwDirectory(Arc<dyn RwDirectory>),
    File(Arc<dyn File>),
    RwFile(Arc<dyn RwFile>),
}

impl Capability {
    pub fn kind(&self) -> NodeKind {
        match self {
            Capability::Directory(_) | Capability::RwDirectory(_) => NodeKind::Directory,
            Capability::File(_) | Capability::RwFile(_) => NodeKind::File,
        }
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, Capability::RwDirectory(_) | Capability::RwFile(_))
    }

    pub fn cap_kind(&self) -> CapKind {
        CapKind::for_node(self.kind(), self.is_writable())
    }

    pub fn node(&self) -> Arc<dyn Node> {
        match self {
            Capability::Directory(d) => d.clone() as Arc<dyn Node>,
            Capability::RwDirectory(d) => d.clone() as Arc<dyn Node>,
            Capability::File(f) => f.clone() as Arc<dyn Node>,
            Capability::RwFile(f) => f.clone() as Arc<dyn Node>,
        }
    }

    pub async fn stat(&self) -> FsResult<StatInfo> {
        self.node().stat().await
    }

    pub async fn save(&self) -> FsResult<Vec<u8>> {
        self.node().save().await
    }

    pub fn into_directory(self) -> FsResult<Arc<dyn Directory>> {
        match self {
            Capability::Directory(d) => Ok(d),
            Capability::RwDirectory(d) => Ok(d as Arc<dyn Directory>),
            _ => Err(FsError::NotImplemented),
        }
    }

    pub fn into_rw_directory(self) -> FsResult<Arc<dyn RwDirectory>> {
        match self {
            Capability::RwDirectory(d) => Ok(d),
            _ => Err(FsError::NotImplemented),
        }
    }

    pub fn into_file(self) -> FsResult<Arc<dyn File>> {
        match self {
            Capability::File(f) => Ok(f),
            Capability::RwFile(f) => Ok(f as Arc<dyn File>),
            _ => Err(FsError::NotImplemented),
        }
    }

    pub fn into_rw_file(self) -> FsResult<Arc<dyn RwFile>> {
        match self {
            Capability::RwFile(f) => Ok(f),
            _ => Err(FsError::NotImplemented),
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Capability").field(&self.cap_kind()).finish()
    }
}
