//! Local filesystem backend - serves a host directory as capabilities

use std::fs::{Metadata, Permissions};
use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncSeekExt;
use tracing::debug;

use capfs_core::path::validate_filename;
use capfs_core::{
    ByteStream, CancelHandle, Capability, Directory, DirectoryEntry, EntrySink, File, FsError,
    FsResult, MainView, Node, NodeKind, RwDirectory, RwFile, StatInfo, WriteSession, APPEND,
    DEFAULT_CHUNK_SIZE, DEFAULT_ENTRY_BATCH_SIZE,
};

use crate::listing::{spawn_listing, EntrySource};
use crate::persist::NodeToken;
use crate::transfer::{spawn_read, spawn_write};
use crate::WRITE_QUEUE_DEPTH;

/// Tuning knobs for the local backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendOptions {
    /// Maximum entries per listing push
    pub entry_batch_size: usize,
    /// Maximum bytes per read chunk
    pub chunk_size: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            entry_batch_size: DEFAULT_ENTRY_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

const FILE_MODE: u32 = 0o644;
const EXEC_FILE_MODE: u32 = 0o755;
const EXEC_BITS: u32 = 0o111;

fn owner_writable(meta: &Metadata) -> bool {
    meta.permissions().mode() & 0o200 != 0
}

fn owner_executable(meta: &Metadata) -> bool {
    meta.is_file() && meta.permissions().mode() & 0o100 != 0
}

fn kind_of(meta: &Metadata) -> NodeKind {
    if meta.is_dir() {
        NodeKind::Directory
    } else {
        NodeKind::File
    }
}

/// Stat result for a child of a directory with the given writability
fn child_info(meta: &Metadata, parent_writable: bool) -> StatInfo {
    let writable = parent_writable && owner_writable(meta);
    match kind_of(meta) {
        NodeKind::Directory => StatInfo::dir(writable),
        NodeKind::File => StatInfo::file(meta.len(), writable, owner_executable(meta)),
    }
}

/// A file or directory on the host
///
/// Writability is decided once, when the node is produced: a child is
/// writable only if its parent was and its owner write bit is set.
pub struct LocalNode {
    path: PathBuf,
    kind: NodeKind,
    writable: bool,
    executable: AtomicBool,
    options: BackendOptions,
}

impl Clone for LocalNode {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            kind: self.kind,
            writable: self.writable,
            executable: AtomicBool::new(self.executable.load(Ordering::Relaxed)),
            options: self.options,
        }
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("writable", &self.writable)
            .finish()
    }
}

impl LocalNode {
    /// Open a host path as a root node. Its writability comes from the
    /// owner write bit alone.
    ///
    /// The path is canonicalized first, so every node derived from it and
    /// every token it saves carries an absolute path without `..`.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = std::fs::canonicalize(path)?;
        let meta = std::fs::metadata(&path)?;
        Ok(Self::from_parts(
            path,
            kind_of(&meta),
            owner_writable(&meta),
            owner_executable(&meta),
            BackendOptions::default(),
        ))
    }

    pub(crate) fn from_parts(
        path: PathBuf,
        kind: NodeKind,
        writable: bool,
        executable: bool,
        options: BackendOptions,
    ) -> Self {
        Self {
            path,
            kind,
            writable,
            executable: AtomicBool::new(executable),
            options,
        }
    }

    pub fn with_options(mut self, options: BackendOptions) -> Self {
        self.options = options;
        self
    }

    /// Same node, stripped of write access
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_executable(&self) -> bool {
        self.executable.load(Ordering::Relaxed)
    }

    pub fn options(&self) -> BackendOptions {
        self.options
    }

    /// Wrap this node in the capability variant its kind and writability
    /// select.
    pub fn capability(self) -> Capability {
        let node = Arc::new(self);
        match (node.kind, node.writable) {
            (NodeKind::Directory, false) => Capability::Directory(node),
            (NodeKind::Directory, true) => Capability::RwDirectory(node),
            (NodeKind::File, false) => Capability::File(node),
            (NodeKind::File, true) => Capability::RwFile(node),
        }
    }

    fn child(&self, path: PathBuf, meta: &Metadata) -> Self {
        Self::from_parts(
            path,
            kind_of(meta),
            self.writable && owner_writable(meta),
            owner_executable(meta),
            self.options,
        )
    }

    fn child_path(&self, name: &str) -> FsResult<PathBuf> {
        validate_filename(name)?;
        Ok(self.path.join(name))
    }
}

#[async_trait]
impl Node for LocalNode {
    async fn stat(&self) -> FsResult<StatInfo> {
        let meta = fs::metadata(&self.path).await.map_err(|e| {
            debug!(path = ?self.path, error = %e, "stat failed");
            FsError::censor(&e)
        })?;

        Ok(match self.kind {
            NodeKind::Directory => StatInfo::dir(self.writable),
            NodeKind::File => StatInfo::file(meta.len(), self.writable, self.is_executable()),
        })
    }

    async fn save(&self) -> FsResult<Vec<u8>> {
        NodeToken::from(self).encode()
    }
}

/// Reads a host directory in batches, skipping entries that vanish or
/// cannot be named
struct ReadDirSource {
    entries: fs::ReadDir,
    writable: bool,
}

#[async_trait]
impl EntrySource for ReadDirSource {
    async fn next_batch(&mut self, max: usize) -> io::Result<Vec<DirectoryEntry>> {
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(entry) = self.entries.next_entry().await? else {
                break;
            };

            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    debug!(name = ?raw, "skipping entry with non-UTF-8 name");
                    continue;
                }
            };
            // Follow symlinks so listing agrees with walk
            let meta = match fs::metadata(entry.path()).await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!(name = %name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            match DirectoryEntry::new(name, child_info(&meta, self.writable)) {
                Ok(entry) => batch.push(entry),
                Err(e) => debug!(error = %e, "skipping entry with illegal name"),
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl Directory for LocalNode {
    async fn list(&self, sink: Arc<dyn EntrySink>) -> FsResult<CancelHandle> {
        let entries = fs::read_dir(&self.path).await.map_err(|e| {
            debug!(path = ?self.path, error = %e, "read_dir failed");
            FsError::OpenFailed
        })?;

        let source = ReadDirSource {
            entries,
            writable: self.writable,
        };
        let listing = spawn_listing(source, sink, self.options.entry_batch_size);
        Ok(Arc::new(listing.cancel))
    }

    async fn walk(&self, name: &str) -> FsResult<Capability> {
        let path = self.child_path(name)?;
        let meta = fs::metadata(&path).await.map_err(|e| FsError::censor(&e))?;
        Ok(self.child(path, &meta).capability())
    }
}

#[async_trait]
impl RwDirectory for LocalNode {
    async fn create(&self, name: &str, executable: bool) -> FsResult<Arc<dyn RwFile>> {
        let path = self.child_path(name)?;
        let mode = if executable { EXEC_FILE_MODE } else { FILE_MODE };

        fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(&path)
            .await
            .map_err(|e| {
                debug!(path = ?path, error = %e, "create failed");
                FsError::OpenFailed
            })?;

        Ok(Arc::new(Self::from_parts(
            path,
            NodeKind::File,
            true,
            executable,
            self.options,
        )))
    }

    async fn mkdir(&self, name: &str) -> FsResult<Arc<dyn RwDirectory>> {
        let path = self.child_path(name)?;
        fs::create_dir(&path).await.map_err(|e| {
            debug!(path = ?path, error = %e, "mkdir failed");
            FsError::OpenFailed
        })?;

        Ok(Arc::new(Self::from_parts(
            path,
            NodeKind::Directory,
            true,
            false,
            self.options,
        )))
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        let path = self.child_path(name)?;
        let meta = fs::symlink_metadata(&path)
            .await
            .map_err(|e| FsError::censor(&e))?;

        let removed = if meta.is_dir() {
            fs::remove_dir_all(&path).await
        } else {
            fs::remove_file(&path).await
        };
        removed.map_err(|e| {
            debug!(path = ?path, error = %e, "delete failed");
            FsError::censor(&e)
        })
    }
}

#[async_trait]
impl File for LocalNode {
    async fn read(
        &self,
        start_at: i64,
        amount: u64,
        sink: Arc<dyn ByteStream>,
    ) -> FsResult<CancelHandle> {
        if start_at < 0 {
            return Err(FsError::InvalidArgument);
        }

        let mut file = fs::File::open(&self.path).await.map_err(|e| {
            debug!(path = ?self.path, error = %e, "open for read failed");
            FsError::OpenFailed
        })?;
        file.seek(SeekFrom::Start(start_at as u64))
            .await
            .map_err(|_| FsError::OpenFailed)?;

        let transfer = spawn_read(file, amount, sink, self.options.chunk_size);
        Ok(Arc::new(transfer.cancel))
    }
}

#[async_trait]
impl RwFile for LocalNode {
    async fn write(&self, start_at: i64) -> FsResult<WriteSession> {
        let position = match start_at {
            APPEND => SeekFrom::End(0),
            n if n >= 0 => SeekFrom::Start(n as u64),
            _ => return Err(FsError::InvalidArgument),
        };

        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                debug!(path = ?self.path, error = %e, "open for write failed");
                FsError::OpenFailed
            })?;
        file.seek(position).await.map_err(|_| FsError::OpenFailed)?;

        let (sink, transfer) = spawn_write(file, WRITE_QUEUE_DEPTH);
        Ok(WriteSession {
            sink: Arc::new(sink),
            cancel: Arc::new(transfer.cancel),
        })
    }

    async fn set_exec(&self, exec: bool) -> FsResult<()> {
        let meta = fs::metadata(&self.path)
            .await
            .map_err(|e| FsError::censor(&e))?;

        let mut mode = meta.permissions().mode();
        if exec {
            mode |= EXEC_BITS;
        } else {
            mode &= !EXEC_BITS;
        }
        fs::set_permissions(&self.path, Permissions::from_mode(mode))
            .await
            .map_err(|_| FsError::OpenFailed)?;

        self.executable.store(exec, Ordering::Relaxed);
        Ok(())
    }

    async fn truncate(&self, size: u64) -> FsResult<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|_| FsError::OpenFailed)?;
        file.set_len(size).await.map_err(|_| FsError::OpenFailed)
    }
}

/// Main view over a local root directory
pub struct LocalBackend {
    root: LocalNode,
}

impl LocalBackend {
    pub fn new(root: LocalNode) -> Self {
        Self { root }
    }

    /// Open `path` as the served root with default options.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::new(LocalNode::open(path)?))
    }

    pub fn root_node(&self) -> &LocalNode {
        &self.root
    }
}

#[async_trait]
impl MainView for LocalBackend {
    async fn root(&self) -> FsResult<Capability> {
        Ok(self.root.clone().capability())
    }

    async fn restore(&self, token: &[u8]) -> FsResult<Capability> {
        let node = NodeToken::decode(token)?.restore_within(&self.root)?;
        Ok(node.capability())
    }
}
