//! Core type definitions for capfs
//!
//! These types are shared by every backend and every consumer and define the
//! values that flow through the filesystem protocol.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::path::validate_filename;

/// Type of filesystem node. Fixed when the node is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// Variant part of [`StatInfo`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatKind {
    File { size: u64 },
    Dir,
}

/// Result of `stat`
///
/// On the wire this is always one tag byte, a u64 size and two flags, so
/// encoding never branches on the variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireStatInfo", try_from = "WireStatInfo")]
pub struct StatInfo {
    pub kind: StatKind,
    pub writable: bool,
    pub executable: bool,
}

impl StatInfo {
    const TAG_FILE: u8 = 0;
    const TAG_DIR: u8 = 1;

    pub fn file(size: u64, writable: bool, executable: bool) -> Self {
        Self {
            kind: StatKind::File { size },
            writable,
            executable,
        }
    }

    pub fn dir(writable: bool) -> Self {
        Self {
            kind: StatKind::Dir,
            writable,
            executable: false,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, StatKind::Dir)
    }

    pub fn node_kind(&self) -> NodeKind {
        match self.kind {
            StatKind::File { .. } => NodeKind::File,
            StatKind::Dir => NodeKind::Directory,
        }
    }

    /// File size in bytes (0 for directories)
    pub fn size(&self) -> u64 {
        match self.kind {
            StatKind::File { size } => size,
            StatKind::Dir => 0,
        }
    }

    /// POSIX-style mode bits for mount adapters.
    ///
    /// The owner can always read; write and exec follow the flags.
    pub fn mode(&self) -> u32 {
        let mut mode = 0o400;
        if self.executable {
            mode |= 0o100;
        }
        if self.writable {
            mode |= 0o200;
        }
        match self.kind {
            StatKind::Dir => mode | libc::S_IFDIR as u32,
            StatKind::File { .. } => mode | libc::S_IFREG as u32,
        }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize)]
struct WireStatInfo(u8, u64, bool, bool);

impl From<StatInfo> for WireStatInfo {
    fn from(info: StatInfo) -> Self {
        let tag = match info.kind {
            StatKind::File { .. } => StatInfo::TAG_FILE,
            StatKind::Dir => StatInfo::TAG_DIR,
        };
        WireStatInfo(tag, info.size(), info.writable, info.executable)
    }
}

impl TryFrom<WireStatInfo> for StatInfo {
    type Error = String;

    fn try_from(w: WireStatInfo) -> Result<Self, Self::Error> {
        let kind = match w.0 {
            StatInfo::TAG_FILE => StatKind::File { size: w.1 },
            StatInfo::TAG_DIR => StatKind::Dir,
            other => return Err(format!("invalid stat tag: {}", other)),
        };
        Ok(Self {
            kind,
            writable: w.2,
            executable: w.3,
        })
    }
}

/// Directory entry as delivered by `list`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    pub info: StatInfo,
}

impl DirectoryEntry {
    /// Create an entry, rejecting names that could not be walked to.
    pub fn new(name: impl Into<String>, info: StatInfo) -> FsResult<Self> {
        let name = name.into();
        validate_filename(&name)?;
        Ok(Self { name, info })
    }
}

/// Concrete interface behind a capability descriptor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapKind {
    Directory,
    RwDirectory,
    File,
    RwFile,
    EntrySink,
    ByteStream,
    Handle,
}

impl CapKind {
    /// Leaf node kind selected by `(kind, writable)`
    pub fn for_node(kind: NodeKind, writable: bool) -> Self {
        match (kind, writable) {
            (NodeKind::Directory, false) => CapKind::Directory,
            (NodeKind::Directory, true) => CapKind::RwDirectory,
            (NodeKind::File, false) => CapKind::File,
            (NodeKind::File, true) => CapKind::RwFile,
        }
    }

    pub fn is_node(self) -> bool {
        matches!(
            self,
            CapKind::Directory | CapKind::RwDirectory | CapKind::File | CapKind::RwFile
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_wire_shape() {
        let info = StatInfo::file(42, true, false);
        let bytes = bincode::serialize(&info).unwrap();
        // tag + u64 + two bools
        assert_eq!(bytes.len(), 11);
        assert_eq!(bytes[0], 0);

        let dir = bincode::serialize(&StatInfo::dir(false)).unwrap();
        assert_eq!(dir.len(), 11);
        assert_eq!(dir[0], 1);

        let decoded: StatInfo = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_stat_rejects_unknown_tag() {
        let mut bytes = bincode::serialize(&StatInfo::dir(true)).unwrap();
        bytes[0] = 7;
        assert!(bincode::deserialize::<StatInfo>(&bytes).is_err());
    }

    #[test]
    fn test_mode_bits() {
        let ro = StatInfo::file(0, false, false);
        assert_eq!(ro.mode() & 0o777, 0o400);

        let rwx = StatInfo::file(0, true, true);
        assert_eq!(rwx.mode() & 0o777, 0o700);

        let dir = StatInfo::dir(false);
        assert_eq!(dir.mode() & libc::S_IFMT as u32, libc::S_IFDIR as u32);
        assert_eq!(dir.size(), 0);
        assert!(!dir.executable);
    }

    #[test]
    fn test_directory_entry_name_invariant() {
        let info = StatInfo::file(1, false, false);
        assert!(DirectoryEntry::new("notes.txt", info).is_ok());
        assert_eq!(
            DirectoryEntry::new("..", info),
            Err(FsError::IllegalFileName)
        );
        assert_eq!(
            DirectoryEntry::new("a/b", info),
            Err(FsError::IllegalFileName)
        );
    }

    #[test]
    fn test_cap_kind_for_node() {
        assert_eq!(CapKind::for_node(NodeKind::File, true), CapKind::RwFile);
        assert_eq!(
            CapKind::for_node(NodeKind::Directory, false),
            CapKind::Directory
        );
        assert!(!CapKind::Handle.is_node());
    }
}
