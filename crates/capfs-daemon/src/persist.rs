//! Capability persistence for the local backend
//!
//! A saved node is a small JSON document naming its host path and the
//! attributes fixed when the capability was produced. Restoring never
//! touches the host: the node is rebuilt as-is and fails later, on use, if
//! the path has gone away.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use capfs_core::path::is_confined;
use capfs_core::{FsError, FsResult, NodeKind};

use crate::local::LocalNode;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeToken {
    pub kind: NodeKind,
    pub writable: bool,
    #[serde(default)]
    pub executable: bool,
    pub path: PathBuf,
}

impl From<&LocalNode> for NodeToken {
    fn from(node: &LocalNode) -> Self {
        Self {
            kind: node.kind(),
            writable: node.is_writable(),
            executable: node.is_executable(),
            path: node.path().to_path_buf(),
        }
    }
}

impl NodeToken {
    pub fn encode(&self) -> FsResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FsError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> FsResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| FsError::Decode(e.to_string()))
    }

    /// Rebuild the node this token describes, trusting it completely.
    pub fn restore(self, template: &LocalNode) -> LocalNode {
        LocalNode::from_parts(
            self.path,
            self.kind,
            self.writable,
            self.executable,
            template.options(),
        )
    }

    /// Rebuild the node, refusing paths outside `root` and never granting
    /// more write access than `root` has.
    pub fn restore_within(mut self, root: &LocalNode) -> FsResult<LocalNode> {
        if !self.path.is_absolute() || !is_confined(root.path(), &self.path) {
            warn!(path = ?self.path, "rejecting token outside the served root");
            return Err(FsError::InvalidArgument);
        }
        self.writable &= root.is_writable();
        Ok(self.restore(root))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capfs_core::{CapKind, Directory, MainView};
    use tempfile::TempDir;

    use crate::local::LocalBackend;

    #[tokio::test]
    async fn test_save_restore_preserves_identity() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("docs")).unwrap();
        std::fs::write(temp.path().join("docs/a.txt"), b"abc").unwrap();
        let root = LocalNode::open(temp.path()).unwrap();
        let backend = LocalBackend::new(root.clone());

        let docs = root.walk("docs").await.unwrap();
        let token = docs.save().await.unwrap();
        let restored = backend.restore(&token).await.unwrap();

        assert_eq!(restored.cap_kind(), CapKind::RwDirectory);
        assert_eq!(restored.stat().await.unwrap(), docs.stat().await.unwrap());
        assert_eq!(restored.save().await.unwrap(), token);

        let file = restored.into_directory().unwrap().walk("a.txt").await.unwrap();
        assert_eq!(file.stat().await.unwrap().size(), 3);
    }

    #[tokio::test]
    async fn test_restore_does_not_touch_host() {
        let temp = TempDir::new().unwrap();
        let root = LocalNode::open(temp.path()).unwrap();
        let ghost_path = root.path().join("ghost.txt");
        let backend = LocalBackend::new(root);

        let token = NodeToken {
            kind: NodeKind::File,
            writable: true,
            executable: false,
            path: ghost_path,
        }
        .encode()
        .unwrap();

        let ghost = backend.restore(&token).await.unwrap();
        assert!(!temp.path().join("ghost.txt").exists());
        assert_eq!(ghost.stat().await.err(), Some(FsError::NotFound));
    }

    #[tokio::test]
    async fn test_malformed_token() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(LocalNode::open(temp.path()).unwrap());

        match backend.restore(b"not json").await {
            Err(FsError::Decode(_)) => {}
            other => panic!("expected decode error, got {:?}", other),
        }
        match backend.restore(br#"{"kind":"socket","writable":true,"path":"/"}"#).await {
            Err(FsError::Decode(_)) => {}
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restore_confined_to_root() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("served")).unwrap();
        let root = LocalNode::open(temp.path().join("served")).unwrap();
        let served = root.path().to_path_buf();
        let backend = LocalBackend::new(root.read_only());

        for path in [
            served.join(".."),
            served.join("../other"),
            PathBuf::from("relative"),
        ] {
            let token = NodeToken {
                kind: NodeKind::Directory,
                writable: true,
                executable: false,
                path,
            };
            assert_eq!(
                backend.restore(&token.encode().unwrap()).await.err(),
                Some(FsError::InvalidArgument)
            );
        }

        let inside = NodeToken {
            kind: NodeKind::Directory,
            writable: true,
            executable: false,
            path: served.join("sub"),
        };
        let cap = backend.restore(&inside.encode().unwrap()).await.unwrap();
        assert_eq!(cap.cap_kind(), CapKind::Directory);
    }

    async fn assert_round_trips(backend: &LocalBackend) {
        let root = backend.root().await.unwrap().into_directory().unwrap();
        let file = root.walk("a.txt").await.unwrap();
        let token = file.save().await.unwrap();

        let saved = NodeToken::decode(&token).unwrap();
        assert!(saved.path.is_absolute());

        let restored = backend.restore(&token).await.unwrap();
        assert_eq!(restored.cap_kind(), CapKind::RwFile);
        assert_eq!(restored.stat().await.unwrap().size(), 3);
        assert_eq!(restored.save().await.unwrap(), token);
    }

    #[tokio::test]
    async fn test_restore_with_relative_root() {
        let temp = tempfile::Builder::new().tempdir_in(".").unwrap();
        assert!(temp.path().is_relative());
        std::fs::write(temp.path().join("a.txt"), b"abc").unwrap();

        assert_round_trips(&LocalBackend::open(temp.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn test_restore_with_dotdot_root() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("x")).unwrap();
        std::fs::write(temp.path().join("a.txt"), b"abc").unwrap();

        assert_round_trips(&LocalBackend::open(temp.path().join("x/..")).unwrap()).await;
    }

    #[test]
    fn test_unencodable_path_is_not_a_decode_error() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let token = NodeToken {
            kind: NodeKind::File,
            writable: false,
            executable: false,
            path: PathBuf::from(OsStr::from_bytes(b"/bad\xff")),
        };
        match token.encode() {
            Err(FsError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_executable_defaults_false() {
        let token = NodeToken::decode(br#"{"kind":"file","writable":false,"path":"/x"}"#).unwrap();
        assert!(!token.executable);
        assert_eq!(token.kind, NodeKind::File);
    }
}
