//! Multi-component path resolution on top of single-name `walk`

use std::sync::Arc;

use capfs_core::path::{split_path, validate_filename};
use capfs_core::{Capability, FsError, FsResult, RwDirectory, StatInfo};

/// Walk `components` one at a time starting from `start`.
///
/// Each name is checked before it is sent anywhere, and each intermediate
/// capability is dropped as soon as the next one is obtained.
pub async fn resolve<S: AsRef<str>>(start: Capability, components: &[S]) -> FsResult<Capability> {
    let mut current = start;
    for name in components {
        let name = name.as_ref();
        validate_filename(name)?;
        let dir = current.into_directory()?;
        current = dir.walk(name).await?;
    }
    Ok(current)
}

/// Resolve a slash-delimited path. Empty components are ignored.
pub async fn resolve_path(start: Capability, path: &str) -> FsResult<Capability> {
    resolve(start, &split_path(path)).await
}

/// A node reached by path, with its last name and attributes
#[derive(Debug)]
pub struct OpenedNode {
    /// Final path component, or empty for the root
    pub name: String,
    pub node: Capability,
    pub info: StatInfo,
}

pub async fn open_path(root: Capability, path: &str) -> FsResult<OpenedNode> {
    let components = split_path(path);
    let name = components.last().copied().unwrap_or_default().to_string();
    let node = resolve(root, &components).await?;
    let info = node.stat().await?;
    Ok(OpenedNode { name, node, info })
}

/// Make sure every directory in `components` exists below `root`, creating
/// missing ones, and return the innermost.
pub async fn ensure_directories<S: AsRef<str>>(
    root: Arc<dyn RwDirectory>,
    components: &[S],
) -> FsResult<Arc<dyn RwDirectory>> {
    let mut current = root;
    for name in components {
        let name = name.as_ref();
        validate_filename(name)?;
        current = match current.mkdir(name).await {
            Ok(dir) => dir,
            Err(FsError::IllegalFileName) => return Err(FsError::IllegalFileName),
            // Most likely it already exists
            Err(_) => current.walk(name).await?.into_rw_directory()?,
        };
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalNode;
    use capfs_core::CapKind;
    use tempfile::TempDir;

    fn tree() -> (TempDir, Capability) {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("a/b")).unwrap();
        std::fs::write(temp.path().join("a/b/c.txt"), b"deep").unwrap();
        let root = LocalNode::open(temp.path()).unwrap().capability();
        (temp, root)
    }

    #[tokio::test]
    async fn test_resolve_nested() {
        let (_temp, root) = tree();
        let file = resolve(root.clone(), &["a", "b", "c.txt"]).await.unwrap();
        assert_eq!(file.stat().await.unwrap().size(), 4);

        let same = resolve_path(root.clone(), "//a/b//c.txt/").await.unwrap();
        assert_eq!(same.save().await.unwrap(), file.save().await.unwrap());

        let itself = resolve_path(root.clone(), "/").await.unwrap();
        assert_eq!(itself.save().await.unwrap(), root.save().await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let (_temp, root) = tree();
        assert_eq!(
            resolve_path(root.clone(), "a/../a").await.err(),
            Some(FsError::IllegalFileName)
        );
        assert_eq!(
            resolve_path(root.clone(), "a/missing/x").await.err(),
            Some(FsError::NotFound)
        );
        // Walking through a file
        assert_eq!(
            resolve_path(root, "a/b/c.txt/more").await.err(),
            Some(FsError::NotImplemented)
        );
    }

    #[tokio::test]
    async fn test_open_path() {
        let (_temp, root) = tree();
        let opened = open_path(root.clone(), "/a/b/c.txt").await.unwrap();
        assert_eq!(opened.name, "c.txt");
        assert_eq!(opened.info.size(), 4);
        assert_eq!(opened.node.cap_kind(), CapKind::RwFile);

        let top = open_path(root, "").await.unwrap();
        assert_eq!(top.name, "");
        assert!(top.info.is_dir());
    }

    #[tokio::test]
    async fn test_ensure_directories() {
        let (temp, root) = tree();
        let root = root.into_rw_directory().unwrap();

        let leaf = ensure_directories(root.clone(), &["a", "new", "deeper"])
            .await
            .unwrap();
        assert!(temp.path().join("a/new/deeper").is_dir());
        leaf.create("x", false).await.unwrap();
        assert!(temp.path().join("a/new/deeper/x").is_file());

        // Idempotent
        ensure_directories(root.clone(), &["a", "new", "deeper"])
            .await
            .unwrap();

        assert_eq!(
            ensure_directories(root, &["a", ".."]).await.err(),
            Some(FsError::IllegalFileName)
        );
    }
}
