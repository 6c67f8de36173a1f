//! capfs client - connects to a server socket and drives capabilities

use std::future::Future;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use capfs_core::{
    Capability, Directory, DirectoryEntry, File, FsError, FsResult, RwFile, DEFAULT_CHUNK_SIZE,
};

use crate::listing::EntryCollector;
use crate::net::{connect_socket, ConnectionError};
use crate::resolve::{open_path, OpenedNode};
use crate::rpc::RpcConnection;
use crate::transfer::ByteCollector;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Client end of a capfs connection
pub struct FsClient {
    conn: RpcConnection,
}

impl FsClient {
    /// Connect to a server listening on `socket`
    pub async fn connect(socket: impl AsRef<Path>) -> Result<Self, ClientError> {
        let socket = socket.as_ref();
        let stream = connect_socket(socket).await?;
        info!("Connected to {:?}", socket);
        Ok(Self::from_connection(RpcConnection::new(stream, None)))
    }

    pub fn from_connection(conn: RpcConnection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &RpcConnection {
        &self.conn
    }

    /// The served root directory
    pub async fn root(&self) -> FsResult<Capability> {
        self.conn.bootstrap().await
    }

    /// Turn a saved token back into a capability
    pub async fn restore(&self, token: &[u8]) -> FsResult<Capability> {
        self.conn.main_view().restore(token).await
    }

    /// Resolve a slash-delimited path from the root
    pub async fn open(&self, path: &str) -> FsResult<OpenedNode> {
        open_path(self.root().await?, path).await
    }

    /// Read a byte range into memory. An `amount` of 0 reads to end of file.
    pub async fn read(&self, file: &dyn File, start_at: i64, amount: u64) -> FsResult<Vec<u8>> {
        self.until_closed(read_range(file, start_at, amount)).await
    }

    /// Collect a directory listing, refusing more than `limit` entries
    pub async fn list(
        &self,
        dir: &dyn Directory,
        limit: Option<usize>,
    ) -> FsResult<Vec<DirectoryEntry>> {
        self.until_closed(list_entries(dir, limit)).await
    }

    /// Write `data` at `start_at` and wait until it is on the host
    pub async fn write(&self, file: &dyn RwFile, start_at: i64, data: &[u8]) -> FsResult<()> {
        self.until_closed(write_all(file, start_at, data)).await
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// Local consumers never hear `done` from a dead peer
    async fn until_closed<T>(&self, fut: impl Future<Output = FsResult<T>>) -> FsResult<T> {
        tokio::select! {
            result = fut => result,
            _ = self.conn.closed() => Err(FsError::Disconnected),
        }
    }
}

/// Read a byte range of any file into memory
pub async fn read_range(file: &dyn File, start_at: i64, amount: u64) -> FsResult<Vec<u8>> {
    let sink = ByteCollector::new();
    let _handle = file.read(start_at, amount, sink.clone()).await?;
    sink.wait().await
}

/// Collect the entries of any directory
pub async fn list_entries(
    dir: &dyn Directory,
    limit: Option<usize>,
) -> FsResult<Vec<DirectoryEntry>> {
    let sink = match limit {
        Some(limit) => EntryCollector::bounded(limit),
        None => EntryCollector::unbounded(),
    };
    let _handle = dir.list(sink.clone()).await?;
    sink.wait().await
}

/// Write a buffer through a write session and wait for the flush
pub async fn write_all(file: &dyn RwFile, start_at: i64, data: &[u8]) -> FsResult<()> {
    let session = file.write(start_at).await?;
    if !data.is_empty() {
        session.sink.expect_size(data.len() as u64).await?;
        for chunk in data.chunks(DEFAULT_CHUNK_SIZE) {
            session.sink.write(chunk.to_vec()).await?;
        }
    }
    session.sink.done().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalBackend, LocalNode};
    use capfs_core::{MainView, APPEND};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::net::UnixStream;

    fn connected(root: &Path) -> (RpcConnection, FsClient) {
        let (a, b) = UnixStream::pair().unwrap();
        let backend: Arc<dyn MainView> = Arc::new(LocalBackend::open(root).unwrap());
        let server = RpcConnection::new(a, Some(backend));
        let client = FsClient::from_connection(RpcConnection::new(b, None));
        (server, client)
    }

    #[tokio::test]
    async fn test_helpers_on_local_nodes() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"0123456789").unwrap();
        let root = LocalNode::open(temp.path()).unwrap().capability();

        let dir = root.clone().into_rw_directory().unwrap();
        let file = dir.walk("a.txt").await.unwrap().into_rw_file().unwrap();
        assert_eq!(read_range(&*file, 2, 3).await.unwrap(), b"234");

        write_all(&*file, APPEND, b"ab").await.unwrap();
        assert_eq!(read_range(&*file, 8, 0).await.unwrap(), b"89ab");

        let entries = list_entries(&*dir, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].info.size(), 12);
    }

    #[tokio::test]
    async fn test_client_roundtrip() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("docs")).unwrap();
        let (_server, client) = connected(temp.path());

        let docs = client.open("docs").await.unwrap();
        assert_eq!(docs.name, "docs");
        let docs = docs.node.into_rw_directory().unwrap();

        let file = docs.create("report.txt", false).await.unwrap();
        client.write(&*file, 0, b"quarterly").await.unwrap();
        assert_eq!(client.read(&*file, 0, 0).await.unwrap(), b"quarterly");

        let listed = client.list(&*docs, Some(10)).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "report.txt");

        let token = file.save().await.unwrap();
        let again = client.restore(&token).await.unwrap();
        assert_eq!(again.stat().await.unwrap().size(), 9);
    }

    #[tokio::test]
    async fn test_list_limit() {
        let temp = TempDir::new().unwrap();
        for i in 0..3 {
            std::fs::write(temp.path().join(format!("f{}", i)), b"").unwrap();
        }
        let (_server, client) = connected(temp.path());
        let root = client.root().await.unwrap().into_directory().unwrap();

        assert_eq!(
            client.list(&*root, Some(2)).await,
            Err(FsError::TooManyEntries)
        );
        assert_eq!(client.list(&*root, Some(3)).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_peer_gone() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"x").unwrap();
        let (server, client) = connected(temp.path());
        let file = client.open("a.txt").await.unwrap().node.into_file().unwrap();

        server.close();
        assert_eq!(
            client.read(&*file, 0, 0).await,
            Err(FsError::Disconnected)
        );
    }
}
