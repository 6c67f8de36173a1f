//! Proxies for objects living on the other side of a connection

use std::sync::Arc;

use async_trait::async_trait;

use capfs_core::{
    ByteStream, Cancel, CancelHandle, CapDescriptor, CapId, CapKind, Capability, Directory,
    DirectoryEntry, EntrySink, File, FsError, FsResult, MainView, Method, Node, Payload,
    RwDirectory, RwFile, StatInfo, WriteSession, DEFAULT_CHUNK_SIZE, DEFAULT_ENTRY_BATCH_SIZE,
    MAIN_CAP,
};

use super::{ConnState, Export};

/// Owned reference to a peer export; released on drop
struct RemoteRef {
    conn: Arc<ConnState>,
    id: CapId,
}

impl RemoteRef {
    async fn call(&self, method: Method) -> FsResult<Payload> {
        self.conn.call(self.id, method).await
    }

    async fn call_unit(&self, method: Method) -> FsResult<()> {
        match self.call(method).await? {
            Payload::Unit => Ok(()),
            other => Err(self.unexpected(other)),
        }
    }

    fn unexpected(&self, payload: Payload) -> FsError {
        self.conn.discard(&payload);
        FsError::Protocol("unexpected reply".into())
    }
}

impl Drop for RemoteRef {
    fn drop(&mut self) {
        self.conn.release(self.id);
    }
}

fn expect_kind(conn: &Arc<ConnState>, desc: CapDescriptor, kind: CapKind) -> FsResult<RemoteRef> {
    let remote = RemoteRef {
        conn: conn.clone(),
        id: desc.id,
    };
    if desc.kind != kind {
        return Err(FsError::Protocol(format!(
            "expected {:?}, got {:?}",
            kind, desc.kind
        )));
    }
    Ok(remote)
}

pub(super) fn import_node(conn: &Arc<ConnState>, desc: CapDescriptor) -> FsResult<Capability> {
    let remote = RemoteRef {
        conn: conn.clone(),
        id: desc.id,
    };
    let node = Arc::new(RemoteNode(remote));
    Ok(match desc.kind {
        CapKind::Directory => Capability::Directory(node),
        CapKind::RwDirectory => Capability::RwDirectory(node),
        CapKind::File => Capability::File(node),
        CapKind::RwFile => Capability::RwFile(node),
        other => {
            return Err(FsError::Protocol(format!(
                "expected a node, got {:?}",
                other
            )))
        }
    })
}

pub(super) fn import_entry_sink(
    conn: &Arc<ConnState>,
    desc: CapDescriptor,
) -> FsResult<Arc<dyn EntrySink>> {
    let remote = expect_kind(conn, desc, CapKind::EntrySink)?;
    Ok(Arc::new(RemoteEntrySink(remote)))
}

pub(super) fn import_byte_stream(
    conn: &Arc<ConnState>,
    desc: CapDescriptor,
) -> FsResult<Arc<dyn ByteStream>> {
    let remote = expect_kind(conn, desc, CapKind::ByteStream)?;
    Ok(Arc::new(RemoteByteStream(remote)))
}

pub(super) fn import_handle(conn: &Arc<ConnState>, desc: CapDescriptor) -> FsResult<CancelHandle> {
    let remote = expect_kind(conn, desc, CapKind::Handle)?;
    Ok(Arc::new(RemoteHandle(remote)))
}

/// Any filesystem node on the peer
///
/// Implements every node trait; the [`Capability`] variant it is wrapped in
/// decides which of them a caller can reach.
struct RemoteNode(RemoteRef);

impl RemoteNode {
    async fn call_capability(&self, method: Method) -> FsResult<Capability> {
        match self.0.call(method).await? {
            Payload::Capability(desc) => import_node(&self.0.conn, desc),
            other => Err(self.0.unexpected(other)),
        }
    }

    async fn call_handle(&self, method: Method) -> FsResult<CancelHandle> {
        match self.0.call(method).await? {
            Payload::Capability(desc) => import_handle(&self.0.conn, desc),
            other => Err(self.0.unexpected(other)),
        }
    }
}

#[async_trait]
impl Node for RemoteNode {
    async fn stat(&self) -> FsResult<StatInfo> {
        match self.0.call(Method::Stat).await? {
            Payload::Stat(info) => Ok(info),
            other => Err(self.0.unexpected(other)),
        }
    }

    async fn save(&self) -> FsResult<Vec<u8>> {
        match self.0.call(Method::Save).await? {
            Payload::Token(token) => Ok(token),
            other => Err(self.0.unexpected(other)),
        }
    }
}

#[async_trait]
impl Directory for RemoteNode {
    async fn list(&self, sink: Arc<dyn EntrySink>) -> FsResult<CancelHandle> {
        let sink = self.0.conn.export(Export::EntrySink(sink), CapKind::EntrySink);
        self.call_handle(Method::List { sink }).await
    }

    async fn walk(&self, name: &str) -> FsResult<Capability> {
        self.call_capability(Method::Walk {
            name: name.to_string(),
        })
        .await
    }
}

#[async_trait]
impl RwDirectory for RemoteNode {
    async fn create(&self, name: &str, executable: bool) -> FsResult<Arc<dyn RwFile>> {
        self.call_capability(Method::Create {
            name: name.to_string(),
            executable,
        })
        .await?
        .into_rw_file()
    }

    async fn mkdir(&self, name: &str) -> FsResult<Arc<dyn RwDirectory>> {
        self.call_capability(Method::Mkdir {
            name: name.to_string(),
        })
        .await?
        .into_rw_directory()
    }

    async fn delete(&self, name: &str) -> FsResult<()> {
        self.0
            .call_unit(Method::Delete {
                name: name.to_string(),
            })
            .await
    }
}

#[async_trait]
impl File for RemoteNode {
    async fn read(
        &self,
        start_at: i64,
        amount: u64,
        sink: Arc<dyn ByteStream>,
    ) -> FsResult<CancelHandle> {
        let sink = self.0.conn.export(Export::ByteStream(sink), CapKind::ByteStream);
        self.call_handle(Method::Read {
            start_at,
            amount,
            sink,
        })
        .await
    }
}

#[async_trait]
impl RwFile for RemoteNode {
    async fn write(&self, start_at: i64) -> FsResult<WriteSession> {
        match self.0.call(Method::Write { start_at }).await? {
            Payload::WriteSession { sink, cancel } => {
                let conn = &self.0.conn;
                // Import both before checking either so nothing leaks
                let sink = import_byte_stream(conn, sink);
                let cancel = import_handle(conn, cancel);
                Ok(WriteSession {
                    sink: sink?,
                    cancel: cancel?,
                })
            }
            other => Err(self.0.unexpected(other)),
        }
    }

    async fn set_exec(&self, exec: bool) -> FsResult<()> {
        self.0.call_unit(Method::SetExec { exec }).await
    }

    async fn truncate(&self, size: u64) -> FsResult<()> {
        self.0.call_unit(Method::Truncate { size }).await
    }
}

struct RemoteEntrySink(RemoteRef);

#[async_trait]
impl EntrySink for RemoteEntrySink {
    async fn push(&self, entries: Vec<DirectoryEntry>) -> FsResult<()> {
        if entries.len() <= DEFAULT_ENTRY_BATCH_SIZE {
            return self.0.call_unit(Method::Push { entries }).await;
        }
        for batch in entries.chunks(DEFAULT_ENTRY_BATCH_SIZE) {
            self.0
                .call_unit(Method::Push {
                    entries: batch.to_vec(),
                })
                .await?;
        }
        Ok(())
    }

    async fn done(&self) -> FsResult<()> {
        self.0.call_unit(Method::EntriesDone).await
    }
}

struct RemoteByteStream(RemoteRef);

#[async_trait]
impl ByteStream for RemoteByteStream {
    async fn write(&self, data: Vec<u8>) -> FsResult<()> {
        if data.len() <= DEFAULT_CHUNK_SIZE {
            return self.0.call_unit(Method::WriteBytes { data }).await;
        }
        for chunk in data.chunks(DEFAULT_CHUNK_SIZE) {
            self.0
                .call_unit(Method::WriteBytes {
                    data: chunk.to_vec(),
                })
                .await?;
        }
        Ok(())
    }

    async fn done(&self) -> FsResult<()> {
        self.0.call_unit(Method::BytesDone).await
    }

    async fn expect_size(&self, size: u64) -> FsResult<()> {
        self.0.call_unit(Method::ExpectSize { size }).await
    }
}

struct RemoteHandle(RemoteRef);

impl Cancel for RemoteHandle {
    fn cancel(&self) {
        self.0.conn.notify(self.0.id, Method::Cancel);
    }
}

/// The peer's main view
pub(crate) struct RemoteMainView {
    conn: Arc<ConnState>,
}

impl RemoteMainView {
    pub(crate) fn new(conn: Arc<ConnState>) -> Self {
        Self { conn }
    }

    async fn call_capability(&self, method: Method) -> FsResult<Capability> {
        match self.conn.call(MAIN_CAP, method).await? {
            Payload::Capability(desc) => import_node(&self.conn, desc),
            other => {
                self.conn.discard(&other);
                Err(FsError::Protocol("unexpected reply".into()))
            }
        }
    }
}

#[async_trait]
impl MainView for RemoteMainView {
    async fn root(&self) -> FsResult<Capability> {
        self.call_capability(Method::Root).await
    }

    async fn restore(&self, token: &[u8]) -> FsResult<Capability> {
        self.call_capability(Method::Restore {
            token: token.to_vec(),
        })
        .await
    }
}
