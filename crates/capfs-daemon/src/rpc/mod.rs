//! Capability RPC over a byte stream
//!
//! Both ends of a connection are peers. Each keeps an export table of local
//! objects the other side may invoke, and wraps every descriptor it receives
//! in a proxy that implements the same capability trait. Passing a sink to
//! `list` or `read` exports it; the remote producer then calls back into it
//! over the same connection.
//!
//! ```text
//!   client                                      server
//!   ──────                                      ──────
//!   RemoteNode ── Call{target, List{sink=7}} ──▶ exports[target]: LocalNode
//!   exports[7]: EntryCollector                        │ list(RemoteEntrySink(7))
//!        ▲                                            ▼
//!        └─────────── Call{7, Push{..}} ──────── listing task
//! ```
//!
//! Dropping a proxy sends `Release` for its descriptor. Releasing a cancel
//! handle does not cancel the operation; closing the connection cancels
//! every operation the peer still holds a handle for.

mod dispatch;
mod proxy;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use capfs_core::{
    ByteStream, CallMessage, CancelHandle, CapDescriptor, CapId, CapKind, Capability, EntrySink,
    FsError, FsResult, HelloMessage, MainView, Method, Payload, QuestionId, ReleaseMessage,
    ReturnMessage, RpcMessage, MAIN_CAP, PROTOCOL_VERSION,
};

use crate::net::{recv_message, send_message, ConnectionError};

use proxy::RemoteMainView;

/// Local object reachable by the peer
#[derive(Clone)]
pub(crate) enum Export {
    Node(Capability),
    EntrySink(Arc<dyn EntrySink>),
    ByteStream(Arc<dyn ByteStream>),
    Handle(CancelHandle),
}

/// Resolved target of an incoming call
pub(crate) enum Target {
    Main(Arc<dyn MainView>),
    Object(Export),
}

pub(crate) struct ConnState {
    exports: DashMap<CapId, Export>,
    next_export: AtomicU64,
    questions: DashMap<QuestionId, oneshot::Sender<FsResult<Payload>>>,
    next_question: AtomicU64,
    outbound: mpsc::UnboundedSender<RpcMessage>,
    shutdown: CancellationToken,
    main: Option<Arc<dyn MainView>>,
}

impl ConnState {
    fn send(&self, msg: RpcMessage) -> bool {
        !self.shutdown.is_cancelled() && self.outbound.send(msg).is_ok()
    }

    pub(crate) fn export(&self, export: Export, kind: CapKind) -> CapDescriptor {
        let id = self.next_export.fetch_add(1, Ordering::Relaxed);
        self.exports.insert(id, export);
        trace!(id, ?kind, "exported");
        CapDescriptor { id, kind }
    }

    pub(crate) fn export_node(&self, cap: Capability) -> CapDescriptor {
        let kind = cap.cap_kind();
        self.export(Export::Node(cap), kind)
    }

    /// Tell the peer we no longer hold its object `id`.
    pub(crate) fn release(&self, id: CapId) {
        self.send(RpcMessage::Release(ReleaseMessage { id }));
    }

    /// Release every descriptor in a reply nobody is going to import.
    pub(crate) fn discard(&self, payload: &Payload) {
        for desc in payload.descriptors() {
            self.release(desc.id);
        }
    }

    /// Invoke `method` on the peer's object `target` and wait for the reply.
    pub(crate) async fn call(&self, target: CapId, method: Method) -> FsResult<Payload> {
        let question = self.next_question.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.questions.insert(question, tx);

        let sent = self.send(RpcMessage::Call(CallMessage {
            question,
            target,
            method,
        }));
        if !sent {
            self.questions.remove(&question);
            return Err(FsError::Disconnected);
        }

        tokio::select! {
            reply = rx => reply.unwrap_or(Err(FsError::Disconnected)),
            _ = self.shutdown.cancelled() => {
                self.questions.remove(&question);
                Err(FsError::Disconnected)
            }
        }
    }

    /// Invoke `method` without waiting for (or keeping) the reply.
    pub(crate) fn notify(&self, target: CapId, method: Method) {
        let question = self.next_question.fetch_add(1, Ordering::Relaxed);
        self.send(RpcMessage::Call(CallMessage {
            question,
            target,
            method,
        }));
    }

    fn resolve_target(&self, id: CapId) -> FsResult<Target> {
        if id == MAIN_CAP {
            return self
                .main
                .clone()
                .map(Target::Main)
                .ok_or(FsError::NotImplemented);
        }
        self.exports
            .get(&id)
            .map(|e| Target::Object(e.value().clone()))
            .ok_or_else(|| FsError::Protocol(format!("unknown capability {}", id)))
    }

    fn handle_incoming(self: &Arc<Self>, msg: RpcMessage) -> Result<(), ConnectionError> {
        match msg {
            RpcMessage::Call(call) => {
                let CallMessage {
                    question,
                    target,
                    method,
                } = call;
                trace!(question, target, "incoming call");

                // Look the target up now so a Release that follows this call
                // cannot overtake it.
                let target = match self.resolve_target(target) {
                    Ok(target) => target,
                    Err(e) => {
                        for desc in method.descriptors() {
                            self.release(desc.id);
                        }
                        self.reply(question, Err(e));
                        return Ok(());
                    }
                };

                let state = self.clone();
                tokio::spawn(async move {
                    let result = dispatch::dispatch(&state, target, method).await;
                    state.reply(question, result);
                });
            }
            RpcMessage::Return(ret) => {
                let result = ret.result.map_err(FsError::from);
                match self.questions.remove(&ret.question) {
                    Some((_, waiter)) => {
                        if let Err(Ok(payload)) = waiter.send(result) {
                            self.discard(&payload);
                        }
                    }
                    None => {
                        if let Ok(payload) = &result {
                            self.discard(payload);
                        }
                    }
                }
            }
            RpcMessage::Release(release) => {
                trace!(id = release.id, "peer released");
                self.exports.remove(&release.id);
            }
            RpcMessage::Hello(_) => return Err(ConnectionError::Unexpected("repeated Hello")),
        }
        Ok(())
    }

    fn reply(&self, question: QuestionId, result: FsResult<Payload>) {
        if let Err(e) = &result {
            debug!(question, error = %e, "call failed");
        }
        self.send(RpcMessage::Return(ReturnMessage {
            question,
            result: result.map_err(|e| (&e).into()),
        }));
    }

    fn teardown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        // Waiting callers see their sender dropped
        self.questions.clear();

        let ids: Vec<CapId> = self.exports.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0usize;
        for id in ids {
            if let Some((_, Export::Handle(handle))) = self.exports.remove(&id) {
                handle.cancel();
                cancelled += 1;
            }
        }
        debug!(cancelled, "connection torn down");
    }
}

/// One end of a capability connection
#[derive(Clone)]
pub struct RpcConnection {
    state: Arc<ConnState>,
}

impl RpcConnection {
    /// Start speaking the protocol on `stream`. Pass `main` to serve a main
    /// view to the peer.
    pub fn new<S>(stream: S, main: Option<Arc<dyn MainView>>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, rx) = mpsc::unbounded_channel();

        // Queued ahead of anything else
        let _ = outbound.send(RpcMessage::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
        }));

        let state = Arc::new(ConnState {
            exports: DashMap::new(),
            next_export: AtomicU64::new(MAIN_CAP + 1),
            questions: DashMap::new(),
            next_question: AtomicU64::new(0),
            outbound,
            shutdown: CancellationToken::new(),
            main,
        });

        tokio::spawn(write_loop(writer, rx, state.clone()));
        tokio::spawn(read_loop(reader, state.clone()));

        Self { state }
    }

    /// The peer's main view
    pub fn main_view(&self) -> Arc<dyn MainView> {
        Arc::new(RemoteMainView::new(self.state.clone()))
    }

    /// The peer's root directory
    pub async fn bootstrap(&self) -> FsResult<Capability> {
        self.main_view().root().await
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        self.state.shutdown.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    /// Drop the connection. Outstanding calls on both sides fail with
    /// [`FsError::Disconnected`].
    pub fn close(&self) {
        self.state.teardown();
    }

    /// Number of local objects the peer currently holds
    pub fn export_count(&self) -> usize {
        self.state.exports.len()
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<RpcMessage>,
    state: Arc<ConnState>,
)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let msg = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = state.shutdown.cancelled() => None,
        };
        let Some(msg) = msg else { break };

        if let Err(e) = send_message(&mut writer, &msg).await {
            warn!(error = %e, "send failed, closing connection");
            break;
        }
    }

    let _ = writer.shutdown().await;
    state.teardown();
}

async fn read_loop<R>(mut reader: R, state: Arc<ConnState>)
where
    R: AsyncRead + Unpin,
{
    match serve_incoming(&mut reader, &state).await {
        Ok(()) | Err(ConnectionError::Closed) => debug!("connection closed"),
        Err(e) => warn!(error = %e, "connection failed"),
    }
    state.teardown();
}

async fn serve_incoming<R>(reader: &mut R, state: &Arc<ConnState>) -> Result<(), ConnectionError>
where
    R: AsyncRead + Unpin,
{
    match recv_message(reader).await? {
        RpcMessage::Hello(hello) if hello.protocol_version == PROTOCOL_VERSION => {}
        RpcMessage::Hello(hello) => {
            return Err(ConnectionError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: hello.protocol_version,
            })
        }
        _ => return Err(ConnectionError::Unexpected("expected Hello")),
    }
    debug!("handshake complete");

    loop {
        let msg = tokio::select! {
            _ = state.shutdown.cancelled() => return Ok(()),
            msg = recv_message(reader) => msg?,
        };
        state.handle_incoming(msg)?;
    }
}
