//! Byte transfers between host files and [`ByteStream`] consumers
//!
//! Reads run as a task that copies from the host into the consumer, one
//! acknowledged chunk at a time. Writes hand the caller a [`WriteSink`]
//! whose chunks are queued to a task owning the host file.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use capfs_core::{ByteStream, FsError, FsResult};

use crate::StreamOutcome;

/// A running read or write
pub struct Transfer {
    pub cancel: CancellationToken,
    pub task: JoinHandle<StreamOutcome>,
}

/// Copy up to `amount` bytes (0 = until end of input) from `reader` into
/// `sink` in chunks of at most `chunk_size`.
pub fn spawn_read<R>(
    reader: R,
    amount: u64,
    sink: Arc<dyn ByteStream>,
    chunk_size: usize,
) -> Transfer
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();
    let task = tokio::spawn(copy_to_sink(
        reader,
        amount,
        sink,
        chunk_size.max(1),
        cancel.clone(),
    ));
    Transfer { cancel, task }
}

async fn copy_to_sink<R>(
    reader: R,
    amount: u64,
    sink: Arc<dyn ByteStream>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> StreamOutcome
where
    R: AsyncRead + Unpin,
{
    let limit = if amount == 0 { u64::MAX } else { amount };
    let mut reader = reader.take(limit);
    let mut buf = vec![0u8; chunk_size];
    let mut copied = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, copied, "host read failed, ending transfer early");
                break;
            }
        };

        let written = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            written = sink.write(buf[..n].to_vec()) => written,
        };
        if let Err(e) = written {
            debug!(error = %e, copied, "consumer rejected data, stopping transfer");
            return StreamOutcome::Aborted(e);
        }
        copied += n as u64;
    }

    let done = tokio::select! {
        biased;
        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
        done = sink.done() => done,
    };
    match done {
        Ok(()) => {
            debug!(copied, "read transfer complete");
            StreamOutcome::Completed
        }
        Err(e) => StreamOutcome::Aborted(e),
    }
}

enum WriteOp {
    Data(Vec<u8>),
    Done(oneshot::Sender<FsResult<()>>),
}

/// Producer side of a write session
///
/// Chunks are written in the order they are accepted. `done` returns once
/// everything before it has been flushed to the host.
pub struct WriteSink {
    tx: mpsc::Sender<WriteOp>,
    failure: Arc<Mutex<Option<FsError>>>,
}

impl WriteSink {
    fn closed_error(&self) -> FsError {
        self.failure.lock().clone().unwrap_or(FsError::Closed)
    }
}

#[async_trait]
impl ByteStream for WriteSink {
    async fn write(&self, data: Vec<u8>) -> FsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(WriteOp::Data(data))
            .await
            .map_err(|_| self.closed_error())
    }

    async fn done(&self) -> FsResult<()> {
        let (reply, ack) = oneshot::channel();
        self.tx
            .send(WriteOp::Done(reply))
            .await
            .map_err(|_| self.closed_error())?;
        ack.await.unwrap_or_else(|_| Err(self.closed_error()))
    }
}

/// Start a write session draining into `writer`.
///
/// Cancelling the returned transfer abandons queued chunks and releases the
/// writer. Data already written stays written.
pub fn spawn_write<W>(writer: W, queue_depth: usize) -> (WriteSink, Transfer)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let failure = Arc::new(Mutex::new(None));
    let cancel = CancellationToken::new();

    let task = tokio::spawn(drain_into(writer, rx, failure.clone(), cancel.clone()));
    (WriteSink { tx, failure }, Transfer { cancel, task })
}

async fn drain_into<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<WriteOp>,
    failure: Arc<Mutex<Option<FsError>>>,
    cancel: CancellationToken,
) -> StreamOutcome
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;

    loop {
        let op = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            op = rx.recv() => op,
        };

        match op {
            Some(WriteOp::Data(data)) => {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return StreamOutcome::Cancelled,
                    result = writer.write_all(&data) => result,
                };
                if let Err(e) = result {
                    warn!(error = %e, written, "host write failed, closing session");
                    *failure.lock() = Some(FsError::OpenFailed);
                    return StreamOutcome::Aborted(FsError::OpenFailed);
                }
                written += data.len() as u64;
            }
            Some(WriteOp::Done(reply)) => {
                let result = writer.flush().await.map_err(|e| {
                    warn!(error = %e, written, "host flush failed");
                    FsError::OpenFailed
                });
                if let Err(e) = &result {
                    *failure.lock() = Some(e.clone());
                }
                let outcome = match &result {
                    Ok(()) => StreamOutcome::Completed,
                    Err(e) => StreamOutcome::Aborted(e.clone()),
                };
                let _ = reply.send(result);
                debug!(written, "write session complete");
                return outcome;
            }
            None => {
                // Producer released the sink without calling done
                let _ = writer.flush().await;
                debug!(written, "write session abandoned");
                return StreamOutcome::Completed;
            }
        }
    }
}

struct CollectedBytes {
    data: Vec<u8>,
    expected: Option<u64>,
    closed: bool,
    error: Option<FsError>,
}

/// Consumer that accumulates a byte stream in memory
pub struct ByteCollector {
    state: Mutex<CollectedBytes>,
    finished: watch::Sender<bool>,
}

impl ByteCollector {
    pub fn new() -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(CollectedBytes {
                data: Vec::new(),
                expected: None,
                closed: false,
                error: None,
            }),
            finished,
        })
    }

    fn finish(&self, state: &mut CollectedBytes, error: Option<FsError>) {
        if state.closed {
            return;
        }
        state.closed = true;
        state.error = error;
        self.finished.send_replace(true);
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        self.finish(&mut state, Some(FsError::Closed));
    }

    /// Size announced through `expect_size`, if any
    pub fn expected_size(&self) -> Option<u64> {
        self.state.lock().expected
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().closed
    }

    /// Wait for `done` and return everything received.
    pub async fn wait(&self) -> FsResult<Vec<u8>> {
        let mut finished = self.finished.subscribe();
        finished
            .wait_for(|finished| *finished)
            .await
            .map_err(|_| FsError::Closed)?;

        let state = self.state.lock();
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(state.data.clone()),
        }
    }
}

#[async_trait]
impl ByteStream for ByteCollector {
    async fn write(&self, data: Vec<u8>) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(state.error.clone().unwrap_or(FsError::Closed));
        }
        state.data.extend_from_slice(&data);
        Ok(())
    }

    async fn done(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        self.finish(&mut state, None);
        Ok(())
    }

    async fn expect_size(&self, size: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        state.expected = Some(size);
        state.data.reserve(size.min(capfs_core::MAX_MESSAGE_SIZE as u64) as usize);
        Ok(())
    }
}
