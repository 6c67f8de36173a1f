//! Streaming directory enumeration
//!
//! A listing runs as its own task: it pulls batches from an [`EntrySource`],
//! pushes each batch to the consumer and waits for the push to be
//! acknowledged before reading further. Exactly one `done` follows the last
//! batch unless the listing was cancelled or the consumer gave up.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use capfs_core::{DirectoryEntry, EntrySink, FsError, FsResult};

use crate::StreamOutcome;

/// Something that yields directory entries in batches
#[async_trait]
pub trait EntrySource: Send {
    /// Read up to `max` further entries. An empty batch means exhausted.
    async fn next_batch(&mut self, max: usize) -> io::Result<Vec<DirectoryEntry>>;
}

/// A running listing
pub struct Listing {
    pub cancel: CancellationToken,
    pub task: JoinHandle<StreamOutcome>,
}

/// Start streaming `source` into `sink` in batches of at most `batch_size`.
pub fn spawn_listing<S>(source: S, sink: Arc<dyn EntrySink>, batch_size: usize) -> Listing
where
    S: EntrySource + 'static,
{
    let cancel = CancellationToken::new();
    let task = tokio::spawn(pump_entries(
        source,
        sink,
        batch_size.max(1),
        cancel.clone(),
    ));
    Listing { cancel, task }
}

async fn pump_entries<S: EntrySource>(
    mut source: S,
    sink: Arc<dyn EntrySink>,
    batch_size: usize,
    cancel: CancellationToken,
) -> StreamOutcome {
    let mut delivered = 0usize;

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            batch = source.next_batch(batch_size) => batch,
        };

        let batch = match batch {
            Ok(batch) if batch.is_empty() => break,
            Ok(batch) => batch,
            Err(e) => {
                // Entries already pushed stay valid; the consumer still gets done.
                warn!(error = %e, delivered, "directory read failed, ending listing early");
                break;
            }
        };

        let count = batch.len();
        let pushed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled,
            pushed = sink.push(batch) => pushed,
        };
        if let Err(e) = pushed {
            debug!(error = %e, delivered, "consumer rejected entries, stopping listing");
            return StreamOutcome::Aborted(e);
        }
        delivered += count;
    }

    let done = tokio::select! {
        biased;
        _ = cancel.cancelled() => return StreamOutcome::Cancelled,
        done = sink.done() => done,
    };
    match done {
        Ok(()) => {
            debug!(delivered, "listing complete");
            StreamOutcome::Completed
        }
        Err(e) => StreamOutcome::Aborted(e),
    }
}

struct CollectorState {
    entries: Vec<DirectoryEntry>,
    limit: Option<usize>,
    closed: bool,
    error: Option<FsError>,
}

/// Consumer that accumulates a listing in memory
///
/// With a limit, a push that would exceed it is refused with
/// [`FsError::TooManyEntries`] and the collector closes; the refused batch
/// is not kept.
pub struct EntryCollector {
    state: Mutex<CollectorState>,
    finished: watch::Sender<bool>,
}

impl EntryCollector {
    pub fn unbounded() -> Arc<Self> {
        Self::with_limit(None)
    }

    pub fn bounded(limit: usize) -> Arc<Self> {
        Self::with_limit(Some(limit))
    }

    fn with_limit(limit: Option<usize>) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new(Self {
            state: Mutex::new(CollectorState {
                entries: Vec::new(),
                limit,
                closed: false,
                error: None,
            }),
            finished,
        })
    }

    fn finish(&self, state: &mut CollectorState, error: Option<FsError>) {
        if state.closed {
            return;
        }
        state.closed = true;
        state.error = error;
        self.finished.send_replace(true);
    }

    /// Stop accepting entries. Further pushes fail with [`FsError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        self.finish(&mut state, Some(FsError::Closed));
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().closed
    }

    /// Entries received so far
    pub fn entries(&self) -> Vec<DirectoryEntry> {
        self.state.lock().entries.clone()
    }

    /// Wait for `done` (or for the collector to close) and return the entries.
    pub async fn wait(&self) -> FsResult<Vec<DirectoryEntry>> {
        let mut finished = self.finished.subscribe();
        finished
            .wait_for(|finished| *finished)
            .await
            .map_err(|_| FsError::Closed)?;

        let state = self.state.lock();
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(state.entries.clone()),
        }
    }
}

#[async_trait]
impl EntrySink for EntryCollector {
    async fn push(&self, entries: Vec<DirectoryEntry>) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            // Late pushes after done are dropped without complaint.
            return match &state.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            };
        }

        if let Some(limit) = state.limit {
            if state.entries.len() + entries.len() > limit {
                self.finish(&mut state, Some(FsError::TooManyEntries));
                return Err(FsError::TooManyEntries);
            }
        }

        state.entries.extend(entries);
        Ok(())
    }

    async fn done(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        self.finish(&mut state, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capfs_core::StatInfo;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn entry(name: &str) -> DirectoryEntry {
        DirectoryEntry::new(name, StatInfo::file(0, false, false)).unwrap()
    }

    struct VecSource {
        entries: VecDeque<DirectoryEntry>,
        fail_after: Option<usize>,
        served: usize,
    }

    impl VecSource {
        fn new(count: usize) -> Self {
            Self {
                entries: (0..count).map(|i| entry(&format!("f{}", i))).collect(),
                fail_after: None,
                served: 0,
            }
        }
    }

    #[async_trait]
    impl EntrySource for VecSource {
        async fn next_batch(&mut self, max: usize) -> io::Result<Vec<DirectoryEntry>> {
            if self.fail_after == Some(self.served) {
                return Err(io::Error::new(io::ErrorKind::Other, "disk on fire"));
            }
            let take = max.min(self.entries.len());
            self.served += take;
            Ok(self.entries.drain(..take).collect())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        pushes: AtomicUsize,
        dones: AtomicUsize,
    }

    #[async_trait]
    impl EntrySink for CountingSink {
        async fn push(&self, _entries: Vec<DirectoryEntry>) -> FsResult<()> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn done(&self) -> FsResult<()> {
            self.dones.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Accepts the first push, then never acknowledges another one
    #[derive(Default)]
    struct StallingSink {
        pushes: AtomicUsize,
        dones: AtomicUsize,
    }

    #[async_trait]
    impl EntrySink for StallingSink {
        async fn push(&self, _entries: Vec<DirectoryEntry>) -> FsResult<()> {
            if self.pushes.fetch_add(1, Ordering::SeqCst) > 0 {
                std::future::pending::<()>().await;
            }
            Ok(())
        }

        async fn done(&self) -> FsResult<()> {
            self.dones.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_every_entry_delivered_once() {
        let collector = EntryCollector::unbounded();
        let listing = spawn_listing(VecSource::new(5), collector.clone(), 2);

        assert_eq!(listing.task.await.unwrap(), StreamOutcome::Completed);
        let entries = collector.wait().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["f0", "f1", "f2", "f3", "f4"]);
    }

    #[tokio::test]
    async fn test_batches_and_single_done() {
        let sink = Arc::new(CountingSink::default());
        let listing = spawn_listing(VecSource::new(5), sink.clone(), 2);
        listing.task.await.unwrap();

        assert_eq!(sink.pushes.load(Ordering::SeqCst), 3);
        assert_eq!(sink.dones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_directory_only_done() {
        let sink = Arc::new(CountingSink::default());
        let listing = spawn_listing(VecSource::new(0), sink.clone(), 16);
        listing.task.await.unwrap();

        assert_eq!(sink.pushes.load(Ordering::SeqCst), 0);
        assert_eq!(sink.dones.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_read_error_still_finishes() {
        let mut source = VecSource::new(6);
        source.fail_after = Some(4);
        let collector = EntryCollector::unbounded();
        let listing = spawn_listing(source, collector.clone(), 2);

        assert_eq!(listing.task.await.unwrap(), StreamOutcome::Completed);
        assert_eq!(collector.wait().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_stops_without_done() {
        let sink = Arc::new(StallingSink::default());
        let listing = spawn_listing(VecSource::new(10), sink.clone(), 2);

        while sink.pushes.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        listing.cancel.cancel();

        assert_eq!(listing.task.await.unwrap(), StreamOutcome::Cancelled);
        assert_eq!(sink.pushes.load(Ordering::SeqCst), 2);
        assert_eq!(sink.dones.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bounded_collector_overflow() {
        let collector = EntryCollector::bounded(3);
        let listing = spawn_listing(VecSource::new(10), collector.clone(), 2);

        assert_eq!(
            listing.task.await.unwrap(),
            StreamOutcome::Aborted(FsError::TooManyEntries)
        );
        assert_eq!(collector.wait().await, Err(FsError::TooManyEntries));
        // Only the batch that fit was kept
        assert_eq!(collector.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_collector_ignores_push_after_done() {
        let collector = EntryCollector::unbounded();
        collector.push(vec![entry("a")]).await.unwrap();
        collector.done().await.unwrap();
        collector.push(vec![entry("b")]).await.unwrap();

        assert_eq!(collector.wait().await.unwrap(), vec![entry("a")]);
    }

    #[tokio::test]
    async fn test_collector_close() {
        let collector = EntryCollector::unbounded();
        collector.close();

        assert_eq!(collector.push(vec![entry("a")]).await, Err(FsError::Closed));
        assert_eq!(collector.wait().await, Err(FsError::Closed));
        assert!(collector.is_finished());
    }
}
