//! Concurrent retrieval of published keys.
//!
//! [`RetrievalPipeline::list`] turns a bucket into a stream of
//! `authorized_keys` lines:
//!
//! ```text
//!                       ┌─► worker 0 ─┐
//! list ─► filter ─► queue             ├─► output ─► AuthorizedKeys (dedup)
//!                       └─► worker K ─┘
//! ```
//!
//! - **Discovery** is one (paginated) listing.  If it fails, nothing is
//!   served and the caller gets [`Error::List`].
//! - **Filter** drops objects larger than [`MAX_KEY_OBJECT_SIZE`] and, when
//!   enabled, objects whose name says they have expired.
//! - **Fan-out**: a dispatcher feeds a bounded queue shared by `K` workers,
//!   so at most `K` downloads are in flight.  Every download has a deadline.
//! - **Fan-in**: all workers write to one channel.  It closes only when the
//!   last worker has exited, so the consumer sees end-of-stream exactly once
//!   all work is done.
//!
//! A failed download drops that entry only.  Drops are logged and counted
//! in [`PipelineStats`]; they never end the stream early.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::{Error, StoreError};
use crate::naming::ObjectName;
use crate::store::{KeyBucket, ObjectEntry};

/// Objects larger than this cannot be a single public key and are never
/// downloaded.
pub const MAX_KEY_OBJECT_SIZE: u64 = 2048;

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicUsize,
    dropped: AtomicUsize,
}

/// Counts for one [`RetrievalPipeline::list`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Objects returned by the listing.
    pub discovered: usize,
    /// Skipped for exceeding [`MAX_KEY_OBJECT_SIZE`].
    pub oversized: usize,
    /// Skipped because their name encodes a past expiration.
    pub expired: usize,
    /// Downloaded and handed to the output channel so far.
    pub delivered: usize,
    /// Failed downloads so far.
    pub dropped: usize,
    /// Lines the consumer discarded as repeats.
    pub duplicates: usize,
}

#[derive(Debug, Default)]
struct Filtered {
    eligible: Vec<ObjectEntry>,
    oversized: usize,
    expired: usize,
}

fn filter_entries(entries: Vec<ObjectEntry>, now: DateTime<Utc>, skip_expired: bool) -> Filtered {
    let mut filtered = Filtered::default();
    for entry in entries {
        if entry.size > MAX_KEY_OBJECT_SIZE {
            debug!(object = %entry.name, size = entry.size, "skipping oversized object");
            filtered.oversized += 1;
            continue;
        }
        if skip_expired
            && let Some(name) = ObjectName::parse(&entry.name)
            && name.is_expired(now)
        {
            debug!(object = %entry.name, "skipping expired key");
            filtered.expired += 1;
            continue;
        }
        filtered.eligible.push(entry);
    }
    filtered
}

/// Decode an object body into a key line, trimming the trailing newline
/// that other publishers may have written.
fn decode_key_line(name: &str, body: &Bytes) -> Result<String, StoreError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| StoreError::Invalid(format!("{name} is not UTF-8")))?;
    let line = text.trim_end();
    if line.is_empty() {
        return Err(StoreError::Invalid(format!("{name} is empty")));
    }
    Ok(line.to_string())
}

pub struct RetrievalPipeline {
    bucket: Arc<dyn KeyBucket>,
    config: PipelineConfig,
}

impl std::fmt::Debug for RetrievalPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalPipeline")
            .field("bucket", &self.bucket.name())
            .field("config", &self.config)
            .finish()
    }
}

impl RetrievalPipeline {
    pub fn new(bucket: Arc<dyn KeyBucket>, config: PipelineConfig) -> Self {
        Self { bucket, config }
    }

    /// Discover and start downloading every currently valid key.
    ///
    /// Must be called from within a Tokio runtime.  The returned stream is
    /// finite and single-use; call `list` again to pick up newly published
    /// keys.
    pub async fn list(&self) -> Result<AuthorizedKeys, Error> {
        self.list_at(Utc::now()).await
    }

    /// Like [`list`](Self::list), judging expiry against `now`.
    pub async fn list_at(&self, now: DateTime<Utc>) -> Result<AuthorizedKeys, Error> {
        let entries = self.bucket.list().await.map_err(Error::List)?;
        let discovered = entries.len();
        let Filtered {
            eligible,
            oversized,
            expired,
        } = filter_entries(entries, now, self.config.skip_expired);

        let workers = self.config.worker_count();
        debug!(
            bucket = %self.bucket.name(),
            discovered,
            oversized,
            expired,
            eligible = eligible.len(),
            workers,
            "starting key retrieval"
        );

        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let (work_tx, work_rx) = mpsc::channel::<ObjectEntry>(workers);
        let (out_tx, out_rx) = mpsc::channel::<String>(workers);

        tokio::spawn(dispatch(eligible, work_tx, cancel.clone()));

        let queue = Arc::new(Mutex::new(work_rx));
        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                bucket: Arc::clone(&self.bucket),
                queue: Arc::clone(&queue),
                out: out_tx.clone(),
                cancel: cancel.clone(),
                counters: Arc::clone(&counters),
                timeout: self.config.download_timeout(),
            };
            set.spawn(worker.run());
        }
        // The output channel now closes when the last worker drops its sender.
        drop(out_tx);

        tokio::spawn(supervise(set, Arc::clone(&counters), self.bucket.name().to_string()));

        Ok(AuthorizedKeys {
            rx: out_rx,
            seen: HashSet::new(),
            cancel,
            counters,
            discovered,
            oversized,
            expired,
            duplicates: 0,
        })
    }
}

/// Feed eligible entries to the workers, stopping early on cancellation.
/// Dropping `work_tx` on return tells idle workers there is nothing left.
async fn dispatch(
    entries: Vec<ObjectEntry>,
    work_tx: mpsc::Sender<ObjectEntry>,
    cancel: CancellationToken,
) {
    for entry in entries {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = work_tx.send(entry) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for every worker, then log how the run went.
async fn supervise(mut set: JoinSet<()>, counters: Arc<Counters>, bucket: String) {
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!(bucket = %bucket, "key retrieval worker failed: {e}");
        }
    }

    let delivered = counters.delivered.load(Ordering::Relaxed);
    let dropped = counters.dropped.load(Ordering::Relaxed);
    if dropped > 0 {
        warn!(
            bucket = %bucket,
            delivered,
            dropped,
            "key retrieval finished with dropped objects"
        );
    } else {
        debug!(bucket = %bucket, delivered, "key retrieval finished");
    }
}

struct Worker {
    id: usize,
    bucket: Arc<dyn KeyBucket>,
    queue: Arc<Mutex<mpsc::Receiver<ObjectEntry>>>,
    out: mpsc::Sender<String>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    timeout: Duration,
}

impl Worker {
    async fn run(self) {
        loop {
            let Some(entry) = self.next_entry().await else {
                break;
            };

            match self.fetch(&entry).await {
                Ok(line) => {
                    if self.out.send(line).await.is_err() {
                        // Consumer is gone; nobody wants the rest.
                        break;
                    }
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = self.id, object = %entry.name, error = %e, "dropping key object");
                }
            }
        }
        debug!(worker = self.id, "worker finished");
    }

    /// The next queued entry, or `None` once the queue is drained or the run
    /// is cancelled.
    async fn next_entry(&self) -> Option<ObjectEntry> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let mut queue = self.queue.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            entry = queue.recv() => entry,
        }
    }

    async fn fetch(&self, entry: &ObjectEntry) -> Result<String, Error> {
        let body = match tokio::time::timeout(self.timeout, self.bucket.get(&entry.name)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(entry.name.clone())),
        };
        body.and_then(|body| decode_key_line(&entry.name, &body))
            .map_err(|source| Error::Download {
                name: entry.name.clone(),
                source,
            })
    }
}

/// The merged output of one retrieval run.
///
/// Yields each distinct key line once, in no particular order, and ends
/// when every worker has finished.  Dropping it cancels outstanding work.
pub struct AuthorizedKeys {
    rx: mpsc::Receiver<String>,
    seen: HashSet<String>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    discovered: usize,
    oversized: usize,
    expired: usize,
    duplicates: usize,
}

impl std::fmt::Debug for AuthorizedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedKeys")
            .field("stats", &self.stats())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AuthorizedKeys {
    /// The next key line, or `None` once the run is complete.
    pub async fn next_key(&mut self) -> Option<String> {
        std::future::poll_fn(|cx| self.poll_next_key(cx)).await
    }

    /// Drain the stream.
    pub async fn collect_all(mut self) -> Vec<String> {
        let mut keys = Vec::new();
        while let Some(key) = self.next_key().await {
            keys.push(key);
        }
        keys
    }

    /// Stop workers from starting new downloads.  Lines already in flight
    /// are still delivered, then the stream ends.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            discovered: self.discovered,
            oversized: self.oversized,
            expired: self.expired,
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            duplicates: self.duplicates,
        }
    }

    fn poll_next_key(&mut self, cx: &mut Context<'_>) -> Poll<Option<String>> {
        loop {
            match ready!(self.rx.poll_recv(cx)) {
                Some(line) => {
                    if self.seen.insert(line.clone()) {
                        return Poll::Ready(Some(line));
                    }
                    self.duplicates += 1;
                }
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Stream for AuthorizedKeys {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_key(cx)
    }
}

impl Drop for AuthorizedKeys {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
