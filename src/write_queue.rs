//! Bounded-concurrency write pipeline
//!
//! `ImageWriteQueue` sits between a handler and its driver. Slow panels can't
//! keep up with render storms, so the queue keeps at most one pending payload
//! per key (a resubmission overwrites it) and caps the number of writes in
//! flight. Only the freshest frame per key is ever sent.
//!
//! ```text
//! submit(k, p) ──► pending {k → p}  ──dispatch──►  in_flight {k}  ──► writer(k, p)
//!                        ▲                                 │
//!                        └───────── completion ◄───────────┘
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Default number of concurrent writes per device
pub const DEFAULT_MAX_CONCURRENCY: usize = 3;

/// Future returned by a writer
pub type WriteFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Asynchronous writer invoked for each dispatched entry
pub type Writer<K, P> = Arc<dyn Fn(K, P) -> WriteFuture + Send + Sync>;

struct QueueState<K, P> {
    /// At most one payload per key
    pending: HashMap<K, P>,
    /// Submission order of pending keys
    order: VecDeque<K>,
    in_flight: HashSet<K>,
    closed: bool,
}

struct Shared<K, P> {
    name: String,
    max_concurrency: usize,
    writer: Writer<K, P>,
    state: Mutex<QueueState<K, P>>,
}

/// Per-device write queue, latest payload per key wins
pub struct ImageWriteQueue<K, P> {
    shared: Arc<Shared<K, P>>,
}

impl<K, P> Clone for ImageWriteQueue<K, P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, P> ImageWriteQueue<K, P>
where
    K: Eq + Hash + Clone + Debug + Send + 'static,
    P: Send + 'static,
{
    /// Create a queue
    ///
    /// # Arguments
    /// * `name` - Used in log messages (usually the surface id)
    /// * `max_concurrency` - Writer calls allowed in flight at once (min 1)
    /// * `writer` - Performs one write; errors are logged and dropped
    pub fn new(name: impl Into<String>, max_concurrency: usize, writer: Writer<K, P>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                max_concurrency: max_concurrency.max(1),
                writer,
                state: Mutex::new(QueueState {
                    pending: HashMap::new(),
                    order: VecDeque::new(),
                    in_flight: HashSet::new(),
                    closed: false,
                }),
            }),
        }
    }

    /// Queue a payload for a key, replacing any payload still pending for it
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, key: K, payload: P) {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                debug!("{}: dropping write for {:?}, queue closed", self.shared.name, key);
                return;
            }
            if state.pending.insert(key.clone(), payload).is_none() {
                state.order.push_back(key);
            }
        }
        Self::dispatch(&self.shared);
    }

    /// Stop accepting writes and drop everything pending
    ///
    /// Writes already in flight are left to finish (or fail) on their own.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        state.pending.clear();
        state.order.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    /// Move pending entries to in-flight while capacity allows
    fn dispatch(shared: &Arc<Shared<K, P>>) {
        let mut jobs = Vec::new();
        {
            let mut state = shared.state.lock();
            while state.in_flight.len() < shared.max_concurrency {
                // A key already being written waits for that write to finish
                let Some(pos) = state
                    .order
                    .iter()
                    .position(|k| !state.in_flight.contains(k))
                else {
                    break;
                };
                let Some(key) = state.order.remove(pos) else {
                    break;
                };
                let Some(payload) = state.pending.remove(&key) else {
                    continue;
                };
                state.in_flight.insert(key.clone());
                jobs.push((key, payload));
            }
        }

        for (key, payload) in jobs {
            let write = (shared.writer)(key.clone(), payload);
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                if let Err(e) = write.await {
                    warn!("{}: write for {:?} failed: {:#}", shared.name, key, e);
                }
                shared.state.lock().in_flight.remove(&key);
                Self::dispatch(&shared);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    /// Writer that blocks on a gate and records every call
    struct Recorder {
        calls: Mutex<Vec<(u32, &'static str)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
        gate: Semaphore,
    }

    impl Recorder {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                gate: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            })
        }

        fn writer(self: &Arc<Self>) -> Writer<u32, &'static str> {
            let rec = Arc::clone(self);
            Arc::new(move |key: u32, payload: &'static str| -> WriteFuture {
                let rec = Arc::clone(&rec);
                rec.calls.lock().push((key, payload));
                let now = rec.active.fetch_add(1, Ordering::SeqCst) + 1;
                rec.max_active.fetch_max(now, Ordering::SeqCst);
                Box::pin(async move {
                    let permit = rec.gate.acquire().await?;
                    permit.forget();
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    rec.active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
        }

        fn calls(&self) -> Vec<(u32, &'static str)> {
            self.calls.lock().clone()
        }
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let rec = Recorder::new(false);
        let queue = ImageWriteQueue::new("test", 3, rec.writer());
        for key in 0..10 {
            queue.submit(key, "img");
        }
        assert_eq!(rec.calls().len(), 3);
        assert_eq!(queue.in_flight_len(), 3);
        assert_eq!(queue.pending_len(), 7);

        rec.gate.add_permits(100);
        wait_for(|| rec.calls().len() == 10).await;
        wait_for(|| queue.in_flight_len() == 0).await;
        assert!(rec.max_active.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_pending_resubmission_keeps_latest() {
        let rec = Recorder::new(false);
        let queue = ImageWriteQueue::new("test", 3, rec.writer());
        for key in 0..3 {
            queue.submit(key, "filler");
        }
        queue.submit(9, "first");
        queue.submit(9, "second");
        assert_eq!(queue.pending_len(), 1);

        rec.gate.add_permits(100);
        wait_for(|| rec.calls().len() == 4).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let for_nine: Vec<_> = rec.calls().into_iter().filter(|(k, _)| *k == 9).collect();
        assert_eq!(for_nine, vec![(9, "second")]);
    }

    #[tokio::test]
    async fn test_same_key_not_written_concurrently() {
        let rec = Recorder::new(false);
        let queue = ImageWriteQueue::new("test", 3, rec.writer());
        queue.submit(1, "a");
        queue.submit(1, "b");
        // Second payload must wait for the first write even though capacity is free
        assert_eq!(rec.calls(), vec![(1, "a")]);
        assert_eq!(queue.pending_len(), 1);

        rec.gate.add_permits(100);
        wait_for(|| rec.calls().len() == 2).await;
        assert_eq!(rec.calls(), vec![(1, "a"), (1, "b")]);
        assert_eq!(rec.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let writer: Writer<u32, ()> = Arc::new(move |key: u32, _: ()| -> WriteFuture {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if key == 0 {
                    anyhow::bail!("device busy");
                }
                Ok(())
            })
        });
        let queue = ImageWriteQueue::new("test", 1, writer);
        queue.submit(0, ());
        queue.submit(1, ());
        queue.submit(2, ());
        wait_for(|| attempts.load(Ordering::SeqCst) == 3).await;
        wait_for(|| queue.in_flight_len() == 0).await;
    }

    #[tokio::test]
    async fn test_closed_queue_drops_submissions() {
        let rec = Recorder::new(true);
        let queue = ImageWriteQueue::new("test", 3, rec.writer());
        queue.close();
        queue.submit(4, "late");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rec.calls().is_empty());
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_close_with_writes_in_flight() {
        let rec = Recorder::new(false);
        let queue = ImageWriteQueue::new("test", 1, rec.writer());
        queue.submit(1, "a");
        queue.submit(2, "b");
        queue.close();
        rec.gate.add_permits(100);
        wait_for(|| queue.in_flight_len() == 0).await;
        assert_eq!(rec.calls(), vec![(1, "a")]);
    }
}
