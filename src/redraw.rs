//! Redraw micro-batching
//!
//! Page changes, config edits and extra-page subscriptions can all ask for a
//! full redraw within a few milliseconds of each other. `RedrawBatcher`
//! collects the dirty keys and flushes them once the input goes quiet for a
//! tick, but never holds a batch longer than `max_wait`.

use std::collections::HashSet;
use std::hash::Hash;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

/// Callback run with every flushed batch
pub type FlushFn<K> = Box<dyn Fn(Vec<K>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Accumulates dirty keys and flushes them in batches
pub struct RedrawBatcher<K> {
    tx: mpsc::UnboundedSender<K>,
    task: JoinHandle<()>,
}

impl<K> RedrawBatcher<K>
where
    K: Eq + Hash + Send + 'static,
{
    /// Spawn the batching task
    ///
    /// # Arguments
    /// * `tick` - Quiet period that closes a batch
    /// * `max_wait` - Upper bound between the first mark and its flush
    /// * `flush` - Awaited for each batch; batches never overlap
    pub fn spawn(tick: Duration, max_wait: Duration, flush: FlushFn<K>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batcher(rx, tick, max_wait.max(tick), flush));
        Self { tx, task }
    }

    /// Mark a key dirty
    pub fn mark(&self, key: K) {
        // Send only fails once the task is gone, at which point nothing redraws
        let _ = self.tx.send(key);
    }

    /// Stop the task, dropping any batch not yet flushed
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl<K> Drop for RedrawBatcher<K> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_batcher<K: Eq + Hash>(
    mut rx: mpsc::UnboundedReceiver<K>,
    tick: Duration,
    max_wait: Duration,
    flush: FlushFn<K>,
) {
    while let Some(first) = rx.recv().await {
        let mut dirty = HashSet::new();
        dirty.insert(first);
        let deadline = Instant::now() + max_wait;
        let mut closed = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = tick.min(deadline - now);
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(key)) => {
                    dirty.insert(key);
                }
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        trace!("Flushing {} dirty keys", dirty.len());
        flush(dirty.into_iter().collect()).await;
        if closed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<Vec<u32>>>>, FlushFn<u32>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let flush: FlushFn<u32> = Box::new(move |mut keys: Vec<u32>| -> BoxFuture<'static, ()> {
            keys.sort_unstable();
            sink.lock().push(keys);
            Box::pin(async {})
        });
        (batches, flush)
    }

    #[tokio::test]
    async fn test_marks_within_tick_coalesce() {
        let (batches, flush) = recorder();
        let batcher =
            RedrawBatcher::spawn(Duration::from_millis(30), Duration::from_millis(500), flush);
        batcher.mark(1);
        batcher.mark(2);
        batcher.mark(1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*batches.lock(), vec![vec![1, 2]]);
    }

    #[tokio::test]
    async fn test_separate_bursts_flush_separately() {
        let (batches, flush) = recorder();
        let batcher =
            RedrawBatcher::spawn(Duration::from_millis(20), Duration::from_millis(500), flush);
        batcher.mark(1);
        tokio::time::sleep(Duration::from_millis(120)).await;
        batcher.mark(2);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(*batches.lock(), vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    async fn test_max_wait_bounds_a_busy_batch() {
        let (batches, flush) = recorder();
        let batcher =
            RedrawBatcher::spawn(Duration::from_millis(40), Duration::from_millis(100), flush);
        // Keep marking faster than the tick for well past max_wait
        for i in 0..20 {
            batcher.mark(i % 3);
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        assert!(batches.lock().len() >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending() {
        let (batches, flush) = recorder();
        let batcher =
            RedrawBatcher::spawn(Duration::from_millis(50), Duration::from_millis(100), flush);
        batcher.mark(7);
        batcher.shutdown();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(batches.lock().is_empty());
    }
}
