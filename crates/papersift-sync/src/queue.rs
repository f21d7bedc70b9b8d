//! Unbounded multi-producer/multi-consumer work queue with drain tracking.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use papersift_adapters::ItemSink;
use papersift_core::WorkItem;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};

/// FIFO of pending items plus the count of items pushed but not yet marked done.
///
/// `outstanding` covers both queued and in-flight items, so [`WorkQueue::join`] only
/// returns once every pushed item has been popped and acknowledged.
#[derive(Debug)]
pub struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    ready: Notify,
    outstanding: watch::Sender<usize>,
    pushed: AtomicUsize,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0usize);
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            outstanding,
            pushed: AtomicUsize::new(0),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, item: WorkItem) {
        // Count before the item becomes visible so a fast consumer can't underflow.
        self.outstanding.send_modify(|n| *n += 1);
        self.pushed.fetch_add(1, Ordering::SeqCst);
        self.items().push_back(item);
        self.ready.notify_one();
    }

    /// Next item, or `None` once `timeout` passes with the queue still empty.
    pub async fn pop(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.items().pop_front() {
                return Some(item);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.items().pop_front();
            }
        }
    }

    /// Acknowledge one popped item.
    pub fn mark_done(&self) {
        self.outstanding.send_modify(|n| {
            debug_assert!(*n > 0, "mark_done without a matching pop");
            *n = n.saturating_sub(1);
        });
    }

    /// Wait until every pushed item has been marked done.
    pub async fn join(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives as long as `self`, so this can't observe a closed channel.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Items pushed over the queue's lifetime.
    pub fn total_pushed(&self) -> usize {
        self.pushed.load(Ordering::SeqCst)
    }
}

impl ItemSink for WorkQueue {
    fn push(&self, item: WorkItem) {
        WorkQueue::push(self, item);
    }
}

/// Calls [`WorkQueue::mark_done`] when dropped, on every exit path of item handling.
#[derive(Debug)]
pub struct DoneGuard<'a> {
    queue: &'a WorkQueue,
}

impl<'a> DoneGuard<'a> {
    pub fn new(queue: &'a WorkQueue) -> Self {
        Self { queue }
    }
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.mark_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use papersift_core::Source;
    use std::sync::Arc;

    fn item(n: usize) -> WorkItem {
        WorkItem::new(format!("https://arxiv.org/pdf/2610.{n:05}"), Source::Arxiv, "p")
    }

    #[tokio::test(start_paused = true)]
    async fn pop_times_out_on_empty_queue() {
        let queue = WorkQueue::new();
        let started = Instant::now();
        assert!(queue.pop(Duration::from_secs(5)).await.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn fifo_order_and_outstanding_count() {
        let queue = WorkQueue::new();
        queue.push(item(1));
        queue.push(item(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.outstanding(), 2);

        let first = queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first, item(1));
        assert_eq!(queue.outstanding(), 2);
        queue.mark_done();
        assert_eq!(queue.outstanding(), 1);
        assert_eq!(queue.total_pushed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_pop_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                queue.push(item(7));
            })
        };
        let started = Instant::now();
        let got = queue.pop(Duration::from_secs(5)).await;
        assert_eq!(got, Some(item(7)));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn join_returns_after_every_item_is_done() {
        let queue = Arc::new(WorkQueue::new());
        for n in 0..3 {
            queue.push(item(n));
        }

        let joined = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.join().await })
        };

        for _ in 0..3 {
            let popped = queue.pop(Duration::from_millis(10)).await;
            assert!(popped.is_some());
            assert!(!joined.is_finished());
            let _done = DoneGuard::new(&queue);
        }
        joined.await.unwrap();
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn join_on_untouched_queue_is_immediate() {
        WorkQueue::new().join().await;
    }
}
