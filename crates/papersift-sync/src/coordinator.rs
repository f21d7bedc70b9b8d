//! Shared run state: the queue, producer completion, per-source results and counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use papersift_core::{RatingResult, Source};
use papersift_rater::FailureKind;
use serde::Serialize;
use tracing::info;

use crate::queue::WorkQueue;

/// Append-only results for one source, guarded by its own lock.
#[derive(Debug, Default)]
pub struct ResultCollection {
    results: Mutex<Vec<RatingResult>>,
}

impl ResultCollection {
    fn lock(&self) -> MutexGuard<'_, Vec<RatingResult>> {
        self.results.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, result: RatingResult) {
        self.lock().push(result);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Take the accumulated results, leaving the collection empty.
    pub fn freeze(&self) -> Vec<RatingResult> {
        std::mem::take(&mut *self.lock())
    }
}

/// Per-run outcome counters. Every dequeued item lands in exactly one bucket.
#[derive(Debug, Default)]
pub struct RunTally {
    rated: AtomicUsize,
    skipped: AtomicUsize,
    empty_response: AtomicUsize,
    empty_after_strip: AtomicUsize,
    malformed_json: AtomicUsize,
    transport: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TallySnapshot {
    pub rated: usize,
    pub skipped: usize,
    pub empty_response: usize,
    pub empty_after_strip: usize,
    pub malformed_json: usize,
    pub transport: usize,
}

impl TallySnapshot {
    pub fn failed(&self) -> usize {
        self.empty_response + self.empty_after_strip + self.malformed_json + self.transport
    }

    pub fn accounted(&self) -> usize {
        self.rated + self.skipped + self.failed()
    }
}

impl RunTally {
    pub fn record_rated(&self) {
        self.rated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::EmptyResponse => &self.empty_response,
            FailureKind::EmptyAfterStrip => &self.empty_after_strip,
            FailureKind::MalformedJson => &self.malformed_json,
            FailureKind::Transport => &self.transport,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TallySnapshot {
        TallySnapshot {
            rated: self.rated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            empty_response: self.empty_response.load(Ordering::Relaxed),
            empty_after_strip: self.empty_after_strip.load(Ordering::Relaxed),
            malformed_json: self.malformed_json.load(Ordering::Relaxed),
            transport: self.transport.load(Ordering::Relaxed),
        }
    }
}

/// State shared by producers, workers and the driver for one run.
#[derive(Debug)]
pub struct PipelineState {
    pub queue: WorkQueue,
    producers_total: usize,
    producers_done: Mutex<usize>,
    collections: BTreeMap<Source, ResultCollection>,
    pub tally: RunTally,
}

impl PipelineState {
    pub fn new(producers_total: usize) -> Self {
        Self {
            queue: WorkQueue::new(),
            producers_total,
            producers_done: Mutex::new(0),
            collections: Source::ALL
                .into_iter()
                .map(|source| (source, ResultCollection::default()))
                .collect(),
            tally: RunTally::default(),
        }
    }

    fn done_count(&self) -> MutexGuard<'_, usize> {
        self.producers_done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn producers_total(&self) -> usize {
        self.producers_total
    }

    pub fn producers_done(&self) -> usize {
        *self.done_count()
    }

    pub fn all_producers_done(&self) -> bool {
        self.producers_done() >= self.producers_total
    }

    /// Workers may exit once no producer can push again and nothing is queued.
    pub fn should_terminate(&self) -> bool {
        self.all_producers_done() && self.queue.is_empty()
    }

    pub fn collection(&self, source: Source) -> &ResultCollection {
        // Every source gets a collection in `new`.
        &self.collections[&source]
    }

    /// Register a running producer. The returned guard reports completion when dropped.
    pub fn producer_guard(self: &Arc<Self>, source: Source) -> ProducerGuard {
        ProducerGuard {
            state: Arc::clone(self),
            source,
        }
    }

    fn producer_finished(&self, source: Source) {
        let mut done = self.done_count();
        *done = (*done + 1).min(self.producers_total);
        info!(%source, done = *done, total = self.producers_total, "producer finished");
    }
}

/// Increments `producers_done` exactly once, on normal return, error, or panic unwind.
#[derive(Debug)]
pub struct ProducerGuard {
    state: Arc<PipelineState>,
    source: Source,
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.state.producer_finished(self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use papersift_core::ChineseAuthor;

    fn result(n: usize) -> RatingResult {
        RatingResult {
            score: Some(n as i64),
            summary: format!("paper {n}"),
            tag_primary: None,
            contact_primary: None,
            tag_secondary: None,
            contact_secondary: None,
            has_chinese_author: ChineseAuthor::No,
            link: format!("https://arxiv.org/pdf/2610.{n:05}"),
            period_label: "p".into(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_appends_are_never_lost() {
        let state = Arc::new(PipelineState::new(2));
        let mut handles = Vec::new();
        for worker in 0..20 {
            let state = state.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    state.collection(Source::Arxiv).append(result(worker * 100 + i));
                    tokio::task::yield_now().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(state.collection(Source::Arxiv).len(), 2000);
        assert!(state.collection(Source::HuggingFace).is_empty());
        assert_eq!(state.collection(Source::Arxiv).freeze().len(), 2000);
        assert!(state.collection(Source::Arxiv).is_empty());
    }

    #[tokio::test]
    async fn producer_guard_counts_once_even_when_the_producer_panics() {
        let state = Arc::new(PipelineState::new(2));

        let ok = {
            let guard = state.producer_guard(Source::Arxiv);
            tokio::spawn(async move {
                let _guard = guard;
            })
        };
        ok.await.unwrap();
        assert_eq!(state.producers_done(), 1);
        assert!(!state.all_producers_done());

        let crashed = {
            let guard = state.producer_guard(Source::HuggingFace);
            tokio::spawn(async move {
                let _guard = guard;
                panic!("listing page changed shape");
            })
        };
        assert!(crashed.await.is_err());
        assert_eq!(state.producers_done(), 2);
        assert!(state.all_producers_done());
    }

    #[tokio::test]
    async fn termination_needs_done_producers_and_an_empty_queue() {
        let state = Arc::new(PipelineState::new(1));
        assert!(!state.should_terminate());

        state
            .queue
            .push(papersift_core::WorkItem::new("https://x.org/1", Source::Arxiv, "p"));
        drop(state.producer_guard(Source::Arxiv));
        assert!(!state.should_terminate());

        let popped = state.queue.pop(std::time::Duration::from_millis(1)).await;
        assert!(popped.is_some());
        assert!(state.should_terminate());
    }

    #[test]
    fn tally_accounts_for_every_bucket() {
        let tally = RunTally::default();
        tally.record_rated();
        tally.record_skipped();
        tally.record_failure(FailureKind::EmptyResponse);
        tally.record_failure(FailureKind::MalformedJson);
        tally.record_failure(FailureKind::MalformedJson);
        let snap = tally.snapshot();
        assert_eq!(snap.malformed_json, 2);
        assert_eq!(snap.failed(), 3);
        assert_eq!(snap.accounted(), 5);
    }
}
