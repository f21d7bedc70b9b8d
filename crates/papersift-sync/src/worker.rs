//! Rating worker pool.

use std::sync::Arc;
use std::time::Duration;

use papersift_core::WorkItem;
use papersift_rater::{RatingClient, Rubric};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::coordinator::PipelineState;
use crate::queue::DoneGuard;

pub const DEFAULT_WORKERS: usize = 20;
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a worker needs, shared by the whole pool.
#[derive(Debug)]
pub struct WorkerContext {
    pub state: Arc<PipelineState>,
    pub rater: RatingClient,
    pub rubric: Rubric,
    pub pop_timeout: Duration,
}

/// Spawn `count` workers; each resolves to the number of items it dequeued.
pub fn spawn_workers(ctx: Arc<WorkerContext>, count: usize) -> JoinSet<usize> {
    let mut pool = JoinSet::new();
    for id in 0..count.max(1) {
        pool.spawn(run_worker(id, Arc::clone(&ctx)));
    }
    pool
}

pub async fn run_worker(id: usize, ctx: Arc<WorkerContext>) -> usize {
    let state = &ctx.state;
    let mut handled = 0usize;
    loop {
        if state.should_terminate() {
            break;
        }
        let Some(item) = state.queue.pop(ctx.pop_timeout).await else {
            continue;
        };
        let _done = DoneGuard::new(&state.queue);
        handle_item(&ctx, item).await;
        handled += 1;
    }
    debug!(worker = id, handled, "worker exiting");
    handled
}

async fn handle_item(ctx: &WorkerContext, item: WorkItem) {
    let state = &ctx.state;
    if !is_http_link(&item.link) {
        warn!(link = %item.link, source = %item.source, "skipping item without an http(s) link");
        state.tally.record_skipped();
        return;
    }

    match ctx.rater.rate(&ctx.rubric, &item.link, &item.period_label).await {
        Ok(result) => {
            info!(link = %item.link, source = %item.source, score = ?result.score, "rated");
            state.collection(item.source).append(result);
            state.tally.record_rated();
        }
        Err(err) => {
            warn!(
                link = %item.link,
                source = %item.source,
                kind = %err.kind(),
                error = %err,
                "rating failed; item dropped"
            );
            state.tally.record_failure(err.kind());
        }
    }
}

fn is_http_link(link: &str) -> bool {
    ["https://", "http://"].iter().any(|scheme| {
        link.get(..scheme.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
            && link.len() > scheme.len()
    })
}
