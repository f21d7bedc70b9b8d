//! Source producer contracts + the arXiv and Hugging Face daily-papers crawlers.

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use papersift_core::{Source, WorkItem};
use papersift_storage::{FetchError, HttpFetcher};
use thiserror::Error;

pub mod arxiv;
pub mod huggingface;

pub use arxiv::{ArxivProducer, SubmissionWindow};
pub use huggingface::HuggingFaceProducer;

pub const CRATE_NAME: &str = "papersift-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unparseable feed: {0}")]
    Feed(String),
    #[error("{0}")]
    Message(String),
}

/// Receives work items as a producer discovers them.
pub trait ItemSink: Send + Sync {
    fn push(&self, item: WorkItem);
}

/// One crawler feeding the rating queue.
///
/// `produce` pushes items as soon as they are discovered and returns how many it pushed.
/// An `Err` means the crawl stopped early; everything pushed before the error stays queued.
#[async_trait]
pub trait SourceProducer: Send + Sync {
    fn source(&self) -> Source;

    fn period_label(&self) -> String;

    async fn produce(&self, http: &HttpFetcher, sink: &dyn ItemSink) -> Result<usize, AdapterError>;
}

/// Drop `#fragment` and `?query` suffixes so the same paper maps to one link.
pub fn clean_link(link: &str) -> &str {
    let end = link.find(['#', '?']).unwrap_or(link.len());
    link[..end].trim()
}

/// The most recent Monday-to-Friday date strictly before `today`.
pub fn previous_working_day(today: NaiveDate) -> NaiveDate {
    let mut day = today - Duration::days(1);
    while day.weekday().num_days_from_monday() >= 5 {
        day -= Duration::days(1);
    }
    day
}
