//! Hugging Face daily-papers crawler.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use papersift_core::{Source, WorkItem};
use papersift_storage::HttpFetcher;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::info;

use crate::{clean_link, AdapterError, ItemSink, SourceProducer};

pub const DEFAULT_BASE_URL: &str = "https://huggingface.co";

fn arxiv_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.\d+").expect("static arxiv id pattern"))
}

#[derive(Debug, Clone)]
pub struct HuggingFaceProducer {
    date: NaiveDate,
    base_url: String,
}

impl HuggingFaceProducer {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn listing_url(&self) -> String {
        format!("{}/papers/date/{}", self.base_url, self.date.format("%Y-%m-%d"))
    }
}

#[async_trait]
impl SourceProducer for HuggingFaceProducer {
    fn source(&self) -> Source {
        Source::HuggingFace
    }

    fn period_label(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    async fn produce(&self, http: &HttpFetcher, sink: &dyn ItemSink) -> Result<usize, AdapterError> {
        let url = self.listing_url();
        info!(%url, "fetching hugging face daily papers");
        let resp = http.fetch_bytes(Source::HuggingFace.as_str(), &url).await?;

        let period = self.period_label();
        let pushed = scan_arxiv_ids(&resp.text(), |id| {
            sink.push(WorkItem::new(
                format!("https://arxiv.org/pdf/{id}"),
                Source::HuggingFace,
                period.clone(),
            ));
        })?;
        info!(period = %period, pushed, "hugging face crawl finished");
        Ok(pushed)
    }
}

/// Call `on_id` for each new arXiv id referenced by a `/papers/<id>` anchor, in document
/// order. Returns how many ids were reported.
pub fn scan_arxiv_ids(html: &str, mut on_id: impl FnMut(&str)) -> Result<usize, AdapterError> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").map_err(|e| AdapterError::Message(e.to_string()))?;

    let mut seen = HashSet::new();
    for href in document.select(&anchors).filter_map(|a| a.value().attr("href")) {
        if !href.contains("/papers/") {
            continue;
        }
        let id = href
            .split('/')
            .map(clean_link)
            .find(|segment| arxiv_id_pattern().is_match(segment));
        if let Some(id) = id {
            if seen.insert(id.to_string()) {
                on_id(id);
            }
        }
    }
    Ok(seen.len())
}

/// arXiv ids referenced by `/papers/<id>` anchors, first occurrence order, de-duplicated.
pub fn extract_arxiv_ids(html: &str) -> Result<Vec<String>, AdapterError> {
    let mut ids = Vec::new();
    scan_arxiv_ids(html, |id| ids.push(id.to_string()))?;
    Ok(ids)
}
