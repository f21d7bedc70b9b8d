//! arXiv API crawler: pages through one category's submissions inside the most recent
//! announcement window and emits each paper's PDF link.

use std::collections::HashSet;
use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate};
use feed_rs::model::Entry;
use papersift_core::{Source, WorkItem};
use papersift_storage::HttpFetcher;
use regex::Regex;
use tracing::{info, warn};

use crate::{clean_link, AdapterError, ItemSink, SourceProducer};

pub const DEFAULT_API_BASE: &str = "https://export.arxiv.org";
pub const DEFAULT_CATEGORY: &str = "cs.AI";
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_RESULTS: usize = 10_000;
/// Consecutive empty pages tolerated before the reported total is reached.
pub const EMPTY_PAGE_RETRIES: usize = 3;

/// Submission window closing at 14:00 US Eastern, the arXiv announcement cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl SubmissionWindow {
    /// Window whose papers are announced on the morning of `today`.
    ///
    /// Monday covers Thursday to Friday, Tuesday covers Friday to Monday, every other
    /// day covers the two days before it.
    pub fn for_run_date(today: NaiveDate) -> Self {
        let weekday = today.weekday().num_days_from_monday();
        let start_back = if weekday <= 1 { 4 } else { 2 };
        let end_back = if weekday == 0 { 3 } else { 1 };
        Self {
            start: today - Duration::days(start_back),
            end: today - Duration::days(end_back),
        }
    }

    pub fn search_query(&self, category: &str) -> String {
        format!(
            "cat:{category} AND submittedDate:[{}1400 TO {}1400]",
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }

    pub fn period_label(&self) -> String {
        format!(
            "EDT {} 14:00 to {} 14:00",
            self.start.format("%Y%m%d"),
            self.end.format("%Y%m%d")
        )
    }
}

#[derive(Debug, Clone)]
pub struct ArxivProducer {
    category: String,
    window: SubmissionWindow,
    api_base: String,
    page_size: usize,
    max_results: usize,
}

impl ArxivProducer {
    pub fn new(category: impl Into<String>, window: SubmissionWindow) -> Self {
        Self {
            category: category.into(),
            window,
            api_base: DEFAULT_API_BASE.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_limits(mut self, page_size: usize, max_results: usize) -> Self {
        self.page_size = page_size.max(1);
        self.max_results = max_results;
        self
    }

    pub fn page_url(&self, start: usize, max_results: usize) -> String {
        format!(
            "{}/api/query?search_query={}&start={start}&max_results={max_results}&sortBy=submittedDate&sortOrder=descending",
            self.api_base,
            urlencoding::encode(&self.window.search_query(&self.category)),
        )
    }
}

#[async_trait]
impl SourceProducer for ArxivProducer {
    fn source(&self) -> Source {
        Source::Arxiv
    }

    fn period_label(&self) -> String {
        self.window.period_label()
    }

    async fn produce(&self, http: &HttpFetcher, sink: &dyn ItemSink) -> Result<usize, AdapterError> {
        let period = self.period_label();
        let mut visited = HashSet::new();
        let mut pushed = 0usize;
        let mut start = 0usize;
        let mut limit = self.max_results;
        let mut empty_streak = 0usize;

        while start < limit {
            let wanted = self.page_size.min(limit - start);
            let resp = http
                .fetch_bytes(Source::Arxiv.as_str(), &self.page_url(start, wanted))
                .await?;
            let page = parse_page(&resp.body)?;

            if let Some(total) = page.total_results {
                limit = limit.min(total);
            }
            if page.entries == 0 {
                if page.total_results.is_none() || start >= limit {
                    break;
                }
                empty_streak += 1;
                if empty_streak > EMPTY_PAGE_RETRIES {
                    return Err(AdapterError::Message(format!(
                        "arxiv returned {empty_streak} empty pages at start={start} of {limit} results"
                    )));
                }
                warn!(start, limit, attempt = empty_streak, "empty arxiv page before the end; retrying");
                continue;
            }
            empty_streak = 0;

            for link in page.links {
                if visited.insert(link.clone()) {
                    sink.push(WorkItem::new(link, Source::Arxiv, period.clone()));
                    pushed += 1;
                }
            }

            if page.total_results.is_none() && page.entries < wanted {
                break;
            }
            start += page.entries;
        }

        info!(period = %period, pushed, "arxiv crawl finished");
        Ok(pushed)
    }
}

/// One Atom result page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArxivPage {
    /// `opensearch:totalResults`, when the feed reports it.
    pub total_results: Option<usize>,
    /// Raw entry count, including entries without a usable link.
    pub entries: usize,
    pub links: Vec<String>,
}

fn total_results_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<opensearch:totalResults[^>]*>\s*(\d+)\s*</opensearch:totalResults>")
            .expect("static totalResults pattern")
    })
}

pub fn parse_page(body: &[u8]) -> Result<ArxivPage, AdapterError> {
    let feed = feed_rs::parser::parse(body).map_err(|e| AdapterError::Feed(e.to_string()))?;
    let total_results = total_results_pattern()
        .captures(&String::from_utf8_lossy(body))
        .and_then(|caps| caps[1].parse().ok());
    Ok(ArxivPage {
        total_results,
        entries: feed.entries.len(),
        links: feed.entries.iter().filter_map(pdf_link).collect(),
    })
}

/// PDF links of every entry in one Atom result page, cleaned, in feed order.
pub fn parse_pdf_links(body: &[u8]) -> Result<Vec<String>, AdapterError> {
    Ok(parse_page(body)?.links)
}

fn pdf_link(entry: &Entry) -> Option<String> {
    let explicit = entry.links.iter().find(|l| {
        l.title.as_deref() == Some("pdf") || l.media_type.as_deref() == Some("application/pdf")
    });
    let raw = match explicit {
        Some(link) => link.href.clone(),
        None if entry.id.contains("/abs/") => entry.id.replacen("/abs/", "/pdf/", 1),
        None => return None,
    };
    Some(clean_link(&raw).replacen("http://", "https://", 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>arXiv Query</title>
  <id>http://arxiv.org/api/abc</id>
  <updated>2026-10-16T00:00:00-04:00</updated>
  <entry>
    <id>http://arxiv.org/abs/2610.01234v1</id>
    <updated>2026-10-15T17:59:59Z</updated>
    <published>2026-10-15T17:59:59Z</published>
    <title>Scaling Agents</title>
    <summary>Abstract.</summary>
    <link href="http://arxiv.org/abs/2610.01234v1" rel="alternate" type="text/html"/>
    <link title="pdf" href="http://arxiv.org/pdf/2610.01234v1" rel="related" type="application/pdf"/>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2610.05678v2</id>
    <updated>2026-10-15T16:00:00Z</updated>
    <published>2026-10-15T16:00:00Z</published>
    <title>No PDF Link Listed</title>
    <summary>Abstract.</summary>
    <link href="http://arxiv.org/abs/2610.05678v2" rel="alternate" type="text/html"/>
  </entry>
</feed>"#;

    #[test]
    fn window_follows_announcement_schedule() {
        // 2026-10-19 Monday: Thursday 14:00 to Friday 14:00.
        let monday = SubmissionWindow::for_run_date(date(2026, 10, 19));
        assert_eq!(monday.start, date(2026, 10, 15));
        assert_eq!(monday.end, date(2026, 10, 16));

        // Tuesday: Friday to Monday.
        let tuesday = SubmissionWindow::for_run_date(date(2026, 10, 20));
        assert_eq!(tuesday.start, date(2026, 10, 16));
        assert_eq!(tuesday.end, date(2026, 10, 19));

        let thursday = SubmissionWindow::for_run_date(date(2026, 10, 22));
        assert_eq!(thursday.start, date(2026, 10, 20));
        assert_eq!(thursday.end, date(2026, 10, 21));
    }

    #[test]
    fn query_and_label_use_compact_dates() {
        let window = SubmissionWindow {
            start: date(2026, 10, 20),
            end: date(2026, 10, 21),
        };
        assert_eq!(
            window.search_query("cs.AI"),
            "cat:cs.AI AND submittedDate:[202610201400 TO 202610211400]"
        );
        assert_eq!(window.period_label(), "EDT 20261020 14:00 to 20261021 14:00");
    }

    #[test]
    fn page_url_encodes_query() {
        let producer = ArxivProducer::new(
            "cs.AI",
            SubmissionWindow {
                start: date(2026, 10, 20),
                end: date(2026, 10, 21),
            },
        )
        .with_api_base("http://localhost:9/");
        let url = producer.page_url(200, 100);
        assert!(url.starts_with("http://localhost:9/api/query?search_query=cat%3Acs.AI%20AND"));
        assert!(url.contains("&start=200&max_results=100&sortBy=submittedDate"));
        assert!(!url.contains(' '));
    }

    #[test]
    fn pdf_links_prefer_explicit_link_and_fall_back_to_abs_id() {
        let links = parse_pdf_links(PAGE.as_bytes()).unwrap();
        assert_eq!(
            links,
            vec![
                "https://arxiv.org/pdf/2610.01234v1".to_string(),
                "https://arxiv.org/pdf/2610.05678v2".to_string(),
            ]
        );
    }

    #[test]
    fn garbage_page_is_a_feed_error() {
        assert!(matches!(
            parse_pdf_links(b"<html>rate limited</html>"),
            Err(AdapterError::Feed(_))
        ));
    }

    #[test]
    fn page_reports_total_and_raw_entry_count() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">
  <title>arXiv Query</title>
  <id>http://arxiv.org/api/abc</id>
  <updated>2026-10-16T00:00:00-04:00</updated>
  <opensearch:totalResults xmlns:opensearch="http://a9.com/-/spec/opensearch/1.1/">412</opensearch:totalResults>
  <entry>
    <id>urn:no-abs-id</id>
    <updated>2026-10-15T17:59:59Z</updated>
    <title>Entry Without Any Link</title>
  </entry>
  <entry>
    <id>http://arxiv.org/abs/2610.01234v1</id>
    <updated>2026-10-15T17:59:59Z</updated>
    <title>Scaling Agents</title>
  </entry>
</feed>"#;
        let page = parse_page(body.as_bytes()).unwrap();
        assert_eq!(page.total_results, Some(412));
        assert_eq!(page.entries, 2);
        assert_eq!(page.links, vec!["https://arxiv.org/pdf/2610.01234v1".to_string()]);

        assert_eq!(parse_page(PAGE.as_bytes()).unwrap().total_results, None);
    }
}
