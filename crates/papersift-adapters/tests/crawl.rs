// Crawl loops driven against a local HTTP stub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use papersift_adapters::arxiv::EMPTY_PAGE_RETRIES;
use papersift_adapters::{
    AdapterError, ArxivProducer, HuggingFaceProducer, ItemSink, SourceProducer, SubmissionWindow,
};
use papersift_core::{Source, WorkItem};
use papersift_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

type Route = dyn Fn(&str, usize) -> (u16, String) + Send + Sync;

/// Serves `route(target, nth_hit_of_target)` and records every request target.
struct Stub {
    base: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl Stub {
    async fn start(route: impl Fn(&str, usize) -> (u16, String) + Send + Sync + 'static) -> Self {
        let route: Arc<Route> = Arc::new(route);
        let hits = Arc::new(Mutex::new(Vec::<String>::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let served = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let route = route.clone();
                let hits = served.clone();
                tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => head.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let text = String::from_utf8_lossy(&head);
                    let target = text.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let nth = {
                        let mut hits = hits.lock().unwrap();
                        let nth = hits.iter().filter(|t| **t == target).count();
                        hits.push(target.clone());
                        nth
                    };
                    let (status, body) = route(&target, nth);
                    let response = format!(
                        "HTTP/1.1 {status} Stub\r\nContent-Type: application/xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { base, hits }
    }

    fn requests(&self) -> usize {
        self.hits.lock().unwrap().len()
    }

    fn requests_at(&self, start: usize) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|t| query_param(t, "start") == Some(start))
            .count()
    }
}

/// Records each item together with how many requests had been served when it arrived.
struct RecordingSink {
    hits: Arc<Mutex<Vec<String>>>,
    items: Mutex<Vec<(WorkItem, usize)>>,
}

impl RecordingSink {
    fn watching(stub: &Stub) -> Self {
        Self {
            hits: stub.hits.clone(),
            items: Mutex::new(Vec::new()),
        }
    }

    fn links(&self) -> Vec<String> {
        self.items
            .lock()
            .unwrap()
            .iter()
            .map(|(item, _)| item.link.clone())
            .collect()
    }

    fn served_when_pushed(&self) -> Vec<usize> {
        self.items.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }
}

impl ItemSink for RecordingSink {
    fn push(&self, item: WorkItem) {
        let served = self.hits.lock().unwrap().len();
        self.items.lock().unwrap().push((item, served));
    }
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        min_intervals: HashMap::new(),
        backoff: BackoffPolicy {
            max_retries: 0,
            ..Default::default()
        },
        ..Default::default()
    })
    .unwrap()
}

fn query_param(target: &str, key: &str) -> Option<usize> {
    let query = target.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix(key)?.strip_prefix('='))
        .and_then(|v| v.parse().ok())
}

/// Atom page with one entry per id; an id of `-` is an entry with no usable link.
fn atom_page(total: usize, ids: &[&str]) -> String {
    let entries: String = ids
        .iter()
        .map(|id| {
            if *id == "-" {
                "<entry><id>urn:withdrawn</id><updated>2026-10-15T00:00:00Z</updated><title>Withdrawn</title></entry>".to_string()
            } else {
                format!(
                    "<entry><id>http://arxiv.org/abs/{id}v1</id><updated>2026-10-15T00:00:00Z</updated><title>{id}</title>\
                     <link title=\"pdf\" href=\"http://arxiv.org/pdf/{id}v1\" rel=\"related\" type=\"application/pdf\"/></entry>"
                )
            }
        })
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <feed xmlns=\"http://www.w3.org/2005/Atom\" xmlns:opensearch=\"http://a9.com/-/spec/opensearch/1.1/\">\
         <title>arXiv Query</title><id>http://arxiv.org/api/q</id><updated>2026-10-16T00:00:00-04:00</updated>\
         <opensearch:totalResults>{total}</opensearch:totalResults>{entries}</feed>"
    )
}

fn pdf(id: &str) -> String {
    format!("https://arxiv.org/pdf/{id}v1")
}

fn arxiv(stub: &Stub, page_size: usize, max_results: usize) -> ArxivProducer {
    let day = NaiveDate::from_ymd_opt(2026, 10, 22).unwrap();
    ArxivProducer::new("cs.AI", SubmissionWindow::for_run_date(day))
        .with_api_base(stub.base.as_str())
        .with_limits(page_size, max_results)
}

#[tokio::test]
async fn arxiv_pushes_each_page_as_it_arrives_and_skips_repeats() {
    let stub = Stub::start(|target, _| {
        let ids: &[&str] = match query_param(target, "start") {
            Some(0) => &["2610.00001", "2610.00002"],
            Some(2) => &["2610.00002", "2610.00003"],
            Some(4) => &["2610.00004"],
            _ => &[],
        };
        (200, atom_page(5, ids))
    })
    .await;
    let sink = RecordingSink::watching(&stub);

    let pushed = arxiv(&stub, 2, 10_000).produce(&fetcher(), &sink).await.unwrap();

    assert_eq!(pushed, 4);
    assert_eq!(
        sink.links(),
        vec![pdf("2610.00001"), pdf("2610.00002"), pdf("2610.00003"), pdf("2610.00004")]
    );
    assert_eq!(sink.served_when_pushed(), vec![1, 1, 2, 3]);
    assert_eq!(stub.requests(), 3);
}

#[tokio::test]
async fn arxiv_retries_a_transient_empty_page() {
    let stub = Stub::start(|target, nth| {
        let ids: &[&str] = match (query_param(target, "start"), nth) {
            (Some(0), _) => &["2610.00001", "2610.00002"],
            (Some(2), 0) => &[],
            (Some(2), _) => &["2610.00003", "2610.00004"],
            (Some(4), _) => &["2610.00005", "2610.00006"],
            _ => &[],
        };
        (200, atom_page(6, ids))
    })
    .await;
    let sink = RecordingSink::watching(&stub);

    let pushed = arxiv(&stub, 2, 10_000).produce(&fetcher(), &sink).await.unwrap();

    assert_eq!(pushed, 6);
    assert_eq!(stub.requests_at(2), 2);
}

#[tokio::test]
async fn arxiv_gap_before_reported_total_is_an_error_and_keeps_earlier_items() {
    let stub = Stub::start(|target, _| {
        let ids: &[&str] = match query_param(target, "start") {
            Some(0) => &["2610.00001", "2610.00002"],
            Some(4) => &["2610.00005", "2610.00006"],
            _ => &[],
        };
        (200, atom_page(6, ids))
    })
    .await;
    let sink = RecordingSink::watching(&stub);

    let result = arxiv(&stub, 2, 10_000).produce(&fetcher(), &sink).await;

    assert!(matches!(result, Err(AdapterError::Message(_))));
    assert_eq!(sink.links(), vec![pdf("2610.00001"), pdf("2610.00002")]);
    assert_eq!(stub.requests_at(2), 1 + EMPTY_PAGE_RETRIES);
    assert_eq!(stub.requests_at(4), 0);
}

#[tokio::test]
async fn arxiv_entry_without_link_does_not_end_paging() {
    let stub = Stub::start(|target, _| {
        let ids: &[&str] = match query_param(target, "start") {
            Some(0) => &["2610.00001", "-"],
            Some(2) => &["2610.00003", "2610.00004"],
            _ => &[],
        };
        (200, atom_page(4, ids))
    })
    .await;
    let sink = RecordingSink::watching(&stub);

    let pushed = arxiv(&stub, 2, 10_000).produce(&fetcher(), &sink).await.unwrap();

    assert_eq!(pushed, 3);
    assert_eq!(stub.requests(), 2);
}

#[tokio::test]
async fn arxiv_stops_at_max_results() {
    let stub = Stub::start(|target, _| {
        let start = query_param(target, "start").unwrap_or(0);
        let max = query_param(target, "max_results").unwrap_or(0);
        let ids: Vec<String> = (start..start + max).map(|i| format!("2610.{i:05}")).collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        (200, atom_page(100, &ids))
    })
    .await;
    let sink = RecordingSink::watching(&stub);

    let pushed = arxiv(&stub, 2, 3).produce(&fetcher(), &sink).await.unwrap();

    assert_eq!(pushed, 3);
    let hits = stub.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 2);
    assert_eq!(query_param(&hits[0], "max_results"), Some(2));
    assert_eq!(query_param(&hits[1], "start"), Some(2));
    assert_eq!(query_param(&hits[1], "max_results"), Some(1));
}

#[tokio::test]
async fn arxiv_failed_second_page_keeps_first_page_queued() {
    let stub = Stub::start(|target, _| match query_param(target, "start") {
        Some(0) => (200, atom_page(4, &["2610.00001", "2610.00002"])),
        _ => (404, "gone".to_string()),
    })
    .await;
    let sink = RecordingSink::watching(&stub);

    let result = arxiv(&stub, 2, 10_000).produce(&fetcher(), &sink).await;

    assert!(matches!(result, Err(AdapterError::Fetch(_))));
    assert_eq!(sink.links().len(), 2);
}

#[tokio::test]
async fn huggingface_pushes_one_item_per_paper_anchor() {
    let stub = Stub::start(|target, _| {
        if target == "/papers/date/2026-10-16" {
            let html = r#"<html><body>
              <a href="/papers/2610.01234">Scaling Agents</a>
              <a href="/papers/2610.01234#community">3 comments</a>
              <a href="/papers/2610.04321?utm=x">Small VLMs</a>
              <a href="/models">Models</a>
            </body></html>"#;
            (200, html.to_string())
        } else {
            (404, String::new())
        }
    })
    .await;
    let sink = RecordingSink::watching(&stub);
    let producer = HuggingFaceProducer::new(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap())
        .with_base_url(stub.base.as_str());

    let pushed = producer.produce(&fetcher(), &sink).await.unwrap();

    assert_eq!(pushed, 2);
    assert_eq!(
        sink.links(),
        vec![
            "https://arxiv.org/pdf/2610.01234".to_string(),
            "https://arxiv.org/pdf/2610.04321".to_string(),
        ]
    );
    let items = sink.items.lock().unwrap();
    assert!(items
        .iter()
        .all(|(item, _)| item.source == Source::HuggingFace && item.period_label == "2026-10-16"));
}

#[tokio::test]
async fn huggingface_missing_listing_is_a_fetch_error() {
    let stub = Stub::start(|_, _| (404, String::new())).await;
    let sink = RecordingSink::watching(&stub);
    let producer = HuggingFaceProducer::new(NaiveDate::from_ymd_opt(2026, 10, 16).unwrap())
        .with_base_url(stub.base.as_str());

    let result = producer.produce(&fetcher(), &sink).await;

    assert!(matches!(result, Err(AdapterError::Fetch(_))));
    assert!(sink.links().is_empty());
}
