//! Thin Feishu (Lark) open-API client: app token exchange, docx markdown export for the
//! rubric documents and Bitable batch inserts for the result tables.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_BASE_URL: &str = "https://open.feishu.cn/open-apis";

/// Bitable rejects `batch_create` calls with more records than this.
pub const BATCH_CREATE_LIMIT: usize = 500;

pub type TableRow = Map<String, JsonValue>;

/// A Bitable table: the app (base) token plus the table id inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDestination {
    pub app_token: String,
    pub table_id: String,
}

impl fmt::Display for TableDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_token, self.table_id)
    }
}

/// Supplies rubric text (the rating SOP and the role-tag catalogue).
#[async_trait]
pub trait RubricSource: Send + Sync {
    async fn fetch_document(&self, doc_token: &str) -> anyhow::Result<String>;
}

/// Receives one batch of result rows per destination table.
#[async_trait]
pub trait TableSink: Send + Sync {
    async fn batch_write(
        &self,
        destination: &TableDestination,
        rows: &[TableRow],
    ) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone)]
pub struct FeishuConfig {
    pub base_url: String,
    pub app_id: String,
    pub app_secret: String,
    pub timeout: Duration,
}

impl FeishuConfig {
    pub fn new(app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum FeishuError {
    #[error("feishu request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feishu {endpoint} returned code {code}: {msg}")]
    Api {
        endpoint: &'static str,
        code: i64,
        msg: String,
    },
    #[error("feishu {endpoint} response carried no data")]
    MissingData { endpoint: &'static str },
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn into_data(self, endpoint: &'static str) -> Result<T, FeishuError> {
        if self.code != 0 {
            return Err(FeishuError::Api {
                endpoint,
                code: self.code,
                msg: self.msg,
            });
        }
        self.data.ok_or(FeishuError::MissingData { endpoint })
    }
}

#[derive(Debug, Deserialize)]
struct AppTokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    app_access_token: Option<String>,
    #[serde(default)]
    expire: u64,
}

#[derive(Debug, Deserialize)]
struct DocContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct BatchCreated {
    #[serde(default)]
    records: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct FeishuClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl FeishuClient {
    /// Exchange the app credentials for an access token valid for this run.
    pub async fn connect(config: FeishuConfig) -> Result<Self, FeishuError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let resp: AppTokenResponse = http
            .post(format!("{base_url}/auth/v3/app_access_token/internal"))
            .json(&json!({ "app_id": config.app_id, "app_secret": config.app_secret }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let access_token = app_token_from(resp)?;

        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    async fn decode<T: DeserializeOwned>(
        resp: reqwest::Response,
        endpoint: &'static str,
    ) -> Result<T, FeishuError> {
        let envelope: Envelope<T> = resp.error_for_status()?.json().await?;
        envelope.into_data(endpoint)
    }

    pub async fn fetch_document_markdown(&self, doc_token: &str) -> Result<String, FeishuError> {
        let resp = self
            .http
            .get(format!("{}/docs/v1/content", self.base_url))
            .bearer_auth(&self.access_token)
            .query(&[
                ("doc_token", doc_token),
                ("doc_type", "docx"),
                ("content_type", "markdown"),
            ])
            .send()
            .await?;
        let doc: DocContent = Self::decode(resp, "docs.v1.content.get").await?;
        Ok(doc.content)
    }

    pub async fn batch_create_records(
        &self,
        destination: &TableDestination,
        rows: &[TableRow],
    ) -> Result<usize, FeishuError> {
        let url = format!(
            "{}/bitable/v1/apps/{}/tables/{}/records/batch_create",
            self.base_url, destination.app_token, destination.table_id
        );
        let mut created = 0usize;
        for chunk in rows.chunks(BATCH_CREATE_LIMIT) {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(&self.access_token)
                .json(&batch_create_body(chunk))
                .send()
                .await?;
            let batch: BatchCreated =
                Self::decode(resp, "bitable.v1.app_table_record.batch_create").await?;
            created += batch.records.len();
        }
        info!(%destination, rows = rows.len(), created, "bitable batch_create complete");
        Ok(created)
    }
}

fn app_token_from(resp: AppTokenResponse) -> Result<String, FeishuError> {
    const ENDPOINT: &str = "auth.v3.app_access_token.internal";
    if resp.code != 0 {
        return Err(FeishuError::Api {
            endpoint: ENDPOINT,
            code: resp.code,
            msg: resp.msg,
        });
    }
    let token = resp
        .app_access_token
        .ok_or(FeishuError::MissingData { endpoint: ENDPOINT })?;
    info!(expires_in_secs = resp.expire, "obtained feishu app access token");
    Ok(token)
}

fn batch_create_body(rows: &[TableRow]) -> JsonValue {
    json!({
        "records": rows.iter().map(|fields| json!({ "fields": fields })).collect::<Vec<_>>()
    })
}

#[async_trait]
impl RubricSource for FeishuClient {
    async fn fetch_document(&self, doc_token: &str) -> anyhow::Result<String> {
        self.fetch_document_markdown(doc_token)
            .await
            .with_context(|| format!("fetching feishu document {doc_token}"))
    }
}

#[async_trait]
impl TableSink for FeishuClient {
    async fn batch_write(
        &self,
        destination: &TableDestination,
        rows: &[TableRow],
    ) -> anyhow::Result<usize> {
        self.batch_create_records(destination, rows)
            .await
            .with_context(|| format!("writing {} rows to table {destination}", rows.len()))
    }
}
