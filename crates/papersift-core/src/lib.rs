//! Core domain model for papersift: work items flowing through the pipeline and the
//! rating records that come out of it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value as JsonValue};

pub const CRATE_NAME: &str = "papersift-core";

/// Where a candidate paper was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Arxiv,
    HuggingFace,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Arxiv, Source::HuggingFace];

    pub fn as_str(self) -> &'static str {
        match self {
            Source::Arxiv => "arxiv",
            Source::HuggingFace => "huggingface",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arxiv" => Ok(Source::Arxiv),
            "huggingface" | "hf" => Ok(Source::HuggingFace),
            other => Err(format!("unknown source `{other}` (expected arxiv or huggingface)")),
        }
    }
}

/// One candidate paper handed from a producer to the rating workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub link: String,
    pub source: Source,
    pub period_label: String,
}

impl WorkItem {
    pub fn new(link: impl Into<String>, source: Source, period_label: impl Into<String>) -> Self {
        Self {
            link: link.into(),
            source,
            period_label: period_label.into(),
        }
    }
}

/// Whether the author list contains at least one Chinese author.
///
/// Only the two canonical values survive decoding; anything else is rejected so a
/// malformed answer invalidates the whole rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChineseAuthor {
    Yes,
    No,
}

impl ChineseAuthor {
    pub fn as_str(self) -> &'static str {
        match self {
            ChineseAuthor::Yes => "YES",
            ChineseAuthor::No => "NO",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("yes") || trimmed == "是" {
            Some(ChineseAuthor::Yes)
        } else if trimmed.eq_ignore_ascii_case("no") || trimmed == "否" {
            Some(ChineseAuthor::No)
        } else {
            None
        }
    }
}

impl Serialize for ChineseAuthor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ChineseAuthor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChineseAuthor::parse(&raw).ok_or_else(|| {
            serde::de::Error::custom(format!("has_chinese_author must be YES or NO, got `{raw}`"))
        })
    }
}

/// Normalized model verdict for one paper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingResult {
    pub score: Option<i64>,
    pub summary: String,
    pub tag_primary: Option<String>,
    pub contact_primary: Option<String>,
    pub tag_secondary: Option<String>,
    pub contact_secondary: Option<String>,
    pub has_chinese_author: ChineseAuthor,
    pub link: String,
    pub period_label: String,
}

impl RatingResult {
    /// Row shape written to the destination table.
    pub fn table_fields(&self) -> Map<String, JsonValue> {
        let mut fields = Map::new();
        if let Some(score) = self.score {
            fields.insert("score".into(), json!(score));
        }
        fields.insert("summary".into(), json!(self.summary));
        insert_opt(&mut fields, "tag_primary", &self.tag_primary);
        insert_opt(&mut fields, "contact_tag_primary", &self.contact_primary);
        insert_opt(&mut fields, "tag_secondary", &self.tag_secondary);
        insert_opt(&mut fields, "contact_tag_secondary", &self.contact_secondary);
        fields.insert(
            "has_chinese_author".into(),
            json!(self.has_chinese_author.as_str()),
        );
        fields.insert(
            "link".into(),
            json!({ "link": self.link, "text": self.link }),
        );
        fields.insert("period".into(), json!(self.period_label));
        fields
    }
}

fn insert_opt(fields: &mut Map<String, JsonValue>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        fields.insert(key.to_string(), json!(value));
    }
}
