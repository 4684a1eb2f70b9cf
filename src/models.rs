//! Core data models.
//!
//! Plain structs mirroring the database rows. Relationships are foreign-key
//! ids only (`work_id`, `endpoint_id`); related rows are fetched through the
//! query functions in [`crate::works`], [`crate::pages`], and
//! [`crate::endpoints`], never held as object references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Manuscript stage of a location's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Version {
    #[serde(rename = "submittedVersion")]
    Submitted,
    #[serde(rename = "acceptedVersion")]
    Accepted,
    #[serde(rename = "publishedVersion")]
    Published,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Submitted => "submittedVersion",
            Version::Accepted => "acceptedVersion",
            Version::Published => "publishedVersion",
        }
    }

    /// Accepts both the stored form (`publishedVersion`) and bare words
    /// (`published`) as they appear in rule files.
    pub fn parse(s: &str) -> Option<Version> {
        match s.trim().to_ascii_lowercase().as_str() {
            "submittedversion" | "submitted" => Some(Version::Submitted),
            "acceptedversion" | "accepted" => Some(Version::Accepted),
            "publishedversion" | "published" => Some(Version::Published),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse open-access classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Gold,
    Green,
    Black,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Gold => "gold",
            Color::Green => "green",
            Color::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    Publisher,
    Repository,
}

impl HostType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostType::Publisher => "publisher",
            HostType::Repository => "repository",
        }
    }

    pub fn parse(s: &str) -> Option<HostType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publisher" => Some(HostType::Publisher),
            "repository" => Some(HostType::Repository),
            _ => None,
        }
    }
}

/// One candidate full-text location for a work.
///
/// `is_best` is not stored here; the ranker assigns it on the serialized
/// result only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenLocation {
    pub work_id: String,
    pub pdf_url: Option<String>,
    pub metadata_url: Option<String>,
    pub license: Option<String>,
    /// Free-text provenance tag, e.g. `oa repository (via OAI-PMH doi match)`.
    pub evidence: String,
    pub version: Option<Version>,
    /// Set only when a source pins the host type (manual overrides).
    pub host_type: Option<HostType>,
    /// Harvest endpoint that contributed this location, if any.
    pub endpoint_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub error: Option<String>,
}

impl OpenLocation {
    pub fn new(work_id: &str, evidence: impl Into<String>) -> Self {
        Self {
            work_id: work_id.to_string(),
            evidence: evidence.into(),
            ..Default::default()
        }
    }

    /// `pdf_url` when present, else `metadata_url`.
    pub fn best_url(&self) -> Option<&str> {
        self.pdf_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .or(self.metadata_url.as_deref().filter(|u| !u.is_empty()))
    }
}

/// An identifier record (e.g. one DOI) and its consolidated answer.
#[derive(Debug, Clone, Default)]
pub struct Work {
    pub id: String,
    pub rand: f64,
    pub created_at: i64,
    pub updated_at: i64,
    pub metadata_json: String,
    pub title: Option<String>,
    pub normalized_title: Option<String>,
    pub scrape_updated: Option<i64>,
    pub scrape_evidence: Option<String>,
    pub scrape_pdf_url: Option<String>,
    pub scrape_metadata_url: Option<String>,
    pub scrape_license: Option<String>,
    pub response_json: Option<String>,
    pub response_is_oa: bool,
    pub response_best_url: Option<String>,
    pub response_best_evidence: Option<String>,
    pub response_best_version: Option<String>,
    pub response_best_host: Option<String>,
    pub response_color: Option<String>,
    pub response_updated: Option<i64>,
    /// Last processing error. Advisory only.
    pub error: Option<String>,
    /// Ranked locations from the last evaluation; written at commit.
    pub locations: Vec<OpenLocation>,
}

/// An OAI-PMH harvest source.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub id: String,
    pub base_url: String,
    pub pmh_set: Option<String>,
    pub rand: f64,
    pub last_harvest_started: Option<i64>,
    pub last_harvest_finished: Option<i64>,
    /// Watermark date, `YYYY-MM-DD`.
    pub most_recent_date_harvested: Option<String>,
    pub error: Option<String>,
    pub ready_to_run: bool,
    /// Pages minted by the last harvest; written at commit.
    pub harvested: Vec<Page>,
}

/// One URL of one harvested OAI-PMH record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub id: String,
    pub endpoint_id: String,
    pub pmh_id: String,
    pub url: String,
    pub doi: Option<String>,
    pub title: Option<String>,
    pub normalized_title: Option<String>,
    pub authors: Vec<String>,
    pub source_tag: String,
    pub created_at: i64,
    pub scrape_updated: Option<i64>,
    pub scrape_pdf_url: Option<String>,
    pub scrape_metadata_url: Option<String>,
    pub scrape_license: Option<String>,
    pub scrape_version: Option<Version>,
    pub error: Option<String>,
}

impl Page {
    /// A page counts as open once a scrape found a pdf or landing URL.
    pub fn is_open(&self) -> bool {
        self.scrape_pdf_url.is_some() || self.scrape_metadata_url.is_some()
    }
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_url_prefers_pdf() {
        let mut loc = OpenLocation::new("10.1/x", "oa repository");
        loc.metadata_url = Some("https://repo.example.org/1".into());
        assert_eq!(loc.best_url(), Some("https://repo.example.org/1"));
        loc.pdf_url = Some("https://repo.example.org/1.pdf".into());
        assert_eq!(loc.best_url(), Some("https://repo.example.org/1.pdf"));
    }

    #[test]
    fn empty_urls_are_not_usable() {
        let mut loc = OpenLocation::new("10.1/x", "oa repository");
        loc.pdf_url = Some(String::new());
        assert_eq!(loc.best_url(), None);
    }

    #[test]
    fn version_parse_accepts_short_forms() {
        assert_eq!(Version::parse("published"), Some(Version::Published));
        assert_eq!(Version::parse("acceptedVersion"), Some(Version::Accepted));
        assert_eq!(Version::parse("draft"), None);
    }
}
