//! Bibliographic metadata for a work, read from its raw JSON record.
//!
//! The record is Crossref-shaped. Every field is optional; a strategy that
//! needs a missing field simply abstains.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::Value;

use crate::normalize::normalize_title;

/// A license claim with the date it takes effect.
#[derive(Debug, Clone, PartialEq)]
pub struct LicenseClaim {
    pub url: String,
    pub start: Option<NaiveDate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Biblio {
    pub doi: String,
    pub title: Option<String>,
    pub normalized_title: Option<String>,
    pub issns: Vec<String>,
    pub journal: Option<String>,
    pub publisher: Option<String>,
    pub year: Option<i32>,
    pub published_date: Option<NaiveDate>,
    pub genre: Option<String>,
    /// Family names, in author order.
    pub authors: Vec<String>,
    pub licenses: Vec<LicenseClaim>,
}

impl Biblio {
    pub fn from_metadata(doi: &str, metadata_json: &str) -> Result<Self> {
        let value: Value = if metadata_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str(metadata_json)
                .with_context(|| format!("metadata for {} is not valid JSON", doi))?
        };
        Ok(Self::from_value(doi, &value))
    }

    pub fn from_value(doi: &str, value: &Value) -> Self {
        let title = first_string(value.get("title"));
        let normalized_title = title
            .as_deref()
            .map(normalize_title)
            .filter(|t| !t.is_empty());
        let published_date = date_parts(value.get("issued"));

        let authors = value
            .get("author")
            .and_then(Value::as_array)
            .map(|authors| {
                authors
                    .iter()
                    .filter_map(|a| a.get("family").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let licenses = value
            .get("license")
            .and_then(Value::as_array)
            .map(|licenses| {
                licenses
                    .iter()
                    .filter_map(|l| {
                        let url = l.get("URL").and_then(Value::as_str)?;
                        Some(LicenseClaim {
                            url: url.to_string(),
                            start: date_parts(l.get("start")),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            doi: doi.to_string(),
            title,
            normalized_title,
            issns: strings(value.get("ISSN")),
            journal: first_string(value.get("container-title")),
            publisher: first_string(value.get("publisher")),
            year: year_parts(value.get("issued")),
            published_date,
            genre: value.get("type").and_then(Value::as_str).map(str::to_string),
            authors,
            licenses,
        }
    }

    pub fn doi_url(&self) -> String {
        format!("https://doi.org/{}", self.doi)
    }

    pub fn first_author(&self) -> Option<&str> {
        self.authors.first().map(String::as_str)
    }

    pub fn last_author(&self) -> Option<&str> {
        self.authors.last().map(String::as_str)
    }
}

/// A string, or the first non-empty string of an array.
fn first_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parts(value: Option<&Value>) -> Option<Vec<i64>> {
    let first = value?.get("date-parts")?.as_array()?.first()?.as_array()?;
    let parts: Vec<i64> = first.iter().filter_map(Value::as_i64).collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}

fn year_parts(value: Option<&Value>) -> Option<i32> {
    parts(value).map(|p| p[0] as i32)
}

/// `date-parts` as a date; missing month/day default to 1.
fn date_parts(value: Option<&Value>) -> Option<NaiveDate> {
    let p = parts(value)?;
    let month = p.get(1).copied().unwrap_or(1) as u32;
    let day = p.get(2).copied().unwrap_or(1) as u32;
    NaiveDate::from_ymd_opt(p[0] as i32, month, day)
}
