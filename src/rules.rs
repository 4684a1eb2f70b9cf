//! Rule tables: journal allow-lists, open-license patterns, manual overrides,
//! and the reported non-compliant denylist.
//!
//! The evidence collector treats all of these as read-only lookups. The
//! allow-lists and license patterns are loaded once into a [`RuleBook`];
//! overrides and denylist entries are per-work and fetched with
//! [`manual_override`] and [`noncompliant_fragments`].
//!
//! `olo rules load <file.toml>` fills the tables from a file like:
//!
//! ```toml
//! [[journal]]
//! kind = "issn"            # issn | journal | publisher | doi_prefix | url_prefix
//! value = "1932-6203"
//! license = "cc-by"
//! from_year = 2006         # optional; older articles are not covered
//!
//! [[license]]
//! pattern = "creativecommons.org/licenses/"
//!
//! [[override]]
//! work_id = "10.1234/abc"
//! pdf_url = "https://example.org/abc.pdf"
//!
//! [[noncompliant]]
//! work_id = "10.1234/abc"
//! url_fragment = "sci-hub"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

use crate::models::{HostType, Version};
use crate::normalize::normalize_title;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalRuleKind {
    Issn,
    Journal,
    Publisher,
    DoiPrefix,
    UrlPrefix,
}

impl JournalRuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JournalRuleKind::Issn => "issn",
            JournalRuleKind::Journal => "journal",
            JournalRuleKind::Publisher => "publisher",
            JournalRuleKind::DoiPrefix => "doi_prefix",
            JournalRuleKind::UrlPrefix => "url_prefix",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "issn" => Some(JournalRuleKind::Issn),
            "journal" => Some(JournalRuleKind::Journal),
            "publisher" => Some(JournalRuleKind::Publisher),
            "doi_prefix" => Some(JournalRuleKind::DoiPrefix),
            "url_prefix" => Some(JournalRuleKind::UrlPrefix),
            _ => None,
        }
    }

    /// Lookup key for a stored or queried value.
    fn key(&self, value: &str) -> String {
        match self {
            JournalRuleKind::Journal => normalize_title(value),
            _ => value.trim().to_lowercase(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalRule {
    pub license: Option<String>,
    pub from_year: Option<i32>,
}

impl JournalRule {
    fn covers(&self, year: Option<i32>) -> bool {
        match (self.from_year, year) {
            (Some(from), Some(year)) => year >= from,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Allow-lists and license patterns, loaded once and shared read-only.
#[derive(Debug, Clone, Default)]
pub struct RuleBook {
    exact: HashMap<(JournalRuleKind, String), JournalRule>,
    prefixes: Vec<(JournalRuleKind, String, JournalRule)>,
    license_patterns: Vec<(String, Option<String>)>,
}

impl RuleBook {
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let mut book = RuleBook::default();

        let rows = sqlx::query("SELECT kind, value, license, from_year FROM journal_rules")
            .fetch_all(pool)
            .await?;
        for row in rows {
            let kind: String = row.get("kind");
            let Some(kind) = JournalRuleKind::parse(&kind) else {
                tracing::warn!(kind = %kind, "unknown journal rule kind, skipping");
                continue;
            };
            let value: String = row.get("value");
            let from_year: Option<i64> = row.get("from_year");
            book.add_journal_rule(
                kind,
                &value,
                JournalRule {
                    license: row.get("license"),
                    from_year: from_year.map(|y| y as i32),
                },
            );
        }

        let rows = sqlx::query("SELECT pattern, normalized FROM license_patterns")
            .fetch_all(pool)
            .await?;
        for row in rows {
            book.add_license_pattern(row.get("pattern"), row.get("normalized"));
        }

        tracing::debug!(
            journal_rules = book.exact.len() + book.prefixes.len(),
            license_patterns = book.license_patterns.len(),
            "rule book loaded"
        );
        Ok(book)
    }

    pub fn add_journal_rule(&mut self, kind: JournalRuleKind, value: &str, rule: JournalRule) {
        let key = kind.key(value);
        match kind {
            JournalRuleKind::DoiPrefix | JournalRuleKind::UrlPrefix => {
                self.prefixes.push((kind, key, rule))
            }
            _ => {
                self.exact.insert((kind, key), rule);
            }
        }
    }

    pub fn add_license_pattern(&mut self, pattern: String, normalized: Option<String>) {
        self.license_patterns.push((pattern.to_lowercase(), normalized));
    }

    fn exact(&self, kind: JournalRuleKind, value: &str, year: Option<i32>) -> Option<&JournalRule> {
        self.exact
            .get(&(kind, kind.key(value)))
            .filter(|rule| rule.covers(year))
    }

    pub fn issn_rule(&self, issn: &str, year: Option<i32>) -> Option<&JournalRule> {
        self.exact(JournalRuleKind::Issn, issn, year)
    }

    pub fn journal_rule(&self, journal: &str, year: Option<i32>) -> Option<&JournalRule> {
        self.exact(JournalRuleKind::Journal, journal, year)
    }

    pub fn publisher_rule(&self, publisher: &str, year: Option<i32>) -> Option<&JournalRule> {
        self.exact(JournalRuleKind::Publisher, publisher, year)
    }

    fn prefix(&self, kind: JournalRuleKind, value: &str) -> Option<&JournalRule> {
        let value = value.trim().to_lowercase();
        self.prefixes
            .iter()
            .find(|(k, prefix, _)| *k == kind && value.starts_with(prefix.as_str()))
            .map(|(_, _, rule)| rule)
    }

    pub fn doi_prefix_rule(&self, doi: &str) -> Option<&JournalRule> {
        self.prefix(JournalRuleKind::DoiPrefix, doi)
    }

    pub fn url_prefix_rule(&self, url: &str) -> Option<&JournalRule> {
        self.prefix(JournalRuleKind::UrlPrefix, url)
    }

    /// Canonical license when `url` matches a known open-license pattern.
    pub fn open_license(&self, url: &str) -> Option<String> {
        let lower = url.to_lowercase();
        self.license_patterns
            .iter()
            .find(|(pattern, _)| lower.contains(pattern.as_str()))
            .map(|(_, normalized)| {
                normalized
                    .clone()
                    .or_else(|| normalize_license(url))
                    .unwrap_or_else(|| "implied-oa".to_string())
            })
    }
}

/// Map a license URL or phrase onto the canonical short scheme
/// (`cc-by`, `cc-by-nc-nd`, `cc0`, `pd`, ...).
pub fn normalize_license(text: &str) -> Option<String> {
    let s = text
        .to_lowercase()
        .replace(['_', ' '], "-")
        .replace("--", "-");

    if s.contains("publicdomain/zero") || s.contains("cc0") {
        return Some("cc0".into());
    }
    if s.contains("publicdomain") || s.contains("public-domain") {
        return Some("pd".into());
    }
    if s.contains("elsevier.com/open-access/userlicense") {
        return Some("elsevier-specific: oa user license".into());
    }
    if s.contains("pubs.acs.org/page/policy/authorchoice") {
        return Some("acs-specific: authorchoice/editors choice usage agreement".into());
    }

    let cc = s.contains("creativecommons.org/licenses/")
        || s.contains("cc-by")
        || s.contains("creative-commons-attribution");
    if !cc {
        return None;
    }
    for (needle, canonical) in [
        ("by-nc-nd", "cc-by-nc-nd"),
        ("by-nc-sa", "cc-by-nc-sa"),
        ("by-nc", "cc-by-nc"),
        ("by-nd", "cc-by-nd"),
        ("by-sa", "cc-by-sa"),
        ("attribution-noncommercial-noderivatives", "cc-by-nc-nd"),
        ("attribution-noncommercial-sharealike", "cc-by-nc-sa"),
        ("attribution-noncommercial", "cc-by-nc"),
        ("attribution-noderivatives", "cc-by-nd"),
        ("attribution-sharealike", "cc-by-sa"),
    ] {
        if s.contains(needle) {
            return Some(canonical.into());
        }
    }
    Some("cc-by".into())
}

/// A per-work manual override. A row with no URL forces the work closed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ManualOverride {
    pub work_id: String,
    pub pdf_url: Option<String>,
    pub metadata_url: Option<String>,
    pub license: Option<String>,
    pub version: Option<String>,
    pub host_type: Option<String>,
}

impl ManualOverride {
    pub fn version(&self) -> Option<Version> {
        self.version.as_deref().and_then(Version::parse)
    }

    pub fn host_type(&self) -> Option<HostType> {
        self.host_type.as_deref().and_then(HostType::parse)
    }

    pub fn forces_closed(&self) -> bool {
        self.pdf_url.is_none() && self.metadata_url.is_none()
    }
}

pub async fn manual_override(pool: &SqlitePool, work_id: &str) -> Result<Option<ManualOverride>> {
    let row = sqlx::query(
        "SELECT work_id, pdf_url, metadata_url, license, version, host_type \
         FROM manual_overrides WHERE work_id = ?",
    )
    .bind(work_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| ManualOverride {
        work_id: row.get("work_id"),
        pdf_url: row.get("pdf_url"),
        metadata_url: row.get("metadata_url"),
        license: row.get("license"),
        version: row.get("version"),
        host_type: row.get("host_type"),
    }))
}

/// URL fragments reported as violating access terms for this work.
pub async fn noncompliant_fragments(pool: &SqlitePool, work_id: &str) -> Result<Vec<String>> {
    let fragments = sqlx::query_scalar(
        "SELECT url_fragment FROM noncompliant_urls WHERE work_id = ? ORDER BY url_fragment",
    )
    .bind(work_id)
    .fetch_all(pool)
    .await?;
    Ok(fragments)
}

// ============ TOML import ============

#[derive(Debug, Deserialize)]
struct JournalRow {
    kind: JournalRuleKind,
    value: String,
    license: Option<String>,
    from_year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct LicenseRow {
    pattern: String,
    normalized: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NoncompliantRow {
    work_id: String,
    url_fragment: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryLinkRow {
    work_id: String,
    repository: String,
    record_id: String,
    #[serde(default = "default_release")]
    release: String,
    landing_url: Option<String>,
    pdf_url: Option<String>,
    version: Option<String>,
}

fn default_release() -> String {
    "live".to_string()
}

#[derive(Debug, Deserialize)]
struct ManuscriptRow {
    pmcid: String,
    author_manuscript: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RulesFile {
    #[serde(default)]
    journal: Vec<JournalRow>,
    #[serde(default)]
    license: Vec<LicenseRow>,
    #[serde(default, rename = "override")]
    overrides: Vec<ManualOverride>,
    #[serde(default)]
    noncompliant: Vec<NoncompliantRow>,
    #[serde(default)]
    repository_link: Vec<RepositoryLinkRow>,
    #[serde(default)]
    pmc_manuscript: Vec<ManuscriptRow>,
}

/// Counts of rows written per table.
#[derive(Debug, Default, PartialEq)]
pub struct ImportSummary {
    pub journal_rules: usize,
    pub license_patterns: usize,
    pub overrides: usize,
    pub noncompliant: usize,
    pub repository_links: usize,
    pub pmc_manuscripts: usize,
}

/// Import a rules file. Each section present replaces that table's rows;
/// sections left out of the file are untouched.
pub async fn import_rules(pool: &SqlitePool, path: &Path) -> Result<ImportSummary> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file: {}", path.display()))?;
    let file: RulesFile = toml::from_str(&text)
        .with_context(|| format!("Failed to parse rules file: {}", path.display()))?;

    let mut tx = pool.begin().await?;
    let mut summary = ImportSummary::default();

    if !file.journal.is_empty() {
        sqlx::query("DELETE FROM journal_rules").execute(&mut *tx).await?;
        for row in &file.journal {
            sqlx::query(
                "INSERT OR REPLACE INTO journal_rules (kind, value, license, from_year) VALUES (?, ?, ?, ?)",
            )
            .bind(row.kind.as_str())
            .bind(&row.value)
            .bind(&row.license)
            .bind(row.from_year.map(i64::from))
            .execute(&mut *tx)
            .await?;
        }
        summary.journal_rules = file.journal.len();
    }

    if !file.license.is_empty() {
        sqlx::query("DELETE FROM license_patterns").execute(&mut *tx).await?;
        for row in &file.license {
            sqlx::query("INSERT OR REPLACE INTO license_patterns (pattern, normalized) VALUES (?, ?)")
                .bind(&row.pattern)
                .bind(&row.normalized)
                .execute(&mut *tx)
                .await?;
        }
        summary.license_patterns = file.license.len();
    }

    if !file.overrides.is_empty() {
        sqlx::query("DELETE FROM manual_overrides").execute(&mut *tx).await?;
        for row in &file.overrides {
            sqlx::query(
                "INSERT OR REPLACE INTO manual_overrides \
                 (work_id, pdf_url, metadata_url, license, version, host_type) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(row.work_id.to_lowercase())
            .bind(&row.pdf_url)
            .bind(&row.metadata_url)
            .bind(&row.license)
            .bind(&row.version)
            .bind(&row.host_type)
            .execute(&mut *tx)
            .await?;
        }
        summary.overrides = file.overrides.len();
    }

    if !file.noncompliant.is_empty() {
        sqlx::query("DELETE FROM noncompliant_urls").execute(&mut *tx).await?;
        for row in &file.noncompliant {
            sqlx::query("INSERT OR IGNORE INTO noncompliant_urls (work_id, url_fragment) VALUES (?, ?)")
                .bind(row.work_id.to_lowercase())
                .bind(&row.url_fragment)
                .execute(&mut *tx)
                .await?;
        }
        summary.noncompliant = file.noncompliant.len();
    }

    if !file.repository_link.is_empty() {
        sqlx::query("DELETE FROM repository_links").execute(&mut *tx).await?;
        for row in &file.repository_link {
            sqlx::query(
                "INSERT OR REPLACE INTO repository_links \
                 (work_id, repository, record_id, release, landing_url, pdf_url, version) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(row.work_id.to_lowercase())
            .bind(&row.repository)
            .bind(&row.record_id)
            .bind(&row.release)
            .bind(&row.landing_url)
            .bind(&row.pdf_url)
            .bind(&row.version)
            .execute(&mut *tx)
            .await?;
        }
        summary.repository_links = file.repository_link.len();
    }

    if !file.pmc_manuscript.is_empty() {
        sqlx::query("DELETE FROM pmc_manuscripts").execute(&mut *tx).await?;
        for row in &file.pmc_manuscript {
            sqlx::query("INSERT OR REPLACE INTO pmc_manuscripts (pmcid, author_manuscript) VALUES (?, ?)")
                .bind(row.pmcid.to_uppercase())
                .bind(row.author_manuscript)
                .execute(&mut *tx)
                .await?;
        }
        summary.pmc_manuscripts = file.pmc_manuscript.len();
    }

    tx.commit().await?;
    Ok(summary)
}
