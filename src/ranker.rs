//! Location ranker: dedup, score, order, and pick the best location, then
//! derive color, version, and the consolidated result.
//!
//! # Scoring
//!
//! Lower is better. Evidence sets the tier; repository locations are
//! separated by how trustworthy their host usually is:
//!
//! | Evidence / URL | Score |
//! |----------------|-------|
//! | `oa journal ...` | -10 |
//! | `publisher ...` | -9 |
//! | `hybrid ...` | -8 |
//! | repository on `/pmc/` | -5 |
//! | repository on arXiv | -4 |
//! | repository on `/pubmed/` | -3 |
//! | repository on `.edu` | -2 |
//! | repository on `doi.org` | -1 |
//! | repository, other PDF link | -0.5 |
//! | repository on CiteSeerX | +9 |
//! | anything else | 0 |
//!
//! Repository locations found through an id lookup or a DOI match get a
//! further -0.5 each. Ties are broken by the best URL.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::biblio::Biblio;
use crate::models::{Color, HostType, OpenLocation, Version};

/// Preprint servers; content there is the submitted version.
const PREPRINT_URL_FRAGMENTS: &[&str] = &[
    "precedings.nature.com",
    "arxiv.org/",
    "10.15200/winn.",
    "/peerj.preprints",
    ".figshare.",
    "10.1101/",
    "10.15363/",
];

/// Score of a repository URL by host quality.
pub fn url_sort_score(url: &str) -> f64 {
    let url = url.to_lowercase();
    if url.contains("/pmc/") {
        -5.0
    } else if url.contains("arxiv") {
        -4.0
    } else if url.contains("/pubmed/") {
        -3.0
    } else if url.contains(".edu") {
        -2.0
    } else if url.contains("doi.org") {
        -1.0
    } else if url.contains("citeseerx") {
        9.0
    } else if url.contains("pdf") {
        -0.5
    } else {
        0.0
    }
}

pub fn location_sort_score(loc: &OpenLocation) -> f64 {
    let evidence = loc.evidence.as_str();
    if evidence.contains("oa journal") {
        return -10.0;
    }
    if evidence.contains("publisher") {
        return -9.0;
    }
    if evidence.contains("hybrid") {
        return -8.0;
    }
    if evidence.contains("oa repo") {
        let mut score = url_sort_score(loc.best_url().unwrap_or_default());
        if evidence.contains("pmcid lookup") || evidence.contains("id lookup") {
            score -= 0.5;
        }
        if evidence.contains("doi") {
            score -= 0.5;
        }
        return score;
    }
    0.0
}

/// Color from evidence and URL alone.
pub fn oa_color(loc: &OpenLocation) -> Color {
    if loc.evidence == "closed" || loc.best_url().is_none() {
        return Color::Black;
    }
    let evidence = loc.evidence.as_str();
    if evidence.contains("oa journal") || evidence.contains("publisher") || evidence.contains("hybrid") {
        Color::Gold
    } else {
        Color::Green
    }
}

pub fn host_type(loc: &OpenLocation) -> HostType {
    loc.host_type.unwrap_or(match oa_color(loc) {
        Color::Gold => HostType::Publisher,
        _ => HostType::Repository,
    })
}

/// `PMC12345` from a PMC article URL.
pub fn pmcid_from_url(url: &str) -> Option<String> {
    let upper = url.to_uppercase();
    upper.match_indices("PMC").find_map(|(start, _)| {
        let digits: String = upper[start + 3..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            None
        } else {
            Some(format!("PMC{}", digits))
        }
    })
}

/// Signals for [`derive_version`] that need a lookup or a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VersionHints {
    /// PMC flags the copy as an author manuscript.
    pub author_manuscript: Option<bool>,
    /// The fetched document carries a copyright mark.
    pub copyright_mark: Option<bool>,
}

/// Manuscript version implied by a location, ignoring any version it has.
pub fn derive_version(loc: &OpenLocation, hints: &VersionHints) -> Option<Version> {
    match oa_color(loc) {
        Color::Black => return None,
        Color::Gold => return Some(Version::Published),
        Color::Green => {}
    }

    let urls = [loc.metadata_url.as_deref(), loc.pdf_url.as_deref()];
    let mentions = |fragment: &str| urls.iter().flatten().any(|u| u.contains(fragment));

    if PREPRINT_URL_FRAGMENTS.iter().any(|f| mentions(f)) {
        return Some(Version::Submitted);
    }
    if mentions("/pmc/") || mentions("europepmc.org") {
        return if hints.author_manuscript == Some(true) {
            Some(Version::Accepted)
        } else {
            Some(Version::Published)
        };
    }
    if hints.copyright_mark == Some(true) {
        Some(Version::Published)
    } else {
        Some(Version::Submitted)
    }
}

/// Whether a copyright mark in the document would change the derived version.
pub fn copyright_mark_matters(loc: &OpenLocation, hints: &VersionHints) -> bool {
    derive_version(loc, &VersionHints { copyright_mark: Some(false), ..*hints })
        != derive_version(loc, &VersionHints { copyright_mark: Some(true), ..*hints })
}

/// Keep the first location for each best URL; locations without a URL
/// are dropped.
pub fn dedup(locations: Vec<OpenLocation>) -> Vec<OpenLocation> {
    let mut seen = HashSet::new();
    locations
        .into_iter()
        .filter(|loc| match loc.best_url() {
            Some(url) => seen.insert(url.to_string()),
            None => false,
        })
        .collect()
}

/// Ranked locations for one work. The best one is first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranked {
    pub locations: Vec<OpenLocation>,
    /// Best URLs removed by the denylist.
    pub reported_noncompliant: Vec<String>,
}

impl Ranked {
    pub fn best(&self) -> Option<&OpenLocation> {
        self.locations.first()
    }
}

/// Dedup, fill missing versions, sort by (score, best URL), and drop
/// locations matching a reported non-compliant fragment.
pub fn rank(
    locations: Vec<OpenLocation>,
    noncompliant_fragments: &[String],
    author_manuscripts: &HashMap<String, bool>,
    copyright_marks: &HashMap<String, bool>,
) -> Ranked {
    let mut locations: Vec<OpenLocation> = dedup(locations)
        .into_iter()
        .filter(|loc| oa_color(loc) != Color::Black)
        .collect();

    for loc in locations.iter_mut() {
        if loc.version.is_none() {
            let hints = VersionHints {
                author_manuscript: loc
                    .best_url()
                    .and_then(pmcid_from_url)
                    .and_then(|id| author_manuscripts.get(&id).copied()),
                copyright_mark: loc.pdf_url.as_deref().and_then(|u| copyright_marks.get(u).copied()),
            };
            loc.version = derive_version(loc, &hints);
        }
    }

    locations.sort_by(|a, b| {
        location_sort_score(a)
            .total_cmp(&location_sort_score(b))
            .then_with(|| a.best_url().cmp(&b.best_url()))
    });

    let mut reported_noncompliant = Vec::new();
    locations.retain(|loc| {
        let url = loc.best_url().unwrap_or_default();
        let hit = noncompliant_fragments
            .iter()
            .any(|f| !f.is_empty() && url.contains(f.as_str()));
        if hit {
            reported_noncompliant.push(url.to_string());
        }
        !hit
    });

    Ranked {
        locations,
        reported_noncompliant,
    }
}

// ============ Consolidated result ============

/// One location in the published answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationResult {
    pub url: String,
    pub url_for_pdf: Option<String>,
    pub url_for_landing_page: Option<String>,
    pub evidence: String,
    pub license: Option<String>,
    pub version: Option<Version>,
    pub host_type: HostType,
    pub is_best: bool,
}

impl LocationResult {
    fn from_location(loc: &OpenLocation, is_best: bool) -> Self {
        Self {
            url: loc.best_url().unwrap_or_default().to_string(),
            url_for_pdf: loc.pdf_url.clone(),
            url_for_landing_page: loc.metadata_url.clone(),
            evidence: loc.evidence.clone(),
            license: loc.license.clone(),
            version: loc.version,
            host_type: host_type(loc),
            is_best,
        }
    }
}

/// The externally consumed answer for one work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedResult {
    pub doi: String,
    pub doi_url: String,
    pub title: Option<String>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub is_open: bool,
    pub oa_status: String,
    pub best_oa_location: Option<LocationResult>,
    pub oa_locations: Vec<LocationResult>,
    pub journal_is_oa: bool,
    pub journal_issns: Option<String>,
    pub journal_name: Option<String>,
    pub publisher: Option<String>,
    pub published_date: Option<String>,
    pub updated: Option<String>,
    pub x_reported_noncompliant_copies: Vec<String>,
    pub x_error: bool,
}

impl ConsolidatedResult {
    /// The fields whose change means the answer changed.
    fn answer_key(&self) -> AnswerKey<'_> {
        AnswerKey {
            best: self.best_oa_location.as_ref().map(|b| BestKey {
                url: &b.url,
                landing: b.url_for_landing_page.as_deref(),
                pdf: b.url_for_pdf.as_deref(),
                host_type: b.host_type,
                version: b.version,
            }),
            journal_is_oa: self.journal_is_oa,
        }
    }

    pub fn color(&self) -> Color {
        match self.oa_status.as_str() {
            "gold" => Color::Gold,
            "green" => Color::Green,
            _ => Color::Black,
        }
    }
}

#[derive(PartialEq)]
struct BestKey<'a> {
    url: &'a str,
    landing: Option<&'a str>,
    pdf: Option<&'a str>,
    host_type: HostType,
    version: Option<Version>,
}

#[derive(PartialEq)]
struct AnswerKey<'a> {
    best: Option<BestKey<'a>>,
    journal_is_oa: bool,
}

/// True when the best location or the journal status differs.
pub fn has_changed(old: &ConsolidatedResult, new: &ConsolidatedResult) -> bool {
    old.answer_key() != new.answer_key()
}

/// Build the answer. `updated` keeps the previous timestamp when the answer
/// did not change, so re-running on unchanged data is a no-op.
pub fn consolidate(
    biblio: &Biblio,
    ranked: &Ranked,
    journal_is_oa: bool,
    had_error: bool,
    previous: Option<&ConsolidatedResult>,
    now: DateTime<Utc>,
) -> ConsolidatedResult {
    let oa_locations: Vec<LocationResult> = ranked
        .locations
        .iter()
        .enumerate()
        .map(|(i, loc)| LocationResult::from_location(loc, i == 0))
        .collect();
    let best_oa_location = oa_locations.first().cloned();
    let oa_status = match ranked.best().map(oa_color) {
        Some(Color::Gold) => "gold",
        Some(Color::Green) => "green",
        _ => "closed",
    };

    let mut result = ConsolidatedResult {
        doi: biblio.doi.clone(),
        doi_url: biblio.doi_url(),
        title: biblio.title.clone(),
        year: biblio.year,
        genre: biblio.genre.clone(),
        is_open: best_oa_location.is_some(),
        oa_status: oa_status.to_string(),
        best_oa_location,
        oa_locations,
        journal_is_oa,
        journal_issns: if biblio.issns.is_empty() {
            None
        } else {
            Some(biblio.issns.join(","))
        },
        journal_name: biblio.journal.clone(),
        publisher: biblio.publisher.clone(),
        published_date: biblio.published_date.map(|d| d.to_string()),
        updated: None,
        x_reported_noncompliant_copies: ranked.reported_noncompliant.clone(),
        x_error: had_error,
    };

    result.updated = match previous {
        Some(prev) if !has_changed(prev, &result) => prev.updated.clone(),
        _ => Some(now.to_rfc3339_opts(SecondsFormat::Secs, true)),
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(evidence: &str, pdf: Option<&str>, landing: Option<&str>) -> OpenLocation {
        let mut l = OpenLocation::new("10.1/x", evidence);
        l.pdf_url = pdf.map(str::to_string);
        l.metadata_url = landing.map(str::to_string);
        l
    }

    #[test]
    fn arxiv_beats_institutional_repository() {
        let ranked = rank(
            vec![
                loc("oa repository", None, Some("https://university.edu/y")),
                loc("oa repository", None, Some("https://arxiv.org/x")),
            ],
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(ranked.best().unwrap().best_url(), Some("https://arxiv.org/x"));
    }

    #[test]
    fn journal_outranks_repository_which_outranks_unknown() {
        let ranked = rank(
            vec![
                loc("open (via license)", None, Some("https://b.example/1")),
                loc("oa repository (via OAI-PMH doi match)", Some("https://repo.example/1.pdf"), None),
                loc("oa journal (via issn in doaj)", None, Some("https://doi.org/10.1/x")),
            ],
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        let evidence: Vec<&str> = ranked.locations.iter().map(|l| l.evidence.as_str()).collect();
        assert_eq!(
            evidence,
            vec![
                "oa journal (via issn in doaj)",
                "oa repository (via OAI-PMH doi match)",
                "open (via license)"
            ]
        );
    }

    #[test]
    fn dedup_keeps_first_evidence() {
        let ranked = rank(
            vec![
                loc("oa repository (via OAI-PMH doi match)", Some("https://r.example/a.pdf"), None),
                loc("oa repository (via OAI-PMH title and first author match)", Some("https://r.example/a.pdf"), None),
            ],
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(ranked.locations.len(), 1);
        assert_eq!(ranked.locations[0].evidence, "oa repository (via OAI-PMH doi match)");
    }

    #[test]
    fn closed_and_urlless_locations_are_black() {
        assert_eq!(oa_color(&loc("closed", Some("https://x.example/a.pdf"), None)), Color::Black);
        assert_eq!(oa_color(&loc("oa journal", None, None)), Color::Black);
        assert_eq!(oa_color(&loc("hybrid (via free pdf)", Some("https://p.example/a.pdf"), None)), Color::Gold);
        assert_eq!(oa_color(&loc("manual", Some("https://p.example/a.pdf"), None)), Color::Green);
    }

    #[test]
    fn denylist_removes_after_scoring() {
        let ranked = rank(
            vec![
                loc("oa repository", Some("https://shadow.example/a.pdf"), None),
                loc("oa repository", None, Some("https://repo.example/a")),
            ],
            &["shadow.example".to_string()],
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(ranked.locations.len(), 1);
        assert_eq!(ranked.reported_noncompliant, vec!["https://shadow.example/a.pdf"]);
    }

    #[test]
    fn versions() {
        let none = VersionHints::default();
        assert_eq!(derive_version(&loc("closed", None, None), &none), None);
        assert_eq!(
            derive_version(&loc("oa journal", None, Some("https://doi.org/10.1/x")), &none),
            Some(Version::Published)
        );
        assert_eq!(
            derive_version(&loc("oa repository", None, Some("https://arxiv.org/abs/1")), &none),
            Some(Version::Submitted)
        );
        let pmc = loc("oa repository", None, Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC123"));
        assert_eq!(derive_version(&pmc, &none), Some(Version::Published));
        assert_eq!(
            derive_version(
                &pmc,
                &VersionHints {
                    author_manuscript: Some(true),
                    ..Default::default()
                }
            ),
            Some(Version::Accepted)
        );
        let plain = loc("oa repository", Some("https://repo.example/a.pdf"), None);
        assert_eq!(derive_version(&plain, &none), Some(Version::Submitted));
        assert_eq!(
            derive_version(
                &plain,
                &VersionHints {
                    copyright_mark: Some(true),
                    ..Default::default()
                }
            ),
            Some(Version::Published)
        );
    }

    #[test]
    fn copyright_mark_settles_plain_repository_copies() {
        let plain = loc("oa repository", Some("https://repo.example/a.pdf"), None);
        assert!(copyright_mark_matters(&plain, &VersionHints::default()));
        let arxiv = loc("oa repository", None, Some("https://arxiv.org/abs/1"));
        assert!(!copyright_mark_matters(&arxiv, &VersionHints::default()));

        let marks = HashMap::from([("https://repo.example/a.pdf".to_string(), true)]);
        let ranked = rank(vec![plain], &[], &HashMap::new(), &marks);
        assert_eq!(ranked.locations[0].version, Some(Version::Published));
    }

    #[test]
    fn pmcid_parsing() {
        assert_eq!(
            pmcid_from_url("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC4567/pdf").as_deref(),
            Some("PMC4567")
        );
        assert_eq!(pmcid_from_url("https://example.org/pmc/"), None);
    }

    #[test]
    fn empty_ranking_is_closed() {
        let biblio = Biblio {
            doi: "10.1/x".into(),
            ..Default::default()
        };
        let result = consolidate(&biblio, &Ranked::default(), false, false, None, Utc::now());
        assert!(!result.is_open);
        assert!(result.best_oa_location.is_none());
        assert_eq!(result.oa_status, "closed");
    }

    #[test]
    fn updated_is_stable_when_answer_is_unchanged() {
        let biblio = Biblio {
            doi: "10.1/x".into(),
            ..Default::default()
        };
        let ranked = rank(
            vec![loc("oa repository", None, Some("https://repo.example/a"))],
            &[],
            &HashMap::new(),
            &HashMap::new(),
        );
        let first = consolidate(&biblio, &ranked, false, false, None, Utc::now());
        let later = Utc::now() + chrono::Duration::days(3);
        let second = consolidate(&biblio, &ranked, false, false, Some(&first), later);
        assert_eq!(first, second);

        let moved = consolidate(&biblio, &Ranked::default(), false, false, Some(&first), later);
        assert_ne!(moved.updated, first.updated);
    }
}
