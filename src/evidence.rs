//! Evidence collector.
//!
//! Every strategy looks at one work and either abstains or proposes open
//! locations tagged with an evidence string. Strategies are independent: a
//! failing strategy is recorded in [`Collected::errors`] and the others still
//! run. A manual override, when present, replaces everything they found.
//!
//! Database reads happen up front in [`gather_inputs`], so the strategies
//! themselves are pure functions of the work, its inputs, and the rules.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};

use crate::biblio::Biblio;
use crate::models::{OpenLocation, Page, Version};
use crate::normalize::{max_from_one_source, normalize_name, title_is_too_common, title_is_too_short};
use crate::pages;
use crate::ranker::pmcid_from_url;
use crate::rules::{self, normalize_license, ManualOverride, RuleBook};

/// Title matches from a single endpoint at or above this count are
/// treated as a matching failure.
pub const MAX_TITLE_MATCHES_PER_SOURCE: usize = 10;

/// A stored publisher landing-page scrape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredScrape {
    pub evidence: Option<String>,
    pub pdf_url: Option<String>,
    pub metadata_url: Option<String>,
    pub license: Option<String>,
    pub updated: i64,
}

/// A work as the strategies see it.
#[derive(Debug, Clone)]
pub struct Subject<'a> {
    pub biblio: &'a Biblio,
    pub hybrid: Option<StoredScrape>,
}

/// A repository's own record of a copy of the work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositoryLink {
    pub repository: String,
    pub record_id: String,
    pub release: String,
    pub landing_url: Option<String>,
    pub pdf_url: Option<String>,
    pub version: Option<String>,
}

/// Everything the strategies read from the database for one work.
#[derive(Debug, Clone, Default)]
pub struct EvidenceInputs {
    pub repository_links: Vec<RepositoryLink>,
    pub doi_pages: Vec<Page>,
    pub title_pages: Vec<Page>,
    /// PMCID -> author-manuscript flag.
    pub author_manuscripts: HashMap<String, bool>,
    pub manual_override: Option<ManualOverride>,
    pub noncompliant: Vec<String>,
}

pub async fn gather_inputs(pool: &SqlitePool, biblio: &Biblio) -> Result<EvidenceInputs> {
    let rows = sqlx::query(
        "SELECT repository, record_id, release, landing_url, pdf_url, version \
         FROM repository_links WHERE work_id = ? ORDER BY repository, record_id",
    )
    .bind(&biblio.doi)
    .fetch_all(pool)
    .await?;
    let repository_links: Vec<RepositoryLink> = rows
        .iter()
        .map(|row| RepositoryLink {
            repository: row.get("repository"),
            record_id: row.get("record_id"),
            release: row.get("release"),
            landing_url: row.get("landing_url"),
            pdf_url: row.get("pdf_url"),
            version: row.get("version"),
        })
        .collect();

    let doi_pages = pages::pages_by_doi(pool, &biblio.doi).await?;
    let title_pages = match biblio.normalized_title.as_deref() {
        Some(title) if !title_is_too_short(title) && !title_is_too_common(title) => {
            pages::pages_by_normalized_title(pool, title).await?
        }
        _ => Vec::new(),
    };

    let mut pmcids: HashSet<String> = repository_links
        .iter()
        .filter(|l| is_pmc(&l.repository))
        .map(|l| l.record_id.to_uppercase())
        .collect();
    for page in doi_pages.iter().chain(title_pages.iter()) {
        if let Some(id) = pmcid_from_url(&page.url) {
            pmcids.insert(id);
        }
    }
    let mut author_manuscripts = HashMap::new();
    for pmcid in pmcids {
        let flag: Option<bool> =
            sqlx::query_scalar("SELECT author_manuscript FROM pmc_manuscripts WHERE pmcid = ?")
                .bind(&pmcid)
                .fetch_optional(pool)
                .await?;
        if let Some(flag) = flag {
            author_manuscripts.insert(pmcid, flag);
        }
    }

    Ok(EvidenceInputs {
        repository_links,
        doi_pages,
        title_pages,
        author_manuscripts,
        manual_override: rules::manual_override(pool, &biblio.doi).await?,
        noncompliant: rules::noncompliant_fragments(pool, &biblio.doi).await?,
    })
}

fn is_pmc(repository: &str) -> bool {
    repository.eq_ignore_ascii_case("pmc")
}

/// Shared read-only state for one evaluation.
pub struct Env<'a> {
    pub rules: &'a RuleBook,
    pub now: DateTime<Utc>,
    pub hybrid_stale_days: i64,
}

/// What one strategy proposes. A malformed candidate is described in
/// `skipped` and the rest are kept.
#[derive(Debug, Clone, Default)]
pub struct Found {
    pub locations: Vec<OpenLocation>,
    pub skipped: Vec<String>,
}

impl From<Vec<OpenLocation>> for Found {
    fn from(locations: Vec<OpenLocation>) -> Self {
        Found {
            locations,
            skipped: Vec::new(),
        }
    }
}

/// One way of finding open locations.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn collect(&self, subject: &Subject<'_>, inputs: &EvidenceInputs, env: &Env<'_>) -> Result<Found>;
}

fn doi_location(biblio: &Biblio, evidence: &str, license: Option<String>) -> OpenLocation {
    let mut loc = OpenLocation::new(&biblio.doi, evidence);
    loc.metadata_url = Some(biblio.doi_url());
    loc.license = license;
    loc.version = Some(Version::Published);
    loc
}

fn rule_license(license: &Option<String>) -> Option<String> {
    license
        .as_deref()
        .map(|l| normalize_license(l).unwrap_or_else(|| l.to_string()))
}

/// Journal, publisher, and prefix allow-lists. The first rule that fires wins.
pub struct JournalAllowList;

impl Strategy for JournalAllowList {
    fn name(&self) -> &'static str {
        "journal allow-list"
    }

    fn collect(&self, subject: &Subject<'_>, _: &EvidenceInputs, env: &Env<'_>) -> Result<Found> {
        let b = subject.biblio;
        let year = b.year;

        if let Some(rule) = b.issns.iter().find_map(|issn| env.rules.issn_rule(issn, year)) {
            let loc = doi_location(b, "oa journal (via issn in doaj)", rule_license(&rule.license));
            return Ok(vec![loc].into());
        }
        if b.issns.is_empty() {
            if let Some(rule) = b.journal.as_deref().and_then(|j| env.rules.journal_rule(j, year)) {
                let loc = doi_location(b, "oa journal (via journal title in doaj)", rule_license(&rule.license));
                return Ok(vec![loc].into());
            }
        }
        if let Some(rule) = b.publisher.as_deref().and_then(|p| env.rules.publisher_rule(p, year)) {
            let loc = doi_location(b, "oa journal (via publisher name)", rule_license(&rule.license));
            return Ok(vec![loc].into());
        }
        if let Some(rule) = env.rules.doi_prefix_rule(&b.doi) {
            let loc = doi_location(b, "oa repository (via doi prefix)", rule_license(&rule.license));
            return Ok(vec![loc].into());
        }
        let mut urls: Vec<String> = subject
            .hybrid
            .iter()
            .filter_map(|h| h.metadata_url.clone())
            .collect();
        urls.push(b.doi_url());
        for url in &urls {
            if let Some(rule) = env.rules.url_prefix_rule(url) {
                let loc = doi_location(b, "oa repository (via url prefix)", rule_license(&rule.license));
                return Ok(vec![loc].into());
            }
        }
        Ok(Found::default())
    }
}

/// Open license declared in the metadata, once it is in effect.
pub struct LicenseUrl;

impl Strategy for LicenseUrl {
    fn name(&self) -> &'static str {
        "license url"
    }

    fn collect(&self, subject: &Subject<'_>, _: &EvidenceInputs, env: &Env<'_>) -> Result<Found> {
        let today: NaiveDate = env.now.date_naive();
        let license = subject
            .biblio
            .licenses
            .iter()
            .filter(|claim| claim.start.map(|s| s <= today).unwrap_or(true))
            .find_map(|claim| env.rules.open_license(&claim.url));

        Ok(license
            .map(|license| doi_location(subject.biblio, "open (via license)", Some(license)))
            .into_iter()
            .collect::<Vec<_>>()
            .into())
    }
}

/// Copies a repository reports as live for this work.
pub struct RepositoryLookup;

impl Strategy for RepositoryLookup {
    fn name(&self) -> &'static str {
        "repository lookup"
    }

    fn collect(&self, subject: &Subject<'_>, inputs: &EvidenceInputs, _: &Env<'_>) -> Result<Found> {
        let mut found = Found::default();
        for link in inputs.repository_links.iter().filter(|l| l.release == "live") {
            let mut loc = OpenLocation::new(&subject.biblio.doi, "oa repository (via id lookup)");
            if is_pmc(&link.repository) {
                let pmcid = link.record_id.to_uppercase();
                let landing = format!("https://www.ncbi.nlm.nih.gov/pmc/articles/{}", pmcid);
                loc.pdf_url = Some(link.pdf_url.clone().unwrap_or_else(|| format!("{}/pdf", landing)));
                loc.metadata_url = Some(link.landing_url.clone().unwrap_or(landing));
                loc.version = match link.version.as_deref().and_then(Version::parse) {
                    Some(v) => Some(v),
                    None if inputs.author_manuscripts.get(&pmcid) == Some(&true) => Some(Version::Accepted),
                    None => Some(Version::Published),
                };
            } else {
                if link.landing_url.is_none() && link.pdf_url.is_none() {
                    tracing::warn!(
                        doi = %subject.biblio.doi,
                        repository = %link.repository,
                        record = %link.record_id,
                        "live repository record has no URL, skipping"
                    );
                    found
                        .skipped
                        .push(format!("{} record {} is live but has no URL", link.repository, link.record_id));
                    continue;
                }
                loc.pdf_url = link.pdf_url.clone();
                loc.metadata_url = link.landing_url.clone();
                loc.version = link.version.as_deref().and_then(Version::parse);
            }
            found.locations.push(loc);
        }
        Ok(found)
    }
}

/// The stored publisher landing-page scrape, while fresh.
pub struct HybridScrape;

impl Strategy for HybridScrape {
    fn name(&self) -> &'static str {
        "hybrid scrape"
    }

    fn collect(&self, subject: &Subject<'_>, _: &EvidenceInputs, env: &Env<'_>) -> Result<Found> {
        let Some(scrape) = subject.hybrid.as_ref() else {
            return Ok(Found::default());
        };
        let Some(evidence) = scrape.evidence.as_deref().filter(|e| *e != "closed") else {
            return Ok(Found::default());
        };
        let age_days = (env.now.timestamp() - scrape.updated) / 86_400;
        if age_days > env.hybrid_stale_days {
            return Ok(Found::default());
        }

        let mut loc = OpenLocation::new(&subject.biblio.doi, evidence);
        loc.pdf_url = scrape.pdf_url.clone();
        loc.metadata_url = scrape
            .metadata_url
            .clone()
            .or_else(|| Some(subject.biblio.doi_url()));
        loc.license = scrape.license.clone();
        loc.version = Some(Version::Published);
        loc.updated_at = scrape.updated;
        Ok(vec![loc].into())
    }
}

/// Harvested repository pages matched by DOI, then by title and author.
pub struct HarvestedPages;

impl HarvestedPages {
    fn author_match(subject: &Subject<'_>, page: &Page) -> Option<&'static str> {
        let page_authors = page
            .authors
            .iter()
            .map(|a| normalize_name(a))
            .collect::<Vec<_>>()
            .join(" ");
        if page_authors.is_empty() {
            return None;
        }
        let matches = |name: Option<&str>| {
            let name = normalize_name(name.unwrap_or_default());
            !name.is_empty() && page_authors.contains(&name)
        };
        if matches(subject.biblio.first_author()) {
            Some("title and first author")
        } else if matches(subject.biblio.last_author()) {
            Some("title and last author")
        } else {
            None
        }
    }

    fn location(subject: &Subject<'_>, page: &Page, match_type: &str) -> OpenLocation {
        let mut loc = OpenLocation::new(
            &subject.biblio.doi,
            format!("oa repository (via OAI-PMH {} match)", match_type),
        );
        loc.pdf_url = page.scrape_pdf_url.clone();
        loc.metadata_url = page.scrape_metadata_url.clone();
        loc.license = page.scrape_license.clone();
        loc.version = page.scrape_version;
        loc.endpoint_id = Some(page.endpoint_id.clone());
        loc.updated_at = page.scrape_updated.unwrap_or_default();
        loc
    }
}

impl Strategy for HarvestedPages {
    fn name(&self) -> &'static str {
        "harvested pages"
    }

    fn collect(&self, subject: &Subject<'_>, inputs: &EvidenceInputs, _: &Env<'_>) -> Result<Found> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        for page in &inputs.doi_pages {
            seen.insert(page.id.as_str());
            if page.is_open() {
                found.push(Self::location(subject, page, "doi"));
            }
        }

        let title_ok = subject
            .biblio
            .normalized_title
            .as_deref()
            .map(|t| !title_is_too_short(t) && !title_is_too_common(t))
            .unwrap_or(false);
        if !title_ok {
            return Ok(found.into());
        }

        let title_matches: Vec<(&Page, &'static str)> = inputs
            .title_pages
            .iter()
            .filter(|p| p.normalized_title == subject.biblio.normalized_title)
            .filter(|p| !seen.contains(p.id.as_str()))
            .filter_map(|p| Self::author_match(subject, p).map(|m| (p, m)))
            .collect();

        let per_source = max_from_one_source(title_matches.iter().map(|(p, _)| p.endpoint_id.as_str()));
        if per_source >= MAX_TITLE_MATCHES_PER_SOURCE {
            tracing::info!(
                doi = %subject.biblio.doi,
                matches = per_source,
                "too many title matches from one repository, ignoring title matches"
            );
            return Ok(found.into());
        }

        found.extend(
            title_matches
                .into_iter()
                .filter(|(p, _)| p.is_open())
                .map(|(p, m)| Self::location(subject, p, m)),
        );
        Ok(found.into())
    }
}

/// The strategies in the order their output is considered.
pub fn default_strategies() -> Vec<Box<dyn Strategy>> {
    vec![
        Box::new(JournalAllowList),
        Box::new(LicenseUrl),
        Box::new(RepositoryLookup),
        Box::new(HybridScrape),
        Box::new(HarvestedPages),
    ]
}

#[derive(Debug, Clone, Default)]
pub struct Collected {
    pub locations: Vec<OpenLocation>,
    pub journal_is_oa: bool,
    /// One entry per failed strategy or skipped candidate.
    pub errors: Vec<String>,
    pub overridden: bool,
}

/// Run every strategy, then apply the manual override.
pub fn collect(
    strategies: &[Box<dyn Strategy>],
    subject: &Subject<'_>,
    inputs: &EvidenceInputs,
    env: &Env<'_>,
) -> Collected {
    let mut collected = Collected::default();

    for strategy in strategies {
        match strategy.collect(subject, inputs, env) {
            Ok(found) => {
                tracing::debug!(
                    doi = %subject.biblio.doi,
                    strategy = strategy.name(),
                    found = found.locations.len(),
                    skipped = found.skipped.len(),
                    "strategy done"
                );
                collected.locations.extend(found.locations);
                collected
                    .errors
                    .extend(found.skipped.into_iter().map(|e| format!("{}: {}", strategy.name(), e)));
            }
            Err(e) => {
                tracing::warn!(doi = %subject.biblio.doi, strategy = strategy.name(), error = %e, "strategy failed");
                collected.errors.push(format!("{}: {}", strategy.name(), e));
            }
        }
    }

    collected.journal_is_oa = collected
        .locations
        .iter()
        .any(|l| l.evidence.starts_with("oa journal"));

    if let Some(o) = inputs.manual_override.as_ref() {
        collected.overridden = true;
        collected.locations = if o.forces_closed() {
            Vec::new()
        } else {
            let mut loc = OpenLocation::new(&subject.biblio.doi, "manual");
            loc.pdf_url = o.pdf_url.clone();
            loc.metadata_url = o.metadata_url.clone();
            loc.license = o.license.clone();
            loc.version = o.version();
            loc.host_type = o.host_type();
            vec![loc]
        };
    }

    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::biblio::LicenseClaim;
    use crate::rules::{JournalRule, JournalRuleKind};

    fn biblio() -> Biblio {
        Biblio {
            doi: "10.1234/abc".into(),
            title: Some("Deep sequencing of the mouse transcriptome".into()),
            normalized_title: Some("deepsequencingofthemousetranscriptome".into()),
            issns: vec!["1111-2222".into()],
            year: Some(2015),
            authors: vec!["Smith".into(), "Okafor".into()],
            ..Default::default()
        }
    }

    fn env(rules: &RuleBook) -> Env<'_> {
        Env {
            rules,
            now: Utc::now(),
            hybrid_stale_days: 180,
        }
    }

    fn page(id: &str, endpoint: &str, authors: &[&str], open: bool) -> Page {
        Page {
            id: id.into(),
            endpoint_id: endpoint.into(),
            url: format!("https://repo.example/{}", id),
            normalized_title: Some("deepsequencingofthemousetranscriptome".into()),
            authors: authors.iter().map(|a| a.to_string()).collect(),
            scrape_pdf_url: open.then(|| format!("https://repo.example/{}.pdf", id)),
            ..Default::default()
        }
    }

    #[test]
    fn issn_allow_list_gives_oa_journal() {
        let mut rules = RuleBook::default();
        rules.add_journal_rule(
            JournalRuleKind::Issn,
            "1111-2222",
            JournalRule {
                license: Some("CC BY".into()),
                from_year: None,
            },
        );
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let out = collect(&default_strategies(), &subject, &EvidenceInputs::default(), &env(&rules));
        assert!(out.journal_is_oa);
        assert_eq!(out.locations[0].evidence, "oa journal (via issn in doaj)");
        assert_eq!(out.locations[0].license.as_deref(), Some("cc-by"));
        assert_eq!(out.locations[0].metadata_url.as_deref(), Some("https://doi.org/10.1234/abc"));
    }

    #[test]
    fn future_license_is_ignored() {
        let mut rules = RuleBook::default();
        rules.add_license_pattern("creativecommons.org/licenses/".into(), None);
        let mut b = biblio();
        b.licenses = vec![LicenseClaim {
            url: "https://creativecommons.org/licenses/by/4.0/".into(),
            start: NaiveDate::from_ymd_opt(2999, 1, 1),
        }];
        let subject = Subject { biblio: &b, hybrid: None };
        assert!(LicenseUrl
            .collect(&subject, &EvidenceInputs::default(), &env(&rules))
            .unwrap()
            .locations
            .is_empty());

        b.licenses[0].start = NaiveDate::from_ymd_opt(2015, 1, 1);
        let subject = Subject { biblio: &b, hybrid: None };
        let found = LicenseUrl
            .collect(&subject, &EvidenceInputs::default(), &env(&rules))
            .unwrap()
            .locations;
        assert_eq!(found[0].evidence, "open (via license)");
    }

    #[test]
    fn title_match_needs_an_author() {
        let rules = RuleBook::default();
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let inputs = EvidenceInputs {
            title_pages: vec![
                page("p1", "e1", &["Smith, J."], true),
                page("p2", "e2", &["Nobody"], true),
                page("p3", "e3", &["Okafor, C"], true),
            ],
            ..Default::default()
        };
        let found = HarvestedPages.collect(&subject, &inputs, &env(&rules)).unwrap().locations;
        let evidence: Vec<&str> = found.iter().map(|l| l.evidence.as_str()).collect();
        assert_eq!(
            evidence,
            vec![
                "oa repository (via OAI-PMH title and first author match)",
                "oa repository (via OAI-PMH title and last author match)"
            ]
        );
    }

    #[test]
    fn flood_from_one_repository_discards_title_matches() {
        let rules = RuleBook::default();
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let mut doi_page = page("d1", "e9", &[], true);
        doi_page.normalized_title = None;
        let inputs = EvidenceInputs {
            doi_pages: vec![doi_page],
            title_pages: (0..10).map(|i| page(&format!("t{}", i), "e1", &["Smith"], true)).collect(),
            ..Default::default()
        };
        let found = HarvestedPages.collect(&subject, &inputs, &env(&rules)).unwrap().locations;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].evidence, "oa repository (via OAI-PMH doi match)");
    }

    #[test]
    fn malformed_repository_link_is_skipped_not_fatal() {
        let rules = RuleBook::default();
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let inputs = EvidenceInputs {
            repository_links: vec![
                RepositoryLink {
                    repository: "pmc".into(),
                    record_id: "PMC777".into(),
                    release: "live".into(),
                    ..Default::default()
                },
                RepositoryLink {
                    repository: "zenodo".into(),
                    record_id: "42".into(),
                    release: "live".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let found = RepositoryLookup.collect(&subject, &inputs, &env(&rules)).unwrap();
        assert_eq!(found.locations.len(), 1);
        assert_eq!(
            found.locations[0].metadata_url.as_deref(),
            Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC777")
        );
        assert_eq!(found.skipped, vec!["zenodo record 42 is live but has no URL"]);

        let out = collect(&default_strategies(), &subject, &inputs, &env(&rules));
        assert_eq!(out.locations.len(), 1);
        assert_eq!(out.errors, vec!["repository lookup: zenodo record 42 is live but has no URL"]);
    }

    #[test]
    fn skipped_link_does_not_block_other_strategies() {
        let mut rules = RuleBook::default();
        rules.add_journal_rule(JournalRuleKind::Issn, "1111-2222", JournalRule::default());
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let inputs = EvidenceInputs {
            repository_links: vec![RepositoryLink {
                repository: "zenodo".into(),
                record_id: "42".into(),
                release: "live".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let out = collect(&default_strategies(), &subject, &inputs, &env(&rules));
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].starts_with("repository lookup"));
        assert_eq!(out.locations.len(), 1);
    }

    #[test]
    fn manual_override_replaces_everything() {
        let mut rules = RuleBook::default();
        rules.add_journal_rule(JournalRuleKind::Issn, "1111-2222", JournalRule::default());
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let inputs = EvidenceInputs {
            manual_override: Some(ManualOverride {
                work_id: b.doi.clone(),
                metadata_url: Some("https://mirror.example/abc".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let out = collect(&default_strategies(), &subject, &inputs, &env(&rules));
        assert!(out.overridden);
        assert_eq!(out.locations.len(), 1);
        assert_eq!(out.locations[0].evidence, "manual");
    }

    #[test]
    fn stale_hybrid_scrape_abstains() {
        let rules = RuleBook::default();
        let b = biblio();
        let now = Utc::now();
        let scrape = StoredScrape {
            evidence: Some("hybrid (via free pdf)".into()),
            pdf_url: Some("https://pub.example/a.pdf".into()),
            updated: now.timestamp() - 400 * 86_400,
            ..Default::default()
        };
        let subject = Subject {
            biblio: &b,
            hybrid: Some(scrape.clone()),
        };
        assert!(HybridScrape
            .collect(&subject, &EvidenceInputs::default(), &env(&rules))
            .unwrap()
            .locations
            .is_empty());

        let fresh = Subject {
            biblio: &b,
            hybrid: Some(StoredScrape {
                updated: now.timestamp(),
                ..scrape
            }),
        };
        let found = HybridScrape
            .collect(&fresh, &EvidenceInputs::default(), &env(&rules))
            .unwrap()
            .locations;
        assert_eq!(found[0].version, Some(Version::Published));
    }

    #[test]
    fn pmc_link_builds_urls() {
        let rules = RuleBook::default();
        let b = biblio();
        let subject = Subject { biblio: &b, hybrid: None };
        let inputs = EvidenceInputs {
            repository_links: vec![RepositoryLink {
                repository: "pmc".into(),
                record_id: "pmc777".into(),
                release: "live".into(),
                ..Default::default()
            }],
            author_manuscripts: HashMap::from([("PMC777".to_string(), true)]),
            ..Default::default()
        };
        let found = RepositoryLookup.collect(&subject, &inputs, &env(&rules)).unwrap().locations;
        assert_eq!(
            found[0].pdf_url.as_deref(),
            Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC777/pdf")
        );
        assert_eq!(found[0].version, Some(Version::Accepted));
    }
}
