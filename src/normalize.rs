//! Text normalization used for matching harvested records to works.

use std::collections::HashMap;

/// Titles shorter than this (after normalization) are never matched by title.
pub const MIN_TITLE_MATCH_LEN: usize = 20;

/// Normalized titles that appear on thousands of unrelated records.
const COMMON_TITLES: &[&str] = &[
    "abstracts",
    "acknowledgements",
    "acknowledgmenttoreviewers",
    "bookreview",
    "bookreviews",
    "correction",
    "corrigendum",
    "editorial",
    "editorialboard",
    "editorsnote",
    "erratum",
    "foreword",
    "frontmatter",
    "index",
    "introduction",
    "lettertotheeditor",
    "lettertotheeditors",
    "listofcontributors",
    "newsandviews",
    "obituary",
    "preface",
    "referees",
    "reviewers",
    "tableofcontents",
];

/// Drop markup, lowercase, keep only letters and digits.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut in_tag = false;
    for ch in title.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
            _ => {}
        }
    }
    out
}

/// Lowercased letters only; used for author surnames.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphabetic())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

pub fn title_is_too_short(normalized_title: &str) -> bool {
    normalized_title.chars().count() < MIN_TITLE_MATCH_LEN
}

pub fn title_is_too_common(normalized_title: &str) -> bool {
    COMMON_TITLES.contains(&normalized_title)
}

/// Canonical lowercase DOI, or `None` when `raw` does not look like one.
///
/// Accepts bare DOIs, `doi:` prefixes, and `doi.org` URLs.
pub fn clean_doi(raw: &str) -> Option<String> {
    let lower = raw.trim().to_lowercase();
    let start = lower.find("10.")?;
    let prefix = &lower[..start];
    let prefix_ok = prefix.is_empty()
        || prefix.ends_with("doi:")
        || prefix.ends_with("doi: ")
        || prefix.ends_with("doi.org/")
        || prefix.ends_with("dx.doi.org/");
    if !prefix_ok {
        return None;
    }
    let doi = lower[start..].trim_end_matches(['.', ',', ';']).to_string();
    if doi.contains('/') {
        Some(doi)
    } else {
        None
    }
}

/// Largest number of entries contributed by any single repository.
pub fn max_from_one_source<'a>(source_ids: impl IntoIterator<Item = &'a str>) -> usize {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in source_ids {
        *counts.entry(id).or_default() += 1;
    }
    counts.into_values().max().unwrap_or(0)
}
