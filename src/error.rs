//! Typed errors for the network collaborators.
//!
//! Everything else in the crate uses `anyhow`; these exist because callers
//! branch on the variant (a 503 is retried, a bad resumption token is not).

use thiserror::Error;

/// Failures talking to an OAI-PMH endpoint.
#[derive(Debug, Error)]
pub enum PmhError {
    /// HTTP 503. The harvest loop sleeps and retries the same request.
    #[error("endpoint unavailable (503)")]
    Unavailable,

    #[error("HTTP {0}")]
    Http(u16),

    /// An OAI `<error code="...">` other than `noRecordsMatch`.
    #[error("OAI-PMH protocol error: {code}: {message}")]
    Protocol { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Parse(String),
}

impl PmhError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PmhError::Unavailable)
    }
}

impl From<reqwest::Error> for PmhError {
    fn from(e: reqwest::Error) -> Self {
        PmhError::Transport(e.to_string())
    }
}

impl From<quick_xml::Error> for PmhError {
    fn from(e: quick_xml::Error) -> Self {
        PmhError::Parse(e.to_string())
    }
}

/// Failures fetching or reading a page for full text.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("transport error fetching {url}: {message}")]
    Transport { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("could not read {url}: {message}")]
    Parse { url: String, message: String },
}

impl ScrapeError {
    pub fn transport(url: &str, e: impl std::fmt::Display) -> Self {
        ScrapeError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }

    pub fn parse(url: &str, e: impl std::fmt::Display) -> Self {
        ScrapeError::Parse {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}
