//! Error types
//!
//! Only conditions that make the whole run meaningless are errors here.
//! Missing fields are `None`, rule update problems collapse into "no update",
//! and assignment shortfall is reported as data.

use thiserror::Error;

/// Fatal pipeline errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no HTML document could be recovered from the input")]
    NoHtmlFound,
    #[error("no snippet containers found in the document")]
    NoSnippets,
}

impl ParseError {
    /// Stable machine-readable code for hosts
    pub fn code(&self) -> &'static str {
        match self {
            ParseError::NoHtmlFound => "NO_HTML_FOUND",
            ParseError::NoSnippets => "NO_SNIPPETS",
        }
    }
}

/// Failures while fetching or decoding a remote rule set
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("invalid rule set JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistence collaborator failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error for key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage lock poisoned")]
    Poisoned,
}
