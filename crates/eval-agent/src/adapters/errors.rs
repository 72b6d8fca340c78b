//! Model-boundary error taxonomy with retry classification.
//!
//! | Category    | Retriable |
//! |-------------|-----------|
//! | Transient   | yes       |
//! | RateLimit   | yes, honouring `retry-after` |
//! | Auth        | no        |
//! | BadRequest  | no        |
//! | ParseFailure| no        |
//! | EmptyOutput | no        |
//! | Missing     | no        |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    /// Network failure, request timeout, 5xx or 408.
    Transient,
    /// 429 from the backend.
    RateLimit,
    /// 401 / 403.
    Auth,
    /// Any other 4xx.
    BadRequest,
    /// Response body did not have the expected shape.
    ParseFailure,
    /// Nothing usable left after sanitization.
    EmptyOutput,
    /// Replay file has no candidate for the item.
    Missing,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimit)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Auth => write!(f, "auth"),
            Self::BadRequest => write!(f, "bad_request"),
            Self::ParseFailure => write!(f, "parse_failure"),
            Self::EmptyOutput => write!(f, "empty_output"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    // ── Retriable ─────────────────────────────────────────────────────────
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    // ── Non-retriable ─────────────────────────────────────────────────────
    #[error("Authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Bad request ({status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Unparsable response: {0}")]
    ParseFailure(String),

    #[error("Model returned no SQL")]
    EmptyOutput,

    #[error("No recorded candidate for item '{0}'")]
    Missing(String),
}

impl GenerationError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Transient(_) => RetryCategory::Transient,
            Self::RateLimit { .. } => RetryCategory::RateLimit,
            Self::Auth { .. } => RetryCategory::Auth,
            Self::BadRequest { .. } => RetryCategory::BadRequest,
            Self::ParseFailure(_) => RetryCategory::ParseFailure,
            Self::EmptyOutput => RetryCategory::EmptyOutput,
            Self::Missing(_) => RetryCategory::Missing,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }

    /// Server-requested wait, when the backend sent one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = truncate(body, 300);
        match status {
            429 => Self::RateLimit {
                message,
                retry_after,
            },
            401 | 403 => Self::Auth { status, message },
            408 => Self::Transient(format!("HTTP 408: {message}")),
            s if s >= 500 => Self::Transient(format!("HTTP {s}: {message}")),
            _ => Self::BadRequest { status, message },
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::ParseFailure(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
