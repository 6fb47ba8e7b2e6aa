//! Error classification for target operations.
//!
//! Every operation failure is mapped onto one of four kinds:
//! - Transient: timeouts, dropped connections, 408/502/503/504
//! - RateLimit: 429, quota or throttling signals
//! - Fatal: auth, permission, not-found, malformed input (never retried)
//! - Unknown: anything else (retried like Transient)

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Classification of an operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimit,
    Fatal,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_retryable(self) -> bool {
        self != Self::Fatal
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a target operation.
///
/// Operations describe what went wrong; the classifier decides what it means.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationError {
    pub message: String,
    /// HTTP-like status code, when the operation has one
    pub status: Option<u16>,
    /// Explicit classification that overrides the heuristics
    pub kind: Option<ErrorKind>,
    /// Server-provided cooldown hint
    pub retry_after: Option<Duration>,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            kind: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Transient)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::RateLimit)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Fatal)
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for OperationError {}

impl From<reqwest::Error> for OperationError {
    fn from(e: reqwest::Error) -> Self {
        let mut error = Self::new(e.to_string());
        if let Some(status) = e.status() {
            error = error.with_status(status.as_u16());
        }
        if e.is_timeout() || e.is_connect() {
            error = error.with_kind(ErrorKind::Transient);
        } else if e.is_builder() || e.is_decode() {
            error = error.with_kind(ErrorKind::Fatal);
        }
        error
    }
}

/// Classify an operation failure.
pub fn classify(error: &OperationError) -> ErrorKind {
    if let Some(kind) = error.kind {
        return kind;
    }

    if let Some(kind) = error.status.and_then(classify_status) {
        return kind;
    }

    let message = error.message.as_str();
    let matches = |re: Option<&Regex>| re.is_some_and(|re| re.is_match(message));
    if matches(rate_limit_pattern()) {
        ErrorKind::RateLimit
    } else if matches(fatal_pattern()) {
        ErrorKind::Fatal
    } else if matches(transient_pattern()) {
        ErrorKind::Transient
    } else {
        ErrorKind::Unknown
    }
}

fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        429 => Some(ErrorKind::RateLimit),
        408 | 502 | 503 | 504 => Some(ErrorKind::Transient),
        400 | 401 | 403 | 404 | 422 => Some(ErrorKind::Fatal),
        _ => None,
    }
}

fn rate_limit_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)rate[ _-]?limit|quota|throttl|too many requests")
            .ok()
    })
    .as_ref()
}

fn transient_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)time[ -]?out|timed out|connection (reset|refused|closed|aborted)|temporarily unavailable|broken pipe|service unavailable|bad gateway",
        )
        .ok()
    })
    .as_ref()
}

fn fatal_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)unauthori[sz]ed|authentication|permission denied|forbidden|not found|invalid api key|malformed|invalid (input|request)",
        )
        .ok()
    })
    .as_ref()
}
