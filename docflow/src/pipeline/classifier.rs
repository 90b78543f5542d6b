//! Maps stage failures to transient or permanent.
//!
//! Resolution order: the processor's [`ErrorHint`], then the HTTP status
//! code, then message patterns. Anything still unrecognised is treated as
//! transient with a conservative retry cap.

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::core::ErrorKind;
use crate::errors::{DocflowError, ErrorHint, Result, StageError};

const DEFAULT_TRANSIENT_PATTERNS: &[&str] = &[
    r"(?i)connection (refused|reset|aborted|closed)",
    r"(?i)timed? ?out",
    r"(?i)temporar(il)?y unavailable",
    r"(?i)rate.?limit",
    r"(?i)too many requests",
    r"(?i)broken pipe",
];

const DEFAULT_PERMANENT_PATTERNS: &[&str] = &[
    r"(?i)malformed",
    r"(?i)invalid",
    r"(?i)unauthori[sz]ed",
    r"(?i)forbidden",
    r"(?i)validation",
    r"(?i)unsupported (file|format|media)",
];

fn default_unknown_max_retries() -> u32 {
    1
}

/// Configuration for the error classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Retry cap for failures nothing recognises.
    #[serde(default = "default_unknown_max_retries")]
    pub unknown_max_retries: u32,
    /// Extra message patterns that mark a failure transient.
    #[serde(default)]
    pub transient_patterns: Vec<String>,
    /// Extra message patterns that mark a failure permanent.
    #[serde(default)]
    pub permanent_patterns: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            unknown_max_retries: default_unknown_max_retries(),
            transient_patterns: Vec::new(),
            permanent_patterns: Vec::new(),
        }
    }
}

/// The classifier's verdict on one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Transient or permanent.
    pub kind: ErrorKind,
    /// Retry cap tighter than the policy's, if any.
    pub retry_cap: Option<u32>,
    /// Label for metrics.
    pub label: String,
}

impl Classification {
    fn transient(label: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            retry_cap: None,
            label: label.into(),
        }
    }

    fn permanent(label: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            retry_cap: None,
            label: label.into(),
        }
    }

    /// Returns the effective number of retries under a policy maximum.
    #[must_use]
    pub fn allowed_retries(&self, policy_max: u32) -> u32 {
        match self.kind {
            ErrorKind::Permanent => 0,
            ErrorKind::Transient => self.retry_cap.map_or(policy_max, |cap| cap.min(policy_max)),
        }
    }
}

/// Pure mapping from a [`StageError`] to a [`Classification`].
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    transient: RegexSet,
    permanent: RegexSet,
    unknown_max_retries: u32,
}

impl ErrorClassifier {
    /// Builds a classifier, compiling the default and configured patterns.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let compile = |defaults: &[&str], extra: &[String]| {
            let patterns = defaults
                .iter()
                .map(|p| (*p).to_string())
                .chain(extra.iter().cloned());
            RegexSet::new(patterns)
                .map_err(|e| DocflowError::Config(format!("invalid classifier pattern: {e}")))
        };

        Ok(Self {
            transient: compile(DEFAULT_TRANSIENT_PATTERNS, &config.transient_patterns)?,
            permanent: compile(DEFAULT_PERMANENT_PATTERNS, &config.permanent_patterns)?,
            unknown_max_retries: config.unknown_max_retries,
        })
    }

    /// Classifies a failure.
    #[must_use]
    pub fn classify(&self, error: &StageError) -> Classification {
        match error.hint {
            ErrorHint::ConnectionRefused
            | ErrorHint::ConnectionReset
            | ErrorHint::Timeout
            | ErrorHint::RateLimited
            | ErrorHint::ServiceUnavailable => Classification::transient(error.hint.label()),
            ErrorHint::MalformedInput | ErrorHint::Unauthorized | ErrorHint::Validation => {
                Classification::permanent(error.hint.label())
            }
            ErrorHint::Unknown => self.classify_unknown(error),
        }
    }

    fn classify_unknown(&self, error: &StageError) -> Classification {
        if let Some(code) = error.status_code {
            let label = format!("http_{code}");
            match code {
                408 | 429 | 502 | 503 | 504 => return Classification::transient(label),
                400 | 401 | 403 | 404 | 409 | 413 | 415 | 422 => {
                    return Classification::permanent(label)
                }
                _ => {}
            }
        }

        if self.transient.is_match(&error.message) {
            return Classification::transient("transient_message");
        }
        if self.permanent.is_match(&error.message) {
            return Classification::permanent("permanent_message");
        }

        Classification {
            kind: ErrorKind::Transient,
            retry_cap: Some(self.unknown_max_retries),
            label: error
                .status_code
                .map_or_else(|| "unknown".to_string(), |code| format!("http_{code}")),
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let transient = RegexSet::new(DEFAULT_TRANSIENT_PATTERNS).unwrap_or_else(|_| RegexSet::empty());
        let permanent = RegexSet::new(DEFAULT_PERMANENT_PATTERNS).unwrap_or_else(|_| RegexSet::empty());
        Self {
            transient,
            permanent,
            unknown_max_retries: default_unknown_max_retries(),
        }
    }
}
