//! Stage, document and error-kind status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The persisted status of one stage execution row.
///
/// Allowed transitions:
/// - `pending -> running` (start, increments the attempt count)
/// - `running -> completed | failed`
/// - `running -> pending` (a retry has been scheduled, or a stale row was reclaimed)
/// - `pending -> skipped`
/// - `pending | running -> failed` (cancellation)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started, or is waiting for a scheduled retry.
    #[default]
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage completed successfully.
    Completed,
    /// Stage failed terminally.
    Failed,
    /// Stage was skipped because its preconditions are permanently unmet.
    Skipped,
}

impl StageStatus {
    /// Returns the persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Returns true if the status will not change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Returns true if later stages may proceed past this one.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown stage status '{other}'")),
        }
    }
}

/// Overall status of a document, derived from its stage rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// At least one required stage is still open.
    InProgress,
    /// Every required stage is completed or skipped.
    Completed,
    /// At least one stage reached a terminal failure.
    Failed,
}

impl DocumentStatus {
    /// Derives the document status from the statuses of its stages.
    #[must_use]
    pub fn derive<'a>(statuses: impl IntoIterator<Item = &'a StageStatus>) -> Self {
        let mut all_done = true;
        for status in statuses {
            if *status == StageStatus::Failed {
                return Self::Failed;
            }
            all_done &= status.is_done();
        }
        if all_done {
            Self::Completed
        } else {
            Self::InProgress
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Expected to resolve itself given time.
    Transient,
    /// Will recur on identical input.
    Permanent,
}

impl ErrorKind {
    /// Returns the persisted string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "permanent" => Ok(Self::Permanent),
            other => Err(format!("unknown error kind '{other}'")),
        }
    }
}
