//! Type definitions shared across the orchestrator
//!
//! Two kinds of failure exist here. [`AutoperfError`] is for problems that stop
//! the process or a whole campaign (bad config, unreadable status store).
//! [`ErrorRecord`] is for problems inside a single experiment attempt; those
//! are collected, persisted and never propagated as `Err` to the caller.

use std::fmt;

use autoperf_common::QosError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::ExperimentId;

/// Result type for orchestrator operations
pub type AutoperfResult<T> = Result<T, AutoperfError>;

/// Fatal errors for the orchestrator
#[derive(Error, Debug)]
pub enum AutoperfError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Status store error: {0}")]
    Store(String),

    #[error("QoS error: {0}")]
    Qos(#[from] QosError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("General error: {0}")]
    General(#[from] anyhow::Error),
}

/// Steps of one experiment attempt, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Ping,
    SshCheck,
    Restart,
    PostRestartPing,
    PostRestartSsh,
    ScriptGeneration,
    ArtifactCleanup,
    ScriptExecution,
    ResultDownload,
    ResultVerification,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ping => "PING",
            Self::SshCheck => "SSH_CHECK",
            Self::Restart => "RESTART",
            Self::PostRestartPing => "POST_RESTART_PING",
            Self::PostRestartSsh => "POST_RESTART_SSH",
            Self::ScriptGeneration => "SCRIPT_GENERATION",
            Self::ArtifactCleanup => "ARTIFACT_CLEANUP",
            Self::ScriptExecution => "SCRIPT_EXECUTION",
            Self::ResultDownload => "RESULT_DOWNLOAD",
            Self::ResultVerification => "RESULT_VERIFICATION",
            Self::Done => "DONE",
        })
    }
}

/// A structured failure inside one experiment attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Sub-operation attempt number (connectivity retries).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            hostname: None,
            ip: None,
            attempt: None,
            command: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn on_host(mut self, hostname: &str, ip: impl fmt::Display) -> Self {
        self.hostname = Some(hostname.to_string());
        self.ip = Some(ip.to_string());
        self
    }

    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.stage)?;
        if let Some(host) = &self.hostname {
            write!(f, " {host}")?;
            if let Some(ip) = &self.ip {
                write!(f, " ({ip})")?;
            }
        }
        if let Some(attempt) = self.attempt {
            write!(f, " attempt {attempt}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Outcome of one experiment attempt, as stored in the status store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Resolved against the campaign's experiments; not persisted.
    #[serde(skip)]
    pub experiment_id: Option<ExperimentId>,
    pub experiment_name: String,
    pub attempt: u32,
    pub machines: Vec<String>,
    pub errors: Vec<ErrorRecord>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl AttemptRecord {
    #[must_use]
    #[inline]
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_record_display() {
        let err = ErrorRecord::new(Stage::Ping, "100% packet loss")
            .on_host("pi-1", "10.0.0.1")
            .with_attempt(2)
            .with_command("ping -c 1 10.0.0.1");
        assert_eq!(
            err.to_string(),
            "[PING] pi-1 (10.0.0.1) attempt 2: 100% packet loss"
        );
    }

    #[test]
    fn test_error_record_json_omits_empty_fields() {
        let err = ErrorRecord::new(Stage::ResultVerification, "expected 3 CSV files, found 2");
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(
            json,
            r#"{"stage":"RESULT_VERIFICATION","message":"expected 3 CSV files, found 2"}"#
        );
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_stage_display_matches_serde() {
        for stage in [Stage::SshCheck, Stage::PostRestartSsh, Stage::ScriptExecution] {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{stage}\""));
        }
    }
}
