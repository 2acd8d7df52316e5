//! Shared types for the autoperf benchmark orchestrator.
//!
//! This crate holds the pieces that describe *what* is benchmarked, independent
//! of how machines are driven: the QoS value object with its name codec and
//! perftest argument generation, and the role a machine plays in a run.

pub mod constants;
pub mod qos;

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use qos::{PerftestScript, Qos, QosError, Role};

/// Role a machine is configured to play across a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    /// Runs publisher processes only.
    Pub,
    /// Runs subscriber processes only.
    Sub,
    /// Runs both publishers and subscribers.
    All,
}

impl ParticipantType {
    /// Whether publisher scripts may be placed on this machine.
    #[must_use]
    #[inline]
    pub const fn publishes(self) -> bool {
        matches!(self, Self::Pub | Self::All)
    }

    /// Whether subscriber scripts may be placed on this machine.
    #[must_use]
    #[inline]
    pub const fn subscribes(self) -> bool {
        matches!(self, Self::Sub | Self::All)
    }
}

impl fmt::Display for ParticipantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pub => "pub",
            Self::Sub => "sub",
            Self::All => "all",
        })
    }
}

impl FromStr for ParticipantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pub" => Ok(Self::Pub),
            "sub" => Ok(Self::Sub),
            "all" => Ok(Self::All),
            other => Err(format!("unknown participant type: {other}")),
        }
    }
}
