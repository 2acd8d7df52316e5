//! QoS configuration for a single perftest run.
//!
//! A [`Qos`] is the unit a campaign sweeps over. Its [`Qos::name`] doubles as
//! the experiment name and the output directory name, so it must parse back
//! into exactly the same value (see the [`FromStr`] impl).

use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{sub_output_file, PUB_OUTPUT_FILE, QOS_NAME_TOKENS};

/// Errors raised while building or parsing a [`Qos`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QosError {
    #[error("a benchmark needs at least one publisher")]
    NoPublishers,

    #[error("a benchmark needs at least one subscriber")]
    NoSubscribers,

    #[error("invalid QoS name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },
}

impl QosError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Which side of the benchmark a perftest process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pub,
    Sub,
}

/// One perftest invocation: the arguments handed to the executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerftestScript {
    pub role: Role,
    /// Index among the scripts of the same role.
    pub index: u32,
    pub args: String,
}

impl PerftestScript {
    /// Name of the CSV this process writes, if any.
    #[must_use]
    pub fn output_file(&self) -> Option<&str> {
        let (_, rest) = self.args.split_once("-outputFile ")?;
        rest.split_whitespace().next()
    }
}

/// Immutable benchmark configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qos {
    pub duration_secs: u64,
    pub datalen_bytes: u64,
    pub pub_count: u32,
    pub sub_count: u32,
    pub use_reliable: bool,
    pub use_multicast: bool,
    pub durability: u8,
    pub latency_count: u64,
}

impl Qos {
    /// Canonical token string, e.g. `600SEC_1000B_5P_1S_REL_MC_0DUR_100LC`.
    #[must_use]
    pub fn name(&self) -> String {
        format!(
            "{}SEC_{}B_{}P_{}S_{}_{}_{}DUR_{}LC",
            self.duration_secs,
            self.datalen_bytes,
            self.pub_count,
            self.sub_count,
            if self.use_reliable { "REL" } else { "BE" },
            if self.use_multicast { "MC" } else { "UC" },
            self.durability,
            self.latency_count,
        )
    }

    /// Number of CSV files a complete run leaves behind: one per subscriber
    /// plus the aggregate publisher file.
    #[must_use]
    pub const fn expected_file_count(&self) -> usize {
        self.sub_count as usize + 1
    }

    /// Builds the perftest arguments for every publisher followed by every
    /// subscriber.
    ///
    /// # Errors
    ///
    /// Fails when either participant count is zero.
    pub fn generate_scripts(&self) -> Result<Vec<PerftestScript>, QosError> {
        if self.pub_count == 0 {
            return Err(QosError::NoPublishers);
        }
        if self.sub_count == 0 {
            return Err(QosError::NoSubscribers);
        }

        let common = self.common_args();
        let mut scripts = Vec::with_capacity((self.pub_count + self.sub_count) as usize);

        for index in 0..self.pub_count {
            let mut args = format!(
                "-pub -pidMultiPubTest {index} -numSubscribers {} -executionTime {} -latencyCount {}",
                self.sub_count, self.duration_secs, self.latency_count
            );
            // multi-publisher runs aggregate into the first process's file
            if index == 0 {
                args.push_str(" -outputFile ");
                args.push_str(PUB_OUTPUT_FILE);
            }
            args.push_str(&common);
            scripts.push(PerftestScript {
                role: Role::Pub,
                index,
                args,
            });
        }

        for index in 0..self.sub_count {
            let args = format!(
                "-sub -sidMultiSubTest {index} -numPublishers {} -outputFile {}{common}",
                self.pub_count,
                sub_output_file(index),
            );
            scripts.push(PerftestScript {
                role: Role::Sub,
                index,
                args,
            });
        }

        Ok(scripts)
    }

    fn common_args(&self) -> String {
        let mut args = format!(
            " -dataLen {} -durability {}",
            self.datalen_bytes, self.durability
        );
        if !self.use_reliable {
            args.push_str(" -bestEffort");
        }
        if self.use_multicast {
            args.push_str(" -multicast");
        }
        args
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

fn numeric<T: FromStr>(name: &str, token: &str, suffix: &str) -> Result<T, QosError> {
    token
        .strip_suffix(suffix)
        .ok_or_else(|| QosError::invalid(name, format!("expected `<n>{suffix}`, got {token:?}")))?
        .parse()
        .map_err(|_| QosError::invalid(name, format!("{token:?} is not a valid number")))
}

fn flag(name: &str, token: &str, on: &str, off: &str) -> Result<bool, QosError> {
    match token {
        t if t == on => Ok(true),
        t if t == off => Ok(false),
        _ => Err(QosError::invalid(
            name,
            format!("expected {on} or {off}, got {token:?}"),
        )),
    }
}

impl FromStr for Qos {
    type Err = QosError;

    /// Parses the output of [`Qos::name`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let tokens: Vec<&str> = name.split('_').collect();
        if tokens.len() != QOS_NAME_TOKENS {
            return Err(QosError::invalid(
                name,
                format!("expected {QOS_NAME_TOKENS} tokens, found {}", tokens.len()),
            ));
        }

        let qos = Self {
            duration_secs: numeric(name, tokens[0], "SEC")?,
            datalen_bytes: numeric(name, tokens[1], "B")?,
            pub_count: numeric(name, tokens[2], "P")?,
            sub_count: numeric(name, tokens[3], "S")?,
            use_reliable: flag(name, tokens[4], "REL", "BE")?,
            use_multicast: flag(name, tokens[5], "MC", "UC")?,
            durability: numeric(name, tokens[6], "DUR")?,
            latency_count: numeric(name, tokens[7], "LC")?,
        };

        if qos.pub_count == 0 {
            return Err(QosError::NoPublishers);
        }
        if qos.sub_count == 0 {
            return Err(QosError::NoSubscribers);
        }
        Ok(qos)
    }
}
