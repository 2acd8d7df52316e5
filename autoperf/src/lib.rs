//! autoperf Library
//!
//! Orchestrates distributed RTI perftest campaigns: a fleet of publisher and
//! subscriber machines is driven through a sweep of QoS configurations over
//! SSH, the per-run CSV artifacts are collected and verified, and every
//! attempt is recorded in an append-only status store so that an interrupted
//! campaign can be resumed.
//!
//! ## Architecture
//!
//! - `config`: JSON campaign definitions and their validation
//! - `transport`: how commands reach a machine (`ssh`, `scp`, `ping`)
//! - `process`: bounded child processes with process-group termination
//! - `machine`: one remote host and the operations run against it
//! - `experiment`: one QoS configuration bound to the fleet
//! - `runner`: the staged state machine for a single attempt
//! - `campaign`: experiment generation, retry/skip policy, circuit breaker
//! - `ess`: the gzip NDJSON experiment status store
//! - `driver`: the outer loop over campaigns
//! - `types`: errors, stages and attempt records
//! - `utils`: hashing, CSV discovery and verification

pub mod campaign;
pub mod cli;
pub mod config;
pub mod driver;
pub mod ess;
pub mod experiment;
pub mod machine;
pub mod process;
pub mod runner;
pub mod transport;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use campaign::{Campaign, CampaignSummary, NextAction};
pub use driver::{run, run_campaign, run_campaigns};
pub use experiment::{Experiment, ExperimentId};
pub use machine::Machine;
pub use runner::ExperimentRunner;
pub use types::{AttemptRecord, AutoperfError, AutoperfResult, ErrorRecord, Stage};

/// Initialize logging for the orchestrator
///
/// Info level by default; `RUST_LOG` overrides it.
pub fn init_logging() -> AutoperfResult<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init()
        .map_err(|e| {
            AutoperfError::Initialization(format!("Failed to initialize logging: {}", e))
        })?;

    Ok(())
}
