//! Command-line interface definitions for the autoperf orchestrator

use std::path::PathBuf;

use clap::Parser;

/// autoperf
///
/// Drives a fleet of publisher/subscriber machines through a sweep of QoS
/// configurations, running RTI perftest on each over SSH.
#[derive(Parser, Debug)]
#[command(
    version,
    about = "autoperf - Distributed perftest campaign orchestrator",
    long_about = "
autoperf runs benchmarking campaigns described in a JSON config file.

For every experiment it checks that each machine answers ping and ssh,
reboots the fleet, assigns the perftest publishers and subscribers to
machines, runs them, and downloads and verifies the CSV output.

Every attempt is recorded in <output_dir>/<campaign_name>/ess.jsonl.gz.
Re-running the same config resumes: succeeded experiments are skipped and
failed ones are retried until max_retries is reached.
"
)]
pub struct Cli {
    /// Path to the campaign configuration file (JSON format)
    ///
    /// The file holds an array of campaign objects, each with its machines and
    /// QoS axes.
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Only run the named campaign (repeatable)
    #[arg(long = "campaign", value_name = "NAME")]
    pub campaigns: Vec<String>,

    /// Seed for random (rcg) experiment generation
    ///
    /// Without it every run draws a fresh sample; already recorded picks are
    /// kept either way.
    #[arg(long, value_name = "N")]
    pub seed: Option<u64>,

    /// Extra ssh/scp `-o` option, e.g. `Port=2222` (repeatable)
    #[arg(long = "ssh-option", value_name = "OPT")]
    pub ssh_options: Vec<String>,
}
