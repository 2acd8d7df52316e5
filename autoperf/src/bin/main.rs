//! autoperf
//!
//! Runs the benchmarking campaigns described in a JSON config file.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin autoperf -- campaigns.json
//! cargo run --bin autoperf -- campaigns.json --campaign nightly --seed 42
//! ```
//!
//! Re-running with the same config resumes each campaign from its status
//! store.

use autoperf::{cli::Cli, init_logging, run, AutoperfError, AutoperfResult};
use clap::Parser;
use log::{error, info};

fn main() -> AutoperfResult<()> {
    // Initialize logging system
    init_logging()?;

    // Parse command line arguments
    let cli = Cli::parse();

    info!("Starting autoperf with {}", cli.config.display());

    match run(&cli) {
        Ok(summaries) => {
            let succeeded: usize = summaries.iter().map(|s| s.succeeded).sum();
            let experiments: usize = summaries.iter().map(|s| s.experiments).sum();
            info!(
                "All {} campaign(s) completed: {succeeded}/{experiments} experiments succeeded",
                summaries.len()
            );
            Ok(())
        }
        Err(e) => {
            error!("autoperf failed: {e}");

            if let AutoperfError::Configuration(_) = e {
                error!("Please check the config file and that every ssh_key_path exists");
            }

            std::process::exit(1);
        }
    }
}
