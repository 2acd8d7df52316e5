//! The outer loop: campaigns, experiments, attempts.

use log::{debug, error, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    campaign::{Campaign, CampaignSummary, NextAction},
    cli::Cli,
    config::{self, CampaignConfig},
    runner::ExperimentRunner,
    transport::{OpenSsh, Transport},
    types::{AutoperfError, AutoperfResult},
};

/// Runs every pending attempt of one campaign, persisting each before the
/// next decision.
pub fn run_campaign<R: Rng + ?Sized>(
    campaign: &mut Campaign,
    transport: &dyn Transport,
    rng: &mut R,
) -> AutoperfResult<CampaignSummary> {
    campaign.load_results()?;
    let total = campaign.generate_experiments(rng)?.len();
    let mut new_attempts = 0;
    let mut halted = false;

    for i in 0..total {
        if campaign.should_abort() {
            error!(
                "[{}] last {} experiments failed every attempt, halting",
                campaign.name(),
                campaign.config().max_failures
            );
            halted = true;
            break;
        }

        loop {
            let experiment = &campaign.experiments()[i];
            let attempt = match campaign.next_action(experiment) {
                NextAction::Run { attempt } => attempt,
                NextAction::SkipSucceeded => {
                    debug!("[{}] already succeeded", experiment.name());
                    break;
                }
                NextAction::SkipExhausted => {
                    warn!(
                        "[{}] gave up after {} attempt(s)",
                        experiment.name(),
                        campaign.attempt_count(experiment.id())
                    );
                    break;
                }
            };

            info!(
                "[{}] experiment {}/{}: {} (attempt {attempt}/{})",
                campaign.name(),
                i + 1,
                total,
                experiment.name(),
                campaign.config().max_retries
            );
            let mut runner = ExperimentRunner::new(
                experiment.clone(),
                attempt,
                campaign.runner_settings().clone(),
            )
            .skip_restart(campaign.config().skip_restart);
            runner.run(transport);
            campaign.record(runner.record())?;
            new_attempts += 1;
        }
    }

    let summary = CampaignSummary {
        new_attempts,
        halted,
        ..campaign.summary()
    };
    info!("[{}] {summary}", campaign.name());
    for (ip, count) in campaign.failure_ip_counts() {
        info!("[{}]   {ip}: {count} error(s)", campaign.name());
    }
    Ok(summary)
}

/// Runs campaigns in order. A campaign that errors or trips its circuit
/// breaker does not stop the ones after it, but makes the whole run fail.
pub fn run_campaigns<R: Rng + ?Sized>(
    configs: Vec<CampaignConfig>,
    transport: &dyn Transport,
    rng: &mut R,
) -> AutoperfResult<Vec<CampaignSummary>> {
    let mut summaries = Vec::with_capacity(configs.len());
    let mut failed = Vec::new();

    for cfg in configs {
        let name = cfg.campaign_name.clone();
        info!("Starting campaign {name}");
        let mut campaign = Campaign::new(cfg);
        match run_campaign(&mut campaign, transport, rng) {
            Ok(summary) => {
                if summary.halted {
                    failed.push(name);
                }
                summaries.push(summary);
            }
            Err(e) => {
                error!("Campaign {name} failed: {e}");
                failed.push(name);
            }
        }
    }

    if failed.is_empty() {
        Ok(summaries)
    } else {
        Err(AutoperfError::General(anyhow::anyhow!(
            "{} campaign(s) did not complete: {}",
            failed.len(),
            failed.join(", ")
        )))
    }
}

/// Entry point behind the binary.
pub fn run(cli: &Cli) -> AutoperfResult<Vec<CampaignSummary>> {
    let mut configs = config::load_from_file(&cli.config)
        .map_err(|e| AutoperfError::Configuration(format!("{e:#}")))?;

    if !cli.campaigns.is_empty() {
        if let Some(missing) = cli
            .campaigns
            .iter()
            .find(|n| !configs.iter().any(|c| &c.campaign_name == *n))
        {
            return Err(AutoperfError::Configuration(format!(
                "no campaign named {missing} in {}",
                cli.config.display()
            )));
        }
        configs.retain(|c| cli.campaigns.contains(&c.campaign_name));
    }

    info!(
        "Loaded {} campaign(s) from {}",
        configs.len(),
        cli.config.display()
    );

    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let transport = OpenSsh {
        extra_options: cli.ssh_options.clone(),
    };
    run_campaigns(configs, &transport, &mut rng)
}
