//! Experiment Runner Module
//!
//! Drives one attempt of one experiment through its stages:
//!
//! `PING → SSH_CHECK → RESTART → POST_RESTART_PING → POST_RESTART_SSH →
//! SCRIPT_GENERATION → ARTIFACT_CLEANUP → SCRIPT_EXECUTION → RESULT_DOWNLOAD →
//! RESULT_VERIFICATION → DONE`
//!
//! The first failing stage records its errors and ends the attempt. Nothing
//! here returns `Err`: the outcome of an attempt is the [`AttemptRecord`] it
//! produces.

use std::{path::PathBuf, thread, time::Duration};

use autoperf_common::Role;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};

use crate::{
    config::RunnerSettings,
    experiment::Experiment,
    machine::{ConnectionCheck, Machine},
    transport::Transport,
    types::{AttemptRecord, ErrorRecord, Stage},
    utils::{list_csv_files, remove_csv_files, stable_hash, verify_csv},
};

/// Machine slot for publisher script `index` among `machines` candidates.
#[must_use]
pub const fn allocate_round_robin(index: usize, machines: usize) -> usize {
    index % machines
}

/// Machine slot for subscriber script `index`: round robin from the far end,
/// so a host running publishers starts with fewer subscribers.
#[must_use]
pub const fn allocate_mirrored(index: usize, machines: usize) -> usize {
    machines - 1 - index % machines
}

/// Runs `f` for every machine on its own scoped thread and returns the
/// results in machine order.
fn for_each_machine<T, F>(machines: &[Machine], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Machine) -> T + Sync,
{
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = machines.iter().map(|m| s.spawn(move || f(m))).collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    })
}

#[derive(Debug)]
pub struct ExperimentRunner {
    experiment: Experiment,
    attempt: u32,
    id: String,
    settings: RunnerSettings,
    skip_restart: bool,
    stage: Stage,
    errors: Vec<ErrorRecord>,
    data_files: Vec<PathBuf>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl ExperimentRunner {
    /// `attempt` is 1-based.
    #[must_use]
    pub fn new(experiment: Experiment, attempt: u32, settings: RunnerSettings) -> Self {
        let id = stable_hash(&[
            experiment.id().as_str().as_bytes(),
            attempt.to_le_bytes().as_slice(),
        ]);
        Self {
            experiment,
            attempt,
            id,
            settings,
            skip_restart: false,
            stage: Stage::Ping,
            errors: Vec::new(),
            data_files: Vec::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Leave the hosts running instead of rebooting before the attempt.
    #[must_use]
    pub fn skip_restart(mut self, skip: bool) -> Self {
        self.skip_restart = skip;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Last stage entered; `Done` after a successful attempt.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    #[must_use]
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    #[must_use]
    pub fn data_files(&self) -> &[PathBuf] {
        &self.data_files
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.end_time.is_some() && self.errors.is_empty()
    }

    /// Runs every stage in order and returns whether the attempt succeeded.
    pub fn run(&mut self, transport: &dyn Transport) -> bool {
        self.start_time = Some(Utc::now());
        info!(
            "[{}] attempt {} starting ({} machines)",
            self.experiment.name(),
            self.attempt,
            self.experiment.machines.len()
        );

        let ok = self.run_stages(transport);
        if ok {
            self.stage = Stage::Done;
            info!("[{}] attempt {} succeeded", self.experiment.name(), self.attempt);
        } else {
            error!(
                "[{}] attempt {} failed at {} with {} error(s)",
                self.experiment.name(),
                self.attempt,
                self.stage,
                self.errors.len()
            );
            for err in &self.errors {
                error!("  {err}");
            }
        }
        self.end_time = Some(Utc::now());
        ok
    }

    fn run_stages(&mut self, transport: &dyn Transport) -> bool {
        let settings = self.settings.clone();

        if !self.preflight(transport, Stage::Ping, Stage::SshCheck, settings.preflight_timeout()) {
            return false;
        }

        if self.skip_restart {
            debug!("restart skipped");
        } else {
            if !self.restart(transport) {
                return false;
            }
            thread::sleep(settings.post_restart_grace());
            if !self.preflight(
                transport,
                Stage::PostRestartPing,
                Stage::PostRestartSsh,
                settings.post_restart_timeout(),
            ) {
                return false;
            }
        }

        self.generate_scripts()
            && self.cleanup_artifacts(transport)
            && self.execute(transport)
            && self.download(transport)
            && self.verify()
    }

    fn fail(&mut self, errors: impl IntoIterator<Item = ErrorRecord>) -> bool {
        let before = self.errors.len();
        self.errors.extend(errors);
        self.errors.len() == before
    }

    /// Pings every machine, then ssh-checks every machine. The ssh pass only
    /// starts once all pings have succeeded.
    fn preflight(
        &mut self,
        transport: &dyn Transport,
        ping_stage: Stage,
        ssh_stage: Stage,
        timeout: Duration,
    ) -> bool {
        debug!("{ping_stage}/{ssh_stage} with {}s per attempt", timeout.as_secs());
        let ping_attempts = self.settings.ping_attempts;
        let ssh_attempts = self.settings.ssh_attempts;

        self.check_all(transport, ConnectionCheck::Ping, ping_attempts, timeout, ping_stage)
            && self.check_all(transport, ConnectionCheck::Ssh, ssh_attempts, timeout, ssh_stage)
    }

    fn check_all(
        &mut self,
        transport: &dyn Transport,
        check: ConnectionCheck,
        attempts: u32,
        timeout: Duration,
        stage: Stage,
    ) -> bool {
        self.stage = stage;
        let results = for_each_machine(&self.experiment.machines, |m| {
            m.check_connection(transport, check, attempts, timeout, stage)
        });
        self.fail(results.into_iter().filter_map(Result::err).flatten())
    }

    fn restart(&mut self, transport: &dyn Transport) -> bool {
        self.stage = Stage::Restart;
        let timeout = self.settings.restart_timeout();
        let results = for_each_machine(&self.experiment.machines, |m| m.restart(transport, timeout));
        self.fail(results.into_iter().filter_map(Result::err))
    }

    /// Assigns the QoS's perftest scripts to machines and builds each
    /// machine's command.
    fn generate_scripts(&mut self) -> bool {
        self.stage = Stage::ScriptGeneration;

        let scripts = match self.experiment.qos.generate_scripts() {
            Ok(scripts) => scripts,
            Err(e) => return self.fail([ErrorRecord::new(Stage::ScriptGeneration, e.to_string())]),
        };

        let machines = &mut self.experiment.machines;
        for m in machines.iter_mut() {
            m.reset();
        }

        let publishers: Vec<usize> = (0..machines.len())
            .filter(|&i| machines[i].participant_type.publishes())
            .collect();
        let subscribers: Vec<usize> = (0..machines.len())
            .filter(|&i| machines[i].participant_type.subscribes())
            .collect();
        if publishers.is_empty() || subscribers.is_empty() {
            return self.fail([ErrorRecord::new(
                Stage::ScriptGeneration,
                format!(
                    "{} publisher-capable and {} subscriber-capable machines",
                    publishers.len(),
                    subscribers.len()
                ),
            )]);
        }

        for script in scripts {
            let index = script.index as usize;
            let slot = match script.role {
                Role::Pub => publishers[allocate_round_robin(index, publishers.len())],
                Role::Sub => subscribers[allocate_mirrored(index, subscribers.len())],
            };
            machines[slot].add_script(script.args);
        }

        for m in machines.iter_mut() {
            let command = m.generate_command();
            if !command.is_empty() {
                debug!("{}: {} script(s)", m.hostname, m.scripts().len());
            }
        }
        true
    }

    fn cleanup_artifacts(&mut self, transport: &dyn Transport) -> bool {
        self.stage = Stage::ArtifactCleanup;
        let timeout = self.settings.command_timeout();
        let results = for_each_machine(&self.experiment.machines, |m| {
            m.remove_artifact_files(transport, timeout)
        });
        self.fail(results.into_iter().filter_map(Result::err))
    }

    /// Starts every machine's command, then joins them in machine order. The
    /// first process gets the whole run budget; the rest only the join buffer,
    /// since they started at the same time.
    fn execute(&mut self, transport: &dyn Transport) -> bool {
        self.stage = Stage::ScriptExecution;
        let first_limit = self.experiment.timeout(self.settings.run_timeout_buffer());
        let join_limit = self.settings.join_buffer();
        let connect_timeout = self.settings.preflight_timeout();

        let mut errors = Vec::new();
        let mut running = Vec::new();
        for (i, m) in self.experiment.machines.iter().enumerate() {
            if m.command().is_empty() {
                continue;
            }
            match m.start_run(transport, connect_timeout) {
                Ok(process) => running.push((i, process)),
                Err(e) => errors.push(e),
            }
        }
        if !errors.is_empty() {
            // dropping `running` kills what did start
            return self.fail(errors);
        }

        for (n, (i, process)) in running.into_iter().enumerate() {
            let limit = if n == 0 { first_limit } else { join_limit };
            let machine = &mut self.experiment.machines[i];
            if let Err(e) = machine.finish_run(process, limit) {
                errors.push(e);
            }
            for line in machine.run_output() {
                debug!("{}: {line}", machine.hostname);
            }
        }
        self.fail(errors)
    }

    fn download(&mut self, transport: &dyn Transport) -> bool {
        self.stage = Stage::ResultDownload;

        let output_dir = match self.experiment.output_dirpath() {
            Ok(dir) => dir,
            Err(e) => {
                return self.fail([ErrorRecord::new(
                    Stage::ResultDownload,
                    format!("cannot create {}: {e}", self.experiment.output_path().display()),
                )])
            }
        };
        match remove_csv_files(&output_dir) {
            Ok(0) => {}
            Ok(n) => warn!("removed {n} stale CSV file(s) from {}", output_dir.display()),
            Err(e) => {
                return self.fail([ErrorRecord::new(
                    Stage::ResultDownload,
                    format!("cannot clear {}: {e}", output_dir.display()),
                )])
            }
        }

        let timeout = self.settings.transfer_timeout();
        let results = for_each_machine(&self.experiment.machines, |m| {
            m.download_results(transport, &output_dir, timeout)
        });

        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(files) => self.data_files.extend(files),
                Err(e) => errors.push(e),
            }
        }
        self.fail(errors)
    }

    fn verify(&mut self) -> bool {
        self.stage = Stage::ResultVerification;
        let dir = self.experiment.output_path();
        let expected = self.experiment.qos.expected_file_count();

        let files = match list_csv_files(&dir) {
            Ok(files) => files,
            Err(e) => {
                return self.fail([ErrorRecord::new(
                    Stage::ResultVerification,
                    format!("cannot list {}: {e}", dir.display()),
                )])
            }
        };

        let mut errors = Vec::new();
        if files.len() != expected {
            errors.push(ErrorRecord::new(
                Stage::ResultVerification,
                format!(
                    "expected {expected} CSV files in {}, found {}",
                    dir.display(),
                    files.len()
                ),
            ));
        }
        for file in &files {
            if let Err(message) = verify_csv(file, self.settings.verify_rows) {
                errors.push(ErrorRecord::new(Stage::ResultVerification, message));
            }
        }
        self.fail(errors)
    }

    /// The persisted view of this attempt.
    #[must_use]
    pub fn record(&self) -> AttemptRecord {
        let start_time = self.start_time.unwrap_or_else(Utc::now);
        AttemptRecord {
            experiment_id: Some(self.experiment.id().clone()),
            experiment_name: self.experiment.name().to_string(),
            attempt: self.attempt,
            machines: self
                .experiment
                .machines
                .iter()
                .map(|m| m.hostname.clone())
                .collect(),
            errors: self.errors.clone(),
            start_time,
            end_time: self.end_time.unwrap_or(start_time),
        }
    }
}
