//! One remote host in the benchmark fleet
//!
//! A [`Machine`] knows how to reach its host and accumulates the perftest
//! invocations it has been assigned for the current experiment. Every remote
//! interaction is a bounded child process; failures come back as
//! [`ErrorRecord`]s tagged with the host so the runner can attribute them.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use autoperf_common::{constants::ARTIFACT_EXTENSION, ParticipantType};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    process::{display_command, run_with_timeout, ProcessOutput, RunningProcess},
    transport::{fetched_path, remote_dirname, shell_quote, SshTarget, Transport},
    types::{ErrorRecord, Stage},
};

/// ssh reserves this status for its own failures.
const SSH_FAILURE_STATUS: i32 = 255;

/// Kind of connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionCheck {
    Ping,
    Ssh,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub hostname: String,
    pub participant_type: ParticipantType,
    pub ip: Ipv4Addr,
    pub ssh_key_path: PathBuf,
    pub username: String,
    /// Remote path of the perftest executable; artifacts land next to it.
    pub perftest_path: String,
    scripts: Vec<String>,
    command: String,
    run_output: Vec<String>,
}

impl Machine {
    pub fn new(
        hostname: impl Into<String>,
        participant_type: ParticipantType,
        ip: Ipv4Addr,
        ssh_key_path: impl Into<PathBuf>,
        username: impl Into<String>,
        perftest_path: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            participant_type,
            ip,
            ssh_key_path: ssh_key_path.into(),
            username: username.into(),
            perftest_path: perftest_path.into(),
            scripts: Vec::new(),
            command: String::new(),
            run_output: Vec::new(),
        }
    }

    #[must_use]
    pub fn target(&self) -> SshTarget<'_> {
        SshTarget {
            ip: self.ip,
            username: &self.username,
            key_path: &self.ssh_key_path,
        }
    }

    /// Remote directory holding the executable and its CSV output.
    #[must_use]
    pub fn perftest_dir(&self) -> &str {
        remote_dirname(&self.perftest_path)
    }

    #[must_use]
    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn run_output(&self) -> &[String] {
        &self.run_output
    }

    /// Clears everything accumulated for a previous experiment.
    pub fn reset(&mut self) {
        self.scripts.clear();
        self.command.clear();
        self.run_output.clear();
    }

    pub fn add_script(&mut self, args: impl Into<String>) {
        self.scripts.push(args.into());
    }

    /// Rebuilds the shell command from the assigned scripts. Calling it again
    /// yields the same command; nothing is appended to a previous build.
    ///
    /// Every script runs in the background; the command exits with the last
    /// non-zero status among them.
    pub fn generate_command(&mut self) -> &str {
        self.command.clear();
        if self.scripts.is_empty() {
            return &self.command;
        }

        let exe = shell_quote(&self.perftest_path);
        self.command = format!("cd {} || exit 1; pids=; ", shell_quote(self.perftest_dir()));
        for script in &self.scripts {
            self.command.push_str(&exe);
            self.command.push(' ');
            self.command.push_str(script);
            self.command.push_str(" & pids=\"$pids $!\"; ");
        }
        self.command
            .push_str("rc=0; for p in $pids; do wait $p || rc=$?; done; exit $rc");
        &self.command
    }

    fn error(&self, stage: Stage, message: impl Into<String>) -> ErrorRecord {
        ErrorRecord::new(stage, message).on_host(&self.hostname, self.ip)
    }

    /// Probes the host up to `total_attempts` times, stopping at the first
    /// success. On failure every attempt's error is returned.
    pub fn check_connection(
        &self,
        transport: &dyn Transport,
        check: ConnectionCheck,
        total_attempts: u32,
        timeout: Duration,
        stage: Stage,
    ) -> Result<(), Vec<ErrorRecord>> {
        let mut errors = Vec::new();

        for attempt in 1..=total_attempts.max(1) {
            let cmd = match check {
                ConnectionCheck::Ping => transport.ping(&self.target(), timeout),
                ConnectionCheck::Ssh => transport.exec(&self.target(), "true", timeout),
            };
            let line = display_command(&cmd);

            let message = match run_with_timeout(cmd, timeout) {
                Ok(out) if out.success() => {
                    for err in &errors {
                        warn!("{err}");
                    }
                    debug!("{} {check:?} ok on attempt {attempt}", self.hostname);
                    return Ok(());
                }
                Ok(out) => out.describe_failure(),
                Err(e) => format!("failed to spawn: {e}"),
            };

            errors.push(
                self.error(stage, message)
                    .with_attempt(attempt)
                    .with_command(line),
            );
        }

        Err(errors)
    }

    /// Issues a reboot and returns as soon as the ssh command completes. The
    /// host is not expected to be reachable afterwards until it has booted.
    pub fn restart(&self, transport: &dyn Transport, timeout: Duration) -> Result<(), ErrorRecord> {
        let cmd = transport.reboot(&self.target(), timeout);
        let line = display_command(&cmd);
        let out = run_with_timeout(cmd, timeout)
            .map_err(|e| self.error(Stage::Restart, format!("failed to spawn: {e}")))?;

        if out.success() {
            info!("Restart issued on {}", self.hostname);
            Ok(())
        } else {
            Err(self
                .error(Stage::Restart, out.describe_failure())
                .with_command(line))
        }
    }

    /// Deletes leftover CSVs next to the executable.
    pub fn remove_artifact_files(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> Result<(), ErrorRecord> {
        let script = format!(
            "rm -f {}/*.{ARTIFACT_EXTENSION}",
            shell_quote(self.perftest_dir())
        );
        let cmd = transport.exec(&self.target(), &script, timeout);
        let line = display_command(&cmd);
        let out = run_with_timeout(cmd, timeout)
            .map_err(|e| self.error(Stage::ArtifactCleanup, format!("failed to spawn: {e}")))?;

        if out.success() {
            Ok(())
        } else {
            Err(self
                .error(Stage::ArtifactCleanup, out.describe_failure())
                .with_command(line))
        }
    }

    /// Starts the generated command without waiting for it.
    pub fn start_run(
        &self,
        transport: &dyn Transport,
        connect_timeout: Duration,
    ) -> Result<RunningProcess, ErrorRecord> {
        let cmd = transport.exec(&self.target(), &self.command, connect_timeout);
        info!("{}: {}", self.hostname, self.command);
        let line = display_command(&cmd);
        RunningProcess::spawn(cmd).map_err(|e| {
            self.error(Stage::ScriptExecution, format!("failed to spawn: {e}"))
                .with_command(line)
        })
    }

    /// Joins a process from [`Machine::start_run`], killing it after `limit`.
    pub fn finish_run(&mut self, process: RunningProcess, limit: Duration) -> Result<(), ErrorRecord> {
        let out = process.wait_timeout(limit).map_err(|e| {
            self.error(Stage::ScriptExecution, format!("failed to wait: {e}"))
                .with_command(self.command.clone())
        })?;
        self.capture_output(&out);

        if out.timed_out() {
            self.run_output
                .push(format!("TIMEOUT: killed after {}s", limit.as_secs()));
            return Err(self
                .error(
                    Stage::ScriptExecution,
                    format!("timed out after {}s", limit.as_secs()),
                )
                .with_command(self.command.clone()));
        }

        match out.code() {
            Some(0) => Ok(()),
            Some(SSH_FAILURE_STATUS) => Err(self
                .error(Stage::ScriptExecution, out.describe_failure())
                .with_command(self.command.clone())),
            code => {
                // perftest writes warnings to stderr; verification decides
                self.run_output.push(match code {
                    Some(code) => format!("EXIT: status {code}"),
                    None => "EXIT: killed by signal".to_string(),
                });
                warn!(
                    "{} finished with {}",
                    self.hostname,
                    out.describe_failure()
                );
                Ok(())
            }
        }
    }

    /// Runs the generated command to completion, bounded by `timeout`.
    pub fn run(&mut self, transport: &dyn Transport, timeout: Duration) -> Result<(), ErrorRecord> {
        let process = self.start_run(transport, timeout)?;
        self.finish_run(process, timeout)
    }

    fn capture_output(&mut self, out: &ProcessOutput) {
        self.run_output
            .extend(out.stdout.lines().map(str::to_string));
        self.run_output
            .extend(out.stderr.lines().map(|l| format!("stderr: {l}")));
    }

    /// Lists the remote CSVs, fetches each into `output_dir` and checks that
    /// at least as many arrived as were listed.
    pub fn download_results(
        &self,
        transport: &dyn Transport,
        output_dir: &Path,
        timeout: Duration,
    ) -> Result<Vec<PathBuf>, ErrorRecord> {
        let remote_files = self.list_remote_artifacts(transport, timeout)?;
        debug!(
            "{} has {} remote artifacts",
            self.hostname,
            remote_files.len()
        );

        let mut fetched = Vec::with_capacity(remote_files.len());
        for remote in &remote_files {
            let cmd = transport.fetch(&self.target(), remote, output_dir, timeout);
            let line = display_command(&cmd);
            let out = run_with_timeout(cmd, timeout).map_err(|e| {
                self.error(Stage::ResultDownload, format!("failed to spawn: {e}"))
                    .with_command(line.clone())
            })?;
            if !out.success() {
                return Err(self
                    .error(
                        Stage::ResultDownload,
                        format!("fetching {remote}: {}", out.describe_failure()),
                    )
                    .with_command(line));
            }
            fetched.push(fetched_path(remote, output_dir));
        }

        let local_count = fetched.iter().filter(|p| p.is_file()).count();
        if local_count < remote_files.len() {
            return Err(self.error(
                Stage::ResultDownload,
                format!(
                    "downloaded {local_count} of {} remote files",
                    remote_files.len()
                ),
            ));
        }

        Ok(fetched)
    }

    fn list_remote_artifacts(
        &self,
        transport: &dyn Transport,
        timeout: Duration,
    ) -> Result<Vec<String>, ErrorRecord> {
        let script = format!(
            "find {} -maxdepth 1 -type f -name '*.{ARTIFACT_EXTENSION}'",
            shell_quote(self.perftest_dir())
        );
        let cmd = transport.exec(&self.target(), &script, timeout);
        let line = display_command(&cmd);
        let out = run_with_timeout(cmd, timeout).map_err(|e| {
            self.error(Stage::ResultDownload, format!("failed to spawn: {e}"))
                .with_command(line.clone())
        })?;

        if !out.success() {
            return Err(self
                .error(
                    Stage::ResultDownload,
                    format!("listing artifacts: {}", out.describe_failure()),
                )
                .with_command(line));
        }

        let mut files: Vec<String> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Instant};

    use super::*;
    use crate::test_support::{machine, LocalShell, FAKE_PERFTEST, HANGING_PERFTEST};

    const T: Duration = Duration::from_secs(10);

    #[test]
    fn test_generate_command_is_idempotent() {
        let mut m = Machine::new(
            "pi-1",
            ParticipantType::All,
            Ipv4Addr::new(10, 0, 0, 1),
            "/keys/id",
            "perf",
            "/opt/perftest/perftest_cpp",
        );
        m.add_script("-pub -pidMultiPubTest 0");
        m.add_script("-sub -sidMultiSubTest 0");

        let first = m.generate_command().to_string();
        let second = m.generate_command().to_string();
        assert_eq!(first, second);
        assert_eq!(
            first,
            "cd /opt/perftest || exit 1; pids=; \
             /opt/perftest/perftest_cpp -pub -pidMultiPubTest 0 & pids=\"$pids $!\"; \
             /opt/perftest/perftest_cpp -sub -sidMultiSubTest 0 & pids=\"$pids $!\"; \
             rc=0; for p in $pids; do wait $p || rc=$?; done; exit $rc"
        );

        m.reset();
        assert!(m.scripts().is_empty());
        assert_eq!(m.generate_command(), "");
    }

    #[test]
    fn test_check_connection_records_every_failed_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(dir.path(), "pi-1", 1, ParticipantType::Pub, FAKE_PERFTEST);
        let mut transport = LocalShell::default();
        transport.unreachable.insert(m.ip);

        let errors = m
            .check_connection(&transport, ConnectionCheck::Ping, 3, T, Stage::Ping)
            .unwrap_err();
        assert_eq!(errors.len(), 3);
        for (i, err) in errors.iter().enumerate() {
            assert_eq!(err.stage, Stage::Ping);
            assert_eq!(err.attempt, Some(i as u32 + 1));
            assert_eq!(err.hostname.as_deref(), Some("pi-1"));
            assert_eq!(err.ip.as_deref(), Some("10.0.0.1"));
            assert!(err.command.is_some());
            assert!(err.message.contains("packet loss"));
        }

        assert!(m
            .check_connection(&transport, ConnectionCheck::Ssh, 3, T, Stage::SshCheck)
            .is_ok());
    }

    #[test]
    fn test_restart_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let m = machine(dir.path(), "pi-1", 1, ParticipantType::Pub, FAKE_PERFTEST);
        let mut transport = LocalShell::default();
        assert!(m.restart(&transport, T).is_ok());

        transport.reboot_fails.insert(m.ip);
        let err = m.restart(&transport, T).unwrap_err();
        assert_eq!(err.stage, Stage::Restart);
        assert!(err.message.contains("password"));
    }

    #[test]
    fn test_run_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("out");
        fs::create_dir_all(&out_dir).unwrap();
        let mut m = machine(dir.path(), "pi-1", 1, ParticipantType::All, FAKE_PERFTEST);
        let transport = LocalShell::default();

        // stale artifact from an interrupted run
        fs::write(Path::new(m.perftest_dir()).join("sub_9.csv"), "old").unwrap();
        m.remove_artifact_files(&transport, T).unwrap();
        assert!(!Path::new(m.perftest_dir()).join("sub_9.csv").exists());

        m.add_script("-pub -outputFile pub_0.csv");
        m.add_script("-sub -outputFile sub_0.csv");
        m.generate_command();
        m.run(&transport, T).unwrap();

        let files = m.download_results(&transport, &out_dir, T).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["pub_0.csv", "sub_0.csv"]);
        assert!(out_dir.join("pub_0.csv").is_file());
    }

    #[test]
    fn test_run_timeout_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = machine(dir.path(), "pi-2", 2, ParticipantType::Sub, HANGING_PERFTEST);
        m.add_script("-sub -outputFile sub_0.csv");
        m.generate_command();

        let started = Instant::now();
        let err = m
            .run(&LocalShell::default(), Duration::from_secs(1))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(err.stage, Stage::ScriptExecution);
        assert!(err.message.contains("timed out"));
        assert!(m.run_output().iter().any(|l| l.starts_with("TIMEOUT")));
    }

    #[test]
    fn test_nonzero_exit_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = machine(
            dir.path(),
            "pi-3",
            3,
            ParticipantType::Sub,
            "#!/bin/sh\necho 'warning: low memory' >&2\nexit 2\n",
        );
        m.add_script("-sub");
        m.generate_command();
        assert!(m.run(&LocalShell::default(), T).is_ok());
        assert!(m
            .run_output()
            .iter()
            .any(|l| l == "stderr: warning: low memory"));
        assert!(m.run_output().iter().any(|l| l == "EXIT: status 2"));
    }

    #[test]
    fn test_ssh_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = machine(dir.path(), "pi-4", 4, ParticipantType::Sub, FAKE_PERFTEST);
        m.add_script("-sub");
        m.generate_command();
        let mut transport = LocalShell::default();
        transport.ssh_down.insert(m.ip);
        let err = m.run(&transport, T).unwrap_err();
        assert!(err.message.contains("255"));
    }
}
