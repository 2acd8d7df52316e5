//! How the controller reaches a machine
//!
//! A [`Transport`] only *builds* commands; spawning, deadlines and output
//! capture live in [`crate::process`]. This keeps every remote interaction a
//! plain child process that can be killed, and lets the whole pipeline run
//! against something other than real SSH.

use std::{
    fmt,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

/// Reboot command issued over SSH; the session dies with the host.
pub const REBOOT_COMMAND: &str = "sudo reboot";

/// Connection details for one machine.
#[derive(Debug, Clone, Copy)]
pub struct SshTarget<'a> {
    pub ip: Ipv4Addr,
    pub username: &'a str,
    pub key_path: &'a Path,
}

impl fmt::Display for SshTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.ip)
    }
}

/// Builds the commands used to probe, drive and collect from a machine.
pub trait Transport: Send + Sync + fmt::Debug {
    /// ICMP reachability probe.
    fn ping(&self, target: &SshTarget<'_>, timeout: Duration) -> Command;

    /// Runs `script` through the remote login shell.
    fn exec(&self, target: &SshTarget<'_>, script: &str, connect_timeout: Duration) -> Command;

    /// Fire-and-forget reboot.
    fn reboot(&self, target: &SshTarget<'_>, connect_timeout: Duration) -> Command {
        self.exec(target, REBOOT_COMMAND, connect_timeout)
    }

    /// Copies one remote file into `local_dir`.
    fn fetch(
        &self,
        target: &SshTarget<'_>,
        remote_path: &str,
        local_dir: &Path,
        connect_timeout: Duration,
    ) -> Command;
}

/// The system `ssh`/`scp`/`ping` binaries.
#[derive(Debug, Clone, Default)]
pub struct OpenSsh {
    /// Extra `-o` options appended after the defaults.
    pub extra_options: Vec<String>,
}

impl OpenSsh {
    fn options(&self, key: &Path, connect_timeout: Duration) -> Vec<String> {
        let mut opts: Vec<String> = vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
            "-o".into(),
            "ServerAliveInterval=30".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-i".into(),
            key.to_string_lossy().into(),
        ];
        for opt in &self.extra_options {
            opts.push("-o".into());
            opts.push(opt.clone());
        }
        opts
    }
}

impl Transport for OpenSsh {
    fn ping(&self, target: &SshTarget<'_>, timeout: Duration) -> Command {
        let mut cmd = Command::new("ping");
        cmd.args(["-c", "1", "-W"])
            .arg(timeout.as_secs().max(1).to_string())
            .arg(target.ip.to_string());
        cmd
    }

    fn exec(&self, target: &SshTarget<'_>, script: &str, connect_timeout: Duration) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.options(target.key_path, connect_timeout))
            .arg(target.to_string())
            .arg(script);
        cmd
    }

    fn fetch(
        &self,
        target: &SshTarget<'_>,
        remote_path: &str,
        local_dir: &Path,
        connect_timeout: Duration,
    ) -> Command {
        let mut cmd = Command::new("scp");
        cmd.args(self.options(target.key_path, connect_timeout))
            .arg(format!("{target}:{remote_path}"))
            .arg(local_dir);
        cmd
    }
}

/// Directory part of a remote POSIX path.
#[must_use]
pub fn remote_dirname(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) => "/",
        Some((dir, _)) => dir,
        None => ".",
    }
}

/// Quotes `s` for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./~=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Local path a fetched remote file lands at.
#[must_use]
pub fn fetched_path(remote_path: &str, local_dir: &Path) -> PathBuf {
    let file = remote_path.rsplit('/').next().unwrap_or(remote_path);
    local_dir.join(file)
}
