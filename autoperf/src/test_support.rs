//! Fixtures for exercising the pipeline without a fleet.
//!
//! `LocalShell` runs every "remote" script with the local `sh`, so a machine's
//! `perftest_path` can point at a shell script inside a temp directory.

use std::{
    collections::HashSet,
    fs,
    net::Ipv4Addr,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    time::Duration,
};

use autoperf_common::ParticipantType;

use crate::{
    machine::Machine,
    transport::{SshTarget, Transport},
};

/// Writes a CSV named by `-outputFile`, if given.
pub const FAKE_PERFTEST: &str = r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
    if [ "$1" = "-outputFile" ]; then out="$2"; fi
    shift
done
if [ -n "$out" ]; then
    printf 'Length (Bytes),Latency (us),Ave (us)\n100,42,40.5\n100,43,41.0\n' > "$out"
fi
"#;

/// Never finishes on its own.
pub const HANGING_PERFTEST: &str = "#!/bin/sh\nsleep 600\n";

/// Writes an empty output file.
pub const TRUNCATING_PERFTEST: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    if [ "$1" = "-outputFile" ]; then : > "$2"; fi
    shift
done
"#;

fn sh(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

#[derive(Debug, Default)]
pub struct LocalShell {
    /// Hosts whose ping fails.
    pub unreachable: HashSet<Ipv4Addr>,
    /// Hosts whose ssh fails with status 255.
    pub ssh_down: HashSet<Ipv4Addr>,
    /// Hosts whose reboot command fails.
    pub reboot_fails: HashSet<Ipv4Addr>,
}

impl Transport for LocalShell {
    fn ping(&self, target: &SshTarget<'_>, _timeout: Duration) -> Command {
        if self.unreachable.contains(&target.ip) {
            sh("echo '100% packet loss' >&2; exit 1")
        } else {
            sh("exit 0")
        }
    }

    fn exec(&self, target: &SshTarget<'_>, script: &str, _connect_timeout: Duration) -> Command {
        if self.ssh_down.contains(&target.ip) {
            sh("echo 'Connection refused' >&2; exit 255")
        } else {
            sh(script)
        }
    }

    fn reboot(&self, target: &SshTarget<'_>, _connect_timeout: Duration) -> Command {
        if self.reboot_fails.contains(&target.ip) {
            sh("echo 'sudo: a password is required' >&2; exit 1")
        } else {
            sh("exit 0")
        }
    }

    fn fetch(
        &self,
        _target: &SshTarget<'_>,
        remote_path: &str,
        local_dir: &Path,
        _connect_timeout: Duration,
    ) -> Command {
        let mut cmd = Command::new("cp");
        cmd.arg(remote_path).arg(local_dir);
        cmd
    }
}

/// Installs `body` as an executable `perftest_cpp` in its own directory under
/// `root` and returns its path.
pub fn install_perftest(root: &Path, host: &str, body: &str) -> PathBuf {
    let dir = root.join(host);
    fs::create_dir_all(&dir).unwrap();
    let exe = dir.join("perftest_cpp");
    fs::write(&exe, body).unwrap();
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
    exe
}

pub fn machine(root: &Path, host: &str, octet: u8, ty: ParticipantType, body: &str) -> Machine {
    let exe = install_perftest(root, host, body);
    Machine::new(
        host,
        ty,
        Ipv4Addr::new(10, 0, 0, octet),
        root.join("id_rsa"),
        "perf",
        exe.to_string_lossy(),
    )
}
