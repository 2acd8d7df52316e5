//! Local child processes with hard deadlines
//!
//! Every remote operation is a local `ssh`/`scp`/`ping` child. Each child is
//! put in its own process group so that a timeout can take down the whole
//! tree (a shell and whatever it spawned), not just the direct child whose
//! grandchildren would otherwise keep the output pipes open.

use std::{
    io::{self, Read},
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERM_GRACE: Duration = Duration::from_millis(500);

/// What a finished (or killed) child left behind.
#[derive(Debug)]
pub struct ProcessOutput {
    /// `None` when the deadline expired and the process group was killed.
    pub status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    #[must_use]
    #[inline]
    pub const fn timed_out(&self) -> bool {
        self.status.is_none()
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    /// Exit code, if the process exited normally.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Short human-readable failure description for error records.
    #[must_use]
    pub fn describe_failure(&self) -> String {
        if self.timed_out() {
            return format!("timed out after {:.1}s", self.elapsed.as_secs_f64());
        }
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        match self.code() {
            Some(code) if detail.is_empty() => format!("exit status {code}"),
            Some(code) => format!("exit status {code}: {detail}"),
            None => format!("terminated by signal: {detail}"),
        }
    }
}

/// A spawned child in its own process group.
#[derive(Debug)]
pub struct RunningProcess {
    child: Option<Child>,
    pgid: i32,
    started: Instant,
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl RunningProcess {
    /// Spawns `cmd` with piped output in a fresh process group.
    pub fn spawn(mut cmd: Command) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        let pgid = i32::try_from(child.id())
            .map_err(|_| io::Error::other("child pid out of range"))?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        debug!("Spawned {:?} as pgid {pgid}", cmd.get_program());
        Ok(Self {
            child: Some(child),
            pgid,
            started: Instant::now(),
            stdout,
            stderr,
        })
    }

    #[must_use]
    pub const fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Whether the group leader has exited, without reaping it. While the
    /// leader is an unreaped zombie its pid, and so the pgid, cannot be
    /// reused, which keeps `killpg` aimed at this group.
    fn leader_exited(&self) -> io::Result<bool> {
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                self.pgid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { info.si_pid() } != 0)
    }

    fn signal_group(&self, signal: libc::c_int) {
        unsafe {
            libc::killpg(self.pgid, signal);
        }
    }

    /// Waits up to `limit` for the child to exit, killing the process group
    /// when the limit expires. The limit is measured from this call, not from
    /// the spawn.
    pub fn wait_timeout(mut self, limit: Duration) -> io::Result<ProcessOutput> {
        let deadline = Instant::now() + limit;
        let mut exited = false;

        if self.child.is_some() {
            loop {
                if self.leader_exited()? {
                    exited = true;
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("Process group {} exceeded {limit:?}, terminating", self.pgid);
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
        }

        let status = if exited {
            // leftovers in the group would keep the pipes open
            self.signal_group(libc::SIGKILL);
            match self.child.take() {
                Some(mut child) => Some(child.wait()?),
                None => None,
            }
        } else {
            self.terminate();
            None
        };

        let stdout = self
            .stdout
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        Ok(ProcessOutput {
            status,
            stdout,
            stderr,
            elapsed: self.started.elapsed(),
        })
    }

    /// SIGTERM the group, then SIGKILL whatever survives the grace period.
    /// The leader is only reaped after the last signal.
    fn terminate(&mut self) {
        if self.child.is_none() {
            return;
        }
        self.signal_group(libc::SIGTERM);
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            match self.leader_exited() {
                Ok(false) => thread::sleep(POLL_INTERVAL),
                _ => break,
            }
        }
        // stragglers in the group may outlive the leader
        self.signal_group(libc::SIGKILL);
        if let Some(mut child) = self.child.take() {
            let _ = child.wait();
        }
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.terminate();
        }
    }
}

/// Runs `cmd` to completion, bounded by `limit`.
pub fn run_with_timeout(cmd: Command, limit: Duration) -> io::Result<ProcessOutput> {
    RunningProcess::spawn(cmd)?.wait_timeout(limit)
}

/// Renders a command line for logs and error records.
#[must_use]
pub fn display_command(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        out.push(' ');
        let arg = arg.to_string_lossy();
        if arg.contains(char::is_whitespace) {
            out.push('\'');
            out.push_str(&arg);
            out.push('\'');
        } else {
            out.push_str(&arg);
        }
    }
    out
}
