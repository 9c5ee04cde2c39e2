//! Subprocess execution with an explicit wall-clock timeout, shared by the
//! icon pipeline ([`crate::icon`]) and the command engine
//! ([`crate::cmdengine`]) — spec §4.4/§4.7, §9 Design Notes "Subprocess
//! orchestration".
//!
//! The teacher (`cli::update`) shells out with `std::process::Command` and
//! checks `status.success()`; we follow the same idiom here and add the
//! timeout loop the spec requires (`cmd_timeout_ms` / per-step draw tool
//! timeouts), implemented with a `try_wait` poll loop rather than a crate
//! dependency — this daemon is synchronous/single-threaded by design (spec
//! §5), so a short poll loop on a thread the caller already owns is the
//! idiomatic fit, not an async runtime.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// Outcome of a bounded subprocess run.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub timed_out: bool,
}

impl ExecOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        !self.timed_out && self.status_code == Some(0)
    }
}

/// How often the wait loop polls `try_wait` before the timeout fires.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Run `program` with `args`, capturing stdout, killing it if it outlives
/// `timeout`. A minimal inherited environment is used (spec §9 "inherit a
/// minimal environment"): only `PATH`, `HOME`, and `LANG` pass through, so
/// draw-tool and user shell commands see a predictable environment
/// regardless of the daemon's own env.
pub fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> std::io::Result<ExecOutcome> {
    let mut command = Command::new(program);
    command.args(args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::null());
    command.env_clear();
    for key in ["PATH", "HOME", "LANG"] {
        if let Ok(val) = std::env::var(key) {
            command.env(key, val);
        }
    }
    let child = command.spawn()?;
    wait_bounded(child, timeout)
}

/// Run a shell command string (`sh -c <cmd>`) the way `$cmd.exec`/`poll`/
/// `state_cmd` entries do — these are user-authored shell snippets, not
/// fixed argv vectors, so they must go through a shell.
pub fn run_shell_with_timeout(cmd: &str, timeout: Duration) -> std::io::Result<ExecOutcome> {
    run_with_timeout("sh", &["-c", cmd], timeout)
}

fn wait_bounded(mut child: Child, timeout: Duration) -> std::io::Result<ExecOutcome> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let mut stdout = Vec::new();
            if let Some(mut out) = child.stdout.take() {
                let _ = out.read_to_end(&mut stdout);
            }
            return Ok(ExecOutcome {
                status_code: status.code(),
                stdout,
                timed_out: false,
            });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(ExecOutcome {
                status_code: None,
                stdout: Vec::new(),
                timed_out: true,
            });
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

#[cfg(test)]
mod tests {
    use super::run_shell_with_timeout;
    use std::time::Duration;

    #[test]
    fn captures_stdout_on_success() {
        let outcome = run_shell_with_timeout("echo 42", Duration::from_millis(500)).unwrap();
        assert!(outcome.success());
        assert_eq!(String::from_utf8_lossy(&outcome.stdout).trim(), "42");
    }

    #[test]
    fn reports_nonzero_exit() {
        let outcome = run_shell_with_timeout("exit 3", Duration::from_millis(500)).unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.status_code, Some(3));
    }

    #[test]
    fn kills_on_timeout() {
        let outcome = run_shell_with_timeout("sleep 5", Duration::from_millis(100)).unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }
}
