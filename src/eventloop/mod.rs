//! Single-threaded `poll(2)` event loop multiplexing the device, control,
//! HA, and command-engine-notify descriptors (spec §4.10).

use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::core::errors::{KeydeckError, Result};

/// `poll(2)` timeout per iteration (spec §4.10: "100ms tick" — bounds how
/// long brightness/command-engine scheduling can lag behind a quiet
/// socket set).
pub const POLL_TIMEOUT_MS: u16 = 100;

/// Which tracked descriptor became readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    Device,
    Control,
    Ha,
    CmdNotify,
}

/// The fixed set of descriptors the event loop multiplexes. HA is
/// optional: a daemon configured without any `entity_id`/`state_cmd`
/// bindings never opens the HA socket (spec §4.6 "lazy connect").
pub struct WatchedFds {
    pub device: RawFd,
    pub control: RawFd,
    pub ha: Option<RawFd>,
    pub cmd_notify: RawFd,
}

/// One `poll(2)` iteration's outcome: every descriptor reported readable,
/// in poll-array order, plus whether the call timed out with nothing
/// ready (used by the caller to still run its periodic bookkeeping —
/// brightness ticks and command-engine scheduling happen every iteration
/// regardless, spec §4.10 steps 4-5).
#[derive(Debug, Clone, Default)]
pub struct PollResult {
    pub ready: Vec<ReadySource>,
}

/// Run one `poll(2)` call over `fds`, returning which sources are
/// readable. Spec §4.10's six-step iteration body:
///   1. poll with 100ms timeout
///   2. drain the device socket (button events, connection state)
///   3. drain the control socket (accept + dispatch one command)
///   4. drain the HA socket (state pushes)
///   5. drain the command-engine notify pipe (apply completed results)
///   6. run brightness/debounce bookkeeping unconditionally
/// Steps 2-6 are the caller's responsibility; this function only performs
/// step 1.
///
/// # Errors
/// Returns [`KeydeckError::Runtime`] if the underlying `poll(2)` syscall
/// fails (anything other than `EINTR`, which is retried transparently by
/// `nix::poll::poll`).
pub fn poll_once(fds: &WatchedFds) -> Result<PollResult> {
    let mut entries: Vec<(ReadySource, PollFd)> = vec![
        (
            ReadySource::Device,
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(fds.device) }, PollFlags::POLLIN),
        ),
        (
            ReadySource::Control,
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(fds.control) }, PollFlags::POLLIN),
        ),
        (
            ReadySource::CmdNotify,
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(fds.cmd_notify) }, PollFlags::POLLIN),
        ),
    ];
    if let Some(ha_fd) = fds.ha {
        entries.push((
            ReadySource::Ha,
            PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(ha_fd) }, PollFlags::POLLIN),
        ));
    }

    let mut poll_fds: Vec<PollFd> = entries.iter().map(|(_, pfd)| *pfd).collect();
    let timeout = PollTimeout::from(POLL_TIMEOUT_MS);
    poll(&mut poll_fds, timeout).map_err(|e| KeydeckError::Runtime {
        details: format!("poll: {e}"),
    })?;

    let mut ready = Vec::new();
    for ((source, _), pfd) in entries.iter().zip(poll_fds.iter()) {
        if pfd
            .revents()
            .is_some_and(|revents| revents.contains(PollFlags::POLLIN))
        {
            ready.push(*source);
        }
    }
    Ok(PollResult { ready })
}

/// Create a non-blocking self-pipe for the command engine's completion
/// notifications (spec §4.7, §4.10 "cmd-engine-notify descriptor").
///
/// # Errors
/// Returns [`KeydeckError::Runtime`] if `pipe(2)` fails.
pub fn make_notify_pipe() -> Result<(RawFd, RawFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK)
        .map(|(r, w)| (std::os::fd::IntoRawFd::into_raw_fd(r), std::os::fd::IntoRawFd::into_raw_fd(w)))
        .map_err(|e| KeydeckError::Runtime {
            details: format!("pipe2: {e}"),
        })
}

/// Drain (and discard) every byte currently queued on `fd`'s notify pipe,
/// used after handling a `ReadySource::CmdNotify` wakeup so the next
/// `poll(2)` doesn't immediately re-fire on leftover bytes.
pub fn drain_notify_pipe(fd: RawFd) {
    use std::io::Read;
    let mut buf = [0u8; 64];
    let mut f = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };
    loop {
        match f.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
    std::mem::forget(f);
}

/// Sleep helper for callers that want to bound retry loops outside the
/// main `poll(2)` cycle (e.g. reconnect backoff).
pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_reports_readable_notify_pipe() {
        let (read_fd, write_fd) = make_notify_pipe().unwrap();
        {
            use std::io::Write;
            let mut w = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(write_fd) };
            w.write_all(&[1]).unwrap();
            std::mem::forget(w);
        }
        let fds = WatchedFds {
            device: read_fd,
            control: read_fd,
            ha: None,
            cmd_notify: read_fd,
        };
        let result = poll_once(&fds).unwrap();
        assert!(result.ready.contains(&ReadySource::Device));
        drain_notify_pipe(read_fd);
        unsafe {
            libc::close(write_fd);
        }
    }

    #[test]
    fn poll_times_out_with_nothing_ready() {
        let (read_fd, write_fd) = make_notify_pipe().unwrap();
        let fds = WatchedFds {
            device: read_fd,
            control: read_fd,
            ha: None,
            cmd_notify: read_fd,
        };
        let result = poll_once(&fds).unwrap();
        assert!(result.ready.is_empty());
        unsafe {
            libc::close(write_fd);
        }
    }
}
