//! Command engine: background shell-command execution bound to `$cmd.*`
//! action verbs and `poll`/`state_cmd` item config (spec §4.7).
//!
//! Each tracked command runs on its own worker thread so a slow or hung
//! command never blocks the event loop; results land in a mutex-protected
//! [`CmdEntry`] tagged with a generation counter so stale results from a
//! superseded run are discarded rather than applied (spec §4.7 "stale
//! result invalidation", §9 Design Notes).
//!
//! Spec §3 Invariant 7 requires at most one `CmdEntry` per `(page,
//! item_index)`, so the engine is keyed by that pair alone (never by which
//! gesture or verb triggered it): one entry carries two independent
//! schedules — a user-controlled `poll` slot (`$cmd.poll_start`/
//! `$cmd.poll_stop`, plus one-shot `$cmd.exec`/`$cmd.exec_text` captures)
//! and a page-scoped `state_cmd` slot — each with its own deadline,
//! running flag, and generation counter (spec §4.7 "Per-entry fields").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parking_lot::Mutex as PlMutex;

use crate::core::config::CmdTextOpts;
use crate::procexec::run_shell_with_timeout;

/// Cadence at which poll/state_cmd entries are checked for a due run (spec
/// §4.7: "200ms scheduler tick").
pub const SCHEDULER_TICK: Duration = Duration::from_millis(200);

/// Result of the most recently applied run on one of an entry's two
/// tracks. `seq` increments on every write (including stop/clear), letting
/// a caller detect "there's something new to apply" independent of the
/// invalidation generation, which only guards in-flight runs.
#[derive(Debug, Clone, Default)]
pub struct CmdResult {
    pub text: Option<String>,
    pub failed: bool,
    pub seq: u64,
}

#[derive(Debug, Clone)]
struct PollSlot {
    cmd: String,
    every_ms: u64,
    opts: CmdTextOpts,
    timeout: Duration,
}

#[derive(Debug, Clone)]
struct StateSlot {
    cmd: String,
    every_ms: u64,
    timeout: Duration,
}

/// One item's tracked commands: an independent `poll` schedule and
/// `state_cmd` schedule, each with its own generation counter so a stopped
/// or superseded run's late result is discarded (spec §4.7, §9 Design
/// Notes "mutex-bearing values that must not move" — held behind an `Arc`
/// so the entry's address never changes while workers hold a clone).
pub struct CmdEntry {
    poll: PlMutex<Option<PollSlot>>,
    state: PlMutex<Option<StateSlot>>,
    poll_gen: AtomicU64,
    state_gen: AtomicU64,
    poll_running: PlMutex<bool>,
    state_running: PlMutex<bool>,
    next_poll_ms: PlMutex<u64>,
    next_state_ms: PlMutex<u64>,
    text_result: PlMutex<CmdResult>,
    state_result: PlMutex<CmdResult>,
    text_seq: AtomicU64,
    state_seq: AtomicU64,
}

impl CmdEntry {
    fn new() -> Self {
        Self {
            poll: PlMutex::new(None),
            state: PlMutex::new(None),
            poll_gen: AtomicU64::new(0),
            state_gen: AtomicU64::new(0),
            poll_running: PlMutex::new(false),
            state_running: PlMutex::new(false),
            next_poll_ms: PlMutex::new(0),
            next_state_ms: PlMutex::new(0),
            text_result: PlMutex::new(CmdResult::default()),
            state_result: PlMutex::new(CmdResult::default()),
            text_seq: AtomicU64::new(0),
            state_seq: AtomicU64::new(0),
        }
    }

    /// Latest applied result for the `poll`/`exec`/`exec_text` track.
    #[must_use]
    pub fn latest_text(&self) -> CmdResult {
        self.text_result.lock().clone()
    }

    /// Latest applied result for the `state_cmd` track.
    #[must_use]
    pub fn latest_state(&self) -> CmdResult {
        self.state_result.lock().clone()
    }

    fn bump_text_result(&self, text: Option<String>, failed: bool) {
        let seq = self.text_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.text_result.lock() = CmdResult { text, failed, seq };
    }

    fn bump_state_result(&self, text: Option<String>, failed: bool) {
        let seq = self.state_seq.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state_result.lock() = CmdResult { text, failed, seq };
    }

    fn maybe_run_poll(self: &Arc<Self>, now_ms: u64, notify_write: std::os::unix::io::RawFd) {
        let slot = self.poll.lock().clone();
        let Some(slot) = slot else { return };
        if slot.every_ms == 0 {
            return;
        }
        {
            let mut next = self.next_poll_ms.lock();
            if now_ms < *next {
                return;
            }
            let mut running = self.poll_running.lock();
            if *running {
                return;
            }
            *running = true;
            *next = now_ms + slot.every_ms;
        }
        let generation = self.poll_gen.load(Ordering::SeqCst);
        spawn_text_run(Arc::clone(self), slot.cmd, slot.opts, slot.timeout, generation, notify_write);
    }

    fn maybe_run_state(self: &Arc<Self>, now_ms: u64, notify_write: std::os::unix::io::RawFd) {
        let slot = self.state.lock().clone();
        let Some(slot) = slot else { return };
        if slot.every_ms == 0 {
            return;
        }
        {
            let mut next = self.next_state_ms.lock();
            if now_ms < *next {
                return;
            }
            let mut running = self.state_running.lock();
            if *running {
                return;
            }
            *running = true;
            *next = now_ms + slot.every_ms;
        }
        let generation = self.state_gen.load(Ordering::SeqCst);
        spawn_state_run(Arc::clone(self), slot.cmd, slot.timeout, generation, notify_write);
    }
}

fn notify(notify_write: std::os::unix::io::RawFd) {
    let mut f = unsafe { <std::fs::File as std::os::unix::io::FromRawFd>::from_raw_fd(notify_write) };
    use std::io::Write;
    let _ = f.write_all(&[0u8]);
    std::mem::forget(f);
}

fn spawn_text_run(entry: Arc<CmdEntry>, cmd: String, opts: CmdTextOpts, timeout: Duration, generation: u64, notify_write: std::os::unix::io::RawFd) {
    std::thread::spawn(move || {
        let outcome = run_shell_with_timeout(&cmd, timeout);
        *entry.poll_running.lock() = false;
        if entry.poll_gen.load(Ordering::SeqCst) != generation {
            // Superseded by a poll_start/poll_stop/exec_stop while the
            // shell command was running; discard the result.
            return;
        }
        match outcome {
            Ok(o) if o.success() => {
                let raw = String::from_utf8_lossy(&o.stdout).trim().to_string();
                entry.bump_text_result(Some(opts.apply(raw)), false);
            }
            // spec §7 "Command errors": non-zero exit or timeout -> last_text = "ERR".
            _ => entry.bump_text_result(Some("ERR".to_string()), true),
        }
        notify(notify_write);
    });
}

fn spawn_state_run(entry: Arc<CmdEntry>, cmd: String, timeout: Duration, generation: u64, notify_write: std::os::unix::io::RawFd) {
    std::thread::spawn(move || {
        let outcome = run_shell_with_timeout(&cmd, timeout);
        *entry.state_running.lock() = false;
        if entry.state_gen.load(Ordering::SeqCst) != generation {
            return;
        }
        match outcome {
            Ok(o) if o.success() => {
                let raw = String::from_utf8_lossy(&o.stdout).trim().to_string();
                entry.bump_state_result(Some(raw), false);
            }
            // spec §7 "Command errors": non-zero exit or timeout -> last_state = "err".
            _ => entry.bump_state_result(Some("err".to_string()), true),
        }
        notify(notify_write);
    });
}

/// Owns every item's [`CmdEntry`], keyed by `(page, item_index)` (spec §3
/// Invariant 7), and runs them on a background scheduler thread.
pub struct CommandEngine {
    entries: Mutex<HashMap<String, Arc<CmdEntry>>>,
    notify_write: std::os::unix::io::RawFd,
}

impl CommandEngine {
    /// `notify_write` is the write end of a self-pipe the event loop polls
    /// alongside the device/control/HA sockets, woken whenever a command
    /// completes (spec §4.10 step "drain cmd-engine notifications").
    #[must_use]
    pub fn new(notify_write: std::os::unix::io::RawFd) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            notify_write,
        }
    }

    fn entry_for(&self, key: &str) -> Arc<CmdEntry> {
        self.entries.lock().unwrap().entry(key.to_string()).or_insert_with(|| Arc::new(CmdEntry::new())).clone()
    }

    /// Handle `$cmd.poll_start` (`every_ms > 0`, arms a recurring schedule
    /// on the entry's `poll` slot) or `$cmd.exec`/`$cmd.exec_text`
    /// (`every_ms == 0`, a one-shot capture that leaves any existing poll
    /// or state_cmd schedule on this entry untouched).
    pub fn upsert(&self, key: &str, cmd: String, every_ms: u64, opts: CmdTextOpts, timeout: Duration) -> Arc<CmdEntry> {
        let entry = self.entry_for(key);
        if every_ms > 0 {
            entry.poll_gen.fetch_add(1, Ordering::SeqCst);
            *entry.poll.lock() = Some(PollSlot { cmd, every_ms, opts, timeout });
            *entry.next_poll_ms.lock() = 0;
        } else {
            let generation = entry.poll_gen.load(Ordering::SeqCst);
            spawn_text_run(Arc::clone(&entry), cmd, opts, timeout, generation, self.notify_write);
        }
        entry
    }

    /// `$cmd.poll_stop`: clear the `poll` slot and bump its generation so
    /// an in-flight run is discarded, then clear `last_text` (but not
    /// `last_sent_text`, which is the caller's concern) so the main loop
    /// reverts to the base icon (spec §4.7).
    pub fn poll_stop(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(key).cloned() {
            entry.poll_gen.fetch_add(1, Ordering::SeqCst);
            *entry.poll.lock() = None;
            *entry.next_poll_ms.lock() = 0;
            entry.bump_text_result(None, false);
        }
    }

    /// `$cmd.exec_stop`: stop everything tracked for this item and clear
    /// both tracks' results (spec §4.7). The `CmdEntry` itself is removed
    /// so a later registration starts clean.
    pub fn exec_stop(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().remove(key) {
            entry.poll_gen.fetch_add(1, Ordering::SeqCst);
            entry.state_gen.fetch_add(1, Ordering::SeqCst);
            *entry.poll.lock() = None;
            *entry.state.lock() = None;
            entry.bump_text_result(None, false);
            entry.bump_state_result(None, false);
        }
    }

    /// `$cmd.text_clear`: clear `last_text` without touching any active
    /// schedule, so the next tick's successful run repopulates it (spec
    /// §4.7).
    pub fn text_clear(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(key).cloned() {
            entry.bump_text_result(None, false);
        }
    }

    /// Arm (or re-arm) this item's page-scoped `state_cmd` sampling (spec
    /// §4.7 "Page scope ... re-arms configured state sampling").
    pub fn set_state_cmd(&self, key: &str, cmd: String, every_ms: u64, timeout: Duration) -> Arc<CmdEntry> {
        let entry = self.entry_for(key);
        entry.state_gen.fetch_add(1, Ordering::SeqCst);
        *entry.state.lock() = Some(StateSlot { cmd, every_ms, timeout });
        *entry.next_state_ms.lock() = 0;
        entry
    }

    /// Disable this item's `state_cmd` sampling on page-leave without
    /// touching its independent `poll` slot (spec §4.7 "Page scope ...
    /// disables state_* sampling ... sets state_every_ms = 0, bumps gen,
    /// clears next").
    pub fn disable_state_cmd(&self, key: &str) {
        if let Some(entry) = self.entries.lock().unwrap().get(key).cloned() {
            entry.state_gen.fetch_add(1, Ordering::SeqCst);
            *entry.state.lock() = None;
            *entry.next_state_ms.lock() = 0;
        }
    }

    /// Look up a tracked entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<CmdEntry>> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Scan every tracked entry once and spawn a worker for any schedule
    /// (poll or state_cmd) whose deadline has elapsed and isn't currently
    /// running. Called every [`SCHEDULER_TICK`] by the event loop.
    pub fn tick(&self, now_ms: u64) {
        let entries: Vec<Arc<CmdEntry>> = self.entries.lock().unwrap().values().cloned().collect();
        for entry in entries {
            entry.maybe_run_poll(now_ms, self.notify_write);
            entry.maybe_run_state(now_ms, self.notify_write);
        }
    }
}

/// `$cmd.exec`: a detached fire-and-forget shell command not bound to any
/// item's tracked entry (spec §4.7: "detached fire-and-forget shell with
/// the given `data` as command").
pub fn exec_detached(cmd: String, timeout: Duration) {
    std::thread::spawn(move || {
        let _ = run_shell_with_timeout(&cmd, timeout);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pipe() -> (std::os::unix::io::RawFd, std::os::unix::io::RawFd) {
        let mut fds = [0i32; 2];
        unsafe {
            libc::pipe(fds.as_mut_ptr());
        }
        (fds[0], fds[1])
    }

    #[test]
    fn one_shot_exec_produces_a_result() {
        let (_r, w) = pipe();
        let engine = CommandEngine::new(w);
        let entry = engine.upsert("root:0", "echo hello".to_string(), 0, CmdTextOpts::default(), Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(150));
        let result = entry.latest_text();
        assert_eq!(result.text.as_deref(), Some("hello"));
        assert!(!result.failed);
    }

    #[test]
    fn poll_stop_invalidates_in_flight_run() {
        let (_r, w) = pipe();
        let engine = CommandEngine::new(w);
        let entry = engine.upsert(
            "root:0",
            "sleep 0.3 && echo late".to_string(),
            200,
            CmdTextOpts::default(),
            Duration::from_secs(2),
        );
        engine.tick(0);
        engine.poll_stop("root:0");
        std::thread::sleep(Duration::from_millis(450));
        let result = entry.latest_text();
        assert!(result.text.is_none());
    }

    #[test]
    fn failed_command_is_marked_failed_and_err() {
        let (_r, w) = pipe();
        let engine = CommandEngine::new(w);
        let entry = engine.upsert("root:1", "exit 1".to_string(), 0, CmdTextOpts::default(), Duration::from_secs(1));
        std::thread::sleep(Duration::from_millis(150));
        let result = entry.latest_text();
        assert!(result.failed);
        assert_eq!(result.text.as_deref(), Some("ERR"));
    }

    #[test]
    fn poll_and_state_cmd_share_one_entry_per_item() {
        let (_r, w) = pipe();
        let engine = CommandEngine::new(w);
        engine.upsert("root:2", "echo poll".to_string(), 500, CmdTextOpts::default(), Duration::from_secs(1));
        engine.set_state_cmd("root:2", "echo state".to_string(), 500, Duration::from_secs(1));
        assert_eq!(engine.entries.lock().unwrap().len(), 1);
    }

    #[test]
    fn poll_stop_on_tap_then_hold_same_item_finds_the_poll() {
        // Regression for spec §3 Invariant 7: a poll started under one
        // gesture's dispatch key must be stoppable from a different
        // gesture on the same item, since both resolve to the same
        // `(page, item_index)` entry key.
        let (_r, w) = pipe();
        let engine = CommandEngine::new(w);
        let key = "root:3";
        engine.upsert(key, "sleep 1 && echo late".to_string(), 1000, CmdTextOpts::default(), Duration::from_secs(2));
        engine.tick(0);
        engine.poll_stop(key);
        let entry = engine.get(key).unwrap();
        std::thread::sleep(Duration::from_millis(1200));
        assert!(entry.latest_text().text.is_none());
    }

    #[test]
    fn disable_state_cmd_leaves_poll_running() {
        let (_r, w) = pipe();
        let engine = CommandEngine::new(w);
        let key = "root:4";
        engine.set_state_cmd(key, "echo state".to_string(), 100, Duration::from_secs(1));
        engine.upsert(key, "echo poll".to_string(), 100, CmdTextOpts::default(), Duration::from_secs(1));
        engine.disable_state_cmd(key);
        let entry = engine.get(key).unwrap();
        assert!(entry.poll.lock().is_some());
        assert!(entry.state.lock().is_none());
    }
}
