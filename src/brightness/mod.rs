//! Brightness state machine: NORMAL / DIM / SLEEP, timer-driven (spec
//! §4.9).

use std::time::{Duration, Instant};

/// The three brightness states a deck can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrightnessState {
    Normal,
    Dim,
    Sleep,
}

/// Tracks activity timers and the currently applied brightness, deciding
/// when a transition is due. The event loop calls [`Self::tick`] once per
/// iteration and applies [`Self::pending_level`] via `set-brightness` when
/// it changes.
pub struct BrightnessMachine {
    state: BrightnessState,
    last_activity: Instant,
    base: u8,
    dim: u8,
    dim_timeout: Option<Duration>,
    sleep_timeout: Option<Duration>,
    last_set_attempt: Option<Instant>,
    last_set_failed: bool,
    last_sent_level: Option<u8>,
}

/// Retry backoff after a failed `set-brightness` send (spec §4.9 "retry no
/// sooner than 1s on failure").
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

impl BrightnessMachine {
    /// `dim_timeout_sec`/`sleep_timeout_sec` of `0` disable that stage
    /// entirely (spec §3 "sleep_dim_timeout_sec"/"sleep_timeout_sec": "0
    /// disables").
    #[must_use]
    pub fn new(base: u8, dim: u8, dim_timeout_sec: u64, sleep_timeout_sec: u64) -> Self {
        Self {
            state: BrightnessState::Normal,
            last_activity: Instant::now(),
            base,
            dim,
            dim_timeout: (dim_timeout_sec > 0).then(|| Duration::from_secs(dim_timeout_sec)),
            sleep_timeout: (sleep_timeout_sec > 0).then(|| Duration::from_secs(sleep_timeout_sec)),
            last_set_attempt: None,
            last_set_failed: false,
            last_sent_level: None,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BrightnessState {
        self.state
    }

    /// Reset the idle timer and return to NORMAL. Called on any button
    /// event, HA-driven state change, or page navigation (spec §4.9 "any
    /// activity wakes the deck without triggering its action" — the
    /// caller decides separately whether to also dispatch the button's
    /// action, see spec §4.9 "wake-without-action").
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.state = BrightnessState::Normal;
    }

    /// Whether the *next* button event, while in DIM or SLEEP, should only
    /// wake the deck rather than also dispatch its configured action (spec
    /// §4.9 "wake-without-action": the first tap after sleeping just turns
    /// the screen back on).
    #[must_use]
    pub fn wakes_without_action(&self) -> bool {
        self.state != BrightnessState::Normal
    }

    /// Advance the idle timer; returns the new state if it changed.
    pub fn tick(&mut self) -> Option<BrightnessState> {
        let idle = self.last_activity.elapsed();
        let next = match self.state {
            BrightnessState::Normal => {
                if self.sleep_timeout.is_some_and(|t| idle >= t) {
                    BrightnessState::Sleep
                } else if self.dim_timeout.is_some_and(|t| idle >= t) {
                    BrightnessState::Dim
                } else {
                    BrightnessState::Normal
                }
            }
            BrightnessState::Dim => {
                if self.sleep_timeout.is_some_and(|t| idle >= t) {
                    BrightnessState::Sleep
                } else {
                    BrightnessState::Dim
                }
            }
            BrightnessState::Sleep => BrightnessState::Sleep,
        };
        if next == self.state {
            None
        } else {
            self.state = next;
            Some(next)
        }
    }

    /// The brightness level that should be applied for the current state.
    /// SLEEP maps to 0 (display fully off); spec §4.9 only names base/dim
    /// explicitly, SLEEP's 0 is implied by "turn the display off".
    #[must_use]
    pub fn pending_level(&self) -> u8 {
        match self.state {
            BrightnessState::Normal => self.base,
            BrightnessState::Dim => self.dim,
            BrightnessState::Sleep => 0,
        }
    }

    /// Whether a `set-brightness` send is due right now: the pending level
    /// differs from what was last successfully sent, or the previous
    /// attempt failed and the 1s backoff has elapsed.
    #[must_use]
    pub fn send_due(&self) -> bool {
        if self.last_sent_level != Some(self.pending_level()) {
            return match self.last_set_attempt {
                None => true,
                Some(_) if !self.last_set_failed => true,
                Some(at) => at.elapsed() >= RETRY_BACKOFF,
            };
        }
        match self.last_set_attempt {
            Some(at) if self.last_set_failed => at.elapsed() >= RETRY_BACKOFF,
            _ => false,
        }
    }

    /// Record the outcome of a `set-brightness` send attempt for the
    /// current [`Self::pending_level`].
    pub fn record_send_outcome(&mut self, succeeded: bool) {
        self.last_set_attempt = Some(Instant::now());
        self.last_set_failed = !succeeded;
        if succeeded {
            self.last_sent_level = Some(self.pending_level());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_normal_to_dim_to_sleep() {
        let mut machine = BrightnessMachine::new(60, 20, 0, 0);
        // No timeouts configured: ticking never transitions.
        assert_eq!(machine.tick(), None);
        assert_eq!(machine.state(), BrightnessState::Normal);
    }

    #[test]
    fn zero_timeout_disables_stage() {
        let machine = BrightnessMachine::new(60, 20, 0, 5);
        assert_eq!(machine.pending_level(), 60);
    }

    #[test]
    fn activity_resets_to_normal() {
        let mut machine = BrightnessMachine::new(60, 20, 1, 2);
        machine.state = BrightnessState::Sleep;
        machine.record_activity();
        assert_eq!(machine.state(), BrightnessState::Normal);
    }

    #[test]
    fn wakes_without_action_only_when_not_normal() {
        let mut machine = BrightnessMachine::new(60, 20, 1, 2);
        assert!(!machine.wakes_without_action());
        machine.state = BrightnessState::Dim;
        assert!(machine.wakes_without_action());
    }

    #[test]
    fn send_due_respects_backoff_after_failure() {
        let mut machine = BrightnessMachine::new(60, 20, 0, 0);
        assert!(machine.send_due());
        machine.record_send_outcome(false);
        assert!(!machine.send_due());
    }

    #[test]
    fn send_not_due_again_after_success() {
        let mut machine = BrightnessMachine::new(60, 20, 0, 0);
        machine.record_send_outcome(true);
        assert!(!machine.send_due());
    }

    #[test]
    fn send_due_again_after_level_changes() {
        let mut machine = BrightnessMachine::new(60, 20, 0, 0);
        machine.record_send_outcome(true);
        assert!(!machine.send_due());
        machine.state = BrightnessState::Dim;
        assert!(machine.send_due());
        machine.record_send_outcome(true);
        assert!(!machine.send_due());
        machine.state = BrightnessState::Sleep;
        assert!(machine.send_due());
    }

    #[test]
    fn sleep_level_is_zero() {
        let mut machine = BrightnessMachine::new(60, 20, 0, 0);
        machine.state = BrightnessState::Sleep;
        assert_eq!(machine.pending_level(), 0);
    }
}
