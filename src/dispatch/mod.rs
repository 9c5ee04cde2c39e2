//! Action dispatch: routes a `(page, item, event)` triple through the
//! item's configured action sequence (spec §4.8).

use std::time::{Duration, Instant};

use crate::core::config::{Action, ActionSpec, ActionStep, Config};
use crate::core::errors::{KeydeckError, Result};

/// Maximum depth of the page navigation history (spec §4.8 "back
/// navigation"). Oldest entries are dropped once the cap is hit.
pub const HISTORY_CAP: usize = 64;

/// Which physical gesture triggered dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    Tap,
    Hold,
    LongHold,
    Released,
}

/// Navigation history plus the currently displayed page/offset, persisted
/// across restarts via [`crate::control`] (spec §4.8, §4.11).
#[derive(Debug, Clone)]
pub struct NavState {
    stack: Vec<(String, usize)>,
    pub current_page: String,
    pub current_offset: usize,
}

impl NavState {
    #[must_use]
    pub fn new(root: &str) -> Self {
        Self {
            stack: Vec::new(),
            current_page: root.to_string(),
            current_offset: 0,
        }
    }

    /// Navigate to `page` at `offset`, pushing the previous location onto
    /// the history stack (capped at [`HISTORY_CAP`]).
    pub fn go_to(&mut self, page: &str, offset: usize) {
        self.stack.push((self.current_page.clone(), self.current_offset));
        if self.stack.len() > HISTORY_CAP {
            self.stack.remove(0);
        }
        self.current_page = page.to_string();
        self.current_offset = offset;
    }

    /// Pop the previous location and navigate there (`$page.back`). A no-op
    /// at the root of history.
    pub fn back(&mut self) -> bool {
        if let Some((page, offset)) = self.stack.pop() {
            self.current_page = page;
            self.current_offset = offset;
            true
        } else {
            false
        }
    }
}

/// Timestamp gate for the post-page-change event-ignore window (spec §4.8
/// "post transition ignore", §4.10 step 6).
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreWindow {
    ignore_until: Option<Instant>,
}

impl IgnoreWindow {
    pub fn arm(&mut self, duration: Duration) {
        self.ignore_until = Some(Instant::now() + duration);
    }

    #[must_use]
    pub fn active(&self) -> bool {
        self.ignore_until.is_some_and(|until| Instant::now() < until)
    }
}

/// Debounces repeated TAP events for the same `(page, item)` within
/// `debounce_ms` (spec §4.8). Hold/LongHold/Released events are never
/// debounced, only naked taps, since a physical tap naturally re-fires
/// while a button is briefly re-pressed.
#[derive(Debug, Default)]
pub struct TapDebouncer {
    last_tap: Option<(String, usize, Instant)>,
}

impl TapDebouncer {
    #[must_use]
    pub fn should_suppress(&mut self, page: &str, item_index: usize, debounce: Duration) -> bool {
        if let Some((last_page, last_item, at)) = &self.last_tap {
            if last_page == page && *last_item == item_index && at.elapsed() < debounce {
                return true;
            }
        }
        self.last_tap = Some((page.to_string(), item_index, Instant::now()));
        false
    }
}

/// What the caller (event loop / partial updater) should do in response to
/// dispatching one action step.
#[derive(Debug, Clone)]
pub enum DispatchEffect {
    /// Navigate to a page; caller re-renders the whole sheet.
    NavigateTo { page: String },
    /// Pop navigation history; caller re-renders the whole sheet.
    NavigateBack,
    /// Call a home-automation service.
    HaCall {
        domain: String,
        service: String,
        data_json: String,
    },
    /// Start/refresh a tracked shell command bound to this item
    /// (`$cmd.poll_start` when `every_ms > 0`; `$cmd.exec_text` one-shot
    /// text capture when `every_ms == 0`).
    CmdStart {
        key: String,
        cmd: String,
        every_ms: u64,
        opts: crate::core::config::CmdTextOpts,
    },
    /// `$cmd.exec`: run detached, fire-and-forget, with no entry and no
    /// captured text (spec §4.7).
    ExecDetached { cmd: String },
    /// `$cmd.poll_stop`: stop only the item's `poll` schedule.
    PollStop { key: String },
    /// `$cmd.exec_stop`: stop everything tracked for this item.
    ExecStop { key: String },
    /// Clear the dynamic-text overlay for this item.
    CmdTextClear { key: String },
    /// No observable effect (e.g. an `Unknown` action, intentionally
    /// ignored rather than treated as fatal — spec §4.1 "unknown `$`
    /// verbs are inert").
    None,
}

/// Dispatch one [`ActionStep`], producing the effect the caller must carry
/// out. `key` identifies the owning `(page, item_index)` for command-engine
/// bookkeeping (spec §3 Invariant 7: at most one `CmdEntry` per pair, so the
/// same key is used regardless of which gesture triggered dispatch). `poll`
/// is the owning item's configured
/// `poll: {...}` block (spec §3 "Polling"), consulted only for
/// `$cmd.poll_start` — the action step itself carries no command/interval,
/// `poll_start` is purely "copy configured poll+state into active slots"
/// (spec §4.7). A `$cmd.poll_start` with no `poll:` configured on the item
/// is inert (no command to start). `entity_id` is the owning item's bound
/// entity (spec §3 "Display"), spliced into HA call payloads per §4.8.
#[must_use]
pub fn dispatch_step(
    step: &ActionStep,
    key: &str,
    poll: Option<&crate::core::config::PollConfig>,
    entity_id: Option<&str>,
) -> DispatchEffect {
    match &step.action {
        Action::PageGoTo(page) => DispatchEffect::NavigateTo { page: page.clone() },
        Action::CmdPollStart => match poll {
            Some(poll) => DispatchEffect::CmdStart {
                key: key.to_string(),
                cmd: poll.cmd.clone(),
                every_ms: poll.every_ms,
                opts: poll.opts,
            },
            None => DispatchEffect::None,
        },
        Action::CmdExec => DispatchEffect::ExecDetached {
            cmd: step.data.clone().unwrap_or_default(),
        },
        Action::CmdExecText => DispatchEffect::CmdStart {
            key: key.to_string(),
            cmd: step.data.clone().unwrap_or_default(),
            every_ms: 0,
            opts: step.cmd_text,
        },
        Action::CmdPollStop => DispatchEffect::PollStop { key: key.to_string() },
        Action::CmdExecStop => DispatchEffect::ExecStop { key: key.to_string() },
        Action::CmdTextClear => DispatchEffect::CmdTextClear { key: key.to_string() },
        Action::Ha { domain, service } => {
            if domain == "script" {
                // `script.<entity>` is a shorthand for calling
                // `script.turn_on` with the target script's slug (carried
                // in `service`) as `entity_id` (spec §4.8 "Special case").
                let data_json = serde_json::json!({ "entity_id": format!("script.{service}") }).to_string();
                DispatchEffect::HaCall {
                    domain: "script".to_string(),
                    service: "turn_on".to_string(),
                    data_json,
                }
            } else {
                DispatchEffect::HaCall {
                    domain: domain.clone(),
                    service: service.clone(),
                    data_json: build_ha_data(step.data.as_deref(), entity_id),
                }
            }
        }
        Action::Unknown => DispatchEffect::None,
    }
}

/// Build the JSON payload for an ordinary (non-`script`) HA call (spec
/// §4.8): if `data` is a JSON object, splice `entity_id` in only when the
/// object doesn't already set it; otherwise wrap `entity_id` alone into
/// `{"entity_id": "..."}`. With no bound `entity_id`, `data` passes through
/// unchanged (or `{}` if absent).
fn build_ha_data(data: Option<&str>, entity_id: Option<&str>) -> String {
    match (data, entity_id) {
        (Some(raw), Some(entity_id)) if raw.trim_start().starts_with('{') => splice_entity_id(raw, entity_id),
        (_, Some(entity_id)) => serde_json::json!({ "entity_id": entity_id }).to_string(),
        (Some(raw), None) => raw.to_string(),
        (None, None) => "{}".to_string(),
    }
}

/// Parse `raw` as a JSON object and insert `entity_id` only if absent. If
/// `raw` isn't a JSON object after all, it's returned unchanged rather than
/// spliced into (it was already checked to start with `{` by the caller, so
/// this only matters for malformed config data).
fn splice_entity_id(raw: &str, entity_id: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.entry("entity_id").or_insert_with(|| serde_json::Value::String(entity_id.to_string()));
            serde_json::to_string(&serde_json::Value::Object(map)).unwrap_or_else(|_| raw.to_string())
        }
        _ => raw.to_string(),
    }
}

/// Dispatch every step of an `ActionSpec` in order. A `NavigateTo`/
/// `NavigateBack` effect terminates the sequence immediately: later steps
/// are dropped because `cur_page` has already changed (spec §4.8
/// "Navigation terminates the sequence", §8 "Action routing").
pub fn dispatch_spec(
    spec: &ActionSpec,
    key: &str,
    poll: Option<&crate::core::config::PollConfig>,
    entity_id: Option<&str>,
    mut on_effect: impl FnMut(DispatchEffect),
) {
    for step in spec.steps() {
        let effect = dispatch_step(step, key, poll, entity_id);
        let is_navigation = matches!(effect, DispatchEffect::NavigateTo { .. } | DispatchEffect::NavigateBack);
        on_effect(effect);
        if is_navigation {
            break;
        }
    }
}

/// Resolve a `$page.go_to` target against `config`, used by the control
/// socket's `load-last-page` and by startup's persisted-offset restore
/// (spec §4.11). Returns [`KeydeckError::UnknownPage`] if the page no
/// longer exists (e.g. config was edited since the page was last visited).
pub fn resolve_page<'a>(config: &'a Config, page: &str, from: &str) -> Result<&'a crate::core::config::Page> {
    config.page(page).ok_or_else(|| KeydeckError::UnknownPage {
        page: page.to_string(),
        from: from.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Action, ActionSpec, ActionStep};

    #[test]
    fn nav_state_back_restores_previous_location() {
        let mut nav = NavState::new("$root");
        nav.go_to("settings", 0);
        nav.go_to("settings/wifi", 1);
        assert!(nav.back());
        assert_eq!(nav.current_page, "settings");
        assert!(nav.back());
        assert_eq!(nav.current_page, "$root");
        assert!(!nav.back());
    }

    #[test]
    fn history_cap_drops_oldest() {
        let mut nav = NavState::new("$root");
        for i in 0..HISTORY_CAP + 5 {
            nav.go_to(&format!("page{i}"), 0);
        }
        let mut count = 0;
        while nav.back() {
            count += 1;
        }
        assert_eq!(count, HISTORY_CAP);
    }

    #[test]
    fn tap_debounce_suppresses_rapid_repeat() {
        let mut debouncer = TapDebouncer::default();
        let debounce = Duration::from_millis(500);
        assert!(!debouncer.should_suppress("$root", 2, debounce));
        assert!(debouncer.should_suppress("$root", 2, debounce));
    }

    #[test]
    fn tap_debounce_is_per_item() {
        let mut debouncer = TapDebouncer::default();
        let debounce = Duration::from_millis(500);
        assert!(!debouncer.should_suppress("$root", 2, debounce));
        assert!(!debouncer.should_suppress("$root", 3, debounce));
    }

    #[test]
    fn script_domain_rewrites_to_turn_on() {
        let step = ActionStep {
            action: Action::Ha {
                domain: "script".to_string(),
                service: "ignored".to_string(),
            },
            data: None,
            cmd_text: crate::core::config::CmdTextOpts::default(),
        };
        match dispatch_step(&step, "root:0:tap", None, None) {
            DispatchEffect::HaCall { domain, service, .. } => {
                assert_eq!(domain, "script");
                assert_eq!(service, "turn_on");
            }
            other => panic!("expected HaCall, got {other:?}"),
        }
    }

    #[test]
    fn sequence_stops_after_navigation() {
        let spec = ActionSpec::Sequence(vec![
            ActionStep {
                action: Action::PageGoTo("a".to_string()),
                data: None,
                cmd_text: crate::core::config::CmdTextOpts::default(),
            },
            ActionStep {
                action: Action::PageGoTo("b".to_string()),
                data: None,
                cmd_text: crate::core::config::CmdTextOpts::default(),
            },
        ]);
        let mut seen = Vec::new();
        dispatch_spec(&spec, "root:0:tap", None, None, |effect| {
            if let DispatchEffect::NavigateTo { page } = effect {
                seen.push(page);
            }
        });
        assert_eq!(seen, vec!["a".to_string()]);
    }

    #[test]
    fn sequence_runs_every_step_when_no_navigation() {
        let spec = ActionSpec::Sequence(vec![
            ActionStep {
                action: Action::CmdExec,
                data: Some("echo one".to_string()),
                cmd_text: crate::core::config::CmdTextOpts::default(),
            },
            ActionStep {
                action: Action::CmdExec,
                data: Some("echo two".to_string()),
                cmd_text: crate::core::config::CmdTextOpts::default(),
            },
        ]);
        let mut seen = 0;
        dispatch_spec(&spec, "root:0:tap", None, None, |effect| {
            if matches!(effect, DispatchEffect::ExecDetached { .. }) {
                seen += 1;
            }
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn script_domain_carries_service_slug_as_entity_id() {
        let step = ActionStep {
            action: Action::Ha {
                domain: "script".to_string(),
                service: "wake_up_house".to_string(),
            },
            data: None,
            cmd_text: crate::core::config::CmdTextOpts::default(),
        };
        match dispatch_step(&step, "root:0:tap", None, None) {
            DispatchEffect::HaCall { data_json, .. } => {
                assert_eq!(data_json, r#"{"entity_id":"script.wake_up_house"}"#);
            }
            other => panic!("expected HaCall, got {other:?}"),
        }
    }

    #[test]
    fn ha_call_without_data_wraps_bound_entity_id() {
        let step = ActionStep {
            action: Action::Ha {
                domain: "light".to_string(),
                service: "toggle".to_string(),
            },
            data: None,
            cmd_text: crate::core::config::CmdTextOpts::default(),
        };
        match dispatch_step(&step, "root:0:tap", None, Some("light.kitchen")) {
            DispatchEffect::HaCall { data_json, .. } => {
                assert_eq!(data_json, r#"{"entity_id":"light.kitchen"}"#);
            }
            other => panic!("expected HaCall, got {other:?}"),
        }
    }

    #[test]
    fn ha_call_splices_entity_id_into_object_data_when_absent() {
        let step = ActionStep {
            action: Action::Ha {
                domain: "light".to_string(),
                service: "turn_on".to_string(),
            },
            data: Some(r#"{"brightness": 128}"#.to_string()),
            cmd_text: crate::core::config::CmdTextOpts::default(),
        };
        match dispatch_step(&step, "root:0:tap", None, Some("light.kitchen")) {
            DispatchEffect::HaCall { data_json, .. } => {
                let parsed: serde_json::Value = serde_json::from_str(&data_json).unwrap();
                assert_eq!(parsed["brightness"], 128);
                assert_eq!(parsed["entity_id"], "light.kitchen");
            }
            other => panic!("expected HaCall, got {other:?}"),
        }
    }

    #[test]
    fn ha_call_does_not_override_explicit_entity_id_in_data() {
        let step = ActionStep {
            action: Action::Ha {
                domain: "light".to_string(),
                service: "turn_on".to_string(),
            },
            data: Some(r#"{"entity_id": "light.other"}"#.to_string()),
            cmd_text: crate::core::config::CmdTextOpts::default(),
        };
        match dispatch_step(&step, "root:0:tap", None, Some("light.kitchen")) {
            DispatchEffect::HaCall { data_json, .. } => {
                let parsed: serde_json::Value = serde_json::from_str(&data_json).unwrap();
                assert_eq!(parsed["entity_id"], "light.other");
            }
            other => panic!("expected HaCall, got {other:?}"),
        }
    }
}
