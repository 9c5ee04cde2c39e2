//! Action and action-step types (spec §3 "Actions per event", §4.8).
//!
//! `ActionSpec` captures both shapes the YAML allows for a single
//! `tap_action`/`hold_action`/`longhold_action`/`released_action` field: a
//! single step, or a `{actions: [...]}` sequence. The legacy single-action
//! flat fields (`*_action`/`*_data`/`*_cmd_text`) are synthesized into a
//! one-element sequence by [`ActionSpec::from_legacy_fields`] so the
//! dispatcher only ever has to deal with sequences (spec §9 Open Question b).

/// One action verb.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Action {
    /// `$page.go_to <page>`.
    PageGoTo(String),
    /// `$cmd.exec`.
    CmdExec,
    /// `$cmd.exec_text`.
    CmdExecText,
    /// `$cmd.exec_stop`.
    CmdExecStop,
    /// `$cmd.poll_start`.
    CmdPollStart,
    /// `$cmd.poll_stop`.
    CmdPollStop,
    /// `$cmd.text_clear`.
    CmdTextClear,
    /// `<ha_domain>.<service>` — anything not starting with `$`.
    Ha { domain: String, service: String },
    /// Parse failure or empty string; the dispatcher treats this as a no-op
    /// and logs a warning rather than failing the whole sequence.
    #[default]
    Unknown,
}

impl Action {
    /// Parse a raw action verb string as it appears in YAML.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("$page.go_to") {
            return Self::PageGoTo(rest.trim().to_string());
        }
        match raw {
            "$cmd.exec" => return Self::CmdExec,
            "$cmd.exec_text" => return Self::CmdExecText,
            "$cmd.exec_stop" => return Self::CmdExecStop,
            "$cmd.poll_start" => return Self::CmdPollStart,
            "$cmd.poll_stop" => return Self::CmdPollStop,
            "$cmd.text_clear" => return Self::CmdTextClear,
            _ => {}
        }
        if raw.starts_with('$') {
            return Self::Unknown;
        }
        if let Some((domain, service)) = raw.split_once('.') {
            if !domain.is_empty() && !service.is_empty() {
                return Self::Ha {
                    domain: domain.to_string(),
                    service: service.to_string(),
                };
            }
        }
        Self::Unknown
    }

    /// Whether this verb is handled by the command engine rather than
    /// navigation or home-automation.
    #[must_use]
    pub const fn is_cmd_verb(&self) -> bool {
        matches!(
            self,
            Self::CmdExec
                | Self::CmdExecText
                | Self::CmdExecStop
                | Self::CmdPollStart
                | Self::CmdPollStop
                | Self::CmdTextClear
        )
    }
}

/// Options controlling how captured command text is post-processed (spec
/// §3 "`cmd_text` options").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdTextOpts {
    pub trim: bool,
    pub max_len: u16,
}

impl Default for CmdTextOpts {
    fn default() -> Self {
        Self {
            trim: true,
            max_len: 32,
        }
    }
}

impl CmdTextOpts {
    pub(crate) fn clamp(&mut self) {
        self.max_len = self.max_len.clamp(1, 256);
    }

    /// Apply trim/max_len to a captured command's stdout.
    #[must_use]
    pub fn apply(&self, mut text: String) -> String {
        if self.trim {
            text = text.trim().to_string();
        }
        let max = self.max_len as usize;
        if text.len() > max {
            // Truncate on a char boundary at or before `max` so multi-byte
            // UTF-8 sequences are never split.
            let mut cut = max;
            while cut > 0 && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

/// A single step in an action sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionStep {
    pub action: Action,
    pub data: Option<String>,
    pub cmd_text: CmdTextOpts,
}

/// The full value of a `*_action` field: either one step, or an explicit
/// `{actions: [...]}` sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSpec {
    Single(ActionStep),
    Sequence(Vec<ActionStep>),
}

impl ActionSpec {
    /// Steps to execute in order. `Single` normalizes to a one-element
    /// slice so callers never branch on the shape.
    #[must_use]
    pub fn steps(&self) -> &[ActionStep] {
        match self {
            Self::Single(step) => std::slice::from_ref(step),
            Self::Sequence(steps) => steps,
        }
    }

    /// Synthesize an `ActionSpec` from the legacy flat
    /// `action`/`data`/`cmd_text` fields, for items that never adopted the
    /// `{actions: [...]}` form (spec §9 Open Question b — both forms are
    /// honored).
    #[must_use]
    pub fn from_legacy_fields(
        action: &str,
        data: Option<String>,
        cmd_text: Option<CmdTextOpts>,
    ) -> Self {
        Self::Single(ActionStep {
            action: Action::parse(action),
            data,
            cmd_text: cmd_text.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, CmdTextOpts};

    #[test]
    fn parses_navigation() {
        assert_eq!(
            Action::parse("$page.go_to kitchen"),
            Action::PageGoTo("kitchen".to_string())
        );
    }

    #[test]
    fn parses_cmd_verbs() {
        assert_eq!(Action::parse("$cmd.poll_start"), Action::CmdPollStart);
        assert_eq!(Action::parse("$cmd.exec_text"), Action::CmdExecText);
    }

    #[test]
    fn parses_ha_call() {
        assert_eq!(
            Action::parse("light.toggle"),
            Action::Ha {
                domain: "light".to_string(),
                service: "toggle".to_string()
            }
        );
    }

    #[test]
    fn unknown_dollar_verb_is_unknown_not_panic() {
        assert_eq!(Action::parse("$cmd.nonsense"), Action::Unknown);
    }

    #[test]
    fn cmd_text_truncates_on_char_boundary() {
        let opts = CmdTextOpts {
            trim: false,
            max_len: 3,
        };
        // 4-byte emoji forces the truncation search to back off.
        let out = opts.apply("ab\u{1F600}cd".to_string());
        assert!(out.len() <= 3);
        assert!(String::from_utf8(out.into_bytes()).is_ok());
    }
}
