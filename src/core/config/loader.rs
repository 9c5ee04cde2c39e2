//! YAML config loading, defaulting, and validation (spec §4.1, §6).
//!
//! The binding is a small handwritten schema over `serde_yaml::Value`
//! rather than a single `#[derive(Deserialize)]` tree: the scalar-or-sequence
//! polymorphism (`presets: name | [name, ...]`), the `"x,y"` offset scalar,
//! and the `true/false/yes/no/on/off/1/0` boolean coercion spec §4.1
//! documents don't map cleanly onto derive macros, and keeping the logic
//! here (rather than on the data types in `mod.rs`) keeps the types free of
//! any particular parser's node model, per spec §9 Design Notes.

use std::collections::HashMap;
use std::path::Path;

use serde_yaml::{Mapping, Value};

use super::{
    Action, ActionSpec, ActionStep, CmdTextOpts, Config, IconSpec, Item, Offset, Page,
    PollConfig, Preset, ROOT_PAGE, StateCmdConfig, StateVariant, SystemPositions, TextAlign,
    Wallpaper,
};
use crate::core::errors::{KeydeckError, Result};

/// Load and fully validate a config file.
///
/// # Errors
/// Returns [`KeydeckError::MissingConfig`] if the file cannot be read,
/// [`KeydeckError::ConfigParse`] if the YAML fails to parse or a value is
/// out of range in a way that cannot be clamped, and
/// [`KeydeckError::InvalidConfig`] if an Invariant from spec §3 is violated
/// (most importantly: missing `$root`).
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).map_err(|_| KeydeckError::MissingConfig {
        path: path.to_path_buf(),
    })?;
    load_str(&text)
}

/// Load from an in-memory YAML document (used by tests and `--dump-config`
/// round-tripping).
///
/// # Errors
/// See [`load`].
pub fn load_str(text: &str) -> Result<Config> {
    let root: Value = serde_yaml::from_str(text)?;
    let root = root.as_mapping().ok_or_else(|| KeydeckError::InvalidConfig {
        details: "top-level YAML document must be a mapping".to_string(),
    })?;

    let mut config = Config::default();

    if let Some(v) = get(root, "brightness") {
        config.base_brightness = as_u8(v).unwrap_or(config.base_brightness);
    }
    if let Some(sleep) = get(root, "sleep").and_then(Value::as_mapping) {
        if let Some(v) = get(sleep, "dim_brightness") {
            config.sleep_dim_brightness = as_u8(v).unwrap_or(config.sleep_dim_brightness);
        }
        if let Some(v) = get(sleep, "dim_timeout") {
            config.sleep_dim_timeout_sec = as_u64(v).unwrap_or(0);
        }
        if let Some(v) = get(sleep, "sleep_timeout") {
            config.sleep_timeout_sec = as_u64(v).unwrap_or(0);
        }
    }
    if let Some(v) = get(root, "cmd_timeout_ms") {
        config.cmd_timeout_ms = as_u64(v).unwrap_or(config.cmd_timeout_ms);
    }
    if let Some(v) = get(root, "debounce_ms") {
        config.debounce_ms = as_u64(v).unwrap_or(config.debounce_ms);
    }
    if let Some(v) = get(root, "post_page_change_ignore_ms") {
        config.post_page_change_ignore_ms = as_u64(v).unwrap_or(config.post_page_change_ignore_ms);
    }
    if let Some(v) = get(root, "wallpaper") {
        config.wallpaper = parse_wallpaper(v);
    }
    if let Some(sb) = get(root, "system_buttons").and_then(Value::as_mapping) {
        config.system = parse_system_positions(sb, config.system);
    }
    if let Some(presets) = get(root, "presets").and_then(Value::as_mapping) {
        for (k, v) in presets {
            let Some(name) = k.as_str() else { continue };
            if let Some(mapping) = v.as_mapping() {
                let mut preset = Preset::default();
                apply_preset_fields(mapping, &mut preset);
                preset.clamp();
                config.presets.insert(name.to_string(), preset);
            }
        }
    }
    if let Some(pages) = get(root, "pages").and_then(Value::as_mapping) {
        for (k, v) in pages {
            let Some(name) = k.as_str() else { continue };
            if let Some(mapping) = v.as_mapping() {
                config.pages.push(parse_page(name, mapping)?);
            }
        }
    }

    validate(&config)?;
    Ok(config)
}

// ──────────────────── validation ────────────────────

fn validate(config: &Config) -> Result<()> {
    if config.page(ROOT_PAGE).is_none() {
        return Err(KeydeckError::InvalidConfig {
            details: format!("missing required page `{ROOT_PAGE}`"),
        });
    }
    let positions = [config.system.back, config.system.prev, config.system.next];
    let mut seen = std::collections::HashSet::new();
    for p in positions {
        if !(1..=13).contains(&p) {
            return Err(KeydeckError::InvalidConfig {
                details: format!("system button position {p} out of range 1..13"),
            });
        }
        if !seen.insert(p) {
            return Err(KeydeckError::InvalidConfig {
                details: "reserved system button positions must be disjoint".to_string(),
            });
        }
    }
    for page in &config.pages {
        for step_holder in page.items.iter().flat_map(Item::action_specs) {
            for step in step_holder.steps() {
                if let Action::PageGoTo(target) = &step.action {
                    if !target.is_empty() && config.page(target).is_none() {
                        return Err(KeydeckError::UnknownPage {
                            page: target.clone(),
                            from: page.name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// ──────────────────── scalar helpers ────────────────────

fn get<'a>(mapping: &'a Mapping, key: &str) -> Option<&'a Value> {
    mapping.get(Value::String(key.to_string()))
}

/// Boolean coercion per spec §4.1: `true/false/yes/no/on/off/1/0`.
fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Some(true),
            "false" | "no" | "off" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64().or_else(|| n.as_i64().map(|i| i.max(0) as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn as_u8(v: &Value) -> Option<u8> {
    as_u64(v).map(|n| u8::try_from(n).unwrap_or(u8::MAX))
}

fn as_u16(v: &Value) -> Option<u16> {
    as_u64(v).map(|n| u16::try_from(n).unwrap_or(u16::MAX))
}

fn as_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse an offset: either a mapping `{x, y}` or the compact `"x,y"` scalar
/// form spec §4.1 documents.
fn as_offset(v: &Value) -> Option<Offset> {
    if let Some(mapping) = v.as_mapping() {
        let x = get(mapping, "x").and_then(as_u64).unwrap_or(0) as i32;
        let y = get(mapping, "y").and_then(as_u64).unwrap_or(0) as i32;
        return Some(Offset { x, y });
    }
    let s = v.as_str()?;
    let (x, y) = s.split_once(',')?;
    Some(Offset {
        x: x.trim().parse().ok()?,
        y: y.trim().parse().ok()?,
    })
}

/// `presets: name | [name, ...]` scalar-or-sequence polymorphism (spec §6,
/// §9 Design Notes).
fn as_string_list(v: &Value) -> Vec<String> {
    match v {
        Value::String(s) => vec![s.clone()],
        Value::Sequence(seq) => seq.iter().filter_map(as_str).collect(),
        _ => Vec::new(),
    }
}

// ──────────────────── structured sections ────────────────────

fn parse_system_positions(mapping: &Mapping, mut current: SystemPositions) -> SystemPositions {
    if let Some(v) = get(mapping, "$page.back").and_then(Value::as_mapping) {
        if let Some(p) = get(v, "position").and_then(as_u8) {
            current.back = p;
        }
    }
    if let Some(v) = get(mapping, "$page.previous").and_then(Value::as_mapping) {
        if let Some(p) = get(v, "position").and_then(as_u8) {
            current.prev = p;
        }
    }
    if let Some(v) = get(mapping, "$page.next").and_then(Value::as_mapping) {
        if let Some(p) = get(v, "position").and_then(as_u8) {
            current.next = p;
        }
    }
    current
}

fn parse_wallpaper(v: &Value) -> Option<Wallpaper> {
    let mapping = v.as_mapping()?;
    let path = get(mapping, "path").and_then(as_str)?;
    let mut wp = Wallpaper {
        path,
        quality: get(mapping, "quality").and_then(as_u8).unwrap_or(85),
        magnify: get(mapping, "magnify").and_then(as_u16).unwrap_or(100),
        dithering: get(mapping, "dithering").and_then(as_bool).unwrap_or(false),
    };
    wp.clamp();
    Some(wp)
}

fn apply_preset_fields(mapping: &Mapping, preset: &mut Preset) {
    if let Some(v) = get(mapping, "background").and_then(as_str) {
        preset.background = v;
    }
    if let Some(v) = get(mapping, "border_radius").and_then(as_u8) {
        preset.border_radius = v;
    }
    if let Some(v) = get(mapping, "border_size").and_then(as_u8) {
        preset.border_size = v;
    }
    if let Some(v) = get(mapping, "border_width").and_then(as_u8) {
        preset.border_width = v;
    }
    if let Some(v) = get(mapping, "border_color").and_then(as_str) {
        preset.border_color = v;
    }
    if let Some(v) = get(mapping, "icon_size").and_then(as_u8) {
        preset.icon_size = v;
    }
    if let Some(v) = get(mapping, "icon_padding").and_then(as_u8) {
        preset.icon_padding = v;
    }
    if let Some(v) = get(mapping, "icon_offset").and_then(as_offset) {
        preset.icon_offset = v;
    }
    if let Some(v) = get(mapping, "icon_brightness").and_then(as_u8) {
        preset.icon_brightness = v;
    }
    if let Some(v) = get(mapping, "icon_color").and_then(as_str) {
        preset.icon_color = Some(v);
    }
    if let Some(v) = get(mapping, "text_color").and_then(as_str) {
        preset.text_color = v;
    }
    if let Some(v) = get(mapping, "text_align").and_then(Value::as_str) {
        if let Some(a) = TextAlign::parse(v) {
            preset.text_align = a;
        }
    }
    if let Some(v) = get(mapping, "text_font").and_then(as_str) {
        preset.text_font = Some(v);
    }
    if let Some(v) = get(mapping, "text_size").and_then(as_u8) {
        preset.text_size = v;
    }
    if let Some(v) = get(mapping, "text_offset").and_then(as_offset) {
        preset.text_offset = v;
    }
}

fn parse_page(name: &str, mapping: &Mapping) -> Result<Page> {
    let mut items = Vec::new();
    if let Some(buttons) = get(mapping, "buttons").and_then(Value::as_sequence) {
        for button in buttons {
            if let Some(m) = button.as_mapping() {
                items.push(parse_item(m));
            }
        }
    }
    let wallpaper = get(mapping, "wallpaper").and_then(parse_wallpaper);
    Ok(Page {
        name: name.to_string(),
        items,
        wallpaper,
    })
}

fn parse_action_spec(v: &Value) -> Option<ActionSpec> {
    if let Some(s) = v.as_str() {
        return Some(ActionSpec::from_legacy_fields(s, None, None));
    }
    let mapping = v.as_mapping()?;
    if let Some(seq) = get(mapping, "actions").and_then(Value::as_sequence) {
        let steps = seq.iter().filter_map(parse_action_step).collect();
        return Some(ActionSpec::Sequence(steps));
    }
    parse_action_step(v).map(ActionSpec::Single)
}

fn parse_action_step(v: &Value) -> Option<ActionStep> {
    let mapping = v.as_mapping()?;
    let action_raw = get(mapping, "action").and_then(Value::as_str)?;
    let data = get(mapping, "data").and_then(as_str);
    let cmd_text = get(mapping, "cmd_text").and_then(Value::as_mapping).map(|m| {
        let mut opts = CmdTextOpts::default();
        if let Some(v) = get(m, "trim").and_then(as_bool) {
            opts.trim = v;
        }
        if let Some(v) = get(m, "max_len").and_then(as_u16) {
            opts.max_len = v;
        }
        opts.clamp();
        opts
    });
    Some(ActionStep {
        action: Action::parse(action_raw),
        data,
        cmd_text: cmd_text.unwrap_or_default(),
    })
}

fn parse_poll(mapping: &Mapping) -> Option<PollConfig> {
    let every_ms = get(mapping, "every_ms").and_then(as_u64)?;
    let action_raw = get(mapping, "action").and_then(Value::as_str).unwrap_or("$cmd.exec_text");
    let action = Action::parse(action_raw);
    let data = get(mapping, "data").and_then(Value::as_mapping);
    let cmd = data
        .and_then(|m| get(m, "cmd"))
        .and_then(as_str)
        .unwrap_or_default();
    let mut opts = CmdTextOpts::default();
    if let Some(m) = data {
        if let Some(v) = get(m, "trim").and_then(as_bool) {
            opts.trim = v;
        }
        if let Some(v) = get(m, "max_len").and_then(as_u16) {
            opts.max_len = v;
        }
    }
    opts.clamp();
    Some(PollConfig {
        every_ms,
        action,
        cmd,
        opts,
    })
}

fn parse_item(mapping: &Mapping) -> Item {
    let mut item = Item::default();
    item.name = get(mapping, "name").and_then(as_str);
    item.icon = get(mapping, "icon")
        .and_then(Value::as_str)
        .and_then(IconSpec::parse);
    item.text = get(mapping, "text").and_then(as_str);
    item.presets = get(mapping, "presets")
        .or_else(|| get(mapping, "preset"))
        .map(as_string_list)
        .unwrap_or_default();
    item.tap_action = get(mapping, "tap_action").and_then(parse_action_spec);
    item.hold_action = get(mapping, "hold_action").and_then(parse_action_spec);
    item.longhold_action = get(mapping, "longhold_action").and_then(parse_action_spec);
    item.released_action = get(mapping, "released_action").and_then(parse_action_spec);
    item.poll = get(mapping, "poll").and_then(Value::as_mapping).and_then(parse_poll);
    item.entity_id = get(mapping, "entity_id").and_then(as_str);
    item.state_cmd = get(mapping, "state_cmd").and_then(Value::as_mapping).and_then(|m| {
        Some(StateCmdConfig {
            cmd: get(m, "cmd").and_then(as_str)?,
            every_ms: get(m, "every_ms").and_then(as_u64).unwrap_or(1000),
        })
    });
    if let Some(states) = get(mapping, "states").and_then(Value::as_mapping) {
        for (k, v) in states {
            let Some(key) = k.as_str() else { continue };
            if let Some(m) = v.as_mapping() {
                item.states.insert(
                    key.to_string(),
                    StateVariant {
                        name: get(m, "name").and_then(as_str),
                        icon: get(m, "icon").and_then(as_str),
                        text: get(m, "text").and_then(as_str),
                        presets: get(m, "presets")
                            .or_else(|| get(m, "preset"))
                            .map(as_string_list)
                            .unwrap_or_default(),
                    },
                );
            }
        }
    }
    item
}

impl Item {
    fn action_specs(&self) -> impl Iterator<Item = &ActionSpec> {
        [
            &self.tap_action,
            &self.hold_action,
            &self.longhold_action,
            &self.released_action,
        ]
        .into_iter()
        .filter_map(|x| x.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::load_str;
    use crate::core::config::{Action, ROOT_PAGE};

    const MINIMAL: &str = r"
pages:
  $root:
    buttons:
      - name: Light
        entity_id: light.kitchen
        tap_action: light.toggle
";

    #[test]
    fn loads_minimal_root() {
        let config = load_str(MINIMAL).expect("should parse");
        let root = config.page(ROOT_PAGE).expect("$root present");
        assert_eq!(root.items.len(), 1);
        assert_eq!(root.items[0].entity_id.as_deref(), Some("light.kitchen"));
    }

    #[test]
    fn missing_root_is_fatal() {
        let err = load_str("pages:\n  other:\n    buttons: []\n").unwrap_err();
        assert_eq!(err.code(), "KD-1001");
    }

    #[test]
    fn navigation_target_must_exist() {
        let yaml = r"
pages:
  $root:
    buttons:
      - name: Go
        tap_action: $page.go_to missing
";
        let err = load_str(yaml).unwrap_err();
        assert_eq!(err.code(), "KD-1004");
    }

    #[test]
    fn boolean_coercion_accepts_yes_no() {
        let yaml = r"
wallpaper:
  path: /tmp/wp.png
  dithering: yes
pages:
  $root:
    buttons: []
";
        let config = load_str(yaml).expect("parses");
        assert!(config.wallpaper.unwrap().dithering);
    }

    #[test]
    fn scalar_or_sequence_presets() {
        let yaml = r"
pages:
  $root:
    buttons:
      - name: A
        presets: solo
      - name: B
        presets: [one, two]
";
        let config = load_str(yaml).expect("parses");
        let root = config.page(ROOT_PAGE).unwrap();
        assert_eq!(root.items[0].presets, vec!["solo".to_string()]);
        assert_eq!(
            root.items[1].presets,
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn action_sequence_is_parsed_in_order() {
        let yaml = r"
pages:
  $root:
    buttons:
      - name: Combo
        tap_action:
          actions:
            - action: light.turn_on
              data: '{\"brightness\": 200}'
            - action: $page.go_to $root
";
        let config = load_str(yaml).expect("parses");
        let steps = config
            .page(ROOT_PAGE)
            .unwrap()
            .items[0]
            .tap_action
            .as_ref()
            .unwrap()
            .steps();
        assert_eq!(steps.len(), 2);
        assert!(matches!(steps[1].action, Action::PageGoTo(_)));
    }
}
