//! Configuration data model: presets, pages, items, and the process-wide
//! [`Config`] snapshot loaded once at startup (spec §3, §4.1).
//!
//! This module holds only data and defaults; YAML parsing and validation
//! live in [`loader`], action-step parsing lives in [`action`].

pub mod action;
pub mod loader;

use std::collections::HashMap;

pub use action::{Action, ActionSpec, ActionStep, CmdTextOpts};

/// An `(x, y)` offset, parsed from either a YAML mapping or the compact
/// `"x,y"` scalar form spec §4.1 documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset {
    pub x: i32,
    pub y: i32,
}

/// Text alignment within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextAlign {
    Top,
    #[default]
    Center,
    Bottom,
}

impl TextAlign {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "top" => Some(Self::Top),
            "center" => Some(Self::Center),
            "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }
}

/// Styling envelope applied to an item's rendering (spec §3 "Preset").
#[derive(Debug, Clone, PartialEq)]
pub struct Preset {
    pub background: String,
    pub border_radius: u8,
    pub border_size: u8,
    pub border_width: u8,
    pub border_color: String,
    pub icon_size: u8,
    pub icon_padding: u8,
    pub icon_offset: Offset,
    pub icon_brightness: u8,
    pub icon_color: Option<String>,
    pub text_color: String,
    pub text_align: TextAlign,
    pub text_font: Option<String>,
    pub text_size: u8,
    pub text_offset: Offset,
}

impl Default for Preset {
    fn default() -> Self {
        Self {
            background: "#000000".to_string(),
            border_radius: 0,
            border_size: 196,
            border_width: 0,
            border_color: "#000000".to_string(),
            icon_size: 0,
            icon_padding: 0,
            icon_offset: Offset::default(),
            icon_brightness: 99,
            icon_color: None,
            text_color: "#ffffff".to_string(),
            text_align: TextAlign::default(),
            text_font: None,
            text_size: 14,
            text_offset: Offset::default(),
        }
    }
}

impl Preset {
    /// Clamp every numeric field into the ranges spec §3 documents. Called
    /// once at load time so nothing downstream needs to re-validate.
    pub(crate) fn clamp(&mut self) {
        self.border_radius = self.border_radius.min(50);
        self.border_size = self.border_size.clamp(98, 196);
        self.border_width = self.border_width.min(98);
        self.icon_size = self.icon_size.min(196);
        self.icon_brightness = self.icon_brightness.clamp(1, 99);
        self.text_size = self.text_size.clamp(1, 64);
    }
}

/// Where an item's icon comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IconSpec {
    /// `mdi:<slug>` — fetched once and rendered via the icon pipeline.
    Mdi(String),
    /// `local:<path>` — a file already on disk.
    Local(String),
    /// `url:<url>` — fetched via the external download tool.
    Url(String),
}

impl IconSpec {
    pub(crate) fn parse(raw: &str) -> Option<Self> {
        if let Some(slug) = raw.strip_prefix("mdi:") {
            Some(Self::Mdi(slug.to_string()))
        } else if let Some(path) = raw.strip_prefix("local:") {
            Some(Self::Local(path.to_string()))
        } else if let Some(url) = raw.strip_prefix("url:") {
            Some(Self::Url(url.to_string()))
        } else {
            None
        }
    }
}

/// A periodic text-capture or state poll bound to an item (spec §3 "Polling").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PollConfig {
    pub every_ms: u64,
    pub action: Action,
    pub cmd: String,
    pub opts: CmdTextOpts,
}

/// A periodic command that prints a state key, bound to an item instead of
/// an `entity_id` (spec §3 "State binding").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateCmdConfig {
    pub cmd: String,
    pub every_ms: u64,
}

/// One entry of an item's `states:` map — the rendering overrides applied
/// when the item's current state key matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateVariant {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub text: Option<String>,
    pub presets: Vec<String>,
}

/// Wallpaper settings, usable globally or per-page (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Wallpaper {
    pub path: String,
    pub quality: u8,
    pub magnify: u16,
    pub dithering: bool,
}

impl Wallpaper {
    pub(crate) fn clamp(&mut self) {
        self.quality = self.quality.clamp(10, 100);
        self.magnify = self.magnify.clamp(10, 300);
    }
}

/// One configurable button (spec §3 "Item").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Item {
    pub name: Option<String>,
    pub icon: Option<IconSpec>,
    pub text: Option<String>,
    pub presets: Vec<String>,
    pub tap_action: Option<ActionSpec>,
    pub hold_action: Option<ActionSpec>,
    pub longhold_action: Option<ActionSpec>,
    pub released_action: Option<ActionSpec>,
    pub poll: Option<PollConfig>,
    pub entity_id: Option<String>,
    pub state_cmd: Option<StateCmdConfig>,
    pub states: HashMap<String, StateVariant>,
}

// `IconSpec`/`ActionSpec`/`Action`/`PollConfig` already derive the traits
// `Item`'s `#[derive(Default, PartialEq, Eq)]` needs; kept minimal here
// since equality is only used by tests comparing parsed fixtures.

/// A named page: a flat list of items plus an optional wallpaper override
/// (spec §3 "Page"). Page order is config order, preserved by `Config`
/// storing pages in a `Vec` rather than a `HashMap`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub name: String,
    pub items: Vec<Item>,
    pub wallpaper: Option<Wallpaper>,
}

/// Reserved system-button positions (spec §3 Invariant 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemPositions {
    pub back: u8,
    pub prev: u8,
    pub next: u8,
}

impl Default for SystemPositions {
    fn default() -> Self {
        Self {
            back: 1,
            prev: 2,
            next: 13,
        }
    }
}

/// Process-wide immutable-after-load configuration snapshot (spec §3
/// "Config"). Everything here is resolved at load time; nothing downstream
/// needs to re-read the YAML document.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub system: SystemPositions,
    pub base_brightness: u8,
    pub sleep_dim_brightness: u8,
    pub sleep_dim_timeout_sec: u64,
    pub sleep_timeout_sec: u64,
    pub cmd_timeout_ms: u64,
    pub debounce_ms: u64,
    pub post_page_change_ignore_ms: u64,
    pub wallpaper: Option<Wallpaper>,
    pub presets: HashMap<String, Preset>,
    pub pages: Vec<Page>,
}

/// Name of the page every config must define (spec §3 Invariant 1).
pub const ROOT_PAGE: &str = "$root";

impl Default for Config {
    fn default() -> Self {
        let mut presets = HashMap::new();
        presets.insert("default".to_string(), Preset::default());
        Self {
            system: SystemPositions::default(),
            base_brightness: 60,
            sleep_dim_brightness: 20,
            sleep_dim_timeout_sec: 0,
            sleep_timeout_sec: 0,
            cmd_timeout_ms: 3000,
            debounce_ms: 300,
            post_page_change_ignore_ms: 300,
            wallpaper: None,
            presets,
            pages: Vec::new(),
        }
    }
}

impl Config {
    /// Look up a page by name.
    #[must_use]
    pub fn page(&self, name: &str) -> Option<&Page> {
        self.pages.iter().find(|p| p.name == name)
    }

    /// Look up a preset by name, falling back to the implicit `default`
    /// preset if the name is unknown (never panics: `default` is always
    /// present after [`loader::load`] runs).
    #[must_use]
    pub fn preset(&self, name: &str) -> &Preset {
        self.presets
            .get(name)
            .or_else(|| self.presets.get("default"))
            .expect("default preset always present after load")
    }

    /// The root page. Only valid after [`loader::load`] has validated
    /// Invariant 1.
    #[must_use]
    pub fn root(&self) -> &Page {
        self.page(ROOT_PAGE).expect("loader guarantees $root exists")
    }
}
