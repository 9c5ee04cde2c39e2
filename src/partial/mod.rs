//! Partial updater: recomputes one button's tile after a state/text change
//! without re-rendering the whole sheet (spec §4.12).

use std::path::PathBuf;

use crate::cache::wallpaper::{WallpaperCache, WallpaperSignature};
use crate::cache::ContentCache;
use crate::core::config::Wallpaper;

/// What changed about an item since its last render, driving how much
/// work [`plan_update`] schedules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeSet {
    pub state_changed: bool,
    pub text_changed: bool,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(self) -> bool {
        !self.state_changed && !self.text_changed
    }
}

/// Tracks the last text/state sent to the device for one button, so a
/// partial update is skipped when nothing actually changed (spec §4.12
/// "no-op suppression").
#[derive(Debug, Clone, Default)]
pub struct SentTileMemo {
    pub last_sent_state: Option<String>,
    pub last_sent_text: Option<String>,
}

impl SentTileMemo {
    /// Compare incoming `(state, text)` against what was last sent,
    /// returning the [`ChangeSet`] and updating the memo.
    pub fn diff_and_update(&mut self, state: Option<&str>, text: Option<&str>) -> ChangeSet {
        let state_changed = self.last_sent_state.as_deref() != state;
        let text_changed = self.last_sent_text.as_deref() != text;
        self.last_sent_state = state.map(str::to_string);
        self.last_sent_text = text.map(str::to_string);
        ChangeSet {
            state_changed,
            text_changed,
        }
    }
}

/// One queued `set-partial-explicit` send, paired with the device
/// position it targets.
#[derive(Debug, Clone)]
pub struct PartialSend {
    pub position: u8,
    pub tile_path: PathBuf,
}

/// Decide which tile path(s) to push for an item whose state and/or text
/// changed. When both changed, spec §4.12 calls for two separate partial
/// sends (state first, since an icon swap should land before its caption)
/// rather than waiting for a single combined re-render.
#[must_use]
pub fn plan_update(
    content: &ContentCache,
    page: &str,
    item_index: usize,
    position: u8,
    changes: ChangeSet,
    state_variant: Option<&str>,
) -> Vec<PartialSend> {
    let mut sends = Vec::new();
    if changes.state_changed {
        sends.push(PartialSend {
            position,
            tile_path: content.path(page, item_index, state_variant),
        });
    }
    if changes.text_changed {
        sends.push(PartialSend {
            position,
            tile_path: content.path(page, item_index, Some("text")),
        });
    }
    sends
}

/// Wallpaper-aware variant of [`plan_update`]: when a page has an active
/// wallpaper, the partial tile must be the wallpaper-composited path
/// rather than the plain content-cache path (spec §4.3 layer 4, §4.12).
#[must_use]
pub fn plan_update_with_wallpaper(
    wallpaper_cache: &WallpaperCache,
    wallpaper: &Wallpaper,
    position: u8,
    base_hash: u32,
    changes: ChangeSet,
) -> Vec<PartialSend> {
    if changes.is_empty() {
        return Vec::new();
    }
    let sig = WallpaperSignature::compute(wallpaper);
    vec![PartialSend {
        position,
        tile_path: wallpaper_cache.comp_path(sig, position, base_hash),
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memo_detects_first_change() {
        let mut memo = SentTileMemo::default();
        let changes = memo.diff_and_update(Some("on"), Some("21°"));
        assert!(changes.state_changed);
        assert!(changes.text_changed);
    }

    #[test]
    fn memo_suppresses_repeat() {
        let mut memo = SentTileMemo::default();
        memo.diff_and_update(Some("on"), Some("21°"));
        let changes = memo.diff_and_update(Some("on"), Some("21°"));
        assert!(changes.is_empty());
    }

    #[test]
    fn memo_detects_only_text_change() {
        let mut memo = SentTileMemo::default();
        memo.diff_and_update(Some("on"), Some("21°"));
        let changes = memo.diff_and_update(Some("on"), Some("22°"));
        assert!(!changes.state_changed);
        assert!(changes.text_changed);
    }

    #[test]
    fn plan_update_emits_two_sends_when_both_changed() {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentCache::new(dir.path());
        let changes = ChangeSet {
            state_changed: true,
            text_changed: true,
        };
        let sends = plan_update(&content, "$root", 0, 3, changes, Some("on"));
        assert_eq!(sends.len(), 2);
        assert_ne!(sends[0].tile_path, sends[1].tile_path);
    }

    #[test]
    fn plan_update_emits_nothing_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let content = ContentCache::new(dir.path());
        let sends = plan_update(&content, "$root", 0, 3, ChangeSet::default(), None);
        assert!(sends.is_empty());
    }
}
