//! Top-level page rendering: the glue that resolves a page's items into
//! device-ready tiles by composing the layout ([`crate::layout`]), render
//! cache ([`crate::cache`]), icon pipeline ([`crate::icon`]), and whatever
//! home-automation/command-engine state currently applies to each item
//! (spec §4.2-§4.4, §4.12, §9 Design Notes "Daemon aggregate").
//!
//! Everything else in this crate is a focused, independently-testable
//! collaborator; this module is where their outputs get composed into one
//! `set-buttons-explicit` call's worth of `(position, path, label)`
//! triples.

use std::path::{Path, PathBuf};

use crate::cache::wallpaper::{WallpaperCache, WallpaperSignature};
use crate::cache::{item_file_hash, ContentCache, ExternalIconCache};
use crate::core::config::{Config, IconSpec, Item, Page, Preset, Wallpaper, ROOT_PAGE};
use crate::core::errors::{KeydeckError, Result};
use crate::icon::mdi::{ensure_local_svg, IconDownloader};
use crate::icon::{render_tile, DrawTools, RenderRequest, ResolvedIcon};
use crate::layout::{compute_sheet_layout, SheetLayout};

/// Fetches the bytes for a `url:` icon spec. Mirrors
/// [`crate::icon::mdi::IconDownloader`]'s shape: abstracted behind a trait
/// so tests never need a real download tool on `PATH` (spec §1 "fetch web
/// resources itself... delegated to download tools").
pub trait UrlFetcher {
    /// Attempt to fetch `url` to `dest`. Returns whether it succeeded.
    fn fetch(&self, url: &str, dest: &Path) -> bool;
}

/// Shells out to an external `download_icon` tool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubprocessUrlFetcher;

impl UrlFetcher for SubprocessUrlFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> bool {
        let Some(dest_str) = dest.to_str() else { return false };
        let cmd = format!("download_icon {url} {dest_str}");
        matches!(
            crate::procexec::run_shell_with_timeout(&cmd, std::time::Duration::from_secs(10)),
            Ok(outcome) if outcome.success()
        )
    }
}

/// Everything a render call needs beyond the item/page itself: the config
/// snapshot, the cache layers, the icon pipeline's external collaborators,
/// and the paths CLI flags resolved (spec §6 "CLI surface").
pub struct RenderCtx<'a> {
    pub config: &'a Config,
    pub content: &'a ContentCache,
    pub external: &'a ExternalIconCache,
    pub tools: &'a dyn DrawTools,
    pub mdi_downloader: &'a dyn IconDownloader,
    pub url_fetcher: &'a dyn UrlFetcher,
    pub cache_root: &'a Path,
    pub error_icon: Option<&'a Path>,
    pub sys_pregen_dir: Option<&'a Path>,
}

/// Runtime state driving one item's rendering beyond its static config:
/// the active state key (matched against `item.states`, set only when an
/// HA entity's state or a `state_cmd`'s output names a configured variant)
/// and any captured dynamic text (command-engine `poll`/`exec_text`
/// output, or a value-display HA entity's raw state — spec §9 Open
/// Question d). The two are mutually informative but distinct: a light
/// with `states: {on, off}` sets `state_key`; a `sensor.*` entity with no
/// `states:` mapping sets `dynamic_text` instead (spec §3 "state
/// binding", §4.12).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemRuntimeState {
    pub state_key: Option<String>,
    pub dynamic_text: Option<String>,
}

/// Resolve which preset applies to an item (plus any `states[key].presets`
/// override list), layering names left-to-right over the implicit
/// `default` preset. Upstream preset-list composition semantics for
/// multiple named presets aren't specified (spec §9 doesn't name an
/// explicit merge rule); we take "last named preset wins" as the
/// resolution, consistent with `states[key].presets` reading as an
/// *additional* override list layered after the item's own, not a
/// replacement (documented in DESIGN.md).
#[must_use]
pub fn resolve_preset(config: &Config, item: &Item, variant_presets: &[String]) -> Preset {
    let mut preset = config.preset("default").clone();
    for name in item.presets.iter().chain(variant_presets.iter()) {
        if let Some(p) = config.presets.get(name) {
            preset = p.clone();
        }
    }
    preset
}

/// The icon spec that applies given the active state variant, if any.
#[must_use]
pub fn effective_icon_spec(item: &Item, runtime: &ItemRuntimeState) -> Option<IconSpec> {
    if let Some(key) = &runtime.state_key {
        if let Some(variant) = item.states.get(key) {
            if let Some(raw) = &variant.icon {
                if let Some(spec) = IconSpec::parse(raw) {
                    return Some(spec);
                }
            }
        }
    }
    item.icon.clone()
}

/// The display label (device button label) that applies given the active
/// state variant, if any.
#[must_use]
pub fn effective_name(item: &Item, runtime: &ItemRuntimeState) -> Option<String> {
    if let Some(key) = &runtime.state_key {
        if let Some(variant) = item.states.get(key) {
            if let Some(name) = &variant.name {
                return Some(name.clone());
            }
        }
    }
    item.name.clone()
}

/// The *static* text baked into an item's base/state-variant tile: the
/// state variant's configured `text`, or the item's own `text`. Never the
/// command-engine/HA dynamic text — that always renders into the separate
/// `"text"` cache variant (see [`render_text_overlay_tile`]) so it can be
/// refreshed independently of the (identity-addressed, never-rebuilt) base
/// tile (spec §4.3 layer 1, §9 Open Question a).
#[must_use]
pub fn effective_static_text(item: &Item, runtime: &ItemRuntimeState) -> Option<String> {
    if let Some(key) = &runtime.state_key {
        if let Some(variant) = item.states.get(key) {
            if let Some(text) = &variant.text {
                return Some(text.clone());
            }
        }
    }
    item.text.clone()
}

fn spec_key(spec: &IconSpec) -> String {
    match spec {
        IconSpec::Mdi(s) => format!("mdi:{s}"),
        IconSpec::Local(p) => format!("local:{p}"),
        IconSpec::Url(u) => format!("url:{u}"),
    }
}

/// Normalize a `local:`/`url:` icon into the external-icon cache, applying
/// spec §4.3's validation rules (exists, non-empty, `<= 6 KiB`, square,
/// `<= 196x196`). `populate` writes the candidate file if it isn't already
/// cached (a plain file copy for `local:`, a download-tool invocation for
/// `url:`).
fn normalize_external(
    external: &ExternalIconCache,
    spec: &IconSpec,
    populate: impl FnOnce(&Path) -> bool,
) -> Option<PathBuf> {
    let key = spec_key(spec);
    let dest = external.path(&key);
    if !dest.is_file() {
        let _ = external.ensure_dir();
        if !populate(&dest) {
            return None;
        }
    }
    ExternalIconCache::validate(&dest).ok().map(|_| dest)
}

/// Resolve an [`IconSpec`] to a [`ResolvedIcon`] ready for
/// [`crate::icon::render_tile`], falling back to the configured error icon
/// (spec §4.3 "Failures fall back to a pregenerated 'file too big' icon")
/// when an MDI fetch or external-icon validation fails.
#[must_use]
pub fn resolve_effective_icon(ctx: &RenderCtx<'_>, item: &Item, runtime: &ItemRuntimeState) -> Option<ResolvedIcon> {
    let spec = effective_icon_spec(item, runtime)?;
    let resolved = match &spec {
        IconSpec::Mdi(slug) => ensure_local_svg(ctx.mdi_downloader, ctx.cache_root, slug).map(ResolvedIcon::Svg),
        IconSpec::Local(path) => {
            let path = path.clone();
            normalize_external(ctx.external, &spec, |dest| std::fs::copy(&path, dest).is_ok()).map(ResolvedIcon::Raster)
        }
        IconSpec::Url(url) => {
            normalize_external(ctx.external, &spec, |dest| ctx.url_fetcher.fetch(url, dest)).map(ResolvedIcon::Raster)
        }
    };
    resolved.or_else(|| ctx.error_icon.map(|p| ResolvedIcon::Raster(p.to_path_buf())))
}

/// Render (or reuse) an item's base tile: its configured icon plus its
/// *static* text, cached at `<page>/<btn>-<hash>[-<state_key>].png` (spec
/// §4.3 layer 1). A no-op once the file exists — cache entries are never
/// rebuilt from a content change, only from a missing file (spec §9 Open
/// Question a).
///
/// # Errors
/// Propagates cache-directory creation failures and `render_tile` errors.
pub fn render_item_tile(ctx: &RenderCtx<'_>, page: &Page, item_index: usize, runtime: &ItemRuntimeState) -> Result<PathBuf> {
    let item = &page.items[item_index];
    let variant = runtime.state_key.clone().filter(|_| !item.states.is_empty());
    let out_path = ctx.content.path(&page.name, item_index, variant.as_deref());
    if out_path.is_file() {
        return Ok(out_path);
    }
    ctx.content
        .ensure_page_dir(&page.name)
        .map_err(|e| KeydeckError::io(&out_path, e))?;

    let variant_presets = variant
        .as_deref()
        .and_then(|k| item.states.get(k))
        .map(|v| v.presets.clone())
        .unwrap_or_default();
    let preset = resolve_preset(ctx.config, item, &variant_presets);
    let text = effective_static_text(item, runtime);
    let icon = resolve_effective_icon(ctx, item, runtime);
    let req = RenderRequest::from_preset(&preset, icon, text);
    render_tile(ctx.tools, &req, &out_path)?;
    Ok(out_path)
}

/// Render the `"text"` overlay variant: the same icon as
/// [`render_item_tile`] but with `runtime.dynamic_text` drawn over it
/// instead of the item's static text. This is the tile the partial
/// updater pushes when a `poll`/`exec_text`/`state_cmd` result changes
/// (spec §4.7, §4.12) — always rebuilt (never the identity-cached base
/// path) since its whole purpose is to track a value that changes at
/// runtime.
///
/// # Errors
/// Propagates cache-directory creation failures and `render_tile` errors.
pub fn render_text_overlay_tile(ctx: &RenderCtx<'_>, page: &Page, item_index: usize, runtime: &ItemRuntimeState) -> Result<PathBuf> {
    let item = &page.items[item_index];
    let out_path = ctx.content.path(&page.name, item_index, Some("text"));
    ctx.content
        .ensure_page_dir(&page.name)
        .map_err(|e| KeydeckError::io(&out_path, e))?;

    let variant_presets = runtime
        .state_key
        .as_deref()
        .and_then(|k| item.states.get(k))
        .map(|v| v.presets.clone())
        .unwrap_or_default();
    let preset = resolve_preset(ctx.config, item, &variant_presets);
    let icon = resolve_effective_icon(ctx, item, runtime);
    let req = RenderRequest::from_preset(&preset, icon, runtime.dynamic_text.clone());
    render_tile(ctx.tools, &req, &out_path)?;
    Ok(out_path)
}

/// Render whichever tile currently applies to an item: the `"text"`
/// overlay when dynamic text is captured, otherwise the (state-variant or
/// plain) base tile.
///
/// # Errors
/// See [`render_item_tile`]/[`render_text_overlay_tile`].
pub fn render_effective_tile(ctx: &RenderCtx<'_>, page: &Page, item_index: usize, runtime: &ItemRuntimeState) -> Result<PathBuf> {
    if runtime.dynamic_text.is_some() {
        render_text_overlay_tile(ctx, page, item_index, runtime)
    } else {
        render_item_tile(ctx, page, item_index, runtime)
    }
}

/// The wallpaper that applies to `page`: a per-page override if configured,
/// else the global default (spec §3 "`wallpaper` (global) and per-page
/// `wallpaper` override").
#[must_use]
pub fn effective_wallpaper<'a>(config: &'a Config, page: &'a Page) -> Option<&'a Wallpaper> {
    page.wallpaper.as_ref().or(config.wallpaper.as_ref())
}

/// Path to one position's pre-tiled wallpaper source image. The wallpaper
/// source itself (a single full-screen image sliced into 14 per-position
/// tiles) is prepared by an external tool, the same way MDI/url icons are
/// fetched by external collaborators rather than decoded in-process (spec
/// §1 "PNG codecs... deliberately treated as external collaborators");
/// `wallpaper.path` names the directory holding the sliced tiles.
fn wallpaper_source_tile(wallpaper: &Wallpaper, position: u8) -> PathBuf {
    Path::new(&wallpaper.path).join(format!("{position}.png"))
}

/// Render (or reuse) one content item's wallpaper-composited tile: the
/// position's wallpaper slice as background, the item's icon and text drawn
/// over it (spec §4.12 step 2 "compose tile + base once into the
/// composition cache"). Rebuilt whenever dynamic text is present, cached
/// otherwise — mirrors [`render_item_tile`]/[`render_text_overlay_tile`]'s
/// split.
///
/// # Errors
/// Propagates cache-directory creation failures and `render_tile` errors.
pub fn render_wallpaper_effective_tile(
    ctx: &RenderCtx<'_>,
    wallpaper_cache: &WallpaperCache,
    wallpaper: &Wallpaper,
    page: &Page,
    item_index: usize,
    position: u8,
    runtime: &ItemRuntimeState,
) -> Result<PathBuf> {
    let item = &page.items[item_index];
    let sig = WallpaperSignature::compute(wallpaper);
    let base_hash = item_file_hash(&page.name, item_index);
    let out_path = wallpaper_cache.comp_path(sig, position, base_hash);
    if runtime.dynamic_text.is_none() && out_path.is_file() {
        return Ok(out_path);
    }
    wallpaper_cache
        .ensure_dirs(&page.name, sig, position)
        .map_err(|e| KeydeckError::io(&out_path, e))?;

    let variant_presets = runtime
        .state_key
        .as_deref()
        .and_then(|k| item.states.get(k))
        .map(|v| v.presets.clone())
        .unwrap_or_default();
    let preset = resolve_preset(ctx.config, item, &variant_presets);
    let text = runtime
        .dynamic_text
        .clone()
        .or_else(|| effective_static_text(item, runtime));
    let icon = resolve_effective_icon(ctx, item, runtime);
    let bg = wallpaper_source_tile(wallpaper, position);
    let req = RenderRequest::from_preset(&preset, icon, text).with_background_raster(bg);
    render_tile(ctx.tools, &req, &out_path)?;
    Ok(out_path)
}

/// Render (or reuse) one reserved back/prev/next position's
/// wallpaper-composited nav tile: the position's wallpaper slice with the
/// pregenerated nav glyph drawn over it.
///
/// # Errors
/// Propagates directory-creation and `render_tile` errors.
fn render_wallpaper_nav_tile(
    ctx: &RenderCtx<'_>,
    wallpaper_cache: &WallpaperCache,
    wallpaper: &Wallpaper,
    page_name: &str,
    nav_name: &str,
    position: u8,
) -> Result<PathBuf> {
    let sig = WallpaperSignature::compute(wallpaper);
    let out_path = wallpaper_cache.nav_path(page_name, nav_name, sig, position);
    if out_path.is_file() {
        return Ok(out_path);
    }
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| KeydeckError::io(&out_path, e))?;
    }
    let nav_icon = nav_icon_path(ctx, nav_name)?;
    let bg = wallpaper_source_tile(wallpaper, position);
    let preset = ctx.config.preset("default").clone();
    let req = RenderRequest::from_preset(&preset, Some(ResolvedIcon::Raster(nav_icon)), None).with_background_raster(bg);
    render_tile(ctx.tools, &req, &out_path)?;
    Ok(out_path)
}

/// One resolved device-button push: the position, the PNG path already on
/// disk, and the (already-sanitized at send time) label if any.
#[derive(Debug, Clone)]
pub struct DeviceTileEntry {
    pub position: u8,
    pub path: PathBuf,
    pub label: Option<String>,
}

/// The full set of tiles to push for one sheet, plus the layout that
/// produced it and a `(position -> item_index)` map so the event loop can
/// translate an incoming button position back to the item that owns it.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub entries: Vec<DeviceTileEntry>,
    pub layout: SheetLayout,
    pub content_slots: Vec<(u8, usize)>,
}

fn ensure_blank_tile(cache_root: &Path) -> Result<PathBuf> {
    let path = cache_root.join("blank.png");
    if !path.is_file() {
        std::fs::write(&path, crate::cache::EMPTY_PNG_1X1).map_err(|e| KeydeckError::io(&path, e))?;
    }
    Ok(path)
}

fn nav_icon_path(ctx: &RenderCtx<'_>, name: &str) -> Result<PathBuf> {
    if let Some(dir) = ctx.sys_pregen_dir {
        let candidate = dir.join(format!("{name}.png"));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    ensure_blank_tile(ctx.cache_root)
}

/// Render one full sheet of `page` at `offset`: computes the layout (spec
/// §4.2), resolves every visible content item's tile, and fills reserved
/// back/prev/next positions with pregenerated nav icons (falling back to
/// the blank tile when `--sys-pregen-dir` wasn't given or doesn't have
/// that icon). `runtime_states[i]` must correspond to `page.items[i]`.
///
/// # Errors
/// Propagates any per-item render failure. The caller (the daemon's event
/// loop) treats a render failure as a reason to retry next tick rather
/// than crash — rendering failures are never fatal to the process (spec
/// §7 "errors are logged once and swallowed in the event loop").
pub fn render_page(ctx: &RenderCtx<'_>, page: &Page, offset: usize, runtime_states: &[ItemRuntimeState]) -> Result<RenderedPage> {
    let show_back = page.name != ROOT_PAGE;
    let layout = compute_sheet_layout(page.items.len(), show_back, offset);
    let wallpaper = effective_wallpaper(ctx.config, page);
    let wallpaper_cache = WallpaperCache::new(ctx.cache_root);
    let mut entries = Vec::new();
    let mut reserved = Vec::new();

    if show_back {
        let path = match wallpaper {
            Some(wp) => render_wallpaper_nav_tile(ctx, &wallpaper_cache, wp, &page.name, "back", ctx.config.system.back)?,
            None => nav_icon_path(ctx, "back")?,
        };
        entries.push(DeviceTileEntry {
            position: ctx.config.system.back,
            path,
            label: None,
        });
        reserved.push(ctx.config.system.back);
    }
    if layout.show_prev {
        let path = match wallpaper {
            Some(wp) => render_wallpaper_nav_tile(ctx, &wallpaper_cache, wp, &page.name, "prev", ctx.config.system.prev)?,
            None => nav_icon_path(ctx, "prev")?,
        };
        entries.push(DeviceTileEntry {
            position: ctx.config.system.prev,
            path,
            label: None,
        });
        reserved.push(ctx.config.system.prev);
    }
    if layout.show_next {
        let path = match wallpaper {
            Some(wp) => render_wallpaper_nav_tile(ctx, &wallpaper_cache, wp, &page.name, "next", ctx.config.system.next)?,
            None => nav_icon_path(ctx, "next")?,
        };
        entries.push(DeviceTileEntry {
            position: ctx.config.system.next,
            path,
            label: None,
        });
        reserved.push(ctx.config.system.next);
    }

    let mut content_positions: Vec<u8> = (1..=13).filter(|p| !reserved.contains(p)).collect();
    content_positions.truncate(layout.cap);

    let blank = ensure_blank_tile(ctx.cache_root)?;
    let mut content_slots = Vec::new();
    for (slot, position) in content_positions.into_iter().enumerate() {
        let item_index = layout.start + slot;
        if item_index >= page.items.len() {
            entries.push(DeviceTileEntry {
                position,
                path: blank.clone(),
                label: None,
            });
            continue;
        }
        let item = &page.items[item_index];
        let default_runtime = ItemRuntimeState::default();
        let runtime = runtime_states.get(item_index).unwrap_or(&default_runtime);
        let path = match wallpaper {
            Some(wp) => render_wallpaper_effective_tile(ctx, &wallpaper_cache, wp, page, item_index, position, runtime)?,
            None => render_effective_tile(ctx, page, item_index, runtime)?,
        };
        entries.push(DeviceTileEntry {
            position,
            path,
            label: effective_name(item, runtime),
        });
        content_slots.push((position, item_index));
    }

    Ok(RenderedPage {
        entries,
        layout,
        content_slots,
    })
}

/// Serialize a resolved [`Config`] to JSON for `--dump-config` (spec §6).
/// Hand-built rather than a blanket `#[derive(Serialize)]` across the
/// config model: the config types intentionally stay free of any
/// particular serialization framework's assumptions (spec §9 Design
/// Notes — the same reasoning that keeps them free of a YAML node model),
/// and `--dump-config` is an introspection convenience, not a document
/// that round-trips back into [`crate::core::config::loader`].
#[must_use]
pub fn config_to_json(config: &Config) -> serde_json::Value {
    use serde_json::json;

    let presets: serde_json::Map<String, serde_json::Value> = config
        .presets
        .iter()
        .map(|(name, preset)| (name.clone(), preset_to_json(preset)))
        .collect();

    let pages: Vec<serde_json::Value> = config
        .pages
        .iter()
        .map(|page| {
            json!({
                "name": page.name,
                "item_count": page.items.len(),
                "wallpaper": page.wallpaper.as_ref().map(|w| w.path.clone()),
            })
        })
        .collect();

    json!({
        "system": {
            "back": config.system.back,
            "prev": config.system.prev,
            "next": config.system.next,
        },
        "base_brightness": config.base_brightness,
        "sleep_dim_brightness": config.sleep_dim_brightness,
        "sleep_dim_timeout_sec": config.sleep_dim_timeout_sec,
        "sleep_timeout_sec": config.sleep_timeout_sec,
        "cmd_timeout_ms": config.cmd_timeout_ms,
        "debounce_ms": config.debounce_ms,
        "post_page_change_ignore_ms": config.post_page_change_ignore_ms,
        "wallpaper": config.wallpaper.as_ref().map(|w| w.path.clone()),
        "presets": presets,
        "pages": pages,
    })
}

fn preset_to_json(preset: &Preset) -> serde_json::Value {
    serde_json::json!({
        "background": preset.background,
        "border_radius": preset.border_radius,
        "border_width": preset.border_width,
        "icon_size": preset.icon_size,
        "icon_brightness": preset.icon_brightness,
        "text_color": preset.text_color,
        "text_size": preset.text_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Item, Page, Preset, StateVariant};
    use crate::icon::mdi::IconDownloader;
    use std::cell::RefCell;

    struct NoopTools;
    impl DrawTools for NoopTools {
        fn draw_square(&self, out: &Path, _size: u32, _bg: &str, _radius: u8) -> Result<()> {
            std::fs::write(out, b"stub").map_err(|e| KeydeckError::io(out, e))
        }
        fn draw_border(&self, _io: &Path, _size: u32, _radius: u8, _color: &str) -> Result<()> {
            Ok(())
        }
        fn draw_mdi(
            &self,
            _io: &Path,
            _svg: &Path,
            _icon_size: u32,
            _offset: crate::core::config::Offset,
            _brightness: u8,
            _color: Option<&str>,
        ) -> Result<()> {
            Ok(())
        }
        fn draw_raster(&self, _io: &Path, _raster: &Path, _icon_size: u32, _offset: crate::core::config::Offset) -> Result<()> {
            Ok(())
        }
        fn draw_optimize(&self, _io: &Path, _colors: u32) -> Result<()> {
            Ok(())
        }
        fn draw_text(
            &self,
            _io: &Path,
            _text: &str,
            _color: &str,
            _align: crate::core::config::TextAlign,
            _font: Option<&str>,
            _size: u8,
            _offset: crate::core::config::Offset,
        ) -> Result<()> {
            Ok(())
        }
    }

    struct NoopDownloader;
    impl IconDownloader for NoopDownloader {
        fn fetch(&self, _slug: &str, _dest: &Path) -> bool {
            false
        }
    }

    struct NoopUrlFetcher;
    impl UrlFetcher for NoopUrlFetcher {
        fn fetch(&self, _url: &str, _dest: &Path) -> bool {
            false
        }
    }

    fn ctx<'a>(
        config: &'a Config,
        content: &'a ContentCache,
        external: &'a ExternalIconCache,
        tools: &'a NoopTools,
        downloader: &'a NoopDownloader,
        fetcher: &'a NoopUrlFetcher,
        cache_root: &'a Path,
    ) -> RenderCtx<'a> {
        RenderCtx {
            config,
            content,
            external,
            tools,
            mdi_downloader: downloader,
            url_fetcher: fetcher,
            cache_root,
            error_icon: None,
            sys_pregen_dir: None,
        }
    }

    #[test]
    fn state_variant_overrides_icon_name_and_text() {
        let mut item = Item::default();
        item.name = Some("Kitchen Light".to_string());
        item.text = Some("base".to_string());
        item.states.insert(
            "off".to_string(),
            StateVariant {
                name: Some("Off".to_string()),
                icon: Some("mdi:lightbulb-off".to_string()),
                text: Some("off".to_string()),
                presets: vec![],
            },
        );
        let runtime = ItemRuntimeState {
            state_key: Some("off".to_string()),
            dynamic_text: None,
        };
        assert_eq!(effective_name(&item, &runtime).as_deref(), Some("Off"));
        assert_eq!(effective_static_text(&item, &runtime).as_deref(), Some("off"));
        assert_eq!(
            effective_icon_spec(&item, &runtime),
            Some(IconSpec::Mdi("lightbulb-off".to_string()))
        );
    }

    #[test]
    fn no_state_key_falls_back_to_item_fields() {
        let mut item = Item::default();
        item.name = Some("Kitchen Light".to_string());
        item.text = Some("base".to_string());
        let runtime = ItemRuntimeState::default();
        assert_eq!(effective_name(&item, &runtime).as_deref(), Some("Kitchen Light"));
        assert_eq!(effective_static_text(&item, &runtime).as_deref(), Some("base"));
    }

    #[test]
    fn preset_resolution_last_named_wins() {
        let mut config = Config::default();
        let mut red = Preset::default();
        red.background = "#ff0000".to_string();
        config.presets.insert("red".to_string(), red);
        let mut blue = Preset::default();
        blue.background = "#0000ff".to_string();
        config.presets.insert("blue".to_string(), blue);

        let mut item = Item::default();
        item.presets = vec!["red".to_string(), "blue".to_string()];
        let resolved = resolve_preset(&config, &item, &[]);
        assert_eq!(resolved.background, "#0000ff");
    }

    #[test]
    fn render_item_tile_is_idempotent_once_cached() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let content = ContentCache::new(dir.path().join("content"));
        let external = ExternalIconCache::new(dir.path().join("ext"));
        let tools = NoopTools;
        let downloader = NoopDownloader;
        let fetcher = NoopUrlFetcher;
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let render_ctx = ctx(&config, &content, &external, &tools, &downloader, &fetcher, &cache_root);

        let page = Page {
            name: "$root".to_string(),
            items: vec![Item::default()],
            wallpaper: None,
        };
        let runtime = ItemRuntimeState::default();
        let first = render_item_tile(&render_ctx, &page, 0, &runtime).unwrap();
        assert!(first.is_file());
        let calls_before = std::fs::metadata(&first).unwrap().modified().unwrap();
        // Re-render must short-circuit on the existing file (spec §9 Open
        // Question a: identity cache, never rebuilt from content).
        let second = render_item_tile(&render_ctx, &page, 0, &runtime).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls_before, std::fs::metadata(&second).unwrap().modified().unwrap());
    }

    #[test]
    fn render_page_reserves_back_on_non_root_pages() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let content = ContentCache::new(dir.path().join("content"));
        let external = ExternalIconCache::new(dir.path().join("ext"));
        let tools = NoopTools;
        let downloader = NoopDownloader;
        let fetcher = NoopUrlFetcher;
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let render_ctx = ctx(&config, &content, &external, &tools, &downloader, &fetcher, &cache_root);

        let page = Page {
            name: "settings".to_string(),
            items: vec![Item::default(), Item::default()],
            wallpaper: None,
        };
        let runtimes = vec![ItemRuntimeState::default(); 2];
        let rendered = render_page(&render_ctx, &page, 0, &runtimes).unwrap();
        assert!(rendered.entries.iter().any(|e| e.position == config.system.back));
        assert_eq!(rendered.content_slots.len(), 2);
    }

    #[test]
    fn render_page_with_wallpaper_routes_through_composition_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.wallpaper = Some(crate::core::config::Wallpaper {
            path: "/wallpapers/sunset".to_string(),
            quality: 85,
            magnify: 100,
            dithering: false,
        });
        let content = ContentCache::new(dir.path().join("content"));
        let external = ExternalIconCache::new(dir.path().join("ext"));
        let tools = NoopTools;
        let downloader = NoopDownloader;
        let fetcher = NoopUrlFetcher;
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let render_ctx = ctx(&config, &content, &external, &tools, &downloader, &fetcher, &cache_root);

        let page = Page {
            name: ROOT_PAGE.to_string(),
            items: vec![Item::default()],
            wallpaper: None,
        };
        let runtimes = vec![ItemRuntimeState::default(); 1];
        let rendered = render_page(&render_ctx, &page, 0, &runtimes).unwrap();
        assert!(rendered.entries[0].path.to_string_lossy().contains("wp_comp"));
    }

    #[test]
    fn render_page_on_root_never_reserves_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let content = ContentCache::new(dir.path().join("content"));
        let external = ExternalIconCache::new(dir.path().join("ext"));
        let tools = NoopTools;
        let downloader = NoopDownloader;
        let fetcher = NoopUrlFetcher;
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let render_ctx = ctx(&config, &content, &external, &tools, &downloader, &fetcher, &cache_root);

        let page = Page {
            name: ROOT_PAGE.to_string(),
            items: vec![Item::default()],
            wallpaper: None,
        };
        let runtimes = vec![ItemRuntimeState::default(); 1];
        let rendered = render_page(&render_ctx, &page, 0, &runtimes).unwrap();
        assert!(!rendered.entries.iter().any(|e| e.position == config.system.back));
    }

    #[test]
    fn dynamic_text_routes_through_text_variant_cache_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let content = ContentCache::new(dir.path().join("content"));
        let external = ExternalIconCache::new(dir.path().join("ext"));
        let tools = NoopTools;
        let downloader = NoopDownloader;
        let fetcher = NoopUrlFetcher;
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let render_ctx = ctx(&config, &content, &external, &tools, &downloader, &fetcher, &cache_root);

        let page = Page {
            name: "$root".to_string(),
            items: vec![Item::default()],
            wallpaper: None,
        };
        let runtime = ItemRuntimeState {
            state_key: None,
            dynamic_text: Some("42".to_string()),
        };
        let path = render_effective_tile(&render_ctx, &page, 0, &runtime).unwrap();
        assert_eq!(path, content.path("$root", 0, Some("text")));
    }

    #[test]
    fn local_icon_failure_falls_back_to_error_icon() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let content = ContentCache::new(dir.path().join("content"));
        let external = ExternalIconCache::new(dir.path().join("ext"));
        let tools = NoopTools;
        let downloader = NoopDownloader;
        let fetcher = NoopUrlFetcher;
        let cache_root = dir.path().join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();
        let error_icon = dir.path().join("error.png");
        std::fs::write(&error_icon, b"stub").unwrap();
        let mut render_ctx = ctx(&config, &content, &external, &tools, &downloader, &fetcher, &cache_root);
        render_ctx.error_icon = Some(&error_icon);

        let mut item = Item::default();
        item.icon = Some(IconSpec::Local("/nonexistent/path.png".to_string()));
        let runtime = ItemRuntimeState::default();
        let resolved = resolve_effective_icon(&render_ctx, &item, &runtime);
        assert!(matches!(resolved, Some(ResolvedIcon::Raster(p)) if p == error_icon));

        let _ = RefCell::new(()); // keep RefCell import used across test edits
    }
}
