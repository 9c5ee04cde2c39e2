//! Daemon aggregate: owns every subsystem and runs the top-level event
//! loop (spec §4.10, §9 Design Notes "Daemon aggregate").

pub mod signals;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::brightness::BrightnessMachine;
use crate::cache::session::SessionCache;
use crate::cache::wallpaper::WallpaperCache;
use crate::cache::{ContentCache, ExternalIconCache};
use crate::cmdengine::CommandEngine;
use crate::control::{ControlListener, PositionStore};
use crate::core::config::{loader, CmdTextOpts, Config};
use crate::core::errors::Result;
use crate::dispatch::{ButtonEvent, DispatchEffect, IgnoreWindow, NavState, TapDebouncer};
use crate::eventloop::{self, WatchedFds};
use crate::ha::{is_value_display_domain, HaClient};
use crate::icon::mdi::SubprocessIconDownloader;
use crate::icon::SubprocessDrawTools;
use crate::logger::JsonlLogger;
use crate::partial::ChangeSet;
use crate::render::{self, ItemRuntimeState, RenderCtx, RenderedPage, SubprocessUrlFetcher};

/// Paths resolved from CLI flags (spec §6), handed to [`Daemon::start`].
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    pub config: PathBuf,
    pub device_sock: PathBuf,
    pub control_sock: PathBuf,
    pub ha_sock: PathBuf,
    pub cache_root: PathBuf,
    pub state_dir: PathBuf,
    pub error_icon: Option<PathBuf>,
    pub sys_pregen_dir: Option<PathBuf>,
}

/// Everything the running daemon holds. Constructed once at startup by
/// [`Daemon::start`]; the event loop in [`Self::run`] borrows it for the
/// duration of the process.
pub struct Daemon {
    pub config: Config,
    pub paths: DaemonPaths,
    pub content_cache: ContentCache,
    pub external_cache: ExternalIconCache,
    pub session_cache: SessionCache,
    pub position_store: PositionStore,
    pub nav: NavState,
    pub brightness: BrightnessMachine,
    pub cmd_engine: Arc<CommandEngine>,
    pub control: ControlListener,
    pub logger: Arc<JsonlLogger>,

    draw_tools: SubprocessDrawTools,
    mdi_downloader: SubprocessIconDownloader,
    url_fetcher: SubprocessUrlFetcher,

    /// Per-`(page, item_index)` rendering state (active HA/state_cmd state
    /// key, captured dynamic text) — the daemon's only mutable rendering
    /// input beyond `config` itself (spec §4.12).
    runtime_states: HashMap<(String, usize), ItemRuntimeState>,
    /// What was last actually pushed to the device for each item, so a
    /// partial update is skipped when nothing changed (spec §4.12 "no-op
    /// suppression").
    sent_memos: HashMap<(String, usize), crate::partial::SentTileMemo>,
    /// Command-engine keys with an active `state_cmd` sample on each page,
    /// disabled (not removed — a `poll` schedule on the same key may still
    /// be running) on navigation away (spec §4.7 "page-scope teardown").
    active_cmd_keys_by_page: HashMap<String, Vec<String>>,
    /// HA subscriptions currently active for each page, torn down the same
    /// way (spec §4.6 "subscriptions driven by page transitions").
    subscribed_entities_by_page: HashMap<String, Vec<String>>,
    /// Maps a command-engine key back to the item it drives, so a
    /// completion notification knows which tile to refresh. Entries persist
    /// across page navigation since a `poll` schedule isn't torn down with
    /// the rest of the page scope.
    cmd_key_to_item: HashMap<String, (String, usize)>,
    /// Last `poll`/`exec` result `seq` already applied per key, so a
    /// `CmdNotify` wakeup doesn't reprocess an unchanged result every tick.
    applied_text_seq: HashMap<String, u64>,
    /// Last `state_cmd` result `seq` already applied per key, tracked
    /// independently of `applied_text_seq` since the two tracks share one
    /// `CmdEntry` but advance on unrelated schedules.
    applied_state_seq: HashMap<String, u64>,

    tap_debouncer: TapDebouncer,
    ignore_window: IgnoreWindow,
    /// Gated by the control socket's `stop-control`/`start-control` (spec
    /// §4.11): while `false`, device button events are still drained (so
    /// the subscription doesn't back up) but never dispatched.
    control_enabled: bool,
    /// The most recently pushed sheet, giving button-position -> item-index
    /// lookups for incoming device events.
    last_render: Option<RenderedPage>,

    notify_read: std::os::unix::io::RawFd,
}

impl Daemon {
    /// Load configuration, open caches and the control socket, and
    /// construct the daemon aggregate. Does not yet connect to the device
    /// or HA sockets — those are lazily established by the event loop on
    /// its first iteration so a daemon can start even while the device
    /// service is still coming up (spec §4.5 "reconnect on demand").
    ///
    /// # Errors
    /// Propagates any [`crate::core::errors::KeydeckError`] from config
    /// loading, cache setup, or binding the control socket.
    pub fn start(paths: DaemonPaths, logger: Arc<JsonlLogger>) -> Result<Self> {
        let config = loader::load(&paths.config)?;
        let content_cache = ContentCache::new(&paths.cache_root);
        let external_cache = ExternalIconCache::new(paths.cache_root.join("external_icons"));
        let session_cache = SessionCache::open(&paths.state_dir)?;
        let position_store = PositionStore::new(&paths.state_dir);

        let root = crate::core::config::ROOT_PAGE;
        let nav = match position_store.load() {
            Some(pos) if config.page(&pos.page).is_some() => {
                let mut nav = NavState::new(root);
                nav.current_page = pos.page;
                nav.current_offset = pos.offset;
                nav
            }
            _ => NavState::new(root),
        };

        let brightness = BrightnessMachine::new(
            config.base_brightness,
            config.sleep_dim_brightness,
            config.sleep_dim_timeout_sec,
            config.sleep_timeout_sec,
        );

        let (notify_read, notify_write) = eventloop::make_notify_pipe()?;
        let cmd_engine = Arc::new(CommandEngine::new(notify_write));
        let control = ControlListener::bind(&paths.control_sock)?;

        Ok(Self {
            config,
            paths,
            content_cache,
            external_cache,
            session_cache,
            position_store,
            nav,
            brightness,
            cmd_engine,
            control,
            logger,
            draw_tools: SubprocessDrawTools::default(),
            mdi_downloader: SubprocessIconDownloader,
            url_fetcher: SubprocessUrlFetcher,
            runtime_states: HashMap::new(),
            sent_memos: HashMap::new(),
            active_cmd_keys_by_page: HashMap::new(),
            subscribed_entities_by_page: HashMap::new(),
            cmd_key_to_item: HashMap::new(),
            applied_text_seq: HashMap::new(),
            applied_state_seq: HashMap::new(),
            tap_debouncer: TapDebouncer::default(),
            ignore_window: IgnoreWindow::default(),
            control_enabled: true,
            last_render: None,
            notify_read,
        })
    }

    /// Persist the current navigation position (spec §4.11, called after
    /// every navigation and on graceful shutdown).
    pub fn persist_position(&self) {
        let pos = crate::control::LastPosition {
            page: self.nav.current_page.clone(),
            offset: self.nav.current_offset,
        };
        if let Err(e) = self.position_store.save(&pos) {
            self.logger.error_code(&format!("failed to persist position: {e}"), e.code());
        }
    }

    /// Descriptor set for the current iteration's `poll(2)` call. The HA
    /// socket is omitted until the daemon actually opens one (spec §4.6
    /// "lazy connect").
    fn watched_fds(&self, device_fd: std::os::unix::io::RawFd, ha_fd: Option<std::os::unix::io::RawFd>) -> WatchedFds {
        WatchedFds {
            device: device_fd,
            control: self.control.as_raw_fd(),
            ha: ha_fd,
            cmd_notify: self.notify_read,
        }
    }

    fn render_ctx(&self) -> RenderCtx<'_> {
        RenderCtx {
            config: &self.config,
            content: &self.content_cache,
            external: &self.external_cache,
            tools: &self.draw_tools,
            mdi_downloader: &self.mdi_downloader,
            url_fetcher: &self.url_fetcher,
            cache_root: &self.paths.cache_root,
            error_icon: self.paths.error_icon.as_deref(),
            sys_pregen_dir: self.paths.sys_pregen_dir.as_deref(),
        }
    }

    fn runtime_states_for(&self, page_name: &str, item_count: usize) -> Vec<ItemRuntimeState> {
        (0..item_count)
            .map(|i| self.runtime_states.get(&(page_name.to_string(), i)).cloned().unwrap_or_default())
            .collect()
    }

    fn position_for_item(&self, item_index: usize) -> Option<u8> {
        self.last_render
            .as_ref()
            .and_then(|r| r.content_slots.iter().find(|(_, idx)| *idx == item_index).map(|(pos, _)| *pos))
    }

    /// Render the currently navigated-to sheet and record it as
    /// [`Self::last_render`].
    fn render_current_page(&mut self) -> Result<RenderedPage> {
        let page_name = self.nav.current_page.clone();
        let offset = self.nav.current_offset;
        let item_count = self.config.page(&page_name).map_or(0, |p| p.items.len());
        let runtimes = self.runtime_states_for(&page_name, item_count);
        let ctx = self.render_ctx();
        let page = crate::dispatch::resolve_page(&self.config, &page_name, &page_name)?;
        let rendered = render::render_page(&ctx, page, offset, &runtimes)?;
        self.last_render = Some(rendered.clone());
        Ok(rendered)
    }

    /// Render the current sheet and push every tile via
    /// `set-buttons-explicit` (spec §4.10 "initial render", §8 Scenarios 1
    /// and 5). Re-seeds [`Self::sent_memos`] from the freshly rendered
    /// runtime state so later partial diffs compare against what the
    /// device actually now shows.
    fn push_full_render(&mut self, device: &mut crate::device::DeviceClient) -> Result<()> {
        let rendered = self.render_current_page()?;
        let entries: Vec<(u8, &std::path::Path, Option<&str>)> = rendered
            .entries
            .iter()
            .map(|e| (e.position, e.path.as_path(), e.label.as_deref()))
            .collect();
        device.set_buttons_explicit(&entries)?;

        let page_name = self.nav.current_page.clone();
        for (_, item_index) in &rendered.content_slots {
            let runtime = self
                .runtime_states
                .get(&(page_name.clone(), *item_index))
                .cloned()
                .unwrap_or_default();
            self.sent_memos
                .entry((page_name.clone(), *item_index))
                .or_default()
                .diff_and_update(runtime.state_key.as_deref(), runtime.dynamic_text.as_deref());
        }
        Ok(())
    }

    /// Register (or replace) this item's `poll`/`exec`/`exec_text` track
    /// (spec §4.7), recording the bookkeeping needed to route its
    /// completion back to a tile refresh. Unlike `state_cmd`, a `poll`
    /// schedule is not torn down on page navigation (spec §4.7), so this
    /// doesn't touch `active_cmd_keys_by_page`.
    fn start_cmd_for_item(&mut self, page: &str, item_index: usize, key: &str, cmd: String, every_ms: u64, opts: CmdTextOpts) {
        self.cmd_engine
            .upsert(key, cmd, every_ms, opts, Duration::from_millis(self.config.cmd_timeout_ms));
        self.cmd_key_to_item.insert(key.to_string(), (page.to_string(), item_index));
    }

    /// Recompute `item`'s runtime state from `ha`'s cached value: a
    /// matching `states:` key wins, otherwise a value-display domain's raw
    /// state becomes dynamic text (spec §9 Open Question d).
    fn ha_runtime_state(item: &crate::core::config::Item, ha: &HaClient) -> ItemRuntimeState {
        let mut runtime = ItemRuntimeState::default();
        let Some(entity_id) = &item.entity_id else { return runtime };
        let Some(state) = ha.current(entity_id) else { return runtime };
        if item.states.contains_key(&state.state) {
            runtime.state_key = Some(state.state.clone());
        } else if is_value_display_domain(entity_id) {
            runtime.dynamic_text = Some(match &state.unit {
                Some(unit) => format!("{}{unit}", state.state),
                None => state.state.clone(),
            });
        }
        runtime
    }

    /// Start every page-scoped background collaborator for the current
    /// page: `state_cmd` polling and HA subscriptions (spec §4.6, §4.7).
    fn setup_page_scope(&mut self, ha: &mut Option<HaClient>) {
        let page_name = self.nav.current_page.clone();
        let Some(page) = self.config.page(&page_name).cloned() else { return };
        let mut entities = Vec::new();
        for (item_index, item) in page.items.iter().enumerate() {
            if let Some(state_cmd) = &item.state_cmd {
                let key = format!("{page_name}:{item_index}");
                self.cmd_engine.set_state_cmd(
                    &key,
                    state_cmd.cmd.clone(),
                    state_cmd.every_ms,
                    Duration::from_millis(self.config.cmd_timeout_ms),
                );
                self.cmd_key_to_item.insert(key.clone(), (page_name.clone(), item_index));
                self.active_cmd_keys_by_page.entry(page_name.clone()).or_default().push(key);
            }
            if let Some(entity_id) = &item.entity_id {
                if ha.is_none() {
                    *ha = HaClient::connect(&self.paths.ha_sock).ok();
                }
                if let Some(h) = ha.as_mut() {
                    if h.subscribe(entity_id).is_ok() {
                        entities.push(entity_id.clone());
                        let runtime = Self::ha_runtime_state(item, h);
                        self.runtime_states.insert((page_name.clone(), item_index), runtime);
                    }
                }
            }
        }
        if !entities.is_empty() {
            self.subscribed_entities_by_page.insert(page_name, entities);
        }
    }

    /// Tear down `page_name`'s background collaborators: stop its tracked
    /// commands and unsubscribe its HA entities (spec §4.6, §4.7 "page-scope
    /// teardown").
    fn teardown_page_scope(&mut self, page_name: &str, ha: &mut Option<HaClient>) {
        if let Some(keys) = self.active_cmd_keys_by_page.remove(page_name) {
            for key in keys {
                self.cmd_engine.disable_state_cmd(&key);
                self.applied_state_seq.remove(&key);
            }
        }
        if let Some(entities) = self.subscribed_entities_by_page.remove(page_name) {
            if let Some(h) = ha.as_mut() {
                for entity in entities {
                    let _ = h.unsubscribe(&entity);
                }
            }
        }
    }

    /// Apply one item's change in `(state_key, dynamic_text)` to the device,
    /// if it actually differs from what was last sent (spec §4.12).
    fn apply_item_change(
        &mut self,
        device: &mut Option<crate::device::DeviceClient>,
        page_name: &str,
        item_index: usize,
        state_key: Option<&str>,
        dynamic_text: Option<&str>,
    ) {
        let changes = self
            .sent_memos
            .entry((page_name.to_string(), item_index))
            .or_default()
            .diff_and_update(state_key, dynamic_text);
        if changes.is_empty() || page_name != self.nav.current_page {
            return;
        }
        let Some(position) = self.position_for_item(item_index) else { return };
        let Some(d) = device.as_mut() else { return };
        self.push_partial(d, page_name, item_index, position, changes, state_key);
    }

    /// Render whatever tile currently applies to `item_index` and send the
    /// partial(s) [`crate::partial::plan_update`]/
    /// [`crate::partial::plan_update_with_wallpaper`] name for `changes`
    /// (spec §4.12).
    fn push_partial(
        &mut self,
        device: &mut crate::device::DeviceClient,
        page_name: &str,
        item_index: usize,
        position: u8,
        changes: ChangeSet,
        state_variant: Option<&str>,
    ) {
        let Some(page) = self.config.page(page_name).cloned() else { return };
        let runtime = self
            .runtime_states
            .get(&(page_name.to_string(), item_index))
            .cloned()
            .unwrap_or_default();
        let wallpaper = render::effective_wallpaper(&self.config, &page).cloned();
        let ctx = self.render_ctx();

        let render_result = match &wallpaper {
            Some(wp) => {
                let wallpaper_cache = WallpaperCache::new(self.paths.cache_root.clone());
                render::render_wallpaper_effective_tile(&ctx, &wallpaper_cache, wp, &page, item_index, position, &runtime).map(|_| ())
            }
            None => render::render_effective_tile(&ctx, &page, item_index, &runtime).map(|_| ()),
        };
        if let Err(e) = render_result {
            self.logger.error_code(&format!("partial render failed: {e}"), e.code());
            return;
        }

        let sends = match &wallpaper {
            Some(wp) => {
                let wallpaper_cache = WallpaperCache::new(self.paths.cache_root.clone());
                let base_hash = crate::cache::item_file_hash(page_name, item_index);
                crate::partial::plan_update_with_wallpaper(&wallpaper_cache, wp, position, base_hash, changes)
            }
            None => crate::partial::plan_update(&self.content_cache, page_name, item_index, position, changes, state_variant),
        };
        let label = render::effective_name(&page.items[item_index], &runtime);
        for send in sends {
            if let Err(e) = device.set_partial_explicit(send.position, &send.tile_path, label.as_deref()) {
                self.logger.error_code(&format!("partial update failed: {e}"), e.code());
            }
        }
    }

    /// Navigate to `target` (`Some(page)`) or pop history (`None`),
    /// persisting the new position, arming the post-transition ignore
    /// window, swapping page-scoped collaborators, and pushing a full
    /// re-render (spec §4.8, §4.10 step 6, §4.11).
    fn do_navigate(&mut self, target: Option<String>, device: &mut Option<crate::device::DeviceClient>, ha: &mut Option<HaClient>) {
        let old_page = self.nav.current_page.clone();
        match target {
            Some(page) => {
                if crate::dispatch::resolve_page(&self.config, &page, &old_page).is_err() {
                    self.logger.warn(&format!("navigation to unknown page `{page}` ignored"));
                    return;
                }
                self.nav.go_to(&page, 0);
            }
            None => {
                if !self.nav.back() {
                    return;
                }
            }
        }
        self.persist_position();
        self.ignore_window.arm(Duration::from_millis(self.config.post_page_change_ignore_ms));
        self.teardown_page_scope(&old_page, ha);
        self.setup_page_scope(ha);
        if let Some(d) = device.as_mut() {
            if let Err(e) = self.push_full_render(d) {
                self.logger.error_code(&format!("render after navigation failed: {e}"), e.code());
            }
        }
    }

    /// Route one dispatched action effect (spec §4.8).
    fn handle_dispatch_effect(
        &mut self,
        effect: DispatchEffect,
        page_name: &str,
        item_index: usize,
        device: &mut Option<crate::device::DeviceClient>,
        ha: &mut Option<HaClient>,
    ) {
        match effect {
            DispatchEffect::NavigateTo { page } => self.do_navigate(Some(page), device, ha),
            DispatchEffect::NavigateBack => self.do_navigate(None, device, ha),
            DispatchEffect::HaCall { domain, service, data_json } => {
                if ha.is_none() {
                    *ha = HaClient::connect(&self.paths.ha_sock).ok();
                }
                if let Some(h) = ha.as_mut() {
                    if let Err(e) = h.call(&domain, &service, &data_json) {
                        self.logger.error_code(&format!("ha call failed: {e}"), e.code());
                    }
                }
            }
            DispatchEffect::CmdStart { key, cmd, every_ms, opts } => {
                self.start_cmd_for_item(page_name, item_index, &key, cmd, every_ms, opts);
            }
            DispatchEffect::ExecDetached { cmd } => {
                crate::cmdengine::exec_detached(cmd, Duration::from_millis(self.config.cmd_timeout_ms));
            }
            DispatchEffect::PollStop { key } => {
                self.cmd_engine.poll_stop(&key);
                self.applied_text_seq.remove(&key);
                let state_key = self
                    .runtime_states
                    .get(&(page_name.to_string(), item_index))
                    .and_then(|r| r.state_key.clone());
                if let Some(rt) = self.runtime_states.get_mut(&(page_name.to_string(), item_index)) {
                    rt.dynamic_text = None;
                }
                self.apply_item_change(device, page_name, item_index, state_key.as_deref(), None);
            }
            DispatchEffect::ExecStop { key } => {
                self.cmd_engine.exec_stop(&key);
                self.cmd_key_to_item.remove(&key);
                self.applied_text_seq.remove(&key);
                self.applied_state_seq.remove(&key);
                if let Some(rt) = self.runtime_states.get_mut(&(page_name.to_string(), item_index)) {
                    rt.dynamic_text = None;
                    rt.state_key = None;
                }
                self.apply_item_change(device, page_name, item_index, None, None);
            }
            DispatchEffect::CmdTextClear { .. } => {
                let state_key = self
                    .runtime_states
                    .get(&(page_name.to_string(), item_index))
                    .and_then(|r| r.state_key.clone());
                if let Some(rt) = self.runtime_states.get_mut(&(page_name.to_string(), item_index)) {
                    rt.dynamic_text = None;
                }
                self.apply_item_change(device, page_name, item_index, state_key.as_deref(), None);
            }
            DispatchEffect::None => {}
        }
    }

    /// Handle one incoming button event: wake-without-action while
    /// dimmed/asleep, debounce, the post-navigation ignore window, then
    /// dispatch the item's configured action for this gesture (spec §4.8,
    /// §4.9).
    fn handle_button_event(
        &mut self,
        position: u8,
        event: ButtonEvent,
        device: &mut Option<crate::device::DeviceClient>,
        ha: &mut Option<HaClient>,
    ) {
        let waking = self.brightness.wakes_without_action();
        self.brightness.record_activity();
        if waking || self.ignore_window.active() {
            return;
        }
        let Some(item_index) = self
            .last_render
            .as_ref()
            .and_then(|r| r.content_slots.iter().find(|(p, _)| *p == position).map(|(_, i)| *i))
        else {
            return;
        };
        let page_name = self.nav.current_page.clone();
        if event == ButtonEvent::Tap
            && self
                .tap_debouncer
                .should_suppress(&page_name, item_index, Duration::from_millis(self.config.debounce_ms))
        {
            return;
        }
        let Some(page) = self.config.page(&page_name).cloned() else { return };
        let Some(item) = page.items.get(item_index) else { return };
        let spec = match event {
            ButtonEvent::Tap => &item.tap_action,
            ButtonEvent::Hold => &item.hold_action,
            ButtonEvent::LongHold => &item.longhold_action,
            ButtonEvent::Released => &item.released_action,
        };
        let Some(spec) = spec else { return };
        let key = format!("{page_name}:{item_index}");
        let mut effects = Vec::new();
        crate::dispatch::dispatch_spec(spec, &key, item.poll.as_ref(), item.entity_id.as_deref(), |effect| {
            effects.push(effect);
        });
        for effect in effects {
            self.handle_dispatch_effect(effect, &page_name, item_index, device, ha);
        }
    }

    /// Apply a `evt state` push for `entity_id` to every current-page item
    /// bound to it (spec §4.6, §4.12).
    fn handle_ha_change(&mut self, entity_id: &str, device: &mut Option<crate::device::DeviceClient>, ha: &Option<HaClient>) {
        let Some(h) = ha else { return };
        let page_name = self.nav.current_page.clone();
        let Some(page) = self.config.page(&page_name).cloned() else { return };
        for (item_index, item) in page.items.iter().enumerate() {
            if item.entity_id.as_deref() != Some(entity_id) {
                continue;
            }
            let runtime = Self::ha_runtime_state(item, h);
            let (state_key, dynamic_text) = (runtime.state_key.clone(), runtime.dynamic_text.clone());
            self.runtime_states.insert((page_name.clone(), item_index), runtime);
            self.apply_item_change(device, &page_name, item_index, state_key.as_deref(), dynamic_text.as_deref());
        }
    }

    /// Check every tracked command-engine entry's two independent tracks
    /// (`poll`/`exec` and `state_cmd`) for a result `seq` newer than the one
    /// last applied, feeding new text/state into the owning item's tile
    /// (spec §4.7, §4.10 step "drain cmd-engine notifications", §4.12).
    fn poll_cmd_results(&mut self, device: &mut Option<crate::device::DeviceClient>) {
        let tracked: Vec<(String, String, usize)> = self
            .cmd_key_to_item
            .iter()
            .map(|(k, (page, idx))| (k.clone(), page.clone(), *idx))
            .collect();
        for (key, page_name, item_index) in tracked {
            let Some(entry) = self.cmd_engine.get(&key) else { continue };

            let text_result = entry.latest_text();
            let text_is_new = self.applied_text_seq.get(&key) != Some(&text_result.seq);
            if text_is_new && !text_result.failed {
                self.applied_text_seq.insert(key.clone(), text_result.seq);
                self.runtime_states.entry((page_name.clone(), item_index)).or_default().dynamic_text = text_result.text.clone();
            }

            let state_result = entry.latest_state();
            let state_is_new = self.applied_state_seq.get(&key) != Some(&state_result.seq);
            if state_is_new && !state_result.failed {
                self.applied_state_seq.insert(key.clone(), state_result.seq);
                self.runtime_states.entry((page_name.clone(), item_index)).or_default().state_key = state_result.text.clone();
            }

            if !text_is_new && !state_is_new {
                continue;
            }
            let prior = self.runtime_states.entry((page_name.clone(), item_index)).or_default();
            let (state_key, dynamic_text) = (prior.state_key.clone(), prior.dynamic_text.clone());
            self.apply_item_change(device, &page_name, item_index, state_key.as_deref(), dynamic_text.as_deref());
        }
    }

    /// Run the event loop until a shutdown signal is observed (spec
    /// §4.10). Reconnects the device socket on failure rather than
    /// exiting: a transient device-service restart shouldn't take the
    /// whole daemon down.
    ///
    /// # Errors
    /// Returns an error only for failures that aren't retryable (e.g. the
    /// control socket itself breaking).
    pub fn run(&mut self) -> Result<()> {
        let mut device = crate::device::DeviceClient::connect(&self.paths.device_sock, self.config.debounce_ms).ok();
        let mut ha: Option<HaClient> = None;

        self.setup_page_scope(&mut ha);
        if let Some(d) = device.as_mut() {
            // spec §8 Scenario 1: brightness is applied before the first
            // full-page render, not after.
            if self.brightness.send_due() {
                let ok = d.set_brightness(self.brightness.pending_level()).is_ok();
                self.brightness.record_send_outcome(ok);
            }
            if let Err(e) = self.push_full_render(d) {
                self.logger.error_code(&format!("initial render failed: {e}"), e.code());
            }
        }

        while !signals::shutdown_requested() {
            let device_fd = match &device {
                Some(d) => d.as_raw_fd(),
                None => {
                    device = crate::device::DeviceClient::connect(&self.paths.device_sock, self.config.debounce_ms).ok();
                    if let Some(d) = device.as_mut() {
                        self.logger.info("device reconnected");
                        if let Err(e) = self.push_full_render(d) {
                            self.logger.error_code(&format!("render after reconnect failed: {e}"), e.code());
                        }
                    }
                    eventloop::sleep_ms(200);
                    continue;
                }
            };
            let ha_fd = ha.as_ref().map(HaClient::as_raw_fd);
            let fds = self.watched_fds(device_fd, ha_fd);
            let result = eventloop::poll_once(&fds)?;

            for source in &result.ready {
                match source {
                    eventloop::ReadySource::Device => {
                        let drained = device.as_mut().map(crate::device::DeviceClient::drain_readable);
                        match drained {
                            Some(Ok(())) => loop {
                                let Some(event) = device.as_mut().and_then(crate::device::DeviceClient::poll_event) else {
                                    break;
                                };
                                match event {
                                    crate::device::DeviceEvent::Button { position, event } => {
                                        if self.control_enabled {
                                            self.handle_button_event(position, event, &mut device, &mut ha);
                                        }
                                    }
                                    crate::device::DeviceEvent::Connected => {
                                        if let Some(d) = device.as_mut() {
                                            if let Some(dir) = &self.paths.sys_pregen_dir {
                                                let style_path = dir.join("label_style.json");
                                                if style_path.is_file() {
                                                    let _ = d.set_label_style(&style_path);
                                                }
                                            }
                                            self.sent_memos.clear();
                                            if let Err(e) = self.push_full_render(d) {
                                                self.logger
                                                    .error_code(&format!("render after evt connected failed: {e}"), e.code());
                                            }
                                        }
                                    }
                                    crate::device::DeviceEvent::Disconnected => device = None,
                                }
                            },
                            Some(Err(_)) => device = None,
                            None => {}
                        }
                    }
                    eventloop::ReadySource::Control => {
                        if let Ok((cmd, stream)) = self.control.accept_command() {
                            self.handle_control_command(&cmd, &mut device, &mut ha);
                            crate::control::reply(stream, true, "");
                        }
                    }
                    eventloop::ReadySource::Ha => {
                        let drained = ha.as_mut().map(HaClient::drain_readable);
                        match drained {
                            Some(Ok(changed)) => {
                                for entity_id in changed {
                                    self.handle_ha_change(&entity_id, &mut device, &ha);
                                }
                            }
                            Some(Err(_)) => ha = None,
                            None => {}
                        }
                    }
                    eventloop::ReadySource::CmdNotify => {
                        eventloop::drain_notify_pipe(self.notify_read);
                        self.poll_cmd_results(&mut device);
                    }
                }
            }

            self.cmd_engine.tick(now_ms());
            if let Some(new_state) = self.brightness.tick() {
                self.logger.info(&format!("brightness transitioned to {new_state:?}"));
            }
            if self.brightness.send_due() {
                if let Some(d) = device.as_mut() {
                    let level = self.brightness.pending_level();
                    let ok = d.set_brightness(level).is_ok();
                    self.brightness.record_send_outcome(ok);
                }
            }
        }

        self.persist_position();
        Ok(())
    }

    fn handle_control_command(
        &mut self,
        cmd: &crate::control::ControlCommand,
        device: &mut Option<crate::device::DeviceClient>,
        ha: &mut Option<HaClient>,
    ) {
        match cmd {
            crate::control::ControlCommand::LoadLastPage => {
                if let Some(pos) = self.position_store.load() {
                    if self.config.page(&pos.page).is_some() {
                        let old_page = self.nav.current_page.clone();
                        self.nav.current_page = pos.page;
                        self.nav.current_offset = pos.offset;
                        self.teardown_page_scope(&old_page, ha);
                        self.setup_page_scope(ha);
                        if let Some(d) = device.as_mut() {
                            if let Err(e) = self.push_full_render(d) {
                                self.logger.error_code(&format!("render after load-last-page failed: {e}"), e.code());
                            }
                        }
                    }
                }
            }
            crate::control::ControlCommand::StopControl => self.control_enabled = false,
            crate::control::ControlCommand::StartControl => self.control_enabled = true,
            crate::control::ControlCommand::SimulateButton { position, event } => {
                self.handle_button_event(*position, *event, device, ha);
            }
            crate::control::ControlCommand::Unknown(_) => {}
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config_yaml() -> &'static str {
        "pages:\n  $root:\n    buttons: []\n"
    }

    fn test_paths(dir: &std::path::Path) -> DaemonPaths {
        let config_path = dir.join("config.yaml");
        std::fs::write(&config_path, minimal_config_yaml()).unwrap();
        let state_dir = dir.join("state");
        std::fs::create_dir_all(&state_dir).unwrap();
        let cache_root = dir.join("cache");
        std::fs::create_dir_all(&cache_root).unwrap();

        DaemonPaths {
            config: config_path,
            device_sock: dir.join("device.sock"),
            control_sock: dir.join("control.sock"),
            ha_sock: dir.join("ha.sock"),
            cache_root,
            state_dir,
            error_icon: None,
            sys_pregen_dir: None,
        }
    }

    #[test]
    fn daemon_start_loads_config_and_restores_position() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let logger = Arc::new(JsonlLogger::stderr_only(crate::logger::LogLevel::Info));
        let daemon = Daemon::start(paths, logger).unwrap();
        assert_eq!(daemon.nav.current_page, "$root");
    }

    #[test]
    fn stop_control_disables_button_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let logger = Arc::new(JsonlLogger::stderr_only(crate::logger::LogLevel::Info));
        let mut daemon = Daemon::start(paths, logger).unwrap();
        let mut device = None;
        let mut ha = None;
        daemon.handle_control_command(&crate::control::ControlCommand::StopControl, &mut device, &mut ha);
        assert!(!daemon.control_enabled);
        daemon.handle_control_command(&crate::control::ControlCommand::StartControl, &mut device, &mut ha);
        assert!(daemon.control_enabled);
    }

    #[test]
    fn navigate_to_unknown_page_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let logger = Arc::new(JsonlLogger::stderr_only(crate::logger::LogLevel::Info));
        let mut daemon = Daemon::start(paths, logger).unwrap();
        let mut device = None;
        let mut ha = None;
        daemon.do_navigate(Some("nowhere".to_string()), &mut device, &mut ha);
        assert_eq!(daemon.nav.current_page, "$root");
    }
}
