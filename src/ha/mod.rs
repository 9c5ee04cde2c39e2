//! Home Assistant client over a Unix domain socket line protocol (spec
//! §4.6). Maintains a local `entity_id -> state` map kept current by
//! `sub-state`/`unsub` subscriptions driven by page transitions.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;

use crate::core::errors::{KeydeckError, Result};

/// Domains whose raw state is meaningful as button text (spec §9 Open
/// Question d: "value-display domains"). Everything else only drives
/// icon/state-variant selection, never raw text display.
const VALUE_DISPLAY_DOMAINS: &[&str] = &["sensor", "number", "input_number"];

/// An entity's last-known state and optional unit of measurement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EntityState {
    pub state: String,
    pub unit: Option<String>,
}

/// Whether `entity_id`'s domain is one the spec allows to display its raw
/// state as button text.
#[must_use]
pub fn is_value_display_domain(entity_id: &str) -> bool {
    entity_id
        .split_once('.')
        .map(|(domain, _)| VALUE_DISPLAY_DOMAINS.contains(&domain))
        .unwrap_or(false)
}

/// Minimal JSON scanner for the HA socket's `get`/`evt state` payloads.
/// Reading codecs is an explicit non-goal (spec §1), so this only pulls
/// the two string fields actually needed (`state`, `unit_of_measurement`)
/// rather than parsing a full JSON document tree.
fn extract_json_string_field(payload: &str, key: &str) -> Option<String> {
    let needle = format!("\"{key}\"");
    let key_at = payload.find(&needle)?;
    let after_key = &payload[key_at + needle.len()..];
    let colon_at = after_key.find(':')?;
    let after_colon = after_key[colon_at + 1..].trim_start();
    if let Some(rest) = after_colon.strip_prefix('"') {
        let end = rest.find('"')?;
        Some(rest[..end].replace("\\\"", "\""))
    } else if after_colon.starts_with("null") {
        None
    } else {
        let end = after_colon
            .find(|c: char| c == ',' || c == '}')
            .unwrap_or(after_colon.len());
        Some(after_colon[..end].trim().to_string())
    }
}

/// Parse one state update's JSON payload into an [`EntityState`].
fn parse_state_payload(payload: &str) -> Option<EntityState> {
    let state = extract_json_string_field(payload, "state")?;
    let unit = extract_json_string_field(payload, "unit_of_measurement");
    Some(EntityState { state, unit })
}

/// Parse a `sub-state` reply's `sub_id=<int>` suffix (spec §4.6: `ok
/// sub_id=<int>`).
fn parse_sub_id(reply: &str) -> Option<u64> {
    let at = reply.find("sub_id=")?;
    let rest = &reply[at + "sub_id=".len()..];
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Client connection to the home-automation service.
pub struct HaClient {
    stream: BufReader<UnixStream>,
    raw: UnixStream,
    states: HashMap<String, EntityState>,
    subscriptions: HashMap<String, u64>,
}

impl HaClient {
    /// Connect to the HA service at `path`.
    ///
    /// # Errors
    /// Returns [`KeydeckError::HaProtocol`] if the socket can't be opened.
    pub fn connect(path: &std::path::Path) -> Result<Self> {
        let raw = UnixStream::connect(path).map_err(|e| KeydeckError::HaProtocol {
            details: format!("connect {}: {e}", path.display()),
        })?;
        let reader = raw.try_clone().map_err(|e| KeydeckError::HaProtocol {
            details: format!("clone socket: {e}"),
        })?;
        Ok(Self {
            stream: BufReader::new(reader),
            raw,
            states: HashMap::new(),
            subscriptions: HashMap::new(),
        })
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.raw.as_raw_fd()
    }

    fn send_line(&mut self, line: &str) -> Result<()> {
        self.raw
            .write_all(format!("{line}\n").as_bytes())
            .map_err(|e| KeydeckError::HaProtocol {
                details: format!("write: {e}"),
            })
    }

    fn read_line(&mut self) -> Result<String> {
        let mut buf = String::new();
        let n = self.stream.read_line(&mut buf).map_err(|e| KeydeckError::HaProtocol {
            details: format!("read: {e}"),
        })?;
        if n == 0 {
            return Err(KeydeckError::HaProtocol {
                details: "connection closed".to_string(),
            });
        }
        Ok(buf)
    }

    /// Subscribe to `entity_id`'s state updates (`sub-state <entity_id>` →
    /// `ok sub_id=<int>`), then issue a `get` to prime its current value
    /// (spec §4.6 "on first subscribe, also issue a get to prime state").
    /// Idempotent: a second subscribe for an already-subscribed entity is a
    /// no-op.
    pub fn subscribe(&mut self, entity_id: &str) -> Result<()> {
        if self.subscriptions.contains_key(entity_id) {
            return Ok(());
        }
        self.send_line(&format!("sub-state {entity_id}"))?;
        let reply = self.read_line()?;
        let sub_id = parse_sub_id(&reply).ok_or_else(|| KeydeckError::HaProtocol {
            details: format!("malformed sub-state reply for {entity_id}: {}", reply.trim()),
        })?;
        self.subscriptions.insert(entity_id.to_string(), sub_id);
        let primed = self.get(entity_id)?;
        self.states.insert(entity_id.to_string(), primed);
        Ok(())
    }

    /// Unsubscribe from `entity_id` (`unsub <id>`, using the numeric
    /// `sub_id` returned by [`Self::subscribe`], not the entity string —
    /// spec §4.6/§6). Called on page transitions away from a page
    /// referencing it.
    pub fn unsubscribe(&mut self, entity_id: &str) -> Result<()> {
        let Some(sub_id) = self.subscriptions.remove(entity_id) else {
            return Ok(());
        };
        self.send_line(&format!("unsub {sub_id}"))?;
        self.states.remove(entity_id);
        Ok(())
    }

    /// One-shot fetch, bypassing the subscription map (`get <entity_id>` →
    /// `ok {json}`).
    pub fn get(&mut self, entity_id: &str) -> Result<EntityState> {
        self.send_line(&format!("get {entity_id}"))?;
        let reply = self.read_line()?;
        parse_state_payload(&reply).ok_or_else(|| KeydeckError::HaProtocol {
            details: format!("malformed state payload for {entity_id}"),
        })
    }

    /// `call <domain> <service> <json-data>` — fire-and-forget (spec §4.6:
    /// "Fire-and-forget"); no reply is read. The special `script.<entity>`
    /// case (spec §4.8 "action dispatch: HA calls") is the dispatcher's
    /// concern, not this transport.
    pub fn call(&mut self, domain: &str, service: &str, data_json: &str) -> Result<()> {
        self.send_line(&format!("call {domain} {service} {data_json}"))
    }

    /// Read every complete line currently available without blocking and
    /// fold `evt state <entity_id> <json>` pushes into the local map.
    /// Returns the entity IDs whose cached state changed. Called by the
    /// event loop once `poll(2)` reports this fd readable.
    pub fn drain_readable(&mut self) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        loop {
            let buf = self.stream.fill_buf().map_err(|e| KeydeckError::HaProtocol {
                details: format!("fill_buf: {e}"),
            })?;
            if buf.is_empty() {
                return Err(KeydeckError::HaProtocol {
                    details: "connection closed".to_string(),
                });
            }
            let Some(newline_at) = buf.iter().position(|&b| b == b'\n') else {
                return Ok(changed);
            };
            let line = String::from_utf8_lossy(&buf[..newline_at]).into_owned();
            let consumed = newline_at + 1;
            self.stream.consume(consumed);
            if let Some(rest) = line.strip_prefix("evt state ") {
                if let Some((entity_id, payload)) = rest.split_once(' ') {
                    if let Some(state) = parse_state_payload(payload) {
                        self.states.insert(entity_id.to_string(), state);
                        changed.push(entity_id.to_string());
                    }
                }
            }
        }
    }

    /// Current cached state for `entity_id`, if subscribed.
    #[must_use]
    pub fn current(&self, entity_id: &str) -> Option<&EntityState> {
        self.states.get(entity_id)
    }
}
