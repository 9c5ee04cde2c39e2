//! Line-protocol client to the device service over a Unix domain socket
//! (spec §4.5, §6). The device service owns the physical hardware; this
//! module only speaks the wire protocol and applies the debounce/sanitize
//! rules.
//!
//! Two logical channels share one socket path: a persistent *subscription*
//! connection opened once via `read-buttons` and drained every loop
//! iteration for button/lifecycle events, and a *command* channel that
//! opens a fresh connection per request ("write one command per
//! connection; read up to the reply delimiter; close", spec §4.5).

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::errors::{KeydeckError, Result};
use crate::dispatch::ButtonEvent;

/// Minimum gap between two command sends, measured from the end of the
/// previous send (spec §4.5 "debounce").
const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// A parsed command-socket reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Ok,
    ErrNoDevice,
    Err(String),
    Other(String),
}

impl CommandReply {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "ok" || line.starts_with("ok ") {
            Self::Ok
        } else if line == "err no_device" {
            Self::ErrNoDevice
        } else if let Some(reason) = line.strip_prefix("err ") {
            Self::Err(reason.to_string())
        } else {
            Self::Other(line.to_string())
        }
    }
}

/// A parsed subscription-socket event line (spec §6 "Device subscription
/// socket").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Button { position: u8, event: ButtonEvent },
    Connected,
    Disconnected,
}

impl DeviceEvent {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line == "evt connected" {
            return Some(Self::Connected);
        }
        if line == "evt disconnected" {
            return Some(Self::Disconnected);
        }
        let rest = line.strip_prefix("button ")?;
        let mut parts = rest.split_whitespace();
        let position = parts.next()?.parse::<u8>().ok()?;
        let event = match parts.next()? {
            "TAP" => ButtonEvent::Tap,
            "HOLD" => ButtonEvent::Hold,
            "LONGHOLD" => ButtonEvent::LongHold,
            "RELEASED" => ButtonEvent::Released,
            _ => return None,
        };
        Some(Self::Button { position, event })
    }
}

/// Strip whitespace/control bytes from a label, replacing runs with `_`
/// (spec §4.5 "label sanitization" — the device line protocol is
/// newline-delimited, so labels can't contain raw control bytes).
#[must_use]
pub fn sanitize_label(raw: &str) -> String {
    // Track which output `_` characters were inserted as whitespace/control
    // replacements so only those are trimmed at the edges — a literal
    // underscore typed by the user (e.g. `"_vip_"`) must pass through
    // untouched (spec §4.5: "other UTF-8 bytes are passed through").
    let mut out: Vec<(char, bool)> = Vec::with_capacity(raw.len());
    let mut last_was_replaced = false;
    for ch in raw.chars() {
        if ch.is_control() || ch.is_whitespace() {
            if !last_was_replaced {
                out.push(('_', true));
                last_was_replaced = true;
            }
        } else {
            out.push((ch, false));
            last_was_replaced = false;
        }
    }
    let start = out.iter().position(|(_, replaced)| !replaced).unwrap_or(out.len());
    let end = out.iter().rposition(|(_, replaced)| !replaced).map_or(start, |i| i + 1);
    out[start..end].iter().map(|(c, _)| *c).collect()
}

/// Client to the device service: one persistent subscription stream plus
/// one-shot command connections.
pub struct DeviceClient {
    sock_path: PathBuf,
    sub_stream: BufReader<UnixStream>,
    sub_raw: UnixStream,
    debounce: Duration,
    last_send_end: Option<Instant>,
    pending: VecDeque<DeviceEvent>,
}

impl DeviceClient {
    /// Open the subscription connection at `path` and issue `read-buttons`.
    ///
    /// # Errors
    /// Returns [`KeydeckError::DeviceProtocol`] if the socket can't be
    /// opened or the subscribe write fails.
    pub fn connect(path: &Path, debounce_ms: u64) -> Result<Self> {
        let raw = UnixStream::connect(path).map_err(|e| KeydeckError::DeviceProtocol {
            details: format!("connect {}: {e}", path.display()),
        })?;
        let reader = raw.try_clone().map_err(|e| KeydeckError::DeviceProtocol {
            details: format!("clone socket: {e}"),
        })?;
        let mut client = Self {
            sock_path: path.to_path_buf(),
            sub_stream: BufReader::new(reader),
            sub_raw: raw,
            debounce: Duration::from_millis(if debounce_ms == 0 {
                DEFAULT_DEBOUNCE_MS
            } else {
                debounce_ms
            }),
            last_send_end: None,
            pending: VecDeque::new(),
        };
        client.subscribe_buttons()?;
        Ok(client)
    }

    /// The subscription socket's file descriptor, registered with the event
    /// loop's `poll(2)` set.
    #[must_use]
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.sub_raw.as_raw_fd()
    }

    fn wait_for_debounce(&self) {
        if let Some(last_end) = self.last_send_end {
            let elapsed = last_end.elapsed();
            if elapsed < self.debounce {
                std::thread::sleep(self.debounce - elapsed);
            }
        }
    }

    /// Open a fresh connection, write `line`, read one reply line, and
    /// close (spec §4.5: one command per connection).
    fn run_command(&mut self, line: &str) -> Result<CommandReply> {
        self.wait_for_debounce();
        let mut conn = UnixStream::connect(&self.sock_path).map_err(|e| KeydeckError::DeviceProtocol {
            details: format!("connect {}: {e}", self.sock_path.display()),
        })?;
        conn.write_all(format!("{line}\n").as_bytes())
            .map_err(|e| KeydeckError::DeviceProtocol {
                details: format!("write: {e}"),
            })?;
        let mut reader = BufReader::new(conn);
        let mut buf = String::new();
        let n = reader.read_line(&mut buf).map_err(|e| KeydeckError::DeviceProtocol {
            details: format!("read: {e}"),
        })?;
        self.last_send_end = Some(Instant::now());
        if n == 0 {
            return Err(KeydeckError::DeviceNotReady);
        }
        Ok(CommandReply::parse(&buf))
    }

    /// `set-buttons-explicit --button-N=<path> [--label-N=<label>] ...`, or
    /// the `-14` variant when a wallpaper backplate tile occupies button 14
    /// (spec §4.5, §6).
    pub fn set_buttons_explicit(&mut self, entries: &[(u8, &Path, Option<&str>)]) -> Result<CommandReply> {
        let verb = if entries.iter().any(|(pos, _, _)| *pos == 14) {
            "set-buttons-explicit-14"
        } else {
            "set-buttons-explicit"
        };
        let mut line = verb.to_string();
        for (pos, path, label) in entries {
            line.push_str(&format!(" --button-{pos}={}", path.display()));
            if let Some(label) = label {
                line.push_str(&format!(" --label-{pos}={}", sanitize_label(label)));
            }
        }
        self.run_command(&line)
    }

    /// `set-partial-explicit --button-N=<path> [--label-N=<label>]` — a
    /// single-button update.
    pub fn set_partial_explicit(&mut self, pos: u8, path: &Path, label: Option<&str>) -> Result<CommandReply> {
        let mut line = format!("set-partial-explicit --button-{pos}={}", path.display());
        if let Some(label) = label {
            line.push_str(&format!(" --label-{pos}={}", sanitize_label(label)));
        }
        self.run_command(&line)
    }

    /// `set-brightness <0..100>`.
    pub fn set_brightness(&mut self, level: u8) -> Result<CommandReply> {
        self.run_command(&format!("set-brightness {}", level.min(100)))
    }

    /// `set-label-style <path-to-json>` — applied once at startup (spec
    /// §4.5).
    pub fn set_label_style(&mut self, style_json_path: &Path) -> Result<CommandReply> {
        self.run_command(&format!("set-label-style {}", style_json_path.display()))
    }

    /// `read-buttons` on the subscription connection. Called once by
    /// [`Self::connect`]; exposed so a reconnect can re-arm the
    /// subscription after `evt connected` (spec §8 Scenario 5).
    pub fn subscribe_buttons(&mut self) -> Result<()> {
        self.sub_raw
            .write_all(b"read-buttons\n")
            .map_err(|e| KeydeckError::DeviceProtocol {
                details: format!("subscribe: {e}"),
            })
    }

    /// `ping` — liveness check, expects `ok`.
    pub fn ping(&mut self) -> Result<CommandReply> {
        self.run_command("ping")
    }

    /// Non-blocking drain of one already-buffered event, if any line was
    /// read ahead by [`Self::drain_readable`].
    pub fn poll_event(&mut self) -> Option<DeviceEvent> {
        self.pending.pop_front()
    }

    /// Read every complete line currently available on the subscription
    /// socket without blocking, queuing parsed events. Called by the event
    /// loop once `poll(2)` reports this fd readable.
    ///
    /// # Errors
    /// Returns [`KeydeckError::DeviceNotReady`] if the connection closed.
    pub fn drain_readable(&mut self) -> Result<()> {
        loop {
            let buf = self.sub_stream.fill_buf().map_err(|e| KeydeckError::DeviceProtocol {
                details: format!("fill_buf: {e}"),
            })?;
            if buf.is_empty() {
                return Err(KeydeckError::DeviceNotReady);
            }
            let Some(newline_at) = buf.iter().position(|&b| b == b'\n') else {
                return Ok(());
            };
            let line = String::from_utf8_lossy(&buf[..newline_at]).into_owned();
            let consumed = newline_at + 1;
            self.sub_stream.consume(consumed);
            if let Some(event) = DeviceEvent::parse(&line) {
                self.pending.push_back(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_replies() {
        assert_eq!(CommandReply::parse("ok"), CommandReply::Ok);
        assert_eq!(CommandReply::parse("err no_device"), CommandReply::ErrNoDevice);
        assert_eq!(
            CommandReply::parse("err bad_position"),
            CommandReply::Err("bad_position".to_string())
        );
    }

    #[test]
    fn parses_button_events() {
        assert_eq!(
            DeviceEvent::parse("button 3 TAP"),
            Some(DeviceEvent::Button {
                position: 3,
                event: ButtonEvent::Tap
            })
        );
        assert_eq!(
            DeviceEvent::parse("button 14 LONGHOLD"),
            Some(DeviceEvent::Button {
                position: 14,
                event: ButtonEvent::LongHold
            })
        );
        assert_eq!(
            DeviceEvent::parse("button 3 RELEASED"),
            Some(DeviceEvent::Button {
                position: 3,
                event: ButtonEvent::Released
            })
        );
    }

    #[test]
    fn parses_lifecycle_events() {
        assert_eq!(DeviceEvent::parse("evt connected"), Some(DeviceEvent::Connected));
        assert_eq!(DeviceEvent::parse("evt disconnected"), Some(DeviceEvent::Disconnected));
    }

    #[test]
    fn unrecognized_line_is_none() {
        assert_eq!(DeviceEvent::parse("ok"), None);
        assert_eq!(DeviceEvent::parse("button 3 WIGGLE"), None);
    }

    #[test]
    fn sanitize_collapses_whitespace_and_control_bytes() {
        assert_eq!(sanitize_label("Living Room\t\n"), "Living_Room");
        assert_eq!(sanitize_label("  leading"), "leading");
        assert_eq!(sanitize_label("a\u{0007}b"), "a_b");
    }

    #[test]
    fn sanitize_empty_label_is_empty() {
        assert_eq!(sanitize_label("   "), "");
    }

    #[test]
    fn literal_underscores_are_not_trimmed() {
        assert_eq!(sanitize_label("_vip_"), "_vip_");
        assert_eq!(sanitize_label("  _vip_  "), "_vip_");
    }
}
