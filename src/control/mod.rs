//! Local control socket: a small command surface for external tooling and
//! session persistence (spec §4.11).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use crate::core::errors::{KeydeckError, Result};
use crate::dispatch::ButtonEvent;

/// A parsed control-socket command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    StopControl,
    StartControl,
    SimulateButton { position: u8, event: ButtonEvent },
    LoadLastPage,
    Unknown(String),
}

/// Split a `simulate-button` argument like `TAP3`/`LONGHOLD14` into its
/// event-name prefix and numeric suffix (spec §4.11: `<EVT><N>` with no
/// separator, `<EVT> ∈ {TAP,HOLD,LONGHOLD,RELEASED}`, `<N> ∈ [1..14]`).
fn parse_simulate_arg(arg: &str) -> Option<(u8, ButtonEvent)> {
    let digits_at = arg.find(|c: char| c.is_ascii_digit())?;
    let (evt, num) = arg.split_at(digits_at);
    let event = match evt {
        "TAP" => ButtonEvent::Tap,
        "HOLD" => ButtonEvent::Hold,
        "LONGHOLD" => ButtonEvent::LongHold,
        "RELEASED" => ButtonEvent::Released,
        _ => return None,
    };
    let position: u8 = num.parse().ok()?;
    if (1..=14).contains(&position) {
        Some((position, event))
    } else {
        None
    }
}

impl ControlCommand {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("stop-control") => Self::StopControl,
            Some("start-control") => Self::StartControl,
            Some("load-last-page") => Self::LoadLastPage,
            Some("simulate-button") => match parts.next().and_then(parse_simulate_arg) {
                Some((position, event)) => Self::SimulateButton { position, event },
                None => Self::Unknown(line.to_string()),
            },
            _ => Self::Unknown(line.to_string()),
        }
    }
}

/// Persisted `(page, offset)` so a restart resumes where the user left
/// off (spec §4.11 "last_page/last_offset persistence").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastPosition {
    pub page: String,
    pub offset: usize,
}

/// Reads/writes the `last_page` file under the state directory. A flat
/// `<page>\n<offset>\n` text format, not JSON, since it's a tiny
/// single-purpose file read once at startup and written on every
/// navigation — matching the spec's "persist on every navigation" without
/// paying a serialization round-trip for two fields.
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("last_page"),
        }
    }

    #[must_use]
    pub fn load(&self) -> Option<LastPosition> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        let mut lines = text.lines();
        let page = lines.next()?.to_string();
        let offset = lines.next()?.parse().ok()?;
        Some(LastPosition { page, offset })
    }

    /// # Errors
    /// Returns [`KeydeckError::Io`] if the write fails.
    pub fn save(&self, pos: &LastPosition) -> Result<()> {
        let text = format!("{}\n{}\n", pos.page, pos.offset);
        std::fs::write(&self.path, text).map_err(|e| KeydeckError::io(&self.path, e))
    }
}

/// Listening endpoint for the control socket. One-line request, one-line
/// `ok`/`err <reason>` reply, matching the device/HA wire style (spec
/// §4.11, §4.5, §4.6 share the same line-protocol idiom).
pub struct ControlListener {
    listener: UnixListener,
}

impl ControlListener {
    /// Bind the control socket at `path`, removing a stale socket file
    /// left behind by a previous unclean shutdown.
    ///
    /// # Errors
    /// Returns [`KeydeckError::Io`] if the bind fails.
    pub fn bind(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|e| KeydeckError::io(path, e))?;
        Ok(Self { listener })
    }

    #[must_use]
    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.listener.as_raw_fd()
    }

    /// Accept one pending connection and read its single command line.
    /// Non-blocking callers should only invoke this once `poll(2)` reports
    /// the listener fd readable.
    pub fn accept_command(&self) -> Result<(ControlCommand, UnixStream)> {
        let (stream, _addr) = self.listener.accept().map_err(|e| KeydeckError::Runtime {
            details: format!("accept control connection: {e}"),
        })?;
        let mut reader = BufReader::new(stream.try_clone().map_err(|e| KeydeckError::Runtime {
            details: format!("clone control stream: {e}"),
        })?);
        let mut line = String::new();
        reader.read_line(&mut line).map_err(|e| KeydeckError::Runtime {
            details: format!("read control command: {e}"),
        })?;
        Ok((ControlCommand::parse(&line), stream))
    }
}

/// Write a reply and shut the connection down (control sessions are
/// strictly request/response, one command per connection).
pub fn reply(mut stream: UnixStream, ok: bool, detail: &str) {
    let line = if ok {
        "ok\n".to_string()
    } else {
        format!("err {detail}\n")
    };
    let _ = stream.write_all(line.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(ControlCommand::parse("stop-control"), ControlCommand::StopControl);
        assert_eq!(ControlCommand::parse("start-control\n"), ControlCommand::StartControl);
        assert_eq!(ControlCommand::parse("load-last-page"), ControlCommand::LoadLastPage);
    }

    #[test]
    fn parses_simulate_button() {
        assert_eq!(
            ControlCommand::parse("simulate-button TAP3"),
            ControlCommand::SimulateButton {
                position: 3,
                event: ButtonEvent::Tap,
            }
        );
        assert_eq!(
            ControlCommand::parse("simulate-button LONGHOLD14"),
            ControlCommand::SimulateButton {
                position: 14,
                event: ButtonEvent::LongHold,
            }
        );
        assert_eq!(
            ControlCommand::parse("simulate-button RELEASED1"),
            ControlCommand::SimulateButton {
                position: 1,
                event: ButtonEvent::Released,
            }
        );
    }

    #[test]
    fn malformed_simulate_button_is_unknown() {
        assert!(matches!(
            ControlCommand::parse("simulate-button notanumber"),
            ControlCommand::Unknown(_)
        ));
        assert!(matches!(
            ControlCommand::parse("simulate-button TAP15"),
            ControlCommand::Unknown(_)
        ));
    }

    #[test]
    fn position_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::new(dir.path());
        assert!(store.load().is_none());
        let pos = LastPosition {
            page: "settings".to_string(),
            offset: 3,
        };
        store.save(&pos).unwrap();
        assert_eq!(store.load(), Some(pos));
    }
}
