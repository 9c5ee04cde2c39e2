//! Interactive terminal status line, shown only when running attached to
//! a TTY with the `cli` feature enabled (spec §4.13 "status line").
//!
//! Renders one line in place using cursor save/restore plus erase-line,
//! so the daemon's scrolling JSONL output and a single live summary line
//! can coexist without a full TUI.

#![cfg(feature = "cli")]

use std::io::{stdout, Write};

use crossterm::cursor::{MoveToColumn, RestorePosition, SavePosition};
use crossterm::terminal::{Clear, ClearType};
use crossterm::{queue, style::Print};

/// Whether stdout is a TTY the status line can safely render to.
#[must_use]
pub fn is_tty() -> bool {
    use std::io::IsTerminal;
    stdout().is_terminal()
}

/// One status line's content (spec §4.13: current page, brightness state,
/// device connection state).
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub page: String,
    pub brightness_state: &'static str,
    pub device_connected: bool,
}

impl StatusSnapshot {
    fn render(&self) -> String {
        let device = if self.device_connected { "connected" } else { "disconnected" };
        format!(
            "keydeckd | page: {} | brightness: {} | device: {device}",
            self.page, self.brightness_state
        )
    }
}

/// Redraws the status line in place. A no-op (returns `Ok(())` without
/// writing) when stdout isn't a TTY, so piping logs to a file or `journald`
/// never sees status-line escape codes mixed into the stream.
///
/// # Errors
/// Returns the underlying IO error if a terminal write fails.
pub fn redraw(snapshot: &StatusSnapshot) -> std::io::Result<()> {
    if !is_tty() {
        return Ok(());
    }
    let mut out = stdout();
    queue!(
        out,
        SavePosition,
        MoveToColumn(0),
        Clear(ClearType::CurrentLine),
        Print(snapshot.render()),
        RestorePosition,
    )?;
    out.flush()
}
