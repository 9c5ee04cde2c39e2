//! Integration coverage for the control socket (spec §4.11) against a
//! real Unix domain socket, plus `last_page`/`last_offset` persistence.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::thread;

use keydeck::control::{self, ControlCommand, ControlListener, LastPosition, PositionStore};
use keydeck::dispatch::ButtonEvent;

fn socket_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "keydeckd-test-control-{name}-{}-{:?}.sock",
        std::process::id(),
        thread::current().id()
    ))
}

#[test]
fn simulate_button_round_trips_and_replies_ok() {
    let path = socket_path("simulate");
    let listener = ControlListener::bind(&path).expect("bind control socket");

    let mut client = UnixStream::connect(&path).expect("connect to control socket");
    client.write_all(b"simulate-button TAP3\n").expect("write command");

    let (cmd, stream) = listener.accept_command().expect("accept command");
    assert_eq!(
        cmd,
        ControlCommand::SimulateButton {
            position: 3,
            event: ButtonEvent::Tap,
        }
    );
    control::reply(stream, true, "");

    let mut reader = BufReader::new(client);
    let mut reply_line = String::new();
    reader.read_line(&mut reply_line).expect("read reply");
    assert_eq!(reply_line, "ok\n");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn longhold_on_button_fourteen_parses() {
    let path = socket_path("longhold14");
    let listener = ControlListener::bind(&path).expect("bind control socket");

    let mut client = UnixStream::connect(&path).expect("connect to control socket");
    client.write_all(b"simulate-button LONGHOLD14\n").expect("write command");

    let (cmd, stream) = listener.accept_command().expect("accept command");
    assert_eq!(
        cmd,
        ControlCommand::SimulateButton {
            position: 14,
            event: ButtonEvent::LongHold,
        }
    );
    control::reply(stream, true, "");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn unrecognized_command_replies_with_an_error() {
    let path = socket_path("unknown");
    let listener = ControlListener::bind(&path).expect("bind control socket");

    let mut client = UnixStream::connect(&path).expect("connect to control socket");
    client.write_all(b"frobnicate\n").expect("write command");

    let (cmd, stream) = listener.accept_command().expect("accept command");
    assert_eq!(cmd, ControlCommand::Unknown("frobnicate".to_string()));
    control::reply(stream, false, "unknown command");

    let mut reader = BufReader::new(client);
    let mut reply_line = String::new();
    reader.read_line(&mut reply_line).expect("read reply");
    assert_eq!(reply_line, "err unknown command\n");

    let _ = std::fs::remove_file(&path);
}

#[test]
fn position_store_round_trips_last_page_and_offset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PositionStore::new(dir.path());
    assert!(store.load().is_none(), "no position persisted yet");

    store
        .save(&LastPosition {
            page: "$root".to_string(),
            offset: 12,
        })
        .expect("save position");

    let loaded = store.load().expect("load position");
    assert_eq!(loaded.page, "$root");
    assert_eq!(loaded.offset, 12);
}

#[test]
fn position_store_survives_repeated_saves() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = PositionStore::new(dir.path());

    store
        .save(&LastPosition {
            page: "$root".to_string(),
            offset: 0,
        })
        .expect("save first position");
    store
        .save(&LastPosition {
            page: "lights".to_string(),
            offset: 12,
        })
        .expect("save second position");

    let loaded = store.load().expect("load position");
    assert_eq!(loaded.page, "lights");
    assert_eq!(loaded.offset, 12);
}
