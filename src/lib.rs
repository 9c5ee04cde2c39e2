//! `keydeck`: paging daemon for a 14-button LCD control deck.
//!
//! YAML-driven pages and presets, a content-addressed render cache, an
//! icon-composition pipeline, home-automation and device-protocol
//! clients, a background shell command engine, and a single-threaded
//! event loop tying it all together.

pub mod brightness;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod cmdengine;
pub mod control;
pub mod core;
pub mod daemon;
pub mod device;
pub mod dispatch;
pub mod eventloop;
pub mod ha;
pub mod icon;
pub mod layout;
pub mod logger;
pub mod partial;
pub mod procexec;
pub mod render;
