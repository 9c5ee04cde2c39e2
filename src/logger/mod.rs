//! Structured logging: JSONL append-only sink with graceful degradation,
//! plus an optional interactive status line (spec §4.13, §9 "ambient
//! observability").

pub mod jsonl;
pub mod status_line;

pub use jsonl::{JsonlLogger, LogLevel};
