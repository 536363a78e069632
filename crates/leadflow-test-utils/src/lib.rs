//! Shared mocks and fixtures for leadflow tests.

pub mod fixtures;
mod mock_dispatcher;

pub use mock_dispatcher::MockDispatcher;

use chrono::{DateTime, TimeZone, Utc};
use std::io::Write;

/// Fixed reference instant used as "now" across tests.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0)
        .unwrap()
}

/// Write `contents` to a temporary `.toml` file that lives as long as the handle.
pub fn temp_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}
