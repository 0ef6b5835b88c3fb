// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stderr logging for the emulator.
//!
//! A thin layer over `env_logger` that stamps records with a UTC timestamp
//! and reads its filter from `XTVM_LOG` (e.g. `XTVM_LOG=debug` to see every
//! intercepted port access).

use std::io::Write;

use chrono::Utc;
use log::SetLoggerError;

/// Environment variable controlling the log filter, in `env_logger` syntax.
pub const LOG_FILTER_ENV: &str = "XTVM_LOG";

fn builder() -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filter) = std::env::var(LOG_FILTER_ENV) {
        builder.parse_filters(&filter);
    }
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{} {:5} {}] {}",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    builder
}

/// Installs the global logger. Returns an error if a logger was already set.
pub fn try_init() -> Result<(), SetLoggerError> {
    builder().try_init()
}

/// Installs the global logger, panicking if one was already set.
pub fn init() {
    builder().init()
}
