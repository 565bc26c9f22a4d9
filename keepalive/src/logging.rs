// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words LIBKEEPALIVE

//! Verbosity plumbing for host applications.
//!
//! The library itself only emits [`tracing`] events; whether and where they
//! go is the application's business. For programs that do not configure
//! tracing themselves, [`init`] installs a compact stderr subscriber whose
//! level comes from the `LIBKEEPALIVE_VERBOSITY` environment variable — a
//! syslog-style integer clamped to `[3, 7]` (`LOG_ERR` to `LOG_DEBUG`),
//! defaulting to warnings.

use tracing_core::LevelFilter;

/// Environment variable holding the syslog-style verbosity level.
pub const VERBOSITY_ENV: &str = "LIBKEEPALIVE_VERBOSITY";

const LOG_ERR: i64 = 3;
const LOG_WARNING: i64 = 4;
const LOG_DEBUG: i64 = 7;

fn parse_verbosity(value: Option<&str>) -> LevelFilter {
    // Unset keeps the default; garbage parses to 0 and clamps to LOG_ERR,
    // matching strtol semantics.
    let level = match value {
        None => LOG_WARNING,
        Some(v) => v.trim().parse::<i64>().unwrap_or(0),
    };
    match level.clamp(LOG_ERR, LOG_DEBUG) {
        LOG_ERR => LevelFilter::ERROR,
        LOG_WARNING => LevelFilter::WARN,
        // Syslog NOTICE and INFO both land on tracing's INFO.
        5 | 6 => LevelFilter::INFO,
        _ => LevelFilter::DEBUG,
    }
}

/// The level filter selected by `LIBKEEPALIVE_VERBOSITY`.
pub fn verbosity_filter() -> LevelFilter {
    parse_verbosity(std::env::var(VERBOSITY_ENV).ok().as_deref())
}

/// Tries to install the global stderr subscriber at the environment-selected
/// level.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_max_level(verbosity_filter())
        .with_writer(std::io::stderr)
        .try_init()
}

/// Like [`try_init`], but quietly yields to an already-installed subscriber.
pub fn init() { drop(try_init()); }
