// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive cpukeepalive iphb dsme

//! Async client library for mobile power management.
//!
//! On a suspend-happy device, three things routinely fight the platform's
//! blank/suspend policy, and this crate lets an application negotiate each
//! of them with the platform daemons instead of fighting them:
//!
//! 1. **Display keepalive** — [`DisplayKeepalive`] / [`DisplayBlanking`]:
//!    keep the screen from blanking while something without user input is on
//!    it (video playback, navigation).
//! 2. **CPU keepalive** — [`CpuKeepalive`]: keep the SoC out of deep suspend
//!    while a computation or I/O batch must make forward progress.
//! 3. **Periodic background activity** — [`BackgroundActivity`]: let the
//!    device suspend between jobs, get woken on a system-wide aligned
//!    schedule ([`Heartbeat`]), stay awake for the duration of the job, then
//!    release everything again.
//!
//! # Lifecycle
//!
//! Every facility hands out a cloneable handle. Clones share one underlying
//! object; dropping the last clone tears the object down *asynchronously* on
//! the event loop — pending daemon sessions are ended, timers and socket
//! watches cancelled — so it is always safe to drop a handle from inside one
//! of its own callbacks. The substrate implementing this is the
//! crate-internal object base shared by all four.
//!
//! # Runtime and transports
//!
//! Factories capture the ambient tokio runtime and must be called within
//! one. The platform transports (system bus, heartbeat daemon socket) hide
//! behind the [`bus::BusLink`] and [`heartbeat::WakeupService`] seams;
//! [`test_fixtures`] provides in-process doubles so application logic can be
//! tested without either daemon:
//!
//! ```no_run
//! use r3bl_keepalive::BackgroundActivity;
//!
//! # async fn demo() {
//! let activity = BackgroundActivity::new();
//! activity.set_wakeup_slot(r3bl_keepalive::WakeupSlot::FIVE_MINUTES);
//! activity.set_running_callback(|activity| {
//!     // do one unit of background work, then let the device sleep until
//!     // the next aligned wakeup
//!     activity.wait();
//! });
//! activity.wait();
//! # }
//! ```
//!
//! # Errors and logging
//!
//! No errors cross this API: calls either take effect or are reconciled away
//! (a stopped daemon, a refused policy) and surface as state. Transient
//! failures — heartbeat socket EOF, daemon restarts — are recovered
//! internally. Diagnostics go through [`tracing`]; see [`logging`] for the
//! `LIBKEEPALIVE_VERBOSITY` plumbing.

pub mod background_activity;
pub mod bus;
pub mod cpu_keepalive;
pub mod display_blanking;
pub mod display_keepalive;
pub mod heartbeat;
pub mod logging;
pub mod mce;
mod object;
pub mod test_fixtures;

pub use background_activity::{BackgroundActivity, BackgroundActivityRef, WakeupSlot};
pub use bus::{BusConnector, BusError, BusLink, BusValue, MethodCall, ReplyType, SignalMatch,
              SignalMessage, system::SystemBus};
pub use cpu_keepalive::CpuKeepalive;
pub use display_blanking::DisplayBlanking;
pub use display_keepalive::{DisplayKeepalive, DisplayStatus, PreventMode};
pub use heartbeat::{Heartbeat, IphbService, WakeupLink, WakeupService};
