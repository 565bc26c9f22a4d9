// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words nokia keepalive

//! Bus names of the platform power daemon (MCE) and the bus service itself.
//!
//! These mirror the daemon's published D-Bus interface; only the methods and
//! signals this crate actually consumes are listed.

/// Power daemon well-known bus name.
pub const MCE_SERVICE: &str = "com.nokia.mce";
/// Power daemon request object path.
pub const MCE_REQUEST_PATH: &str = "/com/nokia/mce/request";
/// Power daemon request interface.
pub const MCE_REQUEST_IF: &str = "com.nokia.mce.request";
/// Power daemon signal object path.
pub const MCE_SIGNAL_PATH: &str = "/com/nokia/mce/signal";
/// Power daemon signal interface.
pub const MCE_SIGNAL_IF: &str = "com.nokia.mce.signal";

/// Starts (or renews) a CPU keepalive session. Arg: session id.
pub const CPU_KEEPALIVE_START: &str = "req_cpu_keepalive_start";
/// Ends a CPU keepalive session. Arg: session id.
pub const CPU_KEEPALIVE_STOP: &str = "req_cpu_keepalive_stop";
/// Queries the daemon-advertised renew period in seconds. Arg: session id.
pub const CPU_KEEPALIVE_PERIOD: &str = "req_cpu_keepalive_period";

/// Starts (or renews) a display blanking pause.
pub const PREVENT_BLANK: &str = "req_display_blanking_pause";
/// Ends a display blanking pause.
pub const CANCEL_PREVENT_BLANK: &str = "req_display_cancel_blanking_pause";
/// Queries whether blanking pauses are currently allowed. Reply: bool.
pub const PREVENT_BLANK_ALLOWED_GET: &str = "get_display_blanking_pause_allowed";
/// Broadcast when the blanking pause policy changes. Arg: bool.
pub const PREVENT_BLANK_ALLOWED_SIG: &str = "display_blanking_pause_allowed_ind";

/// Queries the current display state. Reply: one of the display strings.
pub const DISPLAY_STATUS_GET: &str = "get_display_status";
/// Broadcast when the display state changes. Arg: one of the display strings.
pub const DISPLAY_STATUS_SIG: &str = "display_status_ind";

/// Canonical display state strings.
pub const DISPLAY_ON_STRING: &str = "on";
pub const DISPLAY_DIM_STRING: &str = "dimmed";
pub const DISPLAY_OFF_STRING: &str = "off";

/// Bus service well-known name.
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
/// Bus service object path.
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
/// Bus service interface.
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
/// Queries the unique name owning a well-known name. Arg/reply: string.
pub const GET_NAME_OWNER: &str = "GetNameOwner";
/// Broadcast when a well-known name changes hands. Args: name, prev, curr.
pub const NAME_OWNER_CHANGED: &str = "NameOwnerChanged";
