// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Thin seam over the platform system bus.
//!
//! The session objects never talk to a bus connection directly; they go
//! through the object-safe [`BusLink`] trait so that everything above this
//! seam can be exercised against in-process test doubles (see
//! [`crate::test_fixtures`]). The production transport lives in
//! [`system`] and is the only module that knows about the wire.
//!
//! The value model is deliberately tiny: the power daemon's interface only
//! ever carries strings, booleans and 32-bit integers, and [`ReplyType`]
//! states which of those a caller expects back — the seam-level equivalent of
//! parsing a reply against an expected argument list.

pub mod system;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// D-Bus error name raised by the bus service when a queried name has no
/// current owner. Not a failure: it means "service stopped".
pub const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

/// One argument or reply value on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusValue {
    Str(String),
    Bool(bool),
    I32(i32),
}

impl BusValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for BusValue {
    fn from(v: &str) -> Self { Self::Str(v.to_owned()) }
}

impl From<String> for BusValue {
    fn from(v: String) -> Self { Self::Str(v) }
}

impl From<bool> for BusValue {
    fn from(v: bool) -> Self { Self::Bool(v) }
}

impl From<i32> for BusValue {
    fn from(v: i32) -> Self { Self::I32(v) }
}

/// Reply shape a method call expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    Str,
    Bool,
    I32,
}

/// An outbound method call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub service: &'static str,
    pub object: &'static str,
    pub interface: &'static str,
    pub method: &'static str,
    pub args: Vec<BusValue>,
}

impl MethodCall {
    pub fn new(service: &'static str,
               object: &'static str,
               interface: &'static str,
               method: &'static str)
               -> Self {
        Self { service, object, interface, method, args: Vec::new() }
    }

    #[must_use]
    pub fn arg(mut self, value: impl Into<BusValue>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// Match pattern for a signal subscription. `arg0` narrows delivery to
/// signals whose first argument equals the given string (used for
/// `NameOwnerChanged` so only the tracked daemon's transitions arrive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMatch {
    pub sender: Option<&'static str>,
    pub path: &'static str,
    pub interface: &'static str,
    pub member: &'static str,
    pub arg0: Option<&'static str>,
}

/// A delivered signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub member: String,
    pub args: Vec<BusValue>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("not connected to the bus")]
    NotConnected,
    /// The peer answered with a D-Bus error. `name` is the D-Bus error name.
    #[error("{name}: {message}")]
    Method { name: String, message: String },
    #[error("unexpected reply: {0}")]
    BadReply(String),
    #[error("bus transport: {0}")]
    Transport(String),
}

impl BusError {
    /// True for the bus service's "name has no owner" reply to
    /// `GetNameOwner` — the expected answer while the daemon is stopped.
    pub fn is_name_has_no_owner(&self) -> bool {
        matches!(self, Self::Method { name, .. } if name == NAME_HAS_NO_OWNER)
    }
}

/// One live bus connection.
#[async_trait]
pub trait BusLink: Send + Sync + 'static {
    /// Predicate for: connection exists and reports connected.
    fn is_connected(&self) -> bool;

    /// Asynchronous method call. Resolves to the reply's first argument
    /// parsed per `reply`.
    async fn call(&self, call: MethodCall, reply: ReplyType) -> Result<BusValue, BusError>;

    /// Fire-and-forget method call: marked as expecting no reply and handed
    /// to the transport before this resolves. Per caller, sends are
    /// delivered in issue order.
    async fn send(&self, call: MethodCall) -> Result<(), BusError>;

    /// Installs a signal match and returns the delivery channel. Dropping
    /// the receiver tears the match down.
    async fn subscribe(&self,
                       matcher: SignalMatch)
                       -> Result<mpsc::UnboundedReceiver<SignalMessage>, BusError>;
}

/// Factory seam for obtaining a [`BusLink`]. The production implementation
/// is [`system::SystemBus`]; tests inject doubles.
#[async_trait]
pub trait BusConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Arc<dyn BusLink>, BusError>;
}
