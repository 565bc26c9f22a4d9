// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive

//! In-process doubles for the bus and heartbeat transports.
//!
//! Everything above the [`BusLink`] / [`WakeupService`] seams is designed to
//! be exercised without the platform daemons: [`MockBus`] plays the system
//! bus plus the power daemon behind it, [`MockWakeupService`] plays the
//! heartbeat service. Both are used by this crate's own tests and are public
//! so that applications can drive their keepalive logic under test too.
//!
//! Pair them with `#[tokio::test(start_paused = true)]` and [`settle`] to
//! step the event loop deterministically.

use std::{collections::VecDeque,
          io,
          sync::{Arc, Mutex}};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::{bus::{BusConnector, BusError, BusLink, BusValue, MethodCall, NAME_HAS_NO_OWNER,
                  ReplyType, SignalMatch, SignalMessage},
            heartbeat::{WakeupLink, WakeupService},
            mce};

/// Lets all queued event-loop work (spawned tasks, deferred notifications,
/// reply dispatch) run to quiescence without advancing the clock.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/* ----------------------------------------------------------------------- *
 * MockBus
 * ----------------------------------------------------------------------- */

fn failed(message: &str) -> BusError {
    BusError::Method { name: "org.freedesktop.DBus.Error.Failed".into(),
                       message: message.into() }
}

#[derive(Debug)]
struct MockBusInner {
    refuse_connect: bool,
    connects: usize,
    name_owner: Option<String>,
    keepalive_period: Option<i32>,
    blanking_allowed: Option<bool>,
    display_status: Option<String>,
    calls: Vec<MethodCall>,
    sent: Vec<MethodCall>,
    subscriptions: Vec<(SignalMatch, mpsc::UnboundedSender<SignalMessage>)>,
}

/// System bus plus power daemon in one test double.
///
/// Configure the daemon side with the `set_*` methods, observe the client
/// side through [`sent`](Self::sent) (fire-and-forget calls) and
/// [`calls`](Self::calls) (replied calls), and push signals with the
/// `emit_*` methods. Clones share state; the clone handed out by
/// [`BusConnector::connect`] is the same bus.
#[derive(Debug, Clone)]
pub struct MockBus {
    inner: Arc<Mutex<MockBusInner>>,
}

impl Default for MockBus {
    fn default() -> Self { Self::new() }
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockBusInner {
                refuse_connect: false,
                connects: 0,
                name_owner: None,
                keepalive_period: None,
                blanking_allowed: None,
                display_status: None,
                calls: Vec::new(),
                sent: Vec::new(),
                subscriptions: Vec::new(),
            })),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, MockBusInner> {
        self.inner.lock().unwrap()
    }

    /// Makes subsequent [`BusConnector::connect`] calls fail.
    pub fn fail_connect(&self) { self.locked().refuse_connect = true; }

    /// Number of connect attempts so far.
    pub fn connects(&self) -> usize { self.locked().connects }

    /// Owner reply for `GetNameOwner` on the power daemon name; `None`
    /// answers with the no-owner error.
    pub fn set_name_owner(&self, owner: Option<&str>) {
        self.locked().name_owner = owner.map(str::to_owned);
    }

    /// Renew period reply in seconds; `None` answers with an error.
    pub fn set_keepalive_period(&self, seconds: Option<i32>) {
        self.locked().keepalive_period = seconds;
    }

    /// Blanking-pause-allowed reply; `None` answers with an error.
    pub fn set_blanking_allowed(&self, allowed: Option<bool>) {
        self.locked().blanking_allowed = allowed;
    }

    /// Display status reply; `None` answers with an error.
    pub fn set_display_status(&self, status: Option<&str>) {
        self.locked().display_status = status.map(str::to_owned);
    }

    /// Fire-and-forget calls received so far, in order.
    pub fn sent(&self) -> Vec<MethodCall> { self.locked().sent.clone() }

    /// Replied method calls received so far, in order.
    pub fn calls(&self) -> Vec<MethodCall> { self.locked().calls.clone() }

    /// Emits `NameOwnerChanged` and keeps the queryable owner coherent.
    pub fn emit_name_owner_changed(&self, name: &str, prev: &str, curr: &str) {
        if name == mce::MCE_SERVICE {
            self.locked().name_owner = if curr.is_empty() { None } else { Some(curr.to_owned()) };
        }
        self.emit(mce::NAME_OWNER_CHANGED,
                  vec![BusValue::from(name), BusValue::from(prev), BusValue::from(curr)]);
    }

    /// Emits the blanking-pause-allowed change signal (and updates the
    /// queryable value).
    pub fn emit_blanking_allowed(&self, allowed: bool) {
        self.locked().blanking_allowed = Some(allowed);
        self.emit(mce::PREVENT_BLANK_ALLOWED_SIG, vec![BusValue::from(allowed)]);
    }

    /// Emits the display status change signal (and updates the queryable
    /// value).
    pub fn emit_display_status(&self, status: &str) {
        self.locked().display_status = Some(status.to_owned());
        self.emit(mce::DISPLAY_STATUS_SIG, vec![BusValue::from(status)]);
    }

    fn emit(&self, member: &str, args: Vec<BusValue>) {
        let mut inner = self.locked();
        inner.subscriptions.retain(|(_, tx)| !tx.is_closed());
        for (matcher, tx) in &inner.subscriptions {
            if matcher.member != member {
                continue;
            }
            if let Some(arg0) = matcher.arg0 {
                if args.first().and_then(BusValue::as_str) != Some(arg0) {
                    continue;
                }
            }
            let _ = tx.send(SignalMessage { member: member.to_owned(), args: args.clone() });
        }
    }
}

#[async_trait]
impl BusConnector for MockBus {
    async fn connect(&self) -> Result<Arc<dyn BusLink>, BusError> {
        let mut inner = self.locked();
        inner.connects += 1;
        if inner.refuse_connect {
            return Err(BusError::Transport("mock connect refused".into()));
        }
        drop(inner);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BusLink for MockBus {
    fn is_connected(&self) -> bool { true }

    async fn call(&self, call: MethodCall, _reply: ReplyType) -> Result<BusValue, BusError> {
        let mut inner = self.locked();
        inner.calls.push(call.clone());
        match call.method {
            mce::GET_NAME_OWNER => match &inner.name_owner {
                Some(owner) => Ok(BusValue::Str(owner.clone())),
                None => Err(BusError::Method { name: NAME_HAS_NO_OWNER.into(),
                                               message: "no such name".into() }),
            },
            mce::CPU_KEEPALIVE_PERIOD => {
                inner.keepalive_period
                     .map(BusValue::I32)
                     .ok_or_else(|| failed("no period configured"))
            }
            mce::PREVENT_BLANK_ALLOWED_GET => {
                inner.blanking_allowed
                     .map(BusValue::Bool)
                     .ok_or_else(|| failed("no policy configured"))
            }
            mce::DISPLAY_STATUS_GET => {
                inner.display_status
                     .clone()
                     .map(BusValue::Str)
                     .ok_or_else(|| failed("no status configured"))
            }
            other => Err(failed(other)),
        }
    }

    async fn send(&self, call: MethodCall) -> Result<(), BusError> {
        self.locked().sent.push(call);
        Ok(())
    }

    async fn subscribe(&self,
                       matcher: SignalMatch)
                       -> Result<mpsc::UnboundedReceiver<SignalMessage>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.locked().subscriptions.push((matcher, tx));
        Ok(rx)
    }
}

/* ----------------------------------------------------------------------- *
 * MockWakeupService
 * ----------------------------------------------------------------------- */

#[derive(Debug)]
enum WakeupEvent {
    Wakeup,
    Eof,
}

#[derive(Debug)]
struct WakeupServiceInner {
    opened: usize,
    refuse_opens: u32,
    requests: Vec<(u32, u32)>,
    events: VecDeque<WakeupEvent>,
}

/// Heartbeat service double: records programmed windows and delivers
/// wakeups (or link failures) on demand.
#[derive(Debug)]
pub struct MockWakeupService {
    inner: Arc<Mutex<WakeupServiceInner>>,
    wakeups: Arc<Notify>,
}

impl Default for MockWakeupService {
    fn default() -> Self { Self::new() }
}

impl MockWakeupService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(WakeupServiceInner {
                opened: 0,
                refuse_opens: 0,
                requests: Vec::new(),
                events: VecDeque::new(),
            })),
            wakeups: Arc::new(Notify::new()),
        }
    }

    /// Number of open attempts so far (failed ones included).
    pub fn opened(&self) -> usize { self.inner.lock().unwrap().opened }

    /// Every `(lo, hi)` window programmed so far, in order. `(0, 0)` is a
    /// cancel.
    pub fn requests(&self) -> Vec<(u32, u32)> {
        self.inner.lock().unwrap().requests.clone()
    }

    /// Makes the next `n` open attempts fail.
    pub fn fail_connects(&self, n: u32) {
        self.inner.lock().unwrap().refuse_opens = n;
    }

    /// Delivers one wakeup to the open link.
    pub fn fire_wakeup(&self) {
        self.inner.lock().unwrap().events.push_back(WakeupEvent::Wakeup);
        self.wakeups.notify_one();
    }

    /// Fails the open link with EOF on its next read.
    pub fn fail_link(&self) {
        self.inner.lock().unwrap().events.push_back(WakeupEvent::Eof);
        self.wakeups.notify_one();
    }
}

#[async_trait]
impl WakeupService for MockWakeupService {
    async fn open(&self) -> io::Result<Arc<dyn WakeupLink>> {
        let mut inner = self.inner.lock().unwrap();
        inner.opened += 1;
        if inner.refuse_opens > 0 {
            inner.refuse_opens -= 1;
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "mock open refused"));
        }
        drop(inner);
        Ok(Arc::new(MockWakeupLink { inner: Arc::clone(&self.inner),
                                     wakeups: Arc::clone(&self.wakeups) }))
    }
}

#[derive(Debug)]
struct MockWakeupLink {
    inner: Arc<Mutex<WakeupServiceInner>>,
    wakeups: Arc<Notify>,
}

#[async_trait]
impl WakeupLink for MockWakeupLink {
    async fn request_wakeup(&self, lo: u32, hi: u32) -> io::Result<()> {
        self.inner.lock().unwrap().requests.push((lo, hi));
        Ok(())
    }

    async fn recv_wakeup(&self) -> io::Result<()> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(event) = inner.events.pop_front() {
                    return match event {
                        WakeupEvent::Wakeup => Ok(()),
                        WakeupEvent::Eof => {
                            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "mock eof"))
                        }
                    };
                }
            }
            self.wakeups.notified().await;
        }
    }
}
