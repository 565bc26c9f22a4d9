// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words iphb reprogram reprogramming

//! Wake-aligned wakeup scheduling over the kernel-assisted heartbeat service.
//!
//! A [`Heartbeat`] asks the heartbeat daemon for a single wakeup within a
//! `[lo, hi]` second window, aligned with other wakeups across the system,
//! and delivers one notify callback when it arrives. The caller is expected
//! to call [`Heartbeat::start`] again to re-arm.
//!
//! Two intent flags drive everything: `started` (the user wants a wakeup) and
//! `waiting` (a request is programmed in the kernel). A wakeup clears both; a
//! connection loss clears `waiting` but preserves `started`, so the pending
//! request is re-issued automatically once the 5 s reconnect loop succeeds.
//!
//! The transport is injected through [`WakeupService`] / [`WakeupLink`];
//! production uses [`IphbService`] over the daemon socket. Each open link is
//! owned by a single driver task that multiplexes an ordered command channel
//! (arm / cancel writes) with wakeup reads, so reprogramming can never race
//! the socket.

mod iphb;

pub use iphb::{IPHB_SOCKET_PATH, IphbService};

use std::{io,
          sync::{Arc, Mutex},
          time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::object::{self, Continuation, ObjectCore, ObjectState, TaskId, TaskSlot};

/// Default wakeup window: one hour, exactly.
const HB_DEFAULT_DELAY_S: u32 = 60 * 60;

/// Delay between connect attempts towards the heartbeat service.
const HB_CONNECT_RETRY: Duration = Duration::from_secs(5);

/// Wakeup notification callback. Invoked with no locks held.
pub type WakeupNotify = Arc<dyn Fn() + Send + Sync>;

/// Factory seam for opening a heartbeat service connection.
#[async_trait]
pub trait WakeupService: Send + Sync + 'static {
    async fn open(&self) -> io::Result<Arc<dyn WakeupLink>>;
}

/// One open heartbeat service connection.
#[async_trait]
pub trait WakeupLink: Send + Sync + 'static {
    /// Programs an aligned wakeup within `[lo, hi]` seconds, replacing any
    /// previously programmed request. `(0, 0)` cancels.
    async fn request_wakeup(&self, lo: u32, hi: u32) -> io::Result<()>;

    /// Resolves once one wakeup payload has arrived and been drained (the
    /// payload itself carries no information). Errors on EOF or a
    /// non-retryable read error, upon which the link must be abandoned.
    async fn recv_wakeup(&self) -> io::Result<()>;
}

/// Writes towards the link, serialized through the driver task.
enum LinkCommand {
    Arm { lo: u32, hi: u32 },
    Cancel,
}

pub(crate) struct HeartbeatBody {
    delay_lo: u32,
    delay_hi: u32,
    started: bool,
    waiting: bool,
    /// Present while a link is open; the sending half of the driver task's
    /// command channel.
    commands: Option<mpsc::UnboundedSender<LinkCommand>>,
    wakeup_watch: TaskSlot,
    connect_retry: TaskSlot,
    notify: Option<WakeupNotify>,
}

pub(crate) struct HeartbeatInner {
    core: ObjectCore,
    service: Arc<dyn WakeupService>,
    state: Mutex<ObjectState<HeartbeatBody>>,
}

impl object::ObjectLifecycle for HeartbeatInner {
    type Body = HeartbeatBody;

    fn core(&self) -> &ObjectCore { &self.core }

    fn state(&self) -> &Mutex<ObjectState<HeartbeatBody>> { &self.state }

    fn shutdown_locked(_this: &Arc<Self>, st: &mut ObjectState<HeartbeatBody>) {
        connection_close_locked(st);
    }
}

/// Cancels a pending kernel request (if the link is up) and clears both
/// intent flags.
fn stop_locked(st: &mut ObjectState<HeartbeatBody>) {
    if st.body.waiting {
        if let Some(commands) = &st.body.commands {
            let _ = commands.send(LinkCommand::Cancel);
        }
    }
    st.body.waiting = false;
    st.body.started = false;
}

fn start_locked(this: &Arc<HeartbeatInner>, st: &mut ObjectState<HeartbeatBody>) {
    st.body.started = true;
    connection_open_locked(this, st);
    wakeup_schedule_locked(st);
}

/// Issues the pending wakeup request when intent, connection and shutdown
/// state all line up.
fn wakeup_schedule_locked(st: &mut ObjectState<HeartbeatBody>) {
    if object::in_shutdown_locked(st) {
        return;
    }
    if !st.body.started || st.body.waiting {
        return;
    }
    let Some(commands) = &st.body.commands else { return };
    let (lo, hi) = (st.body.delay_lo, st.body.delay_hi);
    info!("requesting wakeup within [{lo}, {hi}]s");
    if commands.send(LinkCommand::Arm { lo, hi }).is_ok() {
        st.body.waiting = true;
    }
}

/// Starts connecting unless already connected, already trying, or shutting
/// down. Failed attempts are retried until the slot is cancelled.
fn connection_open_locked(this: &Arc<HeartbeatInner>, st: &mut ObjectState<HeartbeatBody>) {
    if object::in_shutdown_locked(st) {
        return;
    }
    if st.body.commands.is_some() || st.body.connect_retry.is_active() {
        return;
    }
    object::task_start_locked(this, st, |st| &mut st.body.connect_retry, |obj, id| async move {
        loop {
            match obj.service.open().await {
                Ok(link) => {
                    let mut st = object::lock(&*obj);
                    if !st.body.connect_retry.matches(id) {
                        break;
                    }
                    st.body.connect_retry.clear();
                    connection_adopt_locked(&obj, &mut st, link);
                    wakeup_schedule_locked(&mut st);
                    break;
                }
                Err(error) => {
                    warn!("heartbeat service connect: {error}");
                    tokio::time::sleep(HB_CONNECT_RETRY).await;
                    let st = object::lock(&*obj);
                    if !st.body.connect_retry.matches(id) {
                        break;
                    }
                }
            }
        }
    });
}

/// Takes ownership of a freshly opened link: installs the driver task and
/// the command channel it drains.
fn connection_adopt_locked(this: &Arc<HeartbeatInner>,
                           st: &mut ObjectState<HeartbeatBody>,
                           link: Arc<dyn WakeupLink>) {
    let (tx, rx) = mpsc::unbounded_channel();
    st.body.commands = Some(tx);
    object::task_start_locked(this,
                              st,
                              |st| &mut st.body.wakeup_watch,
                              |obj, id| link_driver(obj, id, link, rx));
}

/// Tears the connection down: connector and driver tasks, command channel,
/// and with it the link itself (closing the socket cancels any in-kernel
/// request).
fn connection_close_locked(st: &mut ObjectState<HeartbeatBody>) {
    object::timer_stop_locked(st, |st| &mut st.body.connect_retry);
    object::timer_stop_locked(st, |st| &mut st.body.wakeup_watch);
    st.body.commands = None;
    st.body.waiting = false;
    st.body.started = false;
}

/// Sole owner of one open link: applies arm/cancel commands in order and
/// dispatches incoming wakeups.
async fn link_driver(obj: Arc<HeartbeatInner>,
                     id: TaskId,
                     link: Arc<dyn WakeupLink>,
                     mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                let outcome = match command {
                    Some(LinkCommand::Arm { lo, hi }) => link.request_wakeup(lo, hi).await,
                    Some(LinkCommand::Cancel) => link.request_wakeup(0, 0).await,
                    None => break,
                };
                if let Err(error) = outcome {
                    warn!("heartbeat request: {error}");
                    link_lost(&obj, id);
                    break;
                }
            }
            received = link.recv_wakeup() => match received {
                Ok(()) => {
                    if wakeup_deliver(&obj, id) == Continuation::Stop {
                        break;
                    }
                }
                Err(error) => {
                    warn!("heartbeat read: {error}");
                    link_lost(&obj, id);
                    break;
                }
            },
        }
    }
}

/// One wakeup arrived on the link owned by watch `id`.
fn wakeup_deliver(obj: &Arc<HeartbeatInner>, id: TaskId) -> Continuation {
    let mut st = object::lock(&**obj);

    if !st.body.wakeup_watch.matches(id) {
        // Watch was cancelled but the event already dispatched.
        warn!("stray wakeup - no watch");
        return Continuation::Stop;
    }

    if !st.body.waiting {
        // Race with reprogramming flushing the socket; not ours to deliver.
        debug!("stray wakeup - not waiting");
        return Continuation::Continue;
    }

    st.body.started = false;
    st.body.waiting = false;

    // The callback may call start() or reach back into an owning object;
    // deliver with the lock released.
    let notify = st.body.notify.clone();
    drop(st);
    if let Some(notify) = notify {
        notify();
    }
    Continuation::Continue
}

/// The link owned by watch `id` died: close it, keep the user's `started`
/// intent, and begin reconnecting. The pending request is re-issued from the
/// connector's success path.
fn link_lost(obj: &Arc<HeartbeatInner>, id: TaskId) {
    let mut st = object::lock(&**obj);
    if !st.body.wakeup_watch.matches(id) {
        return;
    }
    st.body.wakeup_watch.clear();

    let was_started = st.body.started;
    connection_close_locked(&mut st);
    st.body.started = was_started;
    connection_open_locked(obj, &mut st);
}

/// Client of the heartbeat service; see the [module docs](self).
///
/// Cloning adds a reference; dropping the last clone shuts the object down
/// on the event loop, cancelling the connection and any pending request.
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
    /// Heartbeat over the platform heartbeat daemon socket.
    ///
    /// Must be called within a tokio runtime context.
    pub fn new() -> Self { Self::with_service(Arc::new(IphbService::default())) }

    /// Heartbeat over a caller-provided wakeup transport.
    pub fn with_service(service: Arc<dyn WakeupService>) -> Self {
        let inner = Arc::new(HeartbeatInner {
            core: ObjectCore::new("heartbeat"),
            service,
            state: Mutex::new(ObjectState::new(HeartbeatBody {
                delay_lo: HB_DEFAULT_DELAY_S,
                delay_hi: HB_DEFAULT_DELAY_S,
                started: false,
                waiting: false,
                commands: None,
                wakeup_watch: TaskSlot::default(),
                connect_retry: TaskSlot::default(),
                notify: None,
            })),
        });
        Self { inner }
    }

    /// Sets the wakeup callback. Expected to be called once during setup,
    /// before the first [`start`](Self::start).
    pub fn set_notify(&self, notify: impl Fn() + Send + Sync + 'static) {
        let mut st = object::lock(&*self.inner);
        st.body.notify = Some(Arc::new(notify));
    }

    /// Removes the wakeup callback.
    pub fn clear_notify(&self) {
        let mut st = object::lock(&*self.inner);
        st.body.notify = None;
    }

    /// Sets the wakeup window in seconds. `lo` is clamped to at least 1,
    /// `hi` to at least `lo`. Takes effect on the next request.
    pub fn set_delay(&self, lo: i32, hi: i32) {
        let lo = lo.max(1);
        let hi = hi.max(lo);
        let mut st = object::lock(&*self.inner);
        st.body.delay_lo = lo as u32;
        st.body.delay_hi = hi as u32;
    }

    /// Requests a wakeup at the current window, connecting first if needed.
    /// No-op while a request is already pending.
    pub fn start(&self) {
        let mut st = object::lock(&*self.inner);
        start_locked(&self.inner, &mut st);
    }

    /// Cancels the pending request, if any, and clears the started intent.
    pub fn stop(&self) {
        let mut st = object::lock(&*self.inner);
        stop_locked(&mut st);
    }
}

impl Default for Heartbeat {
    fn default() -> Self { Self::new() }
}

impl Clone for Heartbeat {
    fn clone(&self) -> Self {
        let mut st = object::lock(&*self.inner);
        object::ref_external_locked(&*self.inner, &mut st);
        drop(st);
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        let mut st = object::lock(&*self.inner);
        object::unref_external_locked(&self.inner, &mut st);
    }
}
