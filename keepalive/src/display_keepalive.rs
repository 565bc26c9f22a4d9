// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive rethink preventmode

//! Display blanking pause session with the platform power daemon.
//!
//! Same shape as [`CpuKeepalive`](crate::CpuKeepalive) with two twists. The
//! renew period is a fixed constant instead of daemon-advertised, and the
//! daemon publishes a *prevent mode* boolean that gates the whole facility:
//! when blanking pauses are not allowed (for example while the display is
//! off), a requested session silently idles until the daemon permits it
//! again. "Not allowed" surfaces as state, never as an error.
//!
//! The daemon also broadcasts the display state (`on` / `dimmed` / `off`).
//! It is tracked here as an observer-visible attribute for composition
//! layers like [`DisplayBlanking`](crate::DisplayBlanking); it does not gate
//! the session.

use std::{sync::{Arc, Mutex},
          time::Duration};

use strum_macros::Display;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{bus::{BusConnector, BusLink, BusValue, MethodCall, ReplyType,
                  SignalMatch, SignalMessage, system::SystemBus},
            mce,
            object::{self, Continuation, ObjectCore, ObjectState, TaskId, TaskSlot}};

use crate::cpu_keepalive::NameOwner;

/// Display keepalive renew time.
const DISPLAY_KEEPALIVE_RENEW: Duration = Duration::from_secs(60);

/// Daemon-published policy on display blanking pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum PreventMode {
    /// Not queried yet, or the daemon left the bus.
    Unknown,
    /// Blanking pauses are currently honored.
    Allowed,
    /// The platform refuses blanking pauses for now.
    Denied,
}

/// Display state as reported by the power daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum DisplayStatus {
    Unknown,
    Off,
    Dimmed,
    On,
}

impl DisplayStatus {
    fn from_daemon(s: &str) -> Self {
        match s {
            mce::DISPLAY_ON_STRING => Self::On,
            mce::DISPLAY_DIM_STRING => Self::Dimmed,
            mce::DISPLAY_OFF_STRING => Self::Off,
            _ => Self::Unknown,
        }
    }
}

/// Display status change callback. Invoked with no locks held.
pub type DisplayStatusNotify = Arc<dyn Fn(DisplayStatus) + Send + Sync>;

pub(crate) struct DisplayKeepaliveBody {
    requested: bool,
    connect_attempted: bool,
    bus: Option<Arc<dyn BusLink>>,
    session_calls: Option<mpsc::UnboundedSender<MethodCall>>,
    nameowner_watch: TaskSlot,
    daemon_owner: NameOwner,
    owner_query: TaskSlot,
    prevent_mode: PreventMode,
    prevent_query: TaskSlot,
    prevent_watch: TaskSlot,
    display_status: DisplayStatus,
    status_query: TaskSlot,
    status_watch: TaskSlot,
    status_notify: Option<DisplayStatusNotify>,
    session_renew: TaskSlot,
    connect_task: TaskSlot,
    rethink_task: TaskSlot,
}

impl DisplayKeepaliveBody {
    fn new() -> Self {
        Self {
            requested: false,
            connect_attempted: false,
            bus: None,
            session_calls: None,
            nameowner_watch: TaskSlot::default(),
            daemon_owner: NameOwner::Unknown,
            owner_query: TaskSlot::default(),
            prevent_mode: PreventMode::Unknown,
            prevent_query: TaskSlot::default(),
            prevent_watch: TaskSlot::default(),
            display_status: DisplayStatus::Unknown,
            status_query: TaskSlot::default(),
            status_watch: TaskSlot::default(),
            status_notify: None,
            session_renew: TaskSlot::default(),
            connect_task: TaskSlot::default(),
            rethink_task: TaskSlot::default(),
        }
    }
}

pub(crate) struct DisplayKeepaliveInner {
    core: ObjectCore,
    connector: Arc<dyn BusConnector>,
    state: Mutex<ObjectState<DisplayKeepaliveBody>>,
}

impl object::ObjectLifecycle for DisplayKeepaliveInner {
    type Body = DisplayKeepaliveBody;

    fn core(&self) -> &ObjectCore { &self.core }

    fn state(&self) -> &Mutex<ObjectState<DisplayKeepaliveBody>> { &self.state }

    fn shutdown_locked(this: &Arc<Self>, st: &mut ObjectState<DisplayKeepaliveBody>) {
        object::timer_stop_locked(st, |st| &mut st.body.owner_query);
        object::timer_stop_locked(st, |st| &mut st.body.prevent_query);
        object::timer_stop_locked(st, |st| &mut st.body.status_query);

        object::timer_stop_locked(st, |st| &mut st.body.rethink_task);
        rethink_now_locked(this, st);

        disconnect_now_locked(st);
    }
}

/* ----------------------------------------------------------------------- *
 * Keepalive session
 * ----------------------------------------------------------------------- */

/// Enqueues one fire-and-forget daemon call. Blank prevention carries no
/// session id: the daemon tracks the caller itself.
fn session_call_locked(st: &mut ObjectState<DisplayKeepaliveBody>, method: &'static str) {
    let connected = st.body.bus.as_ref().is_some_and(|bus| bus.is_connected());
    if !connected {
        return;
    }
    let Some(session_calls) = &st.body.session_calls else { return };
    info!("displaykeepalive: {method}");
    let call = MethodCall::new(mce::MCE_SERVICE,
                               mce::MCE_REQUEST_PATH,
                               mce::MCE_REQUEST_IF,
                               method);
    let _ = session_calls.send(call);
}

fn session_renew_tick(obj: &Arc<DisplayKeepaliveInner>, id: TaskId) -> Continuation {
    let mut st = object::lock(&**obj);
    if !st.body.session_renew.matches(id) {
        return Continuation::Stop;
    }
    session_call_locked(&mut st, mce::PREVENT_BLANK);
    Continuation::Continue
}

fn session_start_locked(this: &Arc<DisplayKeepaliveInner>,
                        st: &mut ObjectState<DisplayKeepaliveBody>) {
    if st.body.session_renew.is_active() {
        return;
    }
    session_call_locked(st, mce::PREVENT_BLANK);
    object::timer_start_locked(this, st, |st| &mut st.body.session_renew,
                               DISPLAY_KEEPALIVE_RENEW, session_renew_tick);
}

fn session_stop_locked(st: &mut ObjectState<DisplayKeepaliveBody>) {
    if !st.body.session_renew.is_active() {
        return;
    }
    object::timer_stop_locked(st, |st| &mut st.body.session_renew);
    session_call_locked(st, mce::CANCEL_PREVENT_BLANK);
}

/* ----------------------------------------------------------------------- *
 * State evaluation
 * ----------------------------------------------------------------------- */

/// Session runs iff requested, the daemon is present, blanking pauses are
/// allowed, and the object is not shutting down.
fn rethink_now_locked(this: &Arc<DisplayKeepaliveInner>,
                      st: &mut ObjectState<DisplayKeepaliveBody>) {
    object::timer_stop_locked(st, |st| &mut st.body.rethink_task);

    let need_renew_loop = !object::in_shutdown_locked(st)
                          && st.body.daemon_owner == NameOwner::Running
                          && st.body.prevent_mode == PreventMode::Allowed
                          && st.body.requested;

    if need_renew_loop {
        session_start_locked(this, st);
    } else {
        session_stop_locked(st);
    }
}

fn rethink_tick(obj: &Arc<DisplayKeepaliveInner>, id: TaskId) -> Continuation {
    let mut st = object::lock(&**obj);
    if st.body.rethink_task.matches(id) {
        st.body.rethink_task.clear();
        rethink_now_locked(obj, &mut st);
    }
    Continuation::Stop
}

fn rethink_schedule_locked(this: &Arc<DisplayKeepaliveInner>,
                           st: &mut ObjectState<DisplayKeepaliveBody>) {
    if !st.body.rethink_task.is_active() {
        object::timer_start_locked(this, st, |st| &mut st.body.rethink_task, Duration::ZERO,
                                   rethink_tick);
    }
}

/* ----------------------------------------------------------------------- *
 * Prevent mode
 * ----------------------------------------------------------------------- */

fn preventmode_update_locked(this: &Arc<DisplayKeepaliveInner>,
                             st: &mut ObjectState<DisplayKeepaliveBody>,
                             mode: PreventMode) {
    object::timer_stop_locked(st, |st| &mut st.body.prevent_query);

    if st.body.prevent_mode != mode {
        info!("displaykeepalive: prevent mode: {} -> {}", st.body.prevent_mode, mode);
        st.body.prevent_mode = mode;
        rethink_schedule_locked(this, st);
    }
}

/// Shared parser for the initial query reply and the broadcast signal: both
/// carry one boolean.
fn preventmode_payload_locked(this: &Arc<DisplayKeepaliveInner>,
                              st: &mut ObjectState<DisplayKeepaliveBody>,
                              args: &[BusValue]) {
    match args {
        [BusValue::Bool(allowed)] => {
            let mode = if *allowed { PreventMode::Allowed } else { PreventMode::Denied };
            preventmode_update_locked(this, st, mode);
        }
        _ => warn!("can't parse prevent mode payload"),
    }
}

fn prevent_query_start_locked(this: &Arc<DisplayKeepaliveInner>,
                              st: &mut ObjectState<DisplayKeepaliveBody>) {
    if object::in_shutdown_locked(st) || st.body.prevent_query.is_active() {
        return;
    }
    let Some(bus) = st.body.bus.clone() else { return };
    object::task_start_locked(this, st, |st| &mut st.body.prevent_query, |obj, id| async move {
        let call = MethodCall::new(mce::MCE_SERVICE,
                                   mce::MCE_REQUEST_PATH,
                                   mce::MCE_REQUEST_IF,
                                   mce::PREVENT_BLANK_ALLOWED_GET);
        let reply = bus.call(call, ReplyType::Bool).await;
        let mut st = object::lock(&*obj);
        if !object::task_finish_locked(&mut st, |st| &mut st.body.prevent_query, id) {
            return;
        }
        match reply {
            // Reply to the query and the change signal share one layout.
            Ok(value) => preventmode_payload_locked(&obj, &mut st, &[value]),
            Err(error) => warn!("prevent mode reply: {error}"),
        }
    });
}

/* ----------------------------------------------------------------------- *
 * Display status
 * ----------------------------------------------------------------------- */

/// Applies a status update; returns the notification to deliver once the
/// lock has been released.
#[must_use]
fn display_status_update_locked(st: &mut ObjectState<DisplayKeepaliveBody>,
                                status: DisplayStatus)
                                -> Option<(DisplayStatusNotify, DisplayStatus)> {
    if st.body.display_status == status {
        return None;
    }
    info!("displaykeepalive: display status: {} -> {}", st.body.display_status, status);
    st.body.display_status = status;
    st.body.status_notify.clone().map(|notify| (notify, status))
}

fn status_query_start_locked(this: &Arc<DisplayKeepaliveInner>,
                             st: &mut ObjectState<DisplayKeepaliveBody>) {
    if object::in_shutdown_locked(st) || st.body.status_query.is_active() {
        return;
    }
    let Some(bus) = st.body.bus.clone() else { return };
    object::task_start_locked(this, st, |st| &mut st.body.status_query, |obj, id| async move {
        let call = MethodCall::new(mce::MCE_SERVICE,
                                   mce::MCE_REQUEST_PATH,
                                   mce::MCE_REQUEST_IF,
                                   mce::DISPLAY_STATUS_GET);
        let reply = bus.call(call, ReplyType::Str).await;
        let mut st = object::lock(&*obj);
        if !object::task_finish_locked(&mut st, |st| &mut st.body.status_query, id) {
            return;
        }
        let notify = match reply {
            Ok(value) => {
                let status = DisplayStatus::from_daemon(value.as_str().unwrap_or(""));
                display_status_update_locked(&mut st, status)
            }
            Err(error) => {
                warn!("display status reply: {error}");
                None
            }
        };
        drop(st);
        if let Some((notify, status)) = notify {
            notify(status);
        }
    });
}

/* ----------------------------------------------------------------------- *
 * Daemon tracking
 * ----------------------------------------------------------------------- */

fn owner_update_locked(this: &Arc<DisplayKeepaliveInner>,
                       st: &mut ObjectState<DisplayKeepaliveBody>,
                       owner: NameOwner) {
    if st.body.daemon_owner == owner {
        return;
    }
    info!("displaykeepalive: power daemon: {} -> {}", st.body.daemon_owner, owner);
    st.body.daemon_owner = owner;

    if owner == NameOwner::Running {
        prevent_query_start_locked(this, st);
        status_query_start_locked(this, st);
    } else {
        // The cached policy would be stale by the time the daemon returns.
        preventmode_update_locked(this, st, PreventMode::Unknown);
    }
    rethink_schedule_locked(this, st);
}

fn owner_query_start_locked(this: &Arc<DisplayKeepaliveInner>,
                            st: &mut ObjectState<DisplayKeepaliveBody>) {
    if object::in_shutdown_locked(st) || st.body.owner_query.is_active() {
        return;
    }
    let Some(bus) = st.body.bus.clone() else { return };
    object::task_start_locked(this, st, |st| &mut st.body.owner_query, |obj, id| async move {
        let call = MethodCall::new(mce::DBUS_SERVICE,
                                   mce::DBUS_PATH,
                                   mce::DBUS_INTERFACE,
                                   mce::GET_NAME_OWNER).arg(mce::MCE_SERVICE);
        let reply = bus.call(call, ReplyType::Str).await;
        let mut st = object::lock(&*obj);
        if !object::task_finish_locked(&mut st, |st| &mut st.body.owner_query, id) {
            return;
        }
        let owner = match reply {
            Ok(value) => match value.as_str() {
                Some("") | None => NameOwner::Stopped,
                Some(_) => NameOwner::Running,
            },
            Err(error) => {
                if !error.is_name_has_no_owner() {
                    warn!("GetNameOwner reply: {error}");
                }
                NameOwner::Stopped
            }
        };
        owner_update_locked(&obj, &mut st, owner);
    });
}

/* ----------------------------------------------------------------------- *
 * Signal filters
 * ----------------------------------------------------------------------- */

fn nameowner_signal(obj: &Arc<DisplayKeepaliveInner>,
                    id: TaskId,
                    signal: SignalMessage)
                    -> Continuation {
    let mut st = object::lock(&**obj);
    if !st.body.nameowner_watch.matches(id) {
        return Continuation::Stop;
    }
    match signal.args.as_slice() {
        [BusValue::Str(name), BusValue::Str(_prev), BusValue::Str(curr)]
            if name.as_str() == mce::MCE_SERVICE =>
        {
            let owner = if curr.is_empty() { NameOwner::Stopped } else { NameOwner::Running };
            owner_update_locked(obj, &mut st, owner);
        }
        _ => warn!("can't parse name owner changed signal"),
    }
    Continuation::Continue
}

fn prevent_signal(obj: &Arc<DisplayKeepaliveInner>,
                  id: TaskId,
                  signal: SignalMessage)
                  -> Continuation {
    let mut st = object::lock(&**obj);
    if !st.body.prevent_watch.matches(id) {
        return Continuation::Stop;
    }
    preventmode_payload_locked(obj, &mut st, signal.args.as_slice());
    Continuation::Continue
}

fn status_signal(obj: &Arc<DisplayKeepaliveInner>,
                 id: TaskId,
                 signal: SignalMessage)
                 -> Continuation {
    let mut st = object::lock(&**obj);
    if !st.body.status_watch.matches(id) {
        return Continuation::Stop;
    }
    let notify = match signal.args.as_slice() {
        [BusValue::Str(s)] => display_status_update_locked(&mut st, DisplayStatus::from_daemon(s)),
        _ => {
            warn!("can't parse display status signal");
            None
        }
    };
    drop(st);
    if let Some((notify, status)) = notify {
        notify(status);
    }
    Continuation::Continue
}

/// Installs one signal watch: a guarded task that owns the subscription and
/// feeds the handler until the slot is cancelled.
fn watch_install_locked(this: &Arc<DisplayKeepaliveInner>,
                        st: &mut ObjectState<DisplayKeepaliveBody>,
                        slot: crate::object::SlotFn<DisplayKeepaliveBody>,
                        matcher: SignalMatch,
                        handler: fn(&Arc<DisplayKeepaliveInner>, TaskId, SignalMessage)
                                    -> Continuation) {
    if slot(st).is_active() {
        return;
    }
    let Some(bus) = st.body.bus.clone() else { return };
    object::task_start_locked(this, st, slot, move |obj, id| async move {
        let mut signals = match bus.subscribe(matcher).await {
            Ok(signals) => signals,
            Err(error) => {
                warn!("can't install signal match: {error}");
                let mut st = object::lock(&*obj);
                if slot(&mut st).matches(id) {
                    slot(&mut st).clear();
                }
                return;
            }
        };
        while let Some(signal) = signals.recv().await {
            if handler(&obj, id, signal) == Continuation::Stop {
                break;
            }
        }
    });
}

fn filters_install_locked(this: &Arc<DisplayKeepaliveInner>,
                          st: &mut ObjectState<DisplayKeepaliveBody>) {
    watch_install_locked(this,
                         st,
                         |st| &mut st.body.nameowner_watch,
                         SignalMatch { sender: Some(mce::DBUS_SERVICE),
                                       path: mce::DBUS_PATH,
                                       interface: mce::DBUS_INTERFACE,
                                       member: mce::NAME_OWNER_CHANGED,
                                       arg0: Some(mce::MCE_SERVICE) },
                         nameowner_signal);
    watch_install_locked(this,
                         st,
                         |st| &mut st.body.prevent_watch,
                         SignalMatch { sender: Some(mce::MCE_SERVICE),
                                       path: mce::MCE_SIGNAL_PATH,
                                       interface: mce::MCE_SIGNAL_IF,
                                       member: mce::PREVENT_BLANK_ALLOWED_SIG,
                                       arg0: None },
                         prevent_signal);
    watch_install_locked(this,
                         st,
                         |st| &mut st.body.status_watch,
                         SignalMatch { sender: Some(mce::MCE_SERVICE),
                                       path: mce::MCE_SIGNAL_PATH,
                                       interface: mce::MCE_SIGNAL_IF,
                                       member: mce::DISPLAY_STATUS_SIG,
                                       arg0: None },
                         status_signal);
}

/* ----------------------------------------------------------------------- *
 * Bus connection
 * ----------------------------------------------------------------------- */

fn session_sender_spawn_locked(core: &ObjectCore,
                               st: &mut ObjectState<DisplayKeepaliveBody>,
                               bus: Arc<dyn BusLink>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<MethodCall>();
    st.body.session_calls = Some(tx);
    core.runtime().spawn(async move {
        while let Some(call) = rx.recv().await {
            if let Err(error) = bus.send(call).await {
                warn!("session call failed: {error}");
            }
        }
    });
}

fn connect_later_locked(this: &Arc<DisplayKeepaliveInner>,
                        st: &mut ObjectState<DisplayKeepaliveBody>) {
    if st.body.connect_task.is_active() || st.body.connect_attempted {
        return;
    }
    object::task_start_locked(this, st, |st| &mut st.body.connect_task, |obj, id| async move {
        {
            let mut st = object::lock(&*obj);
            if !st.body.connect_task.matches(id) {
                return;
            }
            if object::in_shutdown_locked(&st) || st.body.connect_attempted {
                st.body.connect_task.clear();
                return;
            }
            st.body.connect_attempted = true;
        }

        let connected = obj.connector.connect().await;

        let mut st = object::lock(&*obj);
        if !object::task_finish_locked(&mut st, |st| &mut st.body.connect_task, id) {
            return;
        }
        match connected {
            Ok(bus) => {
                st.body.bus = Some(Arc::clone(&bus));
                session_sender_spawn_locked(&obj.core, &mut st, bus);
                filters_install_locked(&obj, &mut st);
                owner_query_start_locked(&obj, &mut st);
            }
            Err(error) => warn!("can't connect to system bus: {error}"),
        }
    });
}

fn disconnect_now_locked(st: &mut ObjectState<DisplayKeepaliveBody>) {
    object::timer_stop_locked(st, |st| &mut st.body.connect_task);
    object::timer_stop_locked(st, |st| &mut st.body.nameowner_watch);
    object::timer_stop_locked(st, |st| &mut st.body.prevent_watch);
    object::timer_stop_locked(st, |st| &mut st.body.status_watch);
    st.body.session_calls = None;
    st.body.bus = None;
}

/* ----------------------------------------------------------------------- *
 * External API
 * ----------------------------------------------------------------------- */

/// Display blanking pause handle; see the [module docs](self).
pub struct DisplayKeepalive {
    inner: Arc<DisplayKeepaliveInner>,
}

impl DisplayKeepalive {
    /// Session over the platform system bus.
    ///
    /// Must be called within a tokio runtime context.
    pub fn new() -> Self { Self::with_connector(Arc::new(SystemBus)) }

    /// Session over a caller-provided bus transport.
    pub fn with_connector(connector: Arc<dyn BusConnector>) -> Self {
        let inner = Arc::new(DisplayKeepaliveInner {
            core: ObjectCore::new("displaykeepalive"),
            connector,
            state: Mutex::new(ObjectState::new(DisplayKeepaliveBody::new())),
        });
        let mut st = object::lock(&*inner);
        connect_later_locked(&inner, &mut st);
        drop(st);
        Self { inner }
    }

    /// Requests a blanking pause. Takes effect while the daemon is present
    /// and allows it.
    pub fn start(&self) {
        let mut st = object::lock(&*self.inner);
        if !st.body.requested {
            st.body.requested = true;
            rethink_schedule_locked(&self.inner, &mut st);
        }
    }

    /// Releases the blanking pause.
    pub fn stop(&self) {
        let mut st = object::lock(&*self.inner);
        if st.body.requested {
            st.body.requested = false;
            rethink_schedule_locked(&self.inner, &mut st);
        }
    }

    /// Last daemon-published blanking pause policy.
    pub fn prevent_mode(&self) -> PreventMode {
        object::lock(&*self.inner).body.prevent_mode
    }

    /// Last daemon-reported display state.
    pub fn display_status(&self) -> DisplayStatus {
        object::lock(&*self.inner).body.display_status
    }

    /// Sets the display status change callback.
    pub fn set_status_notify(&self, notify: impl Fn(DisplayStatus) + Send + Sync + 'static) {
        let mut st = object::lock(&*self.inner);
        st.body.status_notify = Some(Arc::new(notify));
    }
}

impl Default for DisplayKeepalive {
    fn default() -> Self { Self::new() }
}

impl Clone for DisplayKeepalive {
    fn clone(&self) -> Self {
        let mut st = object::lock(&*self.inner);
        object::ref_external_locked(&*self.inner, &mut st);
        drop(st);
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Drop for DisplayKeepalive {
    fn drop(&mut self) {
        let mut st = object::lock(&*self.inner);
        object::unref_external_locked(&self.inner, &mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{MockBus, settle};
    use pretty_assertions::assert_eq;

    fn daemon_up_and_allowed() -> MockBus {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.2"));
        bus.set_blanking_allowed(Some(true));
        bus.set_display_status(Some(mce::DISPLAY_ON_STRING));
        bus
    }

    #[tokio::test(start_paused = true)]
    async fn session_runs_while_allowed() {
        let bus = daemon_up_and_allowed();
        let dk = DisplayKeepalive::with_connector(Arc::new(bus.clone()));

        dk.start();
        settle().await;
        assert_eq!(bus.sent().iter().map(|c| c.method).collect::<Vec<_>>(),
                   vec![mce::PREVENT_BLANK]);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(bus.sent().len(), 2);

        dk.stop();
        settle().await;
        assert_eq!(bus.sent().last().map(|c| c.method),
                   Some(mce::CANCEL_PREVENT_BLANK));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_policy_idles_silently() {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.2"));
        bus.set_blanking_allowed(Some(false));
        let dk = DisplayKeepalive::with_connector(Arc::new(bus.clone()));

        dk.start();
        settle().await;
        assert_eq!(dk.prevent_mode(), PreventMode::Denied);
        assert_eq!(bus.sent(), vec![]);

        // Policy flips: the already-requested session starts.
        bus.emit_blanking_allowed(true);
        settle().await;
        assert_eq!(bus.sent().iter().map(|c| c.method).collect::<Vec<_>>(),
                   vec![mce::PREVENT_BLANK]);
    }

    #[tokio::test(start_paused = true)]
    async fn daemon_exit_resets_prevent_mode() {
        let bus = daemon_up_and_allowed();
        let dk = DisplayKeepalive::with_connector(Arc::new(bus.clone()));

        dk.start();
        settle().await;
        assert_eq!(dk.prevent_mode(), PreventMode::Allowed);

        bus.emit_name_owner_changed(mce::MCE_SERVICE, ":1.2", "");
        settle().await;
        assert_eq!(dk.prevent_mode(), PreventMode::Unknown);

        // No renewals while the daemon is gone.
        let sent_before = bus.sent().len();
        tokio::time::advance(Duration::from_secs(180)).await;
        settle().await;
        assert_eq!(bus.sent().len(), sent_before);
    }

    #[tokio::test(start_paused = true)]
    async fn display_status_tracks_daemon_strings() {
        let bus = daemon_up_and_allowed();
        let dk = DisplayKeepalive::with_connector(Arc::new(bus.clone()));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dk.set_status_notify(move |status| sink.lock().unwrap().push(status));

        settle().await;
        assert_eq!(dk.display_status(), DisplayStatus::On);

        bus.emit_display_status(mce::DISPLAY_DIM_STRING);
        settle().await;
        bus.emit_display_status(mce::DISPLAY_OFF_STRING);
        settle().await;
        bus.emit_display_status("garbage");
        settle().await;

        assert_eq!(dk.display_status(), DisplayStatus::Unknown);
        assert_eq!(*seen.lock().unwrap(),
                   vec![DisplayStatus::On,
                        DisplayStatus::Dimmed,
                        DisplayStatus::Off,
                        DisplayStatus::Unknown]);
    }
}
