// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive rethink

//! Suspend-blocking session with the platform power daemon.
//!
//! A [`CpuKeepalive`] keeps the SoC from entering deep suspend while it is
//! started: it opens a named session with the power daemon and renews it by
//! re-sending the start call at the daemon-advertised period. The daemon
//! treats a session whose renewals stop arriving as abandoned, so a crashed
//! client can never pin suspend.
//!
//! [`start`](CpuKeepalive::start) and [`stop`](CpuKeepalive::stop) only
//! record intent and schedule a deferred *rethink*; the reconciliation —
//! session running iff requested, daemon present, and not shutting down —
//! always happens from the event loop, never from inside an API call.
//!
//! Daemon presence is tracked through the bus service (`GetNameOwner` plus a
//! `NameOwnerChanged` match on the daemon's name). The bus connection itself
//! is attempted exactly once per object: if the system bus is unreachable the
//! object stays functional but inert, by contract.

use std::{sync::{Arc, Mutex,
                 atomic::{AtomicU32, Ordering}},
          time::Duration};

use strum_macros::Display;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{bus::{BusConnector, BusError, BusLink, BusValue, MethodCall, ReplyType,
                  SignalMatch, SignalMessage, system::SystemBus},
            mce,
            object::{self, Continuation, ObjectCore, ObjectState, TaskId, TaskSlot}};

/// Assumed renew period while the daemon has not been queried yet.
const CPU_KEEPALIVE_RENEW: Duration = Duration::from_secs(60);

/// Ownership state of the power daemon's bus name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub(crate) enum NameOwner {
    Unknown,
    Stopped,
    Running,
}

static NEXT_SESSION: AtomicU32 = AtomicU32::new(0);

/// Process-unique session id for the daemon IPC. Immutable for the object's
/// lifetime, hence readable without the lock.
fn generate_id() -> String {
    let n = NEXT_SESSION.fetch_add(1, Ordering::Relaxed) + 1;
    format!("cpu_keepalive_{n}")
}

pub(crate) struct CpuKeepaliveBody {
    /// User intent: suspend blocking requested.
    requested: bool,
    /// Bus connect is attempted at most once per object.
    connect_attempted: bool,
    bus: Option<Arc<dyn BusLink>>,
    /// Ordered fire-and-forget session calls; drained by a dedicated task so
    /// START / renew / STOP can never reorder.
    session_calls: Option<mpsc::UnboundedSender<MethodCall>>,
    nameowner_watch: TaskSlot,
    daemon_owner: NameOwner,
    owner_query: TaskSlot,
    /// Daemon-advertised renew period; `None` until discovered.
    renew_period: Option<Duration>,
    period_query: TaskSlot,
    session_renew: TaskSlot,
    connect_task: TaskSlot,
    rethink_task: TaskSlot,
}

impl CpuKeepaliveBody {
    fn new() -> Self {
        Self {
            requested: false,
            connect_attempted: false,
            bus: None,
            session_calls: None,
            nameowner_watch: TaskSlot::default(),
            daemon_owner: NameOwner::Unknown,
            owner_query: TaskSlot::default(),
            renew_period: None,
            period_query: TaskSlot::default(),
            session_renew: TaskSlot::default(),
            connect_task: TaskSlot::default(),
            rethink_task: TaskSlot::default(),
        }
    }
}

pub(crate) struct CpuKeepaliveInner {
    core: ObjectCore,
    connector: Arc<dyn BusConnector>,
    state: Mutex<ObjectState<CpuKeepaliveBody>>,
}

impl object::ObjectLifecycle for CpuKeepaliveInner {
    type Body = CpuKeepaliveBody;

    fn core(&self) -> &ObjectCore { &self.core }

    fn state(&self) -> &Mutex<ObjectState<CpuKeepaliveBody>> { &self.state }

    fn shutdown_locked(this: &Arc<Self>, st: &mut ObjectState<CpuKeepaliveBody>) {
        // Cancel pending queries.
        object::timer_stop_locked(st, |st| &mut st.body.owner_query);
        object::timer_stop_locked(st, |st| &mut st.body.period_query);

        // Stop the session and renew loop; the final rethink sees
        // in_shutdown and emits the STOP call.
        object::timer_stop_locked(st, |st| &mut st.body.rethink_task);
        rethink_now_locked(this, st);

        disconnect_now_locked(st);
    }
}

/* ----------------------------------------------------------------------- *
 * Renew period
 * ----------------------------------------------------------------------- */

fn renew_period_locked(st: &ObjectState<CpuKeepaliveBody>) -> Duration {
    st.body.renew_period.unwrap_or(CPU_KEEPALIVE_RENEW)
}

fn renew_period_set_locked(this: &Arc<CpuKeepaliveInner>,
                           st: &mut ObjectState<CpuKeepaliveBody>,
                           seconds: i32) {
    let old = renew_period_locked(st);
    st.body.renew_period = if seconds <= 0 {
        Some(CPU_KEEPALIVE_RENEW)
    } else {
        Some(Duration::from_secs(seconds as u64))
    };
    let new = renew_period_locked(st);
    info!("{}: renew period: {}s", this.core.identity(), new.as_secs());

    if old != new {
        session_restart_locked(this, st);
    }
}

fn period_query_start_locked(this: &Arc<CpuKeepaliveInner>,
                             st: &mut ObjectState<CpuKeepaliveBody>) {
    if object::in_shutdown_locked(st) {
        return;
    }
    // Queried once; the answer is cached for the lifetime of the object.
    if st.body.renew_period.is_some() || st.body.period_query.is_active() {
        return;
    }
    let Some(bus) = st.body.bus.clone() else { return };
    let session = this.core.identity().to_owned();
    object::task_start_locked(this, st, |st| &mut st.body.period_query, |obj, id| async move {
        let call = MethodCall::new(mce::MCE_SERVICE,
                                   mce::MCE_REQUEST_PATH,
                                   mce::MCE_REQUEST_IF,
                                   mce::CPU_KEEPALIVE_PERIOD).arg(session);
        let reply = bus.call(call, ReplyType::I32).await;
        period_query_reply(&obj, id, reply);
    });
}

fn period_query_reply(obj: &Arc<CpuKeepaliveInner>,
                      id: TaskId,
                      reply: Result<BusValue, BusError>) {
    let mut st = object::lock(&**obj);
    if !object::task_finish_locked(&mut st, |st| &mut st.body.period_query, id) {
        return;
    }
    // Not repeated even when the query fails: record the result either way
    // and let zero mean "use the built-in default".
    let seconds = match reply {
        Ok(value) => value.as_i32().unwrap_or(0),
        Err(error) => {
            warn!("renew period reply: {error}");
            0
        }
    };
    renew_period_set_locked(obj, &mut st, seconds);
}

/* ----------------------------------------------------------------------- *
 * Keepalive session
 * ----------------------------------------------------------------------- */

/// Enqueues one fire-and-forget daemon call carrying the session id. The
/// drain task performs the actual send without holding the object lock.
fn session_call_locked(core: &ObjectCore,
                       st: &mut ObjectState<CpuKeepaliveBody>,
                       method: &'static str) {
    let connected = st.body.bus.as_ref().is_some_and(|bus| bus.is_connected());
    if !connected {
        return;
    }
    let Some(session_calls) = &st.body.session_calls else { return };
    info!("{}: {method}", core.identity());
    let call = MethodCall::new(mce::MCE_SERVICE,
                               mce::MCE_REQUEST_PATH,
                               mce::MCE_REQUEST_IF,
                               method).arg(core.identity());
    let _ = session_calls.send(call);
}

fn session_renew_tick(obj: &Arc<CpuKeepaliveInner>, id: TaskId) -> Continuation {
    let mut st = object::lock(&**obj);
    if !st.body.session_renew.matches(id) {
        return Continuation::Stop;
    }
    session_call_locked(&obj.core, &mut st, mce::CPU_KEEPALIVE_START);
    Continuation::Continue
}

fn session_start_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    if st.body.session_renew.is_active() {
        return;
    }
    session_call_locked(&this.core, st, mce::CPU_KEEPALIVE_START);
    let period = renew_period_locked(st);
    object::timer_start_locked(this, st, |st| &mut st.body.session_renew, period,
                               session_renew_tick);
}

/// Re-sends START and re-arms the renew timer after a period change; the old
/// schedule is discarded.
fn session_restart_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    if !st.body.session_renew.is_active() {
        return;
    }
    session_call_locked(&this.core, st, mce::CPU_KEEPALIVE_START);
    let period = renew_period_locked(st);
    object::timer_start_locked(this, st, |st| &mut st.body.session_renew, period,
                               session_renew_tick);
}

fn session_stop_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    if !st.body.session_renew.is_active() {
        return;
    }
    object::timer_stop_locked(st, |st| &mut st.body.session_renew);
    session_call_locked(&this.core, st, mce::CPU_KEEPALIVE_STOP);
}

/* ----------------------------------------------------------------------- *
 * State evaluation
 * ----------------------------------------------------------------------- */

/// Reconciles the renew loop with current intent and daemon state. Runs only
/// from the event loop (deferred through the rethink task) — never directly
/// from an API call.
fn rethink_now_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    object::timer_stop_locked(st, |st| &mut st.body.rethink_task);

    let need_renew_loop = !object::in_shutdown_locked(st)
                          && st.body.daemon_owner == NameOwner::Running
                          && st.body.requested;

    if need_renew_loop {
        session_start_locked(this, st);
    } else {
        session_stop_locked(this, st);
    }
}

fn rethink_tick(obj: &Arc<CpuKeepaliveInner>, id: TaskId) -> Continuation {
    let mut st = object::lock(&**obj);
    if st.body.rethink_task.matches(id) {
        st.body.rethink_task.clear();
        rethink_now_locked(obj, &mut st);
    }
    Continuation::Stop
}

fn rethink_schedule_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    if !st.body.rethink_task.is_active() {
        object::timer_start_locked(this, st, |st| &mut st.body.rethink_task, Duration::ZERO,
                                   rethink_tick);
    }
}

/* ----------------------------------------------------------------------- *
 * Daemon tracking
 * ----------------------------------------------------------------------- */

fn owner_update_locked(this: &Arc<CpuKeepaliveInner>,
                       st: &mut ObjectState<CpuKeepaliveBody>,
                       owner: NameOwner) {
    if st.body.daemon_owner == owner {
        return;
    }
    info!("{}: power daemon: {} -> {}", this.core.identity(), st.body.daemon_owner, owner);
    st.body.daemon_owner = owner;

    if owner == NameOwner::Running {
        period_query_start_locked(this, st);
    }
    rethink_schedule_locked(this, st);
}

fn owner_query_start_locked(this: &Arc<CpuKeepaliveInner>,
                            st: &mut ObjectState<CpuKeepaliveBody>) {
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
        owner_query_reply(&obj, id, reply);
    });
}

fn owner_query_reply(obj: &Arc<CpuKeepaliveInner>,
                     id: TaskId,
                     reply: Result<BusValue, BusError>) {
    let mut st = object::lock(&**obj);
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
    owner_update_locked(obj, &mut st, owner);
}

fn nameowner_signal(obj: &Arc<CpuKeepaliveInner>, id: TaskId, signal: SignalMessage) -> Continuation {
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

fn filter_install_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    if st.body.nameowner_watch.is_active() {
        return;
    }
    let Some(bus) = st.body.bus.clone() else { return };
    object::task_start_locked(this, st, |st| &mut st.body.nameowner_watch, |obj, id| async move {
        let matcher = SignalMatch { sender: Some(mce::DBUS_SERVICE),
                                    path: mce::DBUS_PATH,
                                    interface: mce::DBUS_INTERFACE,
                                    member: mce::NAME_OWNER_CHANGED,
                                    arg0: Some(mce::MCE_SERVICE) };
        let mut signals = match bus.subscribe(matcher).await {
            Ok(signals) => signals,
            Err(error) => {
                warn!("can't watch power daemon name: {error}");
                let mut st = object::lock(&*obj);
                if st.body.nameowner_watch.matches(id) {
                    st.body.nameowner_watch.clear();
                }
                return;
            }
        };
        while let Some(signal) = signals.recv().await {
            if nameowner_signal(&obj, id, signal) == Continuation::Stop {
                break;
            }
        }
    });
}

/* ----------------------------------------------------------------------- *
 * Bus connection
 * ----------------------------------------------------------------------- */

/// Spawns the ordered drain task for fire-and-forget session calls. Holds
/// only the link, so queued calls (including a final STOP) still go out
/// while the object is being deleted.
fn session_sender_spawn_locked(core: &ObjectCore,
                               st: &mut ObjectState<CpuKeepaliveBody>,
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

fn connect_later_locked(this: &Arc<CpuKeepaliveInner>, st: &mut ObjectState<CpuKeepaliveBody>) {
    if st.body.connect_task.is_active() || st.body.connect_attempted {
        return;
    }
    object::task_start_locked(this, st, |st| &mut st.body.connect_task, |obj, id| async move {
        connect_now(&obj, id).await;
    });
}

async fn connect_now(obj: &Arc<CpuKeepaliveInner>, id: TaskId) {
    {
        let mut st = object::lock(&**obj);
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

    let mut st = object::lock(&**obj);
    if !object::task_finish_locked(&mut st, |st| &mut st.body.connect_task, id) {
        return;
    }
    match connected {
        Ok(bus) => {
            st.body.bus = Some(Arc::clone(&bus));
            session_sender_spawn_locked(&obj.core, &mut st, bus);
            filter_install_locked(obj, &mut st);
            owner_query_start_locked(obj, &mut st);
        }
        Err(error) => {
            // Stays functional but inert; recovery is the daemon's problem,
            // not the client's.
            warn!("can't connect to system bus: {error}");
        }
    }
}

fn disconnect_now_locked(st: &mut ObjectState<CpuKeepaliveBody>) {
    object::timer_stop_locked(st, |st| &mut st.body.connect_task);
    object::timer_stop_locked(st, |st| &mut st.body.nameowner_watch);
    // Closing the channel lets the drain task flush queued calls and exit.
    st.body.session_calls = None;
    st.body.bus = None;
    // `connect_attempted` stays set: re-connecting this object is not
    // possible.
}

/* ----------------------------------------------------------------------- *
 * External API
 * ----------------------------------------------------------------------- */

/// Suspend-blocking session handle; see the [module docs](self).
///
/// Cloning adds a reference; dropping the last clone shuts the session down
/// on the event loop (ending it daemon-side if it was running).
pub struct CpuKeepalive {
    inner: Arc<CpuKeepaliveInner>,
}

impl CpuKeepalive {
    /// Session over the platform system bus.
    ///
    /// Must be called within a tokio runtime context.
    pub fn new() -> Self { Self::with_connector(Arc::new(SystemBus)) }

    /// Session over a caller-provided bus transport.
    pub fn with_connector(connector: Arc<dyn BusConnector>) -> Self {
        let inner = Arc::new(CpuKeepaliveInner {
            core: ObjectCore::new(generate_id()),
            connector,
            state: Mutex::new(ObjectState::new(CpuKeepaliveBody::new())),
        });
        // Connect from the event loop, not from inside the factory.
        let mut st = object::lock(&*inner);
        connect_later_locked(&inner, &mut st);
        drop(st);
        Self { inner }
    }

    /// Requests suspend blocking. Takes effect once the power daemon is
    /// known to be running.
    pub fn start(&self) {
        let mut st = object::lock(&*self.inner);
        if !st.body.requested {
            st.body.requested = true;
            rethink_schedule_locked(&self.inner, &mut st);
        }
    }

    /// Releases the suspend block.
    pub fn stop(&self) {
        let mut st = object::lock(&*self.inner);
        if st.body.requested {
            st.body.requested = false;
            rethink_schedule_locked(&self.inner, &mut st);
        }
    }

    /// The process-unique session id used in daemon IPC. Immutable, so no
    /// locking is needed.
    pub fn id(&self) -> &str { self.inner.core.identity() }
}

impl Default for CpuKeepalive {
    fn default() -> Self { Self::new() }
}

impl Clone for CpuKeepalive {
    fn clone(&self) -> Self {
        let mut st = object::lock(&*self.inner);
        object::ref_external_locked(&*self.inner, &mut st);
        drop(st);
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Drop for CpuKeepalive {
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

    #[tokio::test(start_paused = true)]
    async fn ids_are_unique_and_stable() {
        let bus = MockBus::new();
        let a = CpuKeepalive::with_connector(Arc::new(bus.clone()));
        let b = CpuKeepalive::with_connector(Arc::new(bus));
        assert!(a.id().starts_with("cpu_keepalive_"));
        assert_ne!(a.id(), b.id());
        let id = a.id().to_owned();
        settle().await;
        assert_eq!(a.id(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn no_session_until_daemon_is_running() {
        let bus = MockBus::new();
        let ka = CpuKeepalive::with_connector(Arc::new(bus.clone()));

        ka.start();
        settle().await;
        assert_eq!(bus.sent(), vec![]);

        bus.emit_name_owner_changed(mce::MCE_SERVICE, "", ":1.10");
        settle().await;
        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, mce::CPU_KEEPALIVE_START);
        assert_eq!(sent[0].args[0].as_str(), Some(ka.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_one_session() {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.1"));
        let ka = CpuKeepalive::with_connector(Arc::new(bus.clone()));

        ka.start();
        settle().await;
        ka.start();
        settle().await;

        let starts = bus.sent()
                        .iter()
                        .filter(|c| c.method == mce::CPU_KEEPALIVE_START)
                        .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_loop_uses_default_period_until_discovered() {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.1"));
        // Period query fails; the 60s fallback applies, with no retry.
        let ka = CpuKeepalive::with_connector(Arc::new(bus.clone()));

        ka.start();
        settle().await;
        assert_eq!(bus.sent().len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(bus.sent().len(), 2);

        let period_queries = bus.calls()
                                .iter()
                                .filter(|c| c.method == mce::CPU_KEEPALIVE_PERIOD)
                                .count();
        assert_eq!(period_queries, 1);
        drop(ka);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_sends_stop_and_ends_renewals() {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.1"));
        let ka = CpuKeepalive::with_connector(Arc::new(bus.clone()));

        ka.start();
        settle().await;
        ka.stop();
        settle().await;

        let methods: Vec<_> = bus.sent().iter().map(|c| c.method).collect();
        assert_eq!(methods, vec![mce::CPU_KEEPALIVE_START, mce::CPU_KEEPALIVE_STOP]);

        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(bus.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_leaves_object_inert() {
        let bus = MockBus::new();
        bus.fail_connect();
        bus.set_name_owner(Some(":1.1"));
        let ka = CpuKeepalive::with_connector(Arc::new(bus.clone()));

        ka.start();
        settle().await;
        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;

        assert_eq!(bus.sent(), vec![]);
        assert_eq!(bus.calls(), vec![]);
        drop(ka);
    }
}
