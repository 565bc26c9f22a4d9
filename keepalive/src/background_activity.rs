// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive reprogram

//! Periodic background activity: suspend between jobs, wake on an aligned
//! schedule, stay awake for the duration of the job.
//!
//! A [`BackgroundActivity`] composes an owned [`Heartbeat`] (for the aligned
//! wakeups) and an owned [`CpuKeepalive`] (for blocking suspend while the
//! job runs) behind a three-state machine:
//!
//! | from \ to | Stopped            | Waiting                       | Running             |
//! | :-------- | :----------------- | :---------------------------- | :------------------ |
//! | Stopped   | —                  | arm heartbeat                 | start CPU keepalive |
//! | Waiting   | cancel heartbeat   | reprogram iff delay changed   | — (wakeup only)     |
//! | Running   | stop keepalive¹    | stop keepalive¹, arm          | —                   |
//!
//! ¹ deferred until after the observer callback has returned, so a `running`
//! callback can call [`wait`](BackgroundActivityRef::wait) or
//! [`stop`](BackgroundActivityRef::stop) from inside itself before the
//! suspend block is released.
//!
//! Observers are never called inline: transitions schedule a zero-delay
//! notification task that compares the *reported* state against the current
//! one, which means rapid intermediate states coalesce and only the latest
//! is observed. A missing `running` callback defaults to an immediate
//! `stop()` — forgetting to register one cannot pin suspend forever.

use std::{any::Any,
          sync::{Arc, Mutex, Weak},
          time::Duration};

use strum_macros::Display;
use tracing::info;

use crate::{bus::{BusConnector, system::SystemBus},
            cpu_keepalive::CpuKeepalive,
            heartbeat::{Heartbeat, IphbService, WakeupService},
            object::{self, Continuation, ObjectCore, ObjectState, TaskId, TaskSlot}};

/// Global wakeup slot: a second count aligned to the system-wide 30 s grid.
/// Values below the grid snap up to it; non-multiples round down onto it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeupSlot(u32);

impl WakeupSlot {
    pub const THIRTY_SECONDS: Self = Self(30);
    pub const TWO_AND_HALF_MINUTES: Self = Self(150);
    pub const FIVE_MINUTES: Self = Self(300);
    pub const TEN_MINUTES: Self = Self(600);
    pub const FIFTEEN_MINUTES: Self = Self(900);
    pub const THIRTY_MINUTES: Self = Self(1800);
    pub const ONE_HOUR: Self = Self(3600);
    pub const TWO_HOURS: Self = Self(7200);
    pub const TEN_HOURS: Self = Self(36000);

    /// Aligns an arbitrary second count onto the slot grid.
    pub fn from_secs(seconds: u32) -> Self {
        let grid = Self::THIRTY_SECONDS.0;
        let s = seconds.max(grid);
        Self(s - s % grid)
    }

    pub fn as_secs(self) -> u32 { self.0 }
}

impl From<u32> for WakeupSlot {
    fn from(seconds: u32) -> Self { Self::from_secs(seconds) }
}

/// There is no way to ask what watchdog kicking period the heartbeat daemon
/// uses; assume this many seconds when widening a degenerate range.
const SERVER_HEARTBEAT_S: i32 = 12;

/// Wakeup delay: either a global slot or an explicit `[lo, hi]` range.
/// Equality is structural on all three fields, so switching between a slot
/// and a range of the same length still counts as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WakeupDelay {
    slot: Option<WakeupSlot>,
    lo: u32,
    hi: u32,
}

impl WakeupDelay {
    fn from_slot(slot: WakeupSlot) -> Self {
        Self { slot: Some(slot), lo: slot.as_secs(), hi: slot.as_secs() }
    }

    fn from_range(lo: i32, hi: i32) -> Self {
        // Zero wait is not supported.
        let lo = lo.max(1);
        // A degenerate range widens to one server heartbeat.
        let hi = if hi <= lo { lo + SERVER_HEARTBEAT_S } else { hi };
        Self { slot: None, lo: lo as u32, hi: hi as u32 }
    }
}

impl Default for WakeupDelay {
    fn default() -> Self { Self::from_slot(WakeupSlot::ONE_HOUR) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
enum ActivityState {
    Stopped,
    Waiting,
    Running,
}

/// Observer callback for one state transition. Receives a borrowed control
/// view so it can re-arm or stop without holding a strong handle.
pub(crate) type EventCallback =
    Arc<dyn for<'a> Fn(BackgroundActivityRef<'a>) + Send + Sync>;

pub(crate) struct BackgroundActivityBody {
    current: ActivityState,
    reported: ActivityState,
    report_task: TaskSlot,
    wakeup_curr: WakeupDelay,
    /// Last delay actually programmed; detects Waiting -> Waiting
    /// transitions that must reprogram the wait.
    wakeup_last: WakeupDelay,
    user_data: Option<Arc<dyn Any + Send + Sync>>,
    running_cb: Option<EventCallback>,
    waiting_cb: Option<EventCallback>,
    stopped_cb: Option<EventCallback>,
}

pub(crate) struct BackgroundActivityInner {
    core: ObjectCore,
    /// For wakeup IPC with the heartbeat daemon.
    heartbeat: Heartbeat,
    /// For suspend-blocking IPC with the power daemon; also the id source.
    keepalive: CpuKeepalive,
    state: Mutex<ObjectState<BackgroundActivityBody>>,
}

impl object::ObjectLifecycle for BackgroundActivityInner {
    type Body = BackgroundActivityBody;

    fn core(&self) -> &ObjectCore { &self.core }

    fn state(&self) -> &Mutex<ObjectState<BackgroundActivityBody>> { &self.state }

    fn shutdown_locked(this: &Arc<Self>, st: &mut ObjectState<BackgroundActivityBody>) {
        // Detach from the owned objects; their handles drop together with
        // this object and run their own shutdown.
        this.heartbeat.clear_notify();
        this.heartbeat.stop();
        this.keepalive.stop();

        object::timer_stop_locked(st, |st| &mut st.body.report_task);
    }
}

/* ----------------------------------------------------------------------- *
 * State transitions
 * ----------------------------------------------------------------------- */

fn report_state_tick(obj: &Arc<BackgroundActivityInner>, id: TaskId) -> Continuation {
    let mut st = object::lock(&**obj);
    if !st.body.report_task.matches(id) {
        return Continuation::Stop;
    }
    st.body.report_task.clear();

    if object::in_shutdown_locked(&st) {
        return Continuation::Stop;
    }
    if st.body.reported == st.body.current {
        return Continuation::Stop;
    }
    st.body.reported = st.body.current;

    let state = st.body.reported;
    let callback = match state {
        ActivityState::Stopped => st.body.stopped_cb.clone(),
        ActivityState::Waiting => st.body.waiting_cb.clone(),
        ActivityState::Running => st.body.running_cb.clone(),
    };

    // Observers run with the lock released.
    drop(st);
    match callback {
        Some(callback) => callback(BackgroundActivityRef { inner: obj }),
        None => {
            if state == ActivityState::Running {
                // Whatever happens in a running callback, it must end in
                // stop() or wait(); with no callback registered, stop here or
                // suspend stays blocked until the process exits.
                set_state(obj, ActivityState::Stopped);
            }
        }
    }

    // The suspend block goes away only after the observer has had its say.
    if state != ActivityState::Running {
        obj.keepalive.stop();
    }
    Continuation::Stop
}

fn set_state_locked(this: &Arc<BackgroundActivityInner>,
                    st: &mut ObjectState<BackgroundActivityBody>,
                    state: ActivityState) {
    if object::in_shutdown_locked(st) {
        return;
    }

    // Changing the length of the wait while already waiting counts as a
    // state change; everything else same-to-same is a no-op.
    if st.body.current == state {
        if state != ActivityState::Waiting {
            return;
        }
        if st.body.wakeup_curr == st.body.wakeup_last {
            return;
        }
    }

    info!("{}: state: {} -> {}", this.keepalive.id(), st.body.current, state);

    // Leave the old state.
    match st.body.current {
        ActivityState::Stopped => {}
        ActivityState::Waiting => {
            this.heartbeat.stop();
        }
        ActivityState::Running => {
            // The keepalive is stopped after the transition has been
            // reported; see report_state_tick().
        }
    }

    // Enter the new state.
    match state {
        ActivityState::Stopped => {}
        ActivityState::Waiting => {
            let delay = st.body.wakeup_curr;
            this.heartbeat.set_delay(delay.lo as i32, delay.hi as i32);
            st.body.wakeup_last = delay;
            this.heartbeat.start();
        }
        ActivityState::Running => {
            this.keepalive.start();
        }
    }

    // A pure reprogram does not notify.
    if st.body.current == state {
        return;
    }
    st.body.current = state;

    if st.body.report_task.is_active() {
        return;
    }
    object::timer_start_locked(this, st, |st| &mut st.body.report_task, Duration::ZERO,
                               report_state_tick);
}

fn set_state(inner: &Arc<BackgroundActivityInner>, state: ActivityState) {
    let mut st = object::lock(&**inner);
    set_state_locked(inner, &mut st, state);
}

fn in_state(inner: &Arc<BackgroundActivityInner>, state: ActivityState) -> bool {
    object::lock(&**inner).body.current == state
}

/// Heartbeat wakeup: only a Waiting object starts running; a stray wakeup in
/// any other state is ignored.
fn heartbeat_wakeup(obj: &Arc<BackgroundActivityInner>) {
    let mut st = object::lock(&**obj);
    info!("{}: wakeup", obj.keepalive.id());
    if st.body.current == ActivityState::Waiting {
        set_state_locked(obj, &mut st, ActivityState::Running);
    }
}

/* ----------------------------------------------------------------------- *
 * External API
 * ----------------------------------------------------------------------- */

/// Periodic background activity handle; see the [module docs](self).
///
/// Cloning adds a reference; dropping the last clone shuts the machine down
/// on the event loop, cancelling the wakeup and releasing any suspend block.
pub struct BackgroundActivity {
    inner: Arc<BackgroundActivityInner>,
}

/// Borrowed control view handed to observer callbacks. Supports the same
/// operations as [`BackgroundActivity`] but cannot outlive the callback, so
/// a callback cannot accidentally keep the object alive through itself.
#[derive(Clone, Copy)]
pub struct BackgroundActivityRef<'a> {
    inner: &'a Arc<BackgroundActivityInner>,
}

impl BackgroundActivity {
    /// Background activity over the platform system bus and heartbeat
    /// socket.
    ///
    /// Must be called within a tokio runtime context.
    pub fn new() -> Self {
        Self::with_links(Arc::new(SystemBus), Arc::new(IphbService::default()))
    }

    /// Background activity over caller-provided transports.
    pub fn with_links(connector: Arc<dyn BusConnector>,
                      wakeups: Arc<dyn WakeupService>)
                      -> Self {
        let inner = Arc::new(BackgroundActivityInner {
            core: ObjectCore::new("bg-activity"),
            heartbeat: Heartbeat::with_service(wakeups),
            keepalive: CpuKeepalive::with_connector(connector),
            state: Mutex::new(ObjectState::new(BackgroundActivityBody {
                current: ActivityState::Stopped,
                reported: ActivityState::Stopped,
                report_task: TaskSlot::default(),
                wakeup_curr: WakeupDelay::default(),
                wakeup_last: WakeupDelay::default(),
                user_data: None,
                running_cb: None,
                waiting_cb: None,
                stopped_cb: None,
            })),
        });

        // The wakeup path must not keep the object alive on its own.
        let weak = Arc::downgrade(&inner);
        inner.heartbeat.set_notify(move || {
            if let Some(obj) = Weak::upgrade(&weak) {
                heartbeat_wakeup(&obj);
            }
        });

        Self { inner }
    }

    /// Enters Waiting: suspend may resume, and the object wakes up within
    /// the configured delay. While already Waiting, re-programs the wakeup
    /// only if the delay changed.
    pub fn wait(&self) { set_state(&self.inner, ActivityState::Waiting); }

    /// Enters Running: blocks suspend until `stop()` or `wait()`.
    pub fn run(&self) { set_state(&self.inner, ActivityState::Running); }

    /// Enters Stopped: no wakeup pending, no suspend block held.
    pub fn stop(&self) { set_state(&self.inner, ActivityState::Stopped); }

    pub fn is_stopped(&self) -> bool { in_state(&self.inner, ActivityState::Stopped) }

    pub fn is_waiting(&self) -> bool { in_state(&self.inner, ActivityState::Waiting) }

    pub fn is_running(&self) -> bool { in_state(&self.inner, ActivityState::Running) }

    /// The configured global wakeup slot, or `None` when an explicit range
    /// is in use.
    pub fn wakeup_slot(&self) -> Option<WakeupSlot> {
        object::lock(&*self.inner).body.wakeup_curr.slot
    }

    /// Uses a global wakeup slot (seconds snap onto the 30 s grid). Takes
    /// effect on the next Waiting transition.
    pub fn set_wakeup_slot(&self, slot: impl Into<WakeupSlot>) {
        let mut st = object::lock(&*self.inner);
        st.body.wakeup_curr = WakeupDelay::from_slot(slot.into());
    }

    /// The configured wakeup range in seconds.
    pub fn wakeup_range(&self) -> (u32, u32) {
        let st = object::lock(&*self.inner);
        (st.body.wakeup_curr.lo, st.body.wakeup_curr.hi)
    }

    /// Uses an explicit wakeup range. `lo` is clamped to at least 1; a
    /// degenerate upper bound widens by one server heartbeat.
    pub fn set_wakeup_range(&self, lo: i32, hi: i32) {
        let mut st = object::lock(&*self.inner);
        st.body.wakeup_curr = WakeupDelay::from_range(lo, hi);
    }

    /// The id of the owned CPU keepalive session, tying diagnostics of the
    /// two objects together. Immutable, so no locking is needed.
    pub fn id(&self) -> &str { self.inner.keepalive.id() }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        object::lock(&*self.inner).body.user_data.clone()
    }

    /// Takes the user data out of the object.
    pub fn steal_user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        object::lock(&*self.inner).body.user_data.take()
    }

    /// Replaces the user data. The previous value is dropped outside the
    /// object lock.
    pub fn set_user_data(&self, data: impl Any + Send + Sync) {
        let mut st = object::lock(&*self.inner);
        let old = st.body.user_data.replace(Arc::new(data));
        drop(st);
        drop(old);
    }

    pub fn set_running_callback(&self,
                                cb: impl Fn(BackgroundActivityRef<'_>) + Send + Sync + 'static) {
        object::lock(&*self.inner).body.running_cb = Some(Arc::new(cb));
    }

    pub fn set_waiting_callback(&self,
                                cb: impl Fn(BackgroundActivityRef<'_>) + Send + Sync + 'static) {
        object::lock(&*self.inner).body.waiting_cb = Some(Arc::new(cb));
    }

    pub fn set_stopped_callback(&self,
                                cb: impl Fn(BackgroundActivityRef<'_>) + Send + Sync + 'static) {
        object::lock(&*self.inner).body.stopped_cb = Some(Arc::new(cb));
    }
}

impl Default for BackgroundActivity {
    fn default() -> Self { Self::new() }
}

impl Clone for BackgroundActivity {
    fn clone(&self) -> Self {
        let mut st = object::lock(&*self.inner);
        object::ref_external_locked(&*self.inner, &mut st);
        drop(st);
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl Drop for BackgroundActivity {
    fn drop(&mut self) {
        let mut st = object::lock(&*self.inner);
        object::unref_external_locked(&self.inner, &mut st);
    }
}

impl BackgroundActivityRef<'_> {
    pub fn wait(&self) { set_state(self.inner, ActivityState::Waiting); }

    pub fn run(&self) { set_state(self.inner, ActivityState::Running); }

    pub fn stop(&self) { set_state(self.inner, ActivityState::Stopped); }

    pub fn is_stopped(&self) -> bool { in_state(self.inner, ActivityState::Stopped) }

    pub fn is_waiting(&self) -> bool { in_state(self.inner, ActivityState::Waiting) }

    pub fn is_running(&self) -> bool { in_state(self.inner, ActivityState::Running) }

    pub fn id(&self) -> &str { self.inner.keepalive.id() }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        object::lock(&**self.inner).body.user_data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{MockBus, MockWakeupService, settle};
    use pretty_assertions::assert_eq;

    fn activity_with_mocks() -> (BackgroundActivity, MockBus, Arc<MockWakeupService>) {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.7"));
        let wakeups = Arc::new(MockWakeupService::new());
        let activity = BackgroundActivity::with_links(Arc::new(bus.clone()),
                                                      wakeups.clone());
        (activity, bus, wakeups)
    }

    #[test]
    fn slot_snaps_onto_the_grid() {
        assert_eq!(WakeupSlot::from_secs(0).as_secs(), 30);
        assert_eq!(WakeupSlot::from_secs(29).as_secs(), 30);
        assert_eq!(WakeupSlot::from_secs(45).as_secs(), 30);
        assert_eq!(WakeupSlot::from_secs(60).as_secs(), 60);
        assert_eq!(WakeupSlot::from_secs(3599).as_secs(), 3570);
        assert_eq!(WakeupSlot::ONE_HOUR.as_secs(), 3600);
    }

    #[test]
    fn degenerate_range_widens_by_one_server_heartbeat() {
        let delay = WakeupDelay::from_range(-5, -1);
        assert_eq!((delay.lo, delay.hi), (1, 13));
        assert_eq!(delay.slot, None);

        let delay = WakeupDelay::from_range(10, 10);
        assert_eq!((delay.lo, delay.hi), (10, 22));

        let delay = WakeupDelay::from_range(10, 20);
        assert_eq!((delay.lo, delay.hi), (10, 20));
    }

    #[test]
    fn delay_equality_is_structural() {
        assert_eq!(WakeupDelay::from_slot(WakeupSlot::THIRTY_SECONDS),
                   WakeupDelay::from_slot(WakeupSlot::from_secs(45)));
        // A slot and a range of the same seconds still differ.
        assert_ne!(WakeupDelay::from_slot(WakeupSlot::THIRTY_SECONDS),
                   WakeupDelay::from_range(30, 30));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_twice_with_same_delay_does_not_rearm() {
        let (activity, _bus, wakeups) = activity_with_mocks();

        activity.wait();
        settle().await;
        assert_eq!(wakeups.requests(), vec![(3600, 3600)]);
        assert!(activity.is_waiting());

        activity.wait();
        settle().await;
        assert_eq!(wakeups.requests(), vec![(3600, 3600)]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_with_changed_delay_reprograms() {
        let (activity, _bus, wakeups) = activity_with_mocks();

        activity.wait();
        settle().await;

        activity.set_wakeup_slot(WakeupSlot::THIRTY_SECONDS);
        activity.wait();
        settle().await;

        // Cancel of the old wait, then the new window.
        assert_eq!(wakeups.requests(), vec![(3600, 3600), (0, 0), (30, 30)]);
        assert!(activity.is_waiting());
    }

    #[tokio::test(start_paused = true)]
    async fn stray_wakeup_while_running_is_ignored() {
        let (activity, _bus, wakeups) = activity_with_mocks();

        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        activity.set_running_callback(move |_activity| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        activity.wait();
        settle().await;
        wakeups.fire_wakeup();
        settle().await;
        assert!(activity.is_running());
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);

        wakeups.fire_wakeup();
        settle().await;
        assert!(activity.is_running());
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_from_inside_running_callback_is_a_noop() {
        let (activity, _bus, wakeups) = activity_with_mocks();

        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen = Arc::clone(&runs);
        activity.set_running_callback(move |activity| {
            seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            activity.run();
        });

        activity.wait();
        settle().await;
        wakeups.fire_wakeup();
        settle().await;

        assert!(activity.is_running());
        assert_eq!(runs.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_running_callback_stops() {
        let (activity, bus, wakeups) = activity_with_mocks();

        activity.wait();
        settle().await;
        wakeups.fire_wakeup();
        settle().await;

        assert!(activity.is_stopped());
        // The keepalive session opened and closed around the default stop.
        let methods: Vec<_> = bus.sent().iter().map(|c| c.method).collect();
        assert_eq!(methods,
                   vec![crate::mce::CPU_KEEPALIVE_START, crate::mce::CPU_KEEPALIVE_STOP]);
    }

    #[tokio::test(start_paused = true)]
    async fn user_data_get_steal_set() {
        let (activity, _bus, _wakeups) = activity_with_mocks();

        assert!(activity.user_data().is_none());
        activity.set_user_data(41_i32);
        let data = activity.user_data().expect("user data");
        assert_eq!(data.downcast_ref::<i32>(), Some(&41));

        let stolen = activity.steal_user_data().expect("stolen");
        assert_eq!(stolen.downcast_ref::<i32>(), Some(&41));
        assert!(activity.user_data().is_none());
    }
}
