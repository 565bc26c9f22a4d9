// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Locking and reference counting base shared by every keepalive object.
//!
//! All of the session objects in this crate ([`Heartbeat`], [`CpuKeepalive`],
//! [`DisplayKeepalive`], [`BackgroundActivity`]) face the same lifecycle
//! problem: asynchronous work items (timers, socket watches, outbound bus
//! calls) deliver callbacks that race with the user dropping the last handle.
//! A callback firing just as the handle goes away must neither touch freed
//! state nor deadlock against teardown.
//!
//! The solution is a two-tier reference model:
//!
//! - **External** references keep the object *functional*. They are counted
//!   explicitly in the locked state and driven by the public handle's `Clone`
//!   and `Drop`. When the count steps from 1 to 0, the object's
//!   [`shutdown_locked`] hook is scheduled (never run inline) through a
//!   zero-delay task, so teardown always happens under a fresh lock
//!   acquisition on the event loop.
//! - **Internal** references keep the object *addressable*. They are the
//!   [`Arc`] clones held by every spawned task. Once shutdown has cancelled
//!   all registered work, the last task drops its clone and the inner value's
//!   `Drop` runs exactly once.
//!
//! Work registration goes through [`TaskSlot`]s: a slot holds a non-zero
//! generation id plus an [`AbortHandle`]. Stopping a slot clears the id and
//! posts an abort; cancellation is therefore never delivered synchronously
//! under the caller's lock, and a callback that was already in flight detects
//! staleness by re-checking its generation id against the slot before acting
//! (see [`TaskSlot::matches`] and [`task_finish_locked`]).
//!
//! Everything here is expressed as free functions over an [`ObjectLifecycle`]
//! implementor, mirroring how the concrete objects delegate to their shared
//! base rather than inheriting from it.
//!
//! [`Heartbeat`]: crate::Heartbeat
//! [`CpuKeepalive`]: crate::CpuKeepalive
//! [`DisplayKeepalive`]: crate::DisplayKeepalive
//! [`BackgroundActivity`]: crate::BackgroundActivity
//! [`shutdown_locked`]: ObjectLifecycle::shutdown_locked

use std::{future::Future,
          sync::{Arc, Mutex, MutexGuard,
                 atomic::{AtomicU64, Ordering}},
          time::Duration};

use tokio::{runtime::Handle, task::AbortHandle};
use tracing::warn;

/// Control flow returned by timer ticks: keep the timer repeating, or let the
/// task end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Continuation {
    Continue,
    Stop,
}

/// Generation id of one registered work item. Never zero for live work.
pub(crate) type TaskId = u64;

/// Accessor projecting the locked state onto one [`TaskSlot`]. Plain fn
/// pointer so registration sites stay non-capturing.
pub(crate) type SlotFn<B> = fn(&mut ObjectState<B>) -> &mut TaskSlot;

/// Timer callback. Receives the owning object and the generation id the timer
/// was registered under; must re-validate the id against the slot under the
/// lock before acting.
pub(crate) type TickFn<T> = fn(&Arc<T>, TaskId) -> Continuation;

/// Immutable per-object data: identity for logging, the runtime that owns all
/// of the object's spawned work, and the generation counter for task slots.
///
/// Lives outside the state mutex, so it is readable from any thread without
/// locking (the identity string doubles as the session id for objects that
/// have one).
#[derive(Debug)]
pub(crate) struct ObjectCore {
    identity: String,
    runtime: Handle,
    next_task_id: AtomicU64,
}

impl ObjectCore {
    /// Captures the current tokio runtime. Calling any object factory outside
    /// of a runtime context is a programming error and panics.
    pub(crate) fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            runtime: Handle::current(),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn identity(&self) -> &str { &self.identity }

    pub(crate) fn runtime(&self) -> &Handle { &self.runtime }

    fn next_task_id(&self) -> TaskId {
        self.next_task_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// One registered work item: generation id plus the abort handle of the
/// backing task. A default (id 0, no handle) slot is empty.
#[derive(Debug, Default)]
pub(crate) struct TaskSlot {
    id: TaskId,
    abort: Option<AbortHandle>,
}

impl TaskSlot {
    /// True while the slot holds live work.
    pub(crate) fn is_active(&self) -> bool { self.id != 0 }

    /// True when `id` identifies the work currently occupying the slot. A
    /// stale callback (its slot was cleared or refilled since registration)
    /// never matches.
    pub(crate) fn matches(&self, id: TaskId) -> bool { self.id == id && id != 0 }

    /// Empties the slot, handing back the abort handle of the evicted task.
    pub(crate) fn clear(&mut self) -> Option<AbortHandle> {
        self.id = 0;
        self.abort.take()
    }

    fn fill(&mut self, id: TaskId, abort: AbortHandle) {
        self.id = id;
        self.abort = Some(abort);
    }
}

/// Mutable object state guarded by the per-object mutex: the lifecycle fields
/// shared by all objects plus the component-specific `body`.
#[derive(Debug)]
pub(crate) struct ObjectState<B> {
    external_refs: u32,
    in_shutdown: bool,
    shutdown_slot: TaskSlot,
    pub(crate) body: B,
}

impl<B> ObjectState<B> {
    /// Fresh state for a newly constructed object: exactly one external
    /// reference (the handle returned by the factory), not in shutdown.
    pub(crate) fn new(body: B) -> Self {
        Self {
            external_refs: 1,
            in_shutdown: false,
            shutdown_slot: TaskSlot::default(),
            body,
        }
    }
}

/// Implemented by each concrete object's inner type. Gives the shared base
/// access to the immutable core, the state mutex, and the object's shutdown
/// behavior.
pub(crate) trait ObjectLifecycle: Send + Sync + Sized + 'static {
    type Body: Send + 'static;

    fn core(&self) -> &ObjectCore;

    fn state(&self) -> &Mutex<ObjectState<Self::Body>>;

    /// Cancels the object's asynchronous work once the last external
    /// reference is gone. Runs on the event loop with the object lock held.
    fn shutdown_locked(this: &Arc<Self>, st: &mut ObjectState<Self::Body>);
}

/// Acquires the object lock. Not recursive; a poisoned lock is a fatal
/// programming error.
pub(crate) fn lock<T: ObjectLifecycle>(this: &T) -> MutexGuard<'_, ObjectState<T::Body>> {
    match this.state().lock() {
        Ok(guard) => guard,
        Err(_) => panic!("{}: object lock poisoned", this.core().identity()),
    }
}

/// Adds an external reference. Adding one to an object whose external count
/// already reached zero is a fatal programming error.
pub(crate) fn ref_external_locked<T: ObjectLifecycle>(
    this: &T,
    st: &mut ObjectState<T::Body>,
) {
    assert!(st.external_refs > 0,
            "{}: adding ref to invalid object", this.core().identity());
    st.external_refs += 1;
}

/// Removes an external reference.
///
/// Once external references reach zero no new work can be registered, so the
/// shutdown activity must be scheduled *before* the count is decremented.
pub(crate) fn unref_external_locked<T: ObjectLifecycle>(
    this: &Arc<T>,
    st: &mut ObjectState<T::Body>,
) {
    assert!(st.external_refs > 0,
            "{}: removing ref from invalid object", this.core().identity());
    if st.external_refs == 1 {
        schedule_shutdown_locked(this, st);
    }
    st.external_refs -= 1;
}

/// True once the shutdown task has fired (not merely been scheduled).
pub(crate) fn in_shutdown_locked<B>(st: &ObjectState<B>) -> bool { st.in_shutdown }

fn schedule_shutdown_locked<T: ObjectLifecycle>(this: &Arc<T>, st: &mut ObjectState<T::Body>) {
    if !st.in_shutdown && !st.shutdown_slot.is_active() {
        timer_start_locked(this,
                           st,
                           |st: &mut ObjectState<T::Body>| &mut st.shutdown_slot,
                           Duration::ZERO,
                           shutdown_tick::<T>);
    }
}

fn shutdown_tick<T: ObjectLifecycle>(this: &Arc<T>, id: TaskId) -> Continuation {
    let mut st = lock(&**this);
    if st.shutdown_slot.matches(id) {
        st.shutdown_slot.clear();
        st.in_shutdown = true;
        tracing::debug!("{}: shutting down", this.core().identity());
        T::shutdown_locked(this, &mut st);
    }
    Continuation::Stop
}

/// Starts a timer bound to the object, evicting whatever previously occupied
/// the slot. A zero interval means "next event-loop turn"; a non-zero
/// interval repeats until the tick returns [`Continuation::Stop`] or the slot
/// is stopped.
pub(crate) fn timer_start_locked<T: ObjectLifecycle>(
    this: &Arc<T>,
    st: &mut ObjectState<T::Body>,
    slot: SlotFn<T::Body>,
    interval: Duration,
    tick: TickFn<T>,
) {
    timer_stop_locked(st, slot);

    if st.in_shutdown {
        warn!("{}: attempt to add timer during object shutdown",
              this.core().identity());
        return;
    }

    let id = this.core().next_task_id();
    let task = Arc::clone(this);
    let handle = this.core().runtime().spawn(async move {
        loop {
            if interval.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(interval).await;
            }
            if tick(&task, id) == Continuation::Stop {
                break;
            }
        }
    });
    slot(st).fill(id, handle.abort_handle());
}

/// Stops the slot's work item, if any. The abort is posted, never run inline,
/// so this is safe to call with the object lock held.
pub(crate) fn timer_stop_locked<B>(st: &mut ObjectState<B>, slot: SlotFn<B>) {
    if let Some(abort) = slot(st).clear() {
        abort.abort();
    }
}

/// Registers an arbitrary guarded future in a slot: socket watches, signal
/// subscriptions and outbound bus calls all go through here. The future
/// receives an [`Arc`] of the object (its internal reference) plus the
/// generation id it must re-validate before mutating state.
pub(crate) fn task_start_locked<T, F, Fut>(
    this: &Arc<T>,
    st: &mut ObjectState<T::Body>,
    slot: SlotFn<T::Body>,
    work: F,
) where
    T: ObjectLifecycle,
    F: FnOnce(Arc<T>, TaskId) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    timer_stop_locked(st, slot);

    if st.in_shutdown {
        warn!("{}: attempt to add task during object shutdown",
              this.core().identity());
        return;
    }

    let id = this.core().next_task_id();
    let fut = work(Arc::clone(this), id);
    let handle = this.core().runtime().spawn(fut);
    slot(st).fill(id, handle.abort_handle());
}

/// Completion check for reply-style work: if `id` still occupies the slot the
/// slot is cleared and the reply belongs to the live call; otherwise the
/// reply raced with cancellation and must be discarded.
pub(crate) fn task_finish_locked<B>(st: &mut ObjectState<B>, slot: SlotFn<B>, id: TaskId) -> bool {
    if slot(st).matches(id) {
        slot(st).clear();
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ProbeBody {
        timer: TaskSlot,
        ticks: Arc<AtomicUsize>,
    }

    struct Probe {
        core: ObjectCore,
        state: Mutex<ObjectState<ProbeBody>>,
        shutdowns: AtomicUsize,
        drops: Arc<AtomicUsize>,
    }

    impl ObjectLifecycle for Probe {
        type Body = ProbeBody;

        fn core(&self) -> &ObjectCore { &self.core }

        fn state(&self) -> &Mutex<ObjectState<ProbeBody>> { &self.state }

        fn shutdown_locked(this: &Arc<Self>, st: &mut ObjectState<ProbeBody>) {
            this.shutdowns.fetch_add(1, Ordering::SeqCst);
            timer_stop_locked(st, |st| &mut st.body.timer);
        }
    }

    impl Drop for Probe {
        fn drop(&mut self) { self.drops.fetch_add(1, Ordering::SeqCst); }
    }

    fn new_probe() -> (Arc<Probe>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let drops = Arc::new(AtomicUsize::new(0));
        let probe = Arc::new(Probe {
            core: ObjectCore::new("probe"),
            state: Mutex::new(ObjectState::new(ProbeBody {
                timer: TaskSlot::default(),
                ticks: Arc::clone(&ticks),
            })),
            shutdowns: AtomicUsize::new(0),
            drops: Arc::clone(&drops),
        });
        (probe, ticks, drops)
    }

    fn probe_tick(this: &Arc<Probe>, id: TaskId) -> Continuation {
        let mut st = lock(&**this);
        if !st.body.timer.matches(id) {
            return Continuation::Stop;
        }
        st.body.ticks.fetch_add(1, Ordering::SeqCst);
        Continuation::Continue
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn last_unref_schedules_shutdown_once() {
        let (probe, _ticks, drops) = new_probe();

        {
            let mut st = lock(&*probe);
            ref_external_locked(&*probe, &mut st);
            unref_external_locked(&probe, &mut st);
            assert!(!in_shutdown_locked(&st));
        }
        settle().await;
        assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 0);

        {
            let mut st = lock(&*probe);
            unref_external_locked(&probe, &mut st);
            // Scheduled, not run inline.
            assert!(!in_shutdown_locked(&st));
        }
        settle().await;

        assert_eq!(probe.shutdowns.load(Ordering::SeqCst), 1);
        assert!(in_shutdown_locked(&lock(&*probe)));

        drop(probe);
        settle().await;
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_ticks_until_stopped() {
        let (probe, ticks, _drops) = new_probe();

        {
            let mut st = lock(&*probe);
            timer_start_locked(&probe,
                               &mut st,
                               |st| &mut st.body.timer,
                               Duration::from_secs(1),
                               probe_tick);
        }

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        {
            let mut st = lock(&*probe);
            timer_stop_locked(&mut st, |st| &mut st.body.timer);
        }
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restarting_a_slot_invalidates_the_old_generation() {
        let (probe, ticks, _drops) = new_probe();

        {
            let mut st = lock(&*probe);
            timer_start_locked(&probe,
                               &mut st,
                               |st| &mut st.body.timer,
                               Duration::from_secs(10),
                               probe_tick);
            // Refill before the first expiry: the old registration must never
            // deliver a tick.
            timer_start_locked(&probe,
                               &mut st,
                               |st| &mut st.body.timer,
                               Duration::from_secs(1),
                               probe_tick);
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timers_refused_during_shutdown() {
        let (probe, ticks, _drops) = new_probe();

        {
            let mut st = lock(&*probe);
            unref_external_locked(&probe, &mut st);
        }
        settle().await;

        {
            let mut st = lock(&*probe);
            assert!(in_shutdown_locked(&st));
            timer_start_locked(&probe,
                               &mut st,
                               |st| &mut st.body.timer,
                               Duration::from_secs(1),
                               probe_tick);
            assert!(!st.body.timer.is_active());
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_matching_discards_stale_results() {
        let (probe, _ticks, _drops) = new_probe();

        let live_id;
        {
            let mut st = lock(&*probe);
            task_start_locked(&probe, &mut st, |st| &mut st.body.timer, |_obj, _id| async {});
            live_id = st.body.timer.id;
        }

        {
            let mut st = lock(&*probe);
            assert!(!task_finish_locked(&mut st, |st| &mut st.body.timer, live_id + 1));
            assert!(task_finish_locked(&mut st, |st| &mut st.body.timer, live_id));
            // Second finish for the same id is a no-op.
            assert!(!task_finish_locked(&mut st, |st| &mut st.body.timer, live_id));
        }
    }
}
