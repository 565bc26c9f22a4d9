// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive

//! End-to-end background activity scenarios against the in-process
//! transport doubles: the periodic wait/run cycle, graceful stop, observer
//! coalescing, and shutdown under load.

use std::sync::{Arc, Mutex,
                atomic::{AtomicBool, Ordering}};

use pretty_assertions::assert_eq;
use r3bl_keepalive::{BackgroundActivity, WakeupSlot, mce,
                     test_fixtures::{MockBus, MockWakeupService, settle}};

struct Harness {
    activity: BackgroundActivity,
    bus: MockBus,
    wakeups: Arc<MockWakeupService>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl Harness {
    fn events(&self) -> Vec<&'static str> { self.events.lock().unwrap().clone() }

    fn sent_methods(&self) -> Vec<&'static str> {
        self.bus.sent().iter().map(|c| c.method).collect()
    }
}

/// Activity with a running daemon, observers recording every transition.
fn harness() -> Harness {
    let bus = MockBus::new();
    bus.set_name_owner(Some(":1.4"));
    let wakeups = Arc::new(MockWakeupService::new());
    let activity = BackgroundActivity::with_links(Arc::new(bus.clone()), wakeups.clone());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    activity.set_stopped_callback(move |_activity| sink.lock().unwrap().push("stopped"));
    let sink = Arc::clone(&events);
    activity.set_waiting_callback(move |_activity| sink.lock().unwrap().push("waiting"));

    Harness { activity, bus, wakeups, events }
}

#[tokio::test(start_paused = true)]
async fn periodic_wake_cycle() {
    let h = harness();
    let sink = Arc::clone(&h.events);
    h.activity.set_running_callback(move |activity| {
        sink.lock().unwrap().push("running");
        // Job done; sleep until the next aligned wakeup.
        activity.wait();
    });

    h.activity.set_wakeup_slot(WakeupSlot::THIRTY_SECONDS);
    h.activity.wait();
    settle().await;

    assert_eq!(h.events(), vec!["waiting"]);
    assert_eq!(h.wakeups.requests(), vec![(30, 30)]);
    assert!(h.activity.is_waiting());

    // Aligned wakeup: waiting -> running, the callback re-arms, and the
    // suspend block is released only after the callback has returned.
    h.wakeups.fire_wakeup();
    settle().await;

    assert_eq!(h.events(), vec!["waiting", "running", "waiting"]);
    assert_eq!(h.sent_methods(),
               vec![mce::CPU_KEEPALIVE_START, mce::CPU_KEEPALIVE_STOP]);
    assert_eq!(h.wakeups.requests(), vec![(30, 30), (30, 30)]);

    // And again: the cycle repeats indefinitely.
    h.wakeups.fire_wakeup();
    settle().await;
    assert_eq!(h.events(),
               vec!["waiting", "running", "waiting", "running", "waiting"]);
    assert!(h.activity.is_waiting());
}

#[tokio::test(start_paused = true)]
async fn graceful_stop_during_run() {
    let h = harness();
    let sink = Arc::clone(&h.events);
    h.activity.set_running_callback(move |_activity| {
        sink.lock().unwrap().push("running");
    });

    h.activity.set_wakeup_slot(WakeupSlot::THIRTY_SECONDS);
    h.activity.wait();
    settle().await;
    h.wakeups.fire_wakeup();
    settle().await;
    assert!(h.activity.is_running());

    h.activity.stop();
    settle().await;

    assert!(h.activity.is_stopped());
    assert_eq!(h.events(), vec!["waiting", "running", "stopped"]);
    // The keepalive session was ended...
    assert_eq!(h.sent_methods(),
               vec![mce::CPU_KEEPALIVE_START, mce::CPU_KEEPALIVE_STOP]);
    // ...and the heartbeat was not re-armed.
    assert_eq!(h.wakeups.requests(), vec![(30, 30)]);
}

#[tokio::test(start_paused = true)]
async fn rapid_transitions_coalesce_for_observers() {
    let h = harness();
    let sink = Arc::clone(&h.events);
    h.activity.set_running_callback(move |_activity| {
        sink.lock().unwrap().push("running");
    });

    // Two transitions with no dispatch in between: observers only see the
    // final state.
    h.activity.wait();
    h.activity.run();
    settle().await;

    assert_eq!(h.events(), vec!["running"]);
    assert!(h.activity.is_running());
}

#[tokio::test(start_paused = true)]
async fn explicit_range_reaches_the_heartbeat() {
    let h = harness();

    h.activity.set_wakeup_range(-5, -1);
    assert_eq!(h.activity.wakeup_range(), (1, 13));
    assert_eq!(h.activity.wakeup_slot(), None);

    h.activity.wait();
    settle().await;
    assert_eq!(h.wakeups.requests(), vec![(1, 13)]);
}

struct DropProbe(Arc<AtomicBool>);

impl Drop for DropProbe {
    fn drop(&mut self) { self.0.store(true, Ordering::SeqCst); }
}

#[tokio::test(start_paused = true)]
async fn shutdown_under_load_releases_everything_once() {
    let Harness { activity, bus, wakeups, events } = harness();
    let sink = Arc::clone(&events);
    activity.set_running_callback(move |_activity| {
        sink.lock().unwrap().push("running");
    });

    let deleted = Arc::new(AtomicBool::new(false));
    activity.set_user_data(DropProbe(Arc::clone(&deleted)));

    activity.set_wakeup_slot(WakeupSlot::THIRTY_SECONDS);
    activity.wait();
    settle().await;
    wakeups.fire_wakeup();
    settle().await;
    assert!(activity.is_running());

    // Drop the last external reference while the keepalive session is live.
    let events_before = events.lock().unwrap().len();
    drop(activity);
    settle().await;

    // The session was ended and the object (with its user data) destroyed.
    let methods: Vec<_> = bus.sent().iter().map(|c| c.method).collect();
    assert_eq!(methods, vec![mce::CPU_KEEPALIVE_START, mce::CPU_KEEPALIVE_STOP]);
    assert!(deleted.load(Ordering::SeqCst));

    // No callbacks fire after destruction.
    wakeups.fire_wakeup();
    settle().await;
    assert_eq!(events.lock().unwrap().len(), events_before);
}
