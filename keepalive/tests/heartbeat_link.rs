// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Heartbeat connection loss and recovery against the in-process wakeup
//! double.

use std::{sync::{Arc, Mutex},
          time::Duration};

use pretty_assertions::assert_eq;
use r3bl_keepalive::{Heartbeat, test_fixtures::{MockWakeupService, settle}};

#[tokio::test(start_paused = true)]
async fn link_loss_preserves_the_pending_wait() {
    let service = Arc::new(MockWakeupService::new());
    let hb = Heartbeat::with_service(service.clone());

    let wakeups = Arc::new(Mutex::new(0u32));
    let seen = Arc::clone(&wakeups);
    hb.set_notify(move || *seen.lock().unwrap() += 1);

    hb.set_delay(90, 180);
    hb.start();
    settle().await;
    assert_eq!(service.requests(), vec![(90, 180)]);

    // Socket EOF: close, reopen, and re-issue the wait with the current
    // window. No user callback fires for the failure.
    service.fail_link();
    settle().await;
    assert_eq!(service.opened(), 2);
    assert_eq!(service.requests(), vec![(90, 180), (90, 180)]);
    assert_eq!(*wakeups.lock().unwrap(), 0);

    // The re-issued wait still delivers.
    service.fire_wakeup();
    settle().await;
    assert_eq!(*wakeups.lock().unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_service_is_retried_until_it_appears() {
    let service = Arc::new(MockWakeupService::new());
    service.fail_connects(3);
    let hb = Heartbeat::with_service(service.clone());

    hb.set_delay(45, 60);
    hb.start();
    settle().await;
    assert_eq!(service.requests(), vec![]);

    // One attempt every five seconds until the daemon shows up.
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
    }
    assert_eq!(service.opened(), 4);
    assert_eq!(service.requests(), vec![(45, 60)]);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_closes_the_connection() {
    let service = Arc::new(MockWakeupService::new());
    let hb = Heartbeat::with_service(service.clone());

    let wakeups = Arc::new(Mutex::new(0u32));
    let seen = Arc::clone(&wakeups);
    hb.set_notify(move || *seen.lock().unwrap() += 1);

    hb.start();
    settle().await;
    assert_eq!(service.opened(), 1);

    drop(hb);
    settle().await;

    // A wakeup arriving after shutdown is nobody's business.
    service.fire_wakeup();
    settle().await;
    assert_eq!(*wakeups.lock().unwrap(), 0);
}
