// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words keepalive

//! Cheap per-caller display blanking control, collapsed onto one shared
//! session.
//!
//! UI code tends to create one blanking-prevention object per view. Giving
//! each of them their own [`DisplayKeepalive`] would multiply daemon
//! queries, renew timers and signal matches N-fold for identical state, so
//! all [`DisplayBlanking`] handles in a process share a single session via a
//! refcounted singleton: the session runs while at least one handle is
//! preventing (the daemon-side "allowed" gate lives inside the shared
//! session's own reconciliation), and the whole thing tears down when the
//! last handle goes away.

use std::sync::{Arc, Mutex, Weak};

use crate::{bus::BusConnector,
            display_keepalive::{DisplayKeepalive, DisplayStatus}};

type StatusCallback = Arc<dyn Fn(DisplayStatus) + Send + Sync>;

struct BlankingState {
    /// Number of attached preventing handles.
    preventing: usize,
    next_watcher: u64,
    watchers: Vec<(u64, StatusCallback)>,
}

/// Process-shared blanking session state.
struct BlankingShared {
    keepalive: DisplayKeepalive,
    state: Mutex<BlankingState>,
}

impl BlankingShared {
    fn new(connector: Arc<dyn BusConnector>) -> Arc<Self> {
        let shared = Arc::new(Self {
            keepalive: DisplayKeepalive::with_connector(connector),
            state: Mutex::new(BlankingState { preventing: 0,
                                              next_watcher: 1,
                                              watchers: Vec::new() }),
        });

        let weak = Arc::downgrade(&shared);
        shared.keepalive.set_status_notify(move |status| {
            if let Some(shared) = weak.upgrade() {
                let watchers: Vec<StatusCallback> = {
                    let st = shared.state.lock().unwrap();
                    st.watchers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
                };
                for watcher in watchers {
                    watcher(status);
                }
            }
        });
        shared
    }

    fn attach(&self) {
        let mut st = self.state.lock().unwrap();
        st.preventing += 1;
        if st.preventing == 1 {
            self.keepalive.start();
        }
    }

    fn detach(&self) {
        let mut st = self.state.lock().unwrap();
        if st.preventing > 0 {
            st.preventing -= 1;
            if st.preventing == 0 {
                self.keepalive.stop();
            }
        }
    }
}

static SHARED: Mutex<Weak<BlankingShared>> = Mutex::new(Weak::new());

/// The process singleton, created on first use and recreated after the last
/// handle released it.
fn shared_instance() -> Arc<BlankingShared> {
    let mut guard = SHARED.lock().unwrap();
    if let Some(shared) = guard.upgrade() {
        return shared;
    }
    let shared = BlankingShared::new(Arc::new(crate::bus::system::SystemBus));
    *guard = Arc::downgrade(&shared);
    shared
}

/// Per-caller display blanking control; see the [module docs](self).
pub struct DisplayBlanking {
    shared: Arc<BlankingShared>,
    preventing: bool,
    watcher: Option<u64>,
}

impl DisplayBlanking {
    /// Handle onto the process-shared blanking session.
    ///
    /// Must be called within a tokio runtime context.
    pub fn new() -> Self { Self::with_shared(shared_instance()) }

    /// Handle with its own private session over a caller-provided bus
    /// transport. Does not touch the process singleton.
    pub fn with_connector(connector: Arc<dyn BusConnector>) -> Self {
        Self::with_shared(BlankingShared::new(connector))
    }

    fn with_shared(shared: Arc<BlankingShared>) -> Self {
        Self { shared, preventing: false, watcher: None }
    }

    /// Last daemon-reported display state.
    pub fn display_status(&self) -> DisplayStatus { self.shared.keepalive.display_status() }

    /// Whether this handle is currently asking for blanking to be paused.
    pub fn prevent_blanking(&self) -> bool { self.preventing }

    /// Adds or removes this handle from the set of preventing objects. The
    /// shared session runs while the set is non-empty.
    pub fn set_prevent_blanking(&mut self, prevent: bool) {
        if self.preventing != prevent {
            self.preventing = prevent;
            if prevent {
                self.shared.attach();
            } else {
                self.shared.detach();
            }
        }
    }

    /// Sets this handle's display status change callback.
    pub fn set_status_callback(&mut self,
                               callback: impl Fn(DisplayStatus) + Send + Sync + 'static) {
        let mut st = self.shared.state.lock().unwrap();
        match self.watcher {
            Some(key) => {
                if let Some(entry) = st.watchers.iter_mut().find(|(k, _)| *k == key) {
                    entry.1 = Arc::new(callback);
                }
            }
            None => {
                let key = st.next_watcher;
                st.next_watcher += 1;
                st.watchers.push((key, Arc::new(callback)));
                self.watcher = Some(key);
            }
        }
    }
}

impl Default for DisplayBlanking {
    fn default() -> Self { Self::new() }
}

impl Drop for DisplayBlanking {
    fn drop(&mut self) {
        if self.preventing {
            self.shared.detach();
        }
        if let Some(key) = self.watcher {
            self.shared.state.lock().unwrap().watchers.retain(|(k, _)| *k != key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mce, test_fixtures::{MockBus, settle}};
    use pretty_assertions::assert_eq;
    use serial_test::serial;

    fn mock_shared() -> (Arc<BlankingShared>, MockBus) {
        let bus = MockBus::new();
        bus.set_name_owner(Some(":1.3"));
        bus.set_blanking_allowed(Some(true));
        bus.set_display_status(Some(mce::DISPLAY_ON_STRING));
        (BlankingShared::new(Arc::new(bus.clone())), bus)
    }

    #[tokio::test(start_paused = true)]
    async fn many_handles_share_one_session() {
        let (shared, bus) = mock_shared();
        let mut a = DisplayBlanking::with_shared(Arc::clone(&shared));
        let mut b = DisplayBlanking::with_shared(Arc::clone(&shared));
        settle().await;

        a.set_prevent_blanking(true);
        b.set_prevent_blanking(true);
        settle().await;

        // One session start for two preventing handles.
        assert_eq!(bus.sent().iter().map(|c| c.method).collect::<Vec<_>>(),
                   vec![mce::PREVENT_BLANK]);

        a.set_prevent_blanking(false);
        settle().await;
        assert_eq!(bus.sent().len(), 1);

        // Last preventing handle gone: session ends.
        b.set_prevent_blanking(false);
        settle().await;
        assert_eq!(bus.sent().last().map(|c| c.method),
                   Some(mce::CANCEL_PREVENT_BLANK));
    }

    #[tokio::test(start_paused = true)]
    async fn status_changes_fan_out_to_handles() {
        let (shared, bus) = mock_shared();
        let mut a = DisplayBlanking::with_shared(Arc::clone(&shared));
        let mut b = DisplayBlanking::with_shared(Arc::clone(&shared));

        let seen_a = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_b = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen_a);
        a.set_status_callback(move |status| sink.lock().unwrap().push(status));
        let sink = Arc::clone(&seen_b);
        b.set_status_callback(move |status| sink.lock().unwrap().push(status));

        settle().await;
        bus.emit_display_status(mce::DISPLAY_OFF_STRING);
        settle().await;

        assert_eq!(a.display_status(), DisplayStatus::Off);
        assert!(seen_a.lock().unwrap().contains(&DisplayStatus::Off));
        assert!(seen_b.lock().unwrap().contains(&DisplayStatus::Off));

        // A dropped handle stops receiving.
        drop(b);
        bus.emit_display_status(mce::DISPLAY_DIM_STRING);
        settle().await;
        assert!(seen_a.lock().unwrap().contains(&DisplayStatus::Dimmed));
        assert!(!seen_b.lock().unwrap().contains(&DisplayStatus::Dimmed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_preventing_handle_detaches_it() {
        let (shared, bus) = mock_shared();
        let mut a = DisplayBlanking::with_shared(shared);
        a.set_prevent_blanking(true);
        settle().await;
        assert_eq!(bus.sent().len(), 1);

        drop(a);
        settle().await;
        assert_eq!(bus.sent().last().map(|c| c.method),
                   Some(mce::CANCEL_PREVENT_BLANK));
    }

    #[tokio::test(start_paused = true)]
    #[serial]
    async fn process_singleton_is_shared_and_released() {
        let a = DisplayBlanking::new();
        let b = DisplayBlanking::new();
        assert!(Arc::ptr_eq(&a.shared, &b.shared));

        drop(a);
        drop(b);
        settle().await;

        // The next handle gets a fresh singleton.
        let c = DisplayBlanking::new();
        assert_eq!(c.shared.state.lock().unwrap().preventing, 0);
    }
}
