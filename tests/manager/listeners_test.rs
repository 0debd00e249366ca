// Listener Registry Tests
// Fan-out order, duplicate registration, failure isolation and mutation during broadcast

use applink_transport::manager::{
    BroadcastReport, DataEvent, DataListener, DeviceEvent, DeviceListener, ListenerError,
    ListenerRegistry, ListenerResult,
};
use applink_transport::transport::{ConnectionHandle, Device, SendStatus, TransportKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

fn frame(handle: u32) -> DataEvent {
    DataEvent::FrameReceived {
        handle: ConnectionHandle::from_raw(handle),
        payload: vec![0xAB],
    }
}

fn list_changed() -> DeviceEvent {
    DeviceEvent::DeviceListChanged {
        kind: TransportKind::Usb,
        devices: Vec::<Device>::new(),
    }
}

/// Counts frames and appends its tag to a shared log
struct Tagged {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl DataListener for Tagged {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        self.log.lock().unwrap().push(self.tag);
        Ok(())
    }
}

impl DeviceListener for Tagged {
    fn on_device_list_changed(&self, _kind: TransportKind, _devices: &[Device]) -> ListenerResult {
        self.log.lock().unwrap().push(self.tag);
        Ok(())
    }
}

fn tagged(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Tagged> {
    Arc::new(Tagged {
        tag,
        log: Arc::clone(log),
    })
}

#[derive(Default)]
struct Counter {
    frames: AtomicUsize,
    completions: AtomicUsize,
}

impl DataListener for Counter {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_send_completed(
        &self,
        _handle: ConnectionHandle,
        _sequence: u32,
        _status: SendStatus,
    ) -> ListenerResult {
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Failing;

impl DataListener for Failing {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        Err(ListenerError::new("storage full"))
    }
}

struct Panicking;

impl DataListener for Panicking {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        panic!("listener bug");
    }
}

// ============================================================================
// DELIVERY
// ============================================================================

#[test]
fn test_broadcast_follows_registration_order() {
    let registry = ListenerRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.register_data_listener(tagged("first", &log));
    registry.register_data_listener(tagged("second", &log));
    registry.register_data_listener(tagged("third", &log));

    let report = registry.broadcast_data(&frame(1));

    assert_eq!(report, BroadcastReport { delivered: 3, failed: 0 });
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[test]
fn test_data_and_device_lists_are_separate() {
    let registry = ListenerRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    registry.register_data_listener(tagged("data", &log));
    registry.register_device_listener(tagged("device", &log));

    registry.broadcast_device(&list_changed());

    assert_eq!(*log.lock().unwrap(), vec!["device"]);
    assert_eq!(registry.data_listener_count(), 1);
    assert_eq!(registry.device_listener_count(), 1);
}

#[test]
fn test_send_completed_reaches_data_listeners() {
    let registry = ListenerRegistry::new();
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(counter.clone());

    registry.broadcast_data(&DataEvent::SendCompleted {
        handle: ConnectionHandle::from_raw(1),
        sequence: 1,
        status: SendStatus::Success,
    });

    assert_eq!(counter.completions.load(Ordering::SeqCst), 1);
    assert_eq!(counter.frames.load(Ordering::SeqCst), 0);
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[test]
fn test_duplicate_registration_delivers_twice() {
    let registry = ListenerRegistry::new();
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(counter.clone());
    registry.register_data_listener(counter.clone());

    registry.broadcast_data(&frame(1));

    assert_eq!(counter.frames.load(Ordering::SeqCst), 2);
}

#[test]
fn test_remove_drops_every_registration() {
    let registry = ListenerRegistry::new();
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(counter.clone());
    registry.register_data_listener(counter.clone());

    assert!(registry.remove_data_listener(&counter));
    assert!(!registry.remove_data_listener(&counter));

    registry.broadcast_data(&frame(1));
    assert_eq!(counter.frames.load(Ordering::SeqCst), 0);
    assert_eq!(registry.data_listener_count(), 0);
}

#[test]
fn test_remove_unknown_listener_is_a_noop() {
    let registry = ListenerRegistry::new();
    let registered = Arc::new(Counter::default());
    let stranger = Arc::new(Counter::default());
    registry.register_data_listener(registered.clone());

    assert!(!registry.remove_data_listener(&stranger));
    assert_eq!(registry.data_listener_count(), 1);
}

// ============================================================================
// FAILURE ISOLATION
// ============================================================================

#[test]
fn test_failing_listener_does_not_block_others() {
    let registry = ListenerRegistry::new();
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(Arc::new(Failing));
    registry.register_data_listener(counter.clone());

    let report = registry.broadcast_data(&frame(1));

    assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
    assert_eq!(counter.frames.load(Ordering::SeqCst), 1);
    assert_eq!(registry.failure_count(), 1);
}

#[test]
fn test_panicking_listener_is_contained() {
    let registry = ListenerRegistry::new();
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(Arc::new(Panicking));
    registry.register_data_listener(counter.clone());

    let report = registry.broadcast_data(&frame(1));
    let again = registry.broadcast_data(&frame(2));

    assert_eq!(report.failed, 1);
    assert_eq!(again.failed, 1);
    assert_eq!(counter.frames.load(Ordering::SeqCst), 2);
    assert_eq!(registry.failure_count(), 2);
}

// ============================================================================
// MUTATION DURING BROADCAST
// ============================================================================

/// Unsubscribes itself on the first frame
struct OneShot {
    registry: Arc<ListenerRegistry>,
    me: Weak<OneShot>,
    calls: AtomicUsize,
}

impl DataListener for OneShot {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(me) = self.me.upgrade() {
            self.registry.remove_data_listener(&me);
        }
        Ok(())
    }
}

#[test]
fn test_listener_may_remove_itself_during_callback() {
    let registry = Arc::new(ListenerRegistry::new());
    let one_shot = Arc::new_cyclic(|me| OneShot {
        registry: Arc::clone(&registry),
        me: me.clone(),
        calls: AtomicUsize::new(0),
    });
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(one_shot.clone());
    registry.register_data_listener(counter.clone());

    registry.broadcast_data(&frame(1));
    registry.broadcast_data(&frame(2));

    // The current broadcast still reached everyone; the next one skipped it.
    assert_eq!(one_shot.calls.load(Ordering::SeqCst), 1);
    assert_eq!(counter.frames.load(Ordering::SeqCst), 2);
    assert_eq!(registry.data_listener_count(), 1);
}

/// Registers a new listener from inside its callback
struct Recruiter {
    registry: Arc<ListenerRegistry>,
    recruit: Arc<Counter>,
}

impl DataListener for Recruiter {
    fn on_frame_received(&self, _handle: ConnectionHandle, _payload: &[u8]) -> ListenerResult {
        self.registry.register_data_listener(self.recruit.clone());
        Ok(())
    }
}

#[test]
fn test_listener_added_during_broadcast_waits_for_next_event() {
    let registry = Arc::new(ListenerRegistry::new());
    let recruit = Arc::new(Counter::default());
    registry.register_data_listener(Arc::new(Recruiter {
        registry: Arc::clone(&registry),
        recruit: recruit.clone(),
    }));

    registry.broadcast_data(&frame(1));
    assert_eq!(recruit.frames.load(Ordering::SeqCst), 0);

    registry.broadcast_data(&frame(2));
    assert_eq!(recruit.frames.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_registration_and_broadcast() {
    let registry = Arc::new(ListenerRegistry::new());
    let counter = Arc::new(Counter::default());
    registry.register_data_listener(counter.clone());

    let broadcaster = {
        let registry = Arc::clone(&registry);
        std::thread::spawn(move || {
            for i in 0..500 {
                registry.broadcast_data(&frame(i));
            }
        })
    };
    let churners: Vec<_> = (0..4)
        .map(|_| {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let extra = Arc::new(Counter::default());
                    registry.register_data_listener(extra.clone());
                    registry.remove_data_listener(&extra);
                }
            })
        })
        .collect();

    broadcaster.join().unwrap();
    for churner in churners {
        churner.join().unwrap();
    }

    assert_eq!(counter.frames.load(Ordering::SeqCst), 500);
    assert_eq!(registry.data_listener_count(), 1);
}
