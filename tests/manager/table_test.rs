// Connection Table Tests
// Record lifecycle, send tracking and lookups

use applink_transport::manager::{ConnectionRecord, ConnectionTable, SendMatch};
use applink_transport::transport::{
    AdapterId, AdapterToken, ConnectionHandle, ConnectionState, DeviceKey, TransportError,
    TransportKind,
};

fn record(handle: u32, adapter: usize, token: u64, device: &str) -> ConnectionRecord {
    ConnectionRecord::new(
        ConnectionHandle::from_raw(handle),
        AdapterId::from_index(adapter),
        AdapterToken::from_raw(token),
        DeviceKey::emulator(device),
        TransportKind::Emulator,
    )
}

fn open_table() -> ConnectionTable {
    let table = ConnectionTable::new();
    table.insert(record(1, 0, 10, "phone")).unwrap();
    table
        .update_state(ConnectionHandle::from_raw(1), ConnectionState::Open)
        .unwrap();
    table
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[test]
fn test_record_walks_full_lifecycle() {
    let table = open_table();
    let h = ConnectionHandle::from_raw(1);

    assert_eq!(table.update_state(h, ConnectionState::Closing), Ok(ConnectionState::Open));
    let mut removed = table.remove(h).unwrap();
    removed.transition(ConnectionState::Closed).unwrap();

    assert_eq!(removed.state(), ConnectionState::Closed);
    assert!(table.is_empty());
    assert_eq!(table.find(h), Err(TransportError::HandleNotFound(h)));
}

#[test]
fn test_open_cannot_jump_to_closed() {
    let table = open_table();
    let h = ConnectionHandle::from_raw(1);

    let err = table.update_state(h, ConnectionState::Closed).unwrap_err();

    assert_eq!(
        err,
        TransportError::InvalidTransition {
            from: ConnectionState::Open,
            to: ConnectionState::Closed,
        }
    );
    assert_eq!(table.find(h).unwrap().state(), ConnectionState::Open);
}

#[test]
fn test_update_unknown_handle() {
    let table = ConnectionTable::new();
    let h = ConnectionHandle::from_raw(5);

    assert_eq!(
        table.update_state(h, ConnectionState::Open),
        Err(TransportError::HandleNotFound(h))
    );
}

// ============================================================================
// SENDS
// ============================================================================

#[test]
fn test_with_open_assigns_sequences() {
    let table = open_table();
    let h = ConnectionHandle::from_raw(1);

    let first = table.with_open(h, |r| r.begin_send()).unwrap();
    let second = table.with_open(h, |r| r.begin_send()).unwrap();

    assert_eq!((first, second), (1, 2));
    assert_eq!(table.find(h).unwrap().in_flight().len(), 2);
}

#[test]
fn test_with_open_refuses_closing_connection() {
    let table = open_table();
    let h = ConnectionHandle::from_raw(1);
    table.update_state(h, ConnectionState::Closing).unwrap();

    let result = table.with_open(h, |r| r.begin_send());

    assert_eq!(result, Err(TransportError::ConnectionNotOpen(h)));
}

#[test]
fn test_complete_send_classification() {
    let table = open_table();
    let h = ConnectionHandle::from_raw(1);
    let adapter = AdapterId::from_index(0);
    let token = AdapterToken::from_raw(10);
    table.with_open(h, |r| r.begin_send()).unwrap();

    assert_eq!(table.complete_send(adapter, token, 1), SendMatch::Matched(h));
    assert_eq!(table.complete_send(adapter, token, 1), SendMatch::UnknownSequence(h));
    assert_eq!(
        table.complete_send(adapter, AdapterToken::from_raw(11), 1),
        SendMatch::UnknownConnection
    );
    assert_eq!(
        table.complete_send(AdapterId::from_index(1), token, 1),
        SendMatch::UnknownConnection
    );
}

#[test]
fn test_complete_send_out_of_order_clears_only_matched_sequence() {
    let table = open_table();
    let h = ConnectionHandle::from_raw(1);
    let adapter = AdapterId::from_index(0);
    let token = AdapterToken::from_raw(10);
    for _ in 0..3 {
        table.with_open(h, |r| r.begin_send()).unwrap();
    }

    assert_eq!(table.complete_send(adapter, token, 2), SendMatch::Matched(h));

    let in_flight: Vec<_> = table.find(h).unwrap().in_flight().iter().copied().collect();
    assert_eq!(in_flight, vec![1, 3]);
    assert_eq!(table.complete_send(adapter, token, 2), SendMatch::UnknownSequence(h));
}

// ============================================================================
// LOOKUPS
// ============================================================================

#[test]
fn test_tokens_are_scoped_per_adapter() {
    let table = ConnectionTable::new();
    table.insert(record(1, 0, 7, "a")).unwrap();
    table.insert(record(2, 1, 7, "b")).unwrap();

    assert_eq!(
        table.handle_for(AdapterId::from_index(0), AdapterToken::from_raw(7)),
        Some(ConnectionHandle::from_raw(1))
    );
    assert_eq!(
        table.handle_for(AdapterId::from_index(1), AdapterToken::from_raw(7)),
        Some(ConnectionHandle::from_raw(2))
    );
}

#[test]
fn test_handles_for_device_and_snapshot_are_ordered() {
    let table = ConnectionTable::new();
    table.insert(record(9, 0, 1, "phone")).unwrap();
    table.insert(record(3, 0, 2, "phone")).unwrap();
    table.insert(record(5, 0, 3, "tablet")).unwrap();

    let phone: Vec<_> = table
        .handles_for_device(&DeviceKey::emulator("phone"))
        .into_iter()
        .map(|h| h.as_u32())
        .collect();
    let all: Vec<_> = table.snapshot().iter().map(|r| r.handle().as_u32()).collect();

    assert_eq!(phone, vec![3, 9]);
    assert_eq!(all, vec![3, 5, 9]);
    assert_eq!(table.len(), 3);
}
