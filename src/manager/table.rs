// Connection Table
//
// Authoritative map from connection handle to its record. One writer (the
// transport manager) mutates it; lookups run concurrently. Every mutation
// happens under the write lock, so readers only ever see whole records.

use crate::transport::{
    AdapterId, AdapterToken, ConnectionHandle, ConnectionState, DeviceKey, SequenceNumber,
    TransportError, TransportKind,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

// ============================================================================
// CONNECTION RECORD
// ============================================================================

/// Everything the manager knows about one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    handle: ConnectionHandle,
    adapter: AdapterId,
    token: AdapterToken,
    device_key: DeviceKey,
    kind: TransportKind,
    state: ConnectionState,
    last_sequence: SequenceNumber,
    in_flight: VecDeque<SequenceNumber>,
    opened_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(
        handle: ConnectionHandle,
        adapter: AdapterId,
        token: AdapterToken,
        device_key: DeviceKey,
        kind: TransportKind,
    ) -> Self {
        Self {
            handle,
            adapter,
            token,
            device_key,
            kind,
            state: ConnectionState::Establishing,
            last_sequence: 0,
            in_flight: VecDeque::new(),
            opened_at: Utc::now(),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn adapter(&self) -> AdapterId {
        self.adapter
    }

    pub fn token(&self) -> AdapterToken {
        self.token
    }

    pub fn device_key(&self) -> &DeviceKey {
        &self.device_key
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Sequence numbers sent but not yet completed, oldest first
    pub fn in_flight(&self) -> &VecDeque<SequenceNumber> {
        &self.in_flight
    }

    /// Move to `target`, rejecting transitions the lifecycle does not allow
    pub fn transition(&mut self, target: ConnectionState) -> Result<(), TransportError> {
        if !self.state.can_transition_to(target) {
            return Err(TransportError::InvalidTransition {
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        Ok(())
    }

    /// Assign the next sequence number and track it as in flight
    pub fn begin_send(&mut self) -> SequenceNumber {
        self.last_sequence = match self.last_sequence.checked_add(1) {
            Some(next) => next,
            None => 1,
        };
        self.in_flight.push_back(self.last_sequence);
        self.last_sequence
    }

    /// Forget an in-flight sequence number; false if it was not in flight
    pub fn finish_send(&mut self, sequence: SequenceNumber) -> bool {
        match self.in_flight.iter().position(|s| *s == sequence) {
            Some(index) => {
                self.in_flight.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Result of matching a send completion against the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMatch {
    /// Completion for an in-flight send on a live connection
    Matched(ConnectionHandle),
    /// The connection exists but never had this sequence in flight
    UnknownSequence(ConnectionHandle),
    /// The connection is gone
    UnknownConnection,
}

// ============================================================================
// CONNECTION TABLE
// ============================================================================

#[derive(Default)]
struct TableInner {
    records: HashMap<ConnectionHandle, ConnectionRecord>,
    by_token: HashMap<(AdapterId, AdapterToken), ConnectionHandle>,
}

/// Handle → record map with a reverse index on adapter tokens
#[derive(Default)]
pub struct ConnectionTable {
    inner: RwLock<TableInner>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record; its handle must not be present already
    pub fn insert(&self, record: ConnectionRecord) -> Result<(), TransportError> {
        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.handle) {
            return Err(TransportError::HandleInUse(record.handle));
        }
        inner
            .by_token
            .insert((record.adapter, record.token), record.handle);
        inner.records.insert(record.handle, record);
        Ok(())
    }

    /// Transition a record, returning its previous state
    pub fn update_state(
        &self,
        handle: ConnectionHandle,
        state: ConnectionState,
    ) -> Result<ConnectionState, TransportError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get_mut(&handle)
            .ok_or(TransportError::HandleNotFound(handle))?;
        let previous = record.state;
        record.transition(state)?;
        Ok(previous)
    }

    /// Remove a record, returning it
    pub fn remove(&self, handle: ConnectionHandle) -> Result<ConnectionRecord, TransportError> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .remove(&handle)
            .ok_or(TransportError::HandleNotFound(handle))?;
        inner.by_token.remove(&(record.adapter, record.token));
        Ok(record)
    }

    /// Copy of the record for `handle`
    pub fn find(&self, handle: ConnectionHandle) -> Result<ConnectionRecord, TransportError> {
        self.inner
            .read()
            .records
            .get(&handle)
            .cloned()
            .ok_or(TransportError::HandleNotFound(handle))
    }

    /// Handle owning an adapter-local token
    pub fn handle_for(&self, adapter: AdapterId, token: AdapterToken) -> Option<ConnectionHandle> {
        self.inner.read().by_token.get(&(adapter, token)).copied()
    }

    /// Handles of every connection to `device_key`, ascending
    pub fn handles_for_device(&self, device_key: &DeviceKey) -> Vec<ConnectionHandle> {
        let inner = self.inner.read();
        let mut handles: Vec<_> = inner
            .records
            .values()
            .filter(|r| &r.device_key == device_key)
            .map(|r| r.handle)
            .collect();
        handles.sort();
        handles
    }

    /// Run `f` on the record for `handle` while it is `Open`, under the write lock
    pub fn with_open<R>(
        &self,
        handle: ConnectionHandle,
        f: impl FnOnce(&mut ConnectionRecord) -> R,
    ) -> Result<R, TransportError> {
        let mut inner = self.inner.write();
        match inner.records.get_mut(&handle) {
            Some(record) if record.state.is_open() => Ok(f(record)),
            _ => Err(TransportError::ConnectionNotOpen(handle)),
        }
    }

    /// Match a send completion reported by an adapter
    pub fn complete_send(
        &self,
        adapter: AdapterId,
        token: AdapterToken,
        sequence: SequenceNumber,
    ) -> SendMatch {
        let mut inner = self.inner.write();
        let Some(handle) = inner.by_token.get(&(adapter, token)).copied() else {
            return SendMatch::UnknownConnection;
        };
        match inner.records.get_mut(&handle) {
            Some(record) => {
                if record.finish_send(sequence) {
                    SendMatch::Matched(handle)
                } else {
                    SendMatch::UnknownSequence(handle)
                }
            }
            None => SendMatch::UnknownConnection,
        }
    }

    /// Copy of every record, ordered by handle
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        let mut records: Vec<_> = self.inner.read().records.values().cloned().collect();
        records.sort_by_key(|r| r.handle);
        records
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}
