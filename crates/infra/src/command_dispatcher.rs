//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 0. Acquire the stream lock (one writer per aggregate)
//!   ↓
//! 1. Load events from store
//!   ↓
//! 2. Rehydrate aggregate
//!   ↓
//! 3. Handle command (pure decision, produces events)
//!   ↓
//! 4. Persist events (append-only, optimistic concurrency check)
//!   ↓
//! 5. Publish events to bus (best effort once committed)
//! ```
//!
//! Commands against the same aggregate are applied in a total order: the
//! stream lock is held from load to publish. Commands against different
//! aggregates proceed in parallel. This module contains no IO itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use debts_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};
use debts_events::{EventBus, EventEnvelope};

use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency failure (stale stream version).
    #[error("concurrency conflict: {0}")]
    Concurrency(String),
    /// The loaded stream is inconsistent (foreign events, bad sequencing).
    #[error("stream integrity violation: {0}")]
    StreamIntegrity(String),
    /// Domain validation failure (deterministic).
    #[error("validation failed: {0}")]
    Validation(String),
    /// Domain invariant failure (deterministic).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// The target aggregate does not exist.
    #[error("not found")]
    NotFound,
    /// A fixed-width addition would have overflowed; nothing was recorded.
    #[error("arithmetic overflow")]
    ArithmeticOverflow,
    /// Failed to deserialize historical event payloads into the aggregate event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),
    /// Persisting to the event store failed.
    #[error(transparent)]
    Store(EventStoreError),
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match &value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg.clone()),
            EventStoreError::StreamIntegrity(msg) => DispatchError::StreamIntegrity(msg.clone()),
            _ => DispatchError::Store(value),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            DomainError::NotFound => DispatchError::NotFound,
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::ArithmeticOverflow => DispatchError::ArithmeticOverflow,
        }
    }
}

/// One mutex per aggregate stream, created on first use.
#[derive(Debug, Default)]
struct StreamLocks {
    locks: Mutex<HashMap<AggregateId, Arc<Mutex<()>>>>,
}

impl StreamLocks {
    fn for_stream(&self, aggregate_id: AggregateId) -> Arc<Mutex<()>> {
        // The map only holds lock handles; a poisoned guard leaves it usable.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(aggregate_id).or_default().clone()
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// - **Atomicity**: events are persisted before publication; if the append
///   fails nothing is published, if the decision fails nothing is appended.
///   Once the append succeeds the command has happened, even if publication
///   then fails
/// - **Serialization**: one writer per aggregate stream at a time
/// - **Consistency**: the append still checks `ExpectedVersion::Exact`, so a
///   second writer sharing the same store (another dispatcher) cannot
///   silently interleave
///
/// Generic over the store (`S`) and bus (`B`) so tests run on the in-memory
/// implementations.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    locks: StreamLocks,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            locks: StreamLocks::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Dispatch a command through the full event-sourcing pipeline.
    ///
    /// Returns the committed events (with assigned sequence numbers). An empty
    /// vector means the aggregate decided that nothing happened; nothing is
    /// appended or published in that case.
    #[instrument(skip_all, fields(aggregate_id = %aggregate_id), err(Display))]
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        command: A::Command,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: debts_events::Event + Serialize + DeserializeOwned,
    {
        let lock = self.locks.for_stream(aggregate_id);
        let _writer = lock.lock().unwrap_or_else(PoisonError::into_inner);

        // 1) Load history
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        // 2) Rehydrate aggregate
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;

        // 3) Decide events (no mutation)
        let decided = aggregate.handle(&command).map_err(DispatchError::from)?;
        if decided.is_empty() {
            tracing::debug!("command produced no events");
            return Ok(vec![]);
        }

        // 4) Persist (append-only, optimistic)
        let aggregate_type = aggregate_type.into();
        let uncommitted = decided
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type.clone(), Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;

        // 5) Publish committed events (after append). The append is the
        // commit point: a bus failure is logged, never reported as a failed
        // command. Subscribers catch up by replaying the stream.
        for stored in &committed {
            if let Err(err) = self.bus.publish(stored.to_envelope()) {
                tracing::warn!(
                    sequence_number = stored.sequence_number,
                    error = ?err,
                    "publication failed after commit"
                );
            }
        }

        tracing::debug!(committed = committed.len(), "events committed");
        Ok(committed)
    }

    /// Rehydrate an aggregate from its stream for reading.
    ///
    /// Takes the stream lock, so the result reflects every command dispatched
    /// before the call.
    pub fn load<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl FnOnce(AggregateId) -> A,
    ) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let lock = self.locks.for_stream(aggregate_id);
        let _reader = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history::<A>(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Committed events of one stream, in sequence order.
    pub fn history(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, DispatchError> {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        Ok(history)
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    // A backend returning foreign or out-of-order events must not corrupt state.
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::StreamIntegrity(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            )));
        }
        if e.sequence_number == 0 {
            return Err(DispatchError::StreamIntegrity(
                "stored event has sequence_number=0".to_string(),
            ));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::StreamIntegrity(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            )));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(e.to_string()))?;
        aggregate.apply(&ev);
    }

    Ok(())
}
