//! Append-only event store boundary.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

use debts_core::{AggregateId, ExpectedVersion};
use debts_events::{EventBus, EventEnvelope};

/// Adapter that publishes committed events to an `EventBus` after a successful append.
///
/// For writers that append to the store directly (imports, tooling), not for
/// [`CommandDispatcher`](crate::CommandDispatcher): the dispatcher already
/// publishes, so wrapping its store would deliver every event twice.
///
/// Publication happens only once the append has succeeded, so a failed append
/// never reaches subscribers. A bus failure after the append is logged and the
/// committed events are still returned.
pub struct PublishingEventStore<S, B> {
    store: S,
    bus: B,
}

impl<S, B> PublishingEventStore<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self { store, bus }
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> EventStore for PublishingEventStore<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<serde_json::Value>>,
{
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let committed = self.store.append(events, expected_version)?;

        for e in &committed {
            if let Err(err) = self.bus.publish(e.to_envelope()) {
                tracing::warn!(
                    aggregate_id = %e.aggregate_id,
                    sequence_number = e.sequence_number,
                    error = ?err,
                    "publication failed after append"
                );
            }
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.store.load_stream(aggregate_id)
    }
}
