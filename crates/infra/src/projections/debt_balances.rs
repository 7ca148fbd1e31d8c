use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use debts_core::{AggregateId, Amount, Identity};
use debts_events::EventEnvelope;
use debts_ledger::{AGGREGATE_TYPE, DebtEvent};

use crate::read_model::KeyedStore;

/// Queryable read model: one borrower's position on one ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebtBalance {
    pub borrower: Identity,
    pub outstanding: Amount,
    /// Running totals; saturate at `Amount::MAX`.
    pub total_borrowed: Amount,
    pub total_repaid: Amount,
    pub borrow_count: u64,
    pub repay_count: u64,
}

impl DebtBalance {
    pub fn new(borrower: Identity) -> Self {
        Self {
            borrower,
            outstanding: Amount::ZERO,
            total_borrowed: Amount::ZERO,
            total_repaid: Amount::ZERO,
            borrow_count: 0,
            repay_count: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum BalanceProjectionError {
    #[error("failed to deserialize debt event: {0}")]
    Deserialize(String),

    #[error("event ledger_id does not match envelope aggregate_id")]
    LedgerMismatch,

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },

    #[error("projection cursor lock poisoned")]
    Poisoned,
}

/// Debt balances projection.
///
/// Consumes published envelopes and keeps one [`DebtBalance`] per
/// (ledger, borrower). Envelopes of other aggregate types are ignored.
/// Replays at or below the per-ledger cursor are skipped, so at-least-once
/// delivery is safe.
#[derive(Debug)]
pub struct DebtBalancesProjection<S>
where
    S: KeyedStore<Identity, DebtBalance>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> DebtBalancesProjection<S>
where
    S: KeyedStore<Identity, DebtBalance>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, ledger_id: AggregateId, borrower: &Identity) -> Option<DebtBalance> {
        self.store.get(ledger_id, borrower)
    }

    /// Outstanding debt as last projected (zero for unknown borrowers).
    pub fn outstanding(&self, ledger_id: AggregateId, borrower: &Identity) -> Amount {
        self.get(ledger_id, borrower)
            .map(|b| b.outstanding)
            .unwrap_or(Amount::ZERO)
    }

    pub fn list(&self, ledger_id: AggregateId) -> Vec<DebtBalance> {
        self.store.list(ledger_id)
    }

    /// Last sequence number applied for a ledger (0 if none).
    pub fn cursor(&self, ledger_id: AggregateId) -> u64 {
        self.cursors
            .read()
            .map(|c| c.get(&ledger_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), BalanceProjectionError> {
        if envelope.aggregate_type() != AGGREGATE_TYPE {
            return Ok(());
        }

        let ledger_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let mut cursors = self
            .cursors
            .write()
            .map_err(|_| BalanceProjectionError::Poisoned)?;
        let last = cursors.get(&ledger_id).copied().unwrap_or(0);

        if seq == 0 {
            return Err(BalanceProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate delivery.
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(BalanceProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: DebtEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| BalanceProjectionError::Deserialize(e.to_string()))?;

        let event_ledger = match &event {
            DebtEvent::LedgerOpened(e) => e.ledger_id,
            DebtEvent::Borrowed(e) => e.ledger_id,
            DebtEvent::Repayed(e) => e.ledger_id,
        };
        if event_ledger.0 != ledger_id {
            return Err(BalanceProjectionError::LedgerMismatch);
        }

        match event {
            DebtEvent::LedgerOpened(_) => {}
            DebtEvent::Borrowed(e) => {
                let mut rm = self.store.get(ledger_id, &e.by).unwrap_or_else(|| DebtBalance::new(e.by));
                rm.outstanding = rm.outstanding.saturating_add(e.value);
                rm.total_borrowed = rm.total_borrowed.saturating_add(e.value);
                rm.borrow_count += 1;
                self.store.upsert(ledger_id, e.by, rm);
            }
            DebtEvent::Repayed(e) => {
                let mut rm = self.store.get(ledger_id, &e.by).unwrap_or_else(|| DebtBalance::new(e.by));
                rm.outstanding = rm.outstanding.clamped_sub(e.value).0;
                rm.total_repaid = rm.total_repaid.saturating_add(e.value);
                rm.repay_count += 1;
                self.store.upsert(ledger_id, e.by, rm);
            }
        }

        cursors.insert(ledger_id, seq);
        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), BalanceProjectionError> {
        let mut envs: Vec<_> = envelopes.into_iter().collect();

        {
            let mut ledgers = envs.iter().map(|e| e.aggregate_id()).collect::<Vec<_>>();
            ledgers.sort_by_key(|l| *l.as_uuid().as_bytes());
            ledgers.dedup();

            let mut cursors = self
                .cursors
                .write()
                .map_err(|_| BalanceProjectionError::Poisoned)?;
            for l in &ledgers {
                cursors.remove(l);
            }
            drop(cursors);
            for l in ledgers {
                self.store.clear_ledger(l);
            }
        }

        // Deterministic replay order: ledger, sequence.
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
