//! Ledger service: the operations a hosting platform calls.
//!
//! Wraps a [`CommandDispatcher`] bound to one ledger stream. Callers pass an
//! already-authenticated [`Identity`]; authorization (admin-only repay, admin
//! borrow exemption) is decided by the aggregate.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};

use debts_core::{AggregateId, Amount, Identity};
use debts_events::{EventBus, EventEnvelope, InMemoryEventBus};
use debts_ledger::{AGGREGATE_TYPE, Borrow, DebtCommand, DebtEvent, DebtLedger, LedgerId, OpenLedger, Repay};

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::config::DebtsConfig;
use crate::event_store::{EventStore, InMemoryEventStore, StoredEvent};

/// Result of a `borrow` that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowOutcome {
    /// Debt recorded; `Borrowed` was committed at `sequence_number`.
    Borrowed {
        by: Identity,
        value: Amount,
        sequence_number: u64,
    },
    /// The administrator cannot owe itself anything. Nothing was recorded.
    AdminExempt,
}

/// Result of a `repay` that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepayOutcome {
    /// `Repayed` was committed; `value` is what was actually taken off the debt.
    Repaid {
        by: Identity,
        value: Amount,
        sequence_number: u64,
    },
    /// Caller is not the administrator. Nothing was recorded.
    Ignored,
}

/// Service over a single debt ledger.
#[derive(Debug)]
pub struct DebtService<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    ledger_id: LedgerId,
    admin: Identity,
}

/// Fully in-process service (in-memory store and bus).
pub type InMemoryDebtService =
    DebtService<Arc<InMemoryEventStore>, Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>>;

impl<S, B> DebtService<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Open a new ledger with a fixed administrator.
    pub fn open(store: S, bus: B, admin: Identity) -> Result<Self, DispatchError> {
        Self::open_with_id(store, bus, LedgerId::new(AggregateId::new()), admin)
    }

    /// Open a ledger on a caller-chosen stream id.
    ///
    /// Fails with `Concurrency` if that stream already holds an opened ledger.
    #[instrument(skip_all, fields(ledger_id = %ledger_id, admin = %admin), err(Display))]
    pub fn open_with_id(store: S, bus: B, ledger_id: LedgerId, admin: Identity) -> Result<Self, DispatchError> {
        let dispatcher = CommandDispatcher::new(store, bus);
        dispatcher.dispatch(
            ledger_id.0,
            AGGREGATE_TYPE,
            DebtCommand::OpenLedger(OpenLedger {
                ledger_id,
                admin,
                occurred_at: Utc::now(),
            }),
            rehydrate,
        )?;

        info!("ledger opened");
        Ok(Self {
            dispatcher,
            ledger_id,
            admin,
        })
    }

    /// Bind to a ledger that was opened earlier on the same store.
    pub fn attach(store: S, bus: B, ledger_id: LedgerId) -> Result<Self, DispatchError> {
        let dispatcher = CommandDispatcher::new(store, bus);
        let ledger = dispatcher.load(ledger_id.0, rehydrate)?;
        let admin = ledger.admin().ok_or(DispatchError::NotFound)?;

        debug!(ledger_id = %ledger_id, admin = %admin, "attached to ledger");
        Ok(Self {
            dispatcher,
            ledger_id,
            admin,
        })
    }

    /// Attach to `config.ledger_id` if it is already opened, otherwise open it
    /// (or a fresh ledger when no id is configured).
    ///
    /// An existing ledger whose administrator differs from `config.admin` is
    /// rejected rather than silently adopted.
    pub fn from_config(store: S, bus: B, config: &DebtsConfig) -> Result<Self, DispatchError> {
        let Some(id) = config.ledger_id else {
            return Self::open(store, bus, config.admin);
        };
        let ledger_id = LedgerId::new(id);

        let dispatcher = CommandDispatcher::new(store, bus);
        let existing = dispatcher.load(ledger_id.0, rehydrate)?.admin();
        let (store, bus) = dispatcher.into_parts();

        match existing {
            None => Self::open_with_id(store, bus, ledger_id, config.admin),
            Some(admin) if admin == config.admin => Self::attach(store, bus, ledger_id),
            Some(admin) => Err(DispatchError::InvariantViolation(format!(
                "ledger {ledger_id} is administered by {admin}, not {}",
                config.admin
            ))),
        }
    }

    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    pub fn admin(&self) -> Identity {
        self.admin
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<S, B> {
        &self.dispatcher
    }

    /// `caller` takes on `amount` of additional debt.
    #[instrument(skip_all, fields(ledger_id = %self.ledger_id, caller = %caller, amount = %amount), err(Display))]
    pub fn borrow(&self, caller: Identity, amount: Amount) -> Result<BorrowOutcome, DispatchError> {
        let committed = self.dispatch(DebtCommand::Borrow(Borrow {
            ledger_id: self.ledger_id,
            caller,
            amount,
            occurred_at: Utc::now(),
        }))?;

        let Some(stored) = committed.first() else {
            debug!("administrator borrow ignored");
            return Ok(BorrowOutcome::AdminExempt);
        };

        match decode(stored)? {
            DebtEvent::Borrowed(e) => {
                info!(sequence_number = stored.sequence_number, "debt recorded");
                Ok(BorrowOutcome::Borrowed {
                    by: e.by,
                    value: e.value,
                    sequence_number: stored.sequence_number,
                })
            }
            other => Err(unexpected("borrow", &other)),
        }
    }

    /// `caller` reduces `borrower`'s debt by up to `amount`.
    ///
    /// Only the administrator may repay. Any other caller gets
    /// [`RepayOutcome::Ignored`]; this is not an error.
    #[instrument(
        skip_all,
        fields(ledger_id = %self.ledger_id, caller = %caller, borrower = %borrower, amount = %amount),
        err(Display)
    )]
    pub fn repay(&self, caller: Identity, borrower: Identity, amount: Amount) -> Result<RepayOutcome, DispatchError> {
        let committed = self.dispatch(DebtCommand::Repay(Repay {
            ledger_id: self.ledger_id,
            caller,
            borrower,
            amount,
            occurred_at: Utc::now(),
        }))?;

        let Some(stored) = committed.first() else {
            warn!("repay by non-administrator ignored");
            return Ok(RepayOutcome::Ignored);
        };

        match decode(stored)? {
            DebtEvent::Repayed(e) => {
                info!(sequence_number = stored.sequence_number, repaid = %e.value, "debt repaid");
                Ok(RepayOutcome::Repaid {
                    by: e.by,
                    value: e.value,
                    sequence_number: stored.sequence_number,
                })
            }
            other => Err(unexpected("repay", &other)),
        }
    }

    /// Outstanding debt of `borrower` (zero if it has none).
    ///
    /// Rehydrates the ledger under its stream lock, so the answer reflects
    /// every prior write. Cost grows with the stream and the read briefly
    /// blocks writers; read-heavy callers should query a
    /// [`DebtBalancesProjection`](crate::projections::DebtBalancesProjection)
    /// fed by a projection worker instead.
    pub fn balance_of(&self, borrower: Identity) -> Result<Amount, DispatchError> {
        Ok(self.ledger()?.balance_of(&borrower))
    }

    /// Every identity with a non-zero debt, sorted by identity.
    pub fn debtors(&self) -> Result<Vec<(Identity, Amount)>, DispatchError> {
        let ledger = self.ledger()?;
        let mut out: Vec<_> = ledger.debtors().map(|(id, amount)| (*id, *amount)).collect();
        out.sort_by_key(|(id, _)| *id.as_uuid());
        Ok(out)
    }

    /// The ledger's committed events, oldest first.
    pub fn history(&self) -> Result<Vec<DebtEvent>, DispatchError> {
        self.dispatcher
            .history(self.ledger_id.0)?
            .iter()
            .map(decode)
            .collect()
    }

    fn ledger(&self) -> Result<DebtLedger, DispatchError> {
        self.dispatcher.load(self.ledger_id.0, rehydrate)
    }

    fn dispatch(&self, command: DebtCommand) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher
            .dispatch(self.ledger_id.0, AGGREGATE_TYPE, command, rehydrate)
    }
}

fn rehydrate(id: AggregateId) -> DebtLedger {
    DebtLedger::empty(LedgerId::new(id))
}

fn decode(stored: &StoredEvent) -> Result<DebtEvent, DispatchError> {
    serde_json::from_value(stored.payload.clone()).map_err(|e| DispatchError::Deserialize(e.to_string()))
}

fn unexpected(operation: &str, event: &DebtEvent) -> DispatchError {
    DispatchError::InvariantViolation(format!("{operation} committed unexpected event {event:?}"))
}
