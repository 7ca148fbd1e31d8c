use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use debts_core::{Aggregate, AggregateId, AggregateRoot, Amount, DomainError, Identity};
use debts_events::{Command, Event};

/// Aggregate type recorded on every stored event of a debt ledger stream.
pub const AGGREGATE_TYPE: &str = "debts.ledger";

/// Ledger identifier (aggregate id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(pub AggregateId);

impl LedgerId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: DebtLedger.
///
/// Holds the fixed administrator and the outstanding debt per identity.
/// Identities with no debt have no entry; `balance_of` reports them as zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebtLedger {
    id: LedgerId,
    admin: Option<Identity>,
    balances: HashMap<Identity, Amount>,
    version: u64,
}

impl DebtLedger {
    /// Empty, not-yet-opened aggregate for rehydration.
    pub fn empty(id: LedgerId) -> Self {
        Self {
            id,
            admin: None,
            balances: HashMap::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> LedgerId {
        self.id
    }

    /// The administrator, once the ledger has been opened.
    pub fn admin(&self) -> Option<Identity> {
        self.admin
    }

    pub fn is_opened(&self) -> bool {
        self.admin.is_some()
    }

    /// Outstanding debt of `borrower` (zero if it never borrowed).
    pub fn balance_of(&self, borrower: &Identity) -> Amount {
        self.balances.get(borrower).copied().unwrap_or(Amount::ZERO)
    }

    /// Identities currently carrying a non-zero debt, in no particular order.
    pub fn debtors(&self) -> impl Iterator<Item = (&Identity, &Amount)> {
        self.balances.iter()
    }
}

impl AggregateRoot for DebtLedger {
    type Id = LedgerId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: open a ledger with its (immutable) administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLedger {
    pub ledger_id: LedgerId,
    pub admin: Identity,
    pub occurred_at: DateTime<Utc>,
}

/// Command: `caller` takes on `amount` of debt against itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrow {
    pub ledger_id: LedgerId,
    pub caller: Identity,
    pub amount: Amount,
    pub occurred_at: DateTime<Utc>,
}

/// Command: `caller` reduces `borrower`'s debt by up to `amount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repay {
    pub ledger_id: LedgerId,
    pub caller: Identity,
    pub borrower: Identity,
    pub amount: Amount,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebtCommand {
    OpenLedger(OpenLedger),
    Borrow(Borrow),
    Repay(Repay),
}

impl DebtCommand {
    pub fn ledger_id(&self) -> LedgerId {
        match self {
            DebtCommand::OpenLedger(c) => c.ledger_id,
            DebtCommand::Borrow(c) => c.ledger_id,
            DebtCommand::Repay(c) => c.ledger_id,
        }
    }
}

impl Command for DebtCommand {
    fn target_aggregate_id(&self) -> AggregateId {
        self.ledger_id().0
    }
}

/// Event: LedgerOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOpened {
    pub ledger_id: LedgerId,
    pub admin: Identity,
    pub occurred_at: DateTime<Utc>,
}

/// Event: Borrowed. `by` is the borrower, `value` the amount added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrowed {
    pub ledger_id: LedgerId,
    pub by: Identity,
    pub value: Amount,
    pub occurred_at: DateTime<Utc>,
}

/// Event: Repayed. `by` is the borrower whose debt shrank, `value` the
/// amount actually removed (after clamping).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repayed {
    pub ledger_id: LedgerId,
    pub by: Identity,
    pub value: Amount,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DebtEvent {
    LedgerOpened(LedgerOpened),
    Borrowed(Borrowed),
    Repayed(Repayed),
}

impl Event for DebtEvent {
    fn event_type(&self) -> &'static str {
        match self {
            DebtEvent::LedgerOpened(_) => "debts.ledger.opened",
            DebtEvent::Borrowed(_) => "debts.ledger.borrowed",
            DebtEvent::Repayed(_) => "debts.ledger.repayed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            DebtEvent::LedgerOpened(e) => e.occurred_at,
            DebtEvent::Borrowed(e) => e.occurred_at,
            DebtEvent::Repayed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for DebtLedger {
    type Command = DebtCommand;
    type Event = DebtEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            DebtEvent::LedgerOpened(e) => {
                self.id = e.ledger_id;
                self.admin = Some(e.admin);
            }
            DebtEvent::Borrowed(e) => {
                if !e.value.is_zero() {
                    // handle() has already rejected overflowing borrows.
                    let next = self.balance_of(&e.by).saturating_add(e.value);
                    self.balances.insert(e.by, next);
                }
            }
            DebtEvent::Repayed(e) => {
                let (remaining, _) = self.balance_of(&e.by).clamped_sub(e.value);
                if remaining.is_zero() {
                    self.balances.remove(&e.by);
                } else {
                    self.balances.insert(e.by, remaining);
                }
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        self.ensure_ledger(command.ledger_id())?;

        match command {
            DebtCommand::OpenLedger(cmd) => self.handle_open(cmd),
            DebtCommand::Borrow(cmd) => self.handle_borrow(cmd),
            DebtCommand::Repay(cmd) => self.handle_repay(cmd),
        }
    }
}

impl DebtLedger {
    fn ensure_ledger(&self, ledger_id: LedgerId) -> Result<(), DomainError> {
        if self.id != ledger_id {
            return Err(DomainError::invariant("ledger id mismatch"));
        }
        Ok(())
    }

    fn opened_admin(&self) -> Result<Identity, DomainError> {
        self.admin.ok_or_else(DomainError::not_found)
    }

    fn handle_open(&self, cmd: &OpenLedger) -> Result<Vec<DebtEvent>, DomainError> {
        if self.is_opened() {
            return Err(DomainError::conflict("ledger already opened"));
        }

        Ok(vec![DebtEvent::LedgerOpened(LedgerOpened {
            ledger_id: cmd.ledger_id,
            admin: cmd.admin,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_borrow(&self, cmd: &Borrow) -> Result<Vec<DebtEvent>, DomainError> {
        let admin = self.opened_admin()?;

        // The administrator never accrues debt.
        if cmd.caller == admin {
            return Ok(vec![]);
        }

        self.balance_of(&cmd.caller).checked_add(cmd.amount)?;

        Ok(vec![DebtEvent::Borrowed(Borrowed {
            ledger_id: cmd.ledger_id,
            by: cmd.caller,
            value: cmd.amount,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_repay(&self, cmd: &Repay) -> Result<Vec<DebtEvent>, DomainError> {
        let admin = self.opened_admin()?;

        // Repayment by anyone but the administrator is ignored, not rejected.
        if cmd.caller != admin {
            return Ok(vec![]);
        }

        let (_, taken) = self.balance_of(&cmd.borrower).clamped_sub(cmd.amount);

        Ok(vec![DebtEvent::Repayed(Repayed {
            ledger_id: cmd.ledger_id,
            by: cmd.borrower,
            value: taken,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debts_events::execute;
    use proptest::prelude::*;

    fn test_ledger_id() -> LedgerId {
        LedgerId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn opened(admin: Identity) -> DebtLedger {
        let ledger_id = test_ledger_id();
        let mut ledger = DebtLedger::empty(ledger_id);
        execute(
            &mut ledger,
            &DebtCommand::OpenLedger(OpenLedger {
                ledger_id,
                admin,
                occurred_at: test_time(),
            }),
        )
        .unwrap();
        ledger
    }

    fn borrow(ledger: &mut DebtLedger, caller: Identity, amount: u128) -> Result<Vec<DebtEvent>, DomainError> {
        let cmd = DebtCommand::Borrow(Borrow {
            ledger_id: ledger.id_typed(),
            caller,
            amount: Amount::new(amount),
            occurred_at: test_time(),
        });
        execute(ledger, &cmd)
    }

    fn repay(
        ledger: &mut DebtLedger,
        caller: Identity,
        borrower: Identity,
        amount: u128,
    ) -> Vec<DebtEvent> {
        let cmd = DebtCommand::Repay(Repay {
            ledger_id: ledger.id_typed(),
            caller,
            borrower,
            amount: Amount::new(amount),
            occurred_at: test_time(),
        });
        execute(ledger, &cmd).unwrap()
    }

    #[test]
    fn borrow_emits_borrowed_and_increases_balance() {
        let admin = Identity::new();
        let borrower = Identity::new();
        let mut ledger = opened(admin);

        let events = borrow(&mut ledger, borrower, 1000).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DebtEvent::Borrowed(e) => {
                assert_eq!(e.by, borrower);
                assert_eq!(e.value, Amount::new(1000));
                assert_eq!(e.ledger_id, ledger.id_typed());
            }
            other => panic!("expected Borrowed, got {other:?}"),
        }
        assert_eq!(ledger.balance_of(&borrower), Amount::new(1000));
        assert_eq!(ledger.version(), 2);
    }

    #[test]
    fn admin_borrow_is_a_silent_no_op() {
        let admin = Identity::new();
        let mut ledger = opened(admin);
        let before = ledger.clone();

        let events = borrow(&mut ledger, admin, 1000).unwrap();
        assert!(events.is_empty());
        assert_eq!(ledger.balance_of(&admin), Amount::ZERO);
        assert_eq!(ledger, before);
    }

    #[test]
    fn admin_borrow_of_max_does_not_overflow() {
        let admin = Identity::new();
        let mut ledger = opened(admin);
        assert!(borrow(&mut ledger, admin, u128::MAX).unwrap().is_empty());
        assert!(borrow(&mut ledger, admin, u128::MAX).unwrap().is_empty());
    }

    #[test]
    fn zero_borrow_emits_event_without_creating_an_entry() {
        let admin = Identity::new();
        let borrower = Identity::new();
        let mut ledger = opened(admin);

        let events = borrow(&mut ledger, borrower, 0).unwrap();
        assert!(matches!(&events[..], [DebtEvent::Borrowed(e)] if e.value.is_zero()));
        assert_eq!(ledger.balance_of(&borrower), Amount::ZERO);
        assert_eq!(ledger.debtors().count(), 0);
    }

    #[test]
    fn overflowing_borrow_fails_and_keeps_state() {
        let admin = Identity::new();
        let borrower = Identity::new();
        let mut ledger = opened(admin);

        borrow(&mut ledger, borrower, u128::MAX).unwrap();
        let before = ledger.clone();

        let err = borrow(&mut ledger, borrower, 1).unwrap_err();
        assert_eq!(err, DomainError::ArithmeticOverflow);
        assert_eq!(ledger, before);
        assert_eq!(ledger.balance_of(&borrower), Amount::MAX);
    }

    #[test]
    fn admin_repay_reduces_balance() {
        let admin = Identity::new();
        let borrower = Identity::new();
        let mut ledger = opened(admin);
        borrow(&mut ledger, borrower, 1000).unwrap();

        let events = repay(&mut ledger, admin, borrower, 300);
        match &events[..] {
            [DebtEvent::Repayed(e)] => {
                assert_eq!(e.by, borrower);
                assert_eq!(e.value, Amount::new(300));
            }
            other => panic!("expected one Repayed, got {other:?}"),
        }
        assert_eq!(ledger.balance_of(&borrower), Amount::new(700));
    }

    #[test]
    fn over_repayment_is_clamped_to_outstanding_debt() {
        let admin = Identity::new();
        let borrower = Identity::new();
        let mut ledger = opened(admin);
        borrow(&mut ledger, borrower, 1000).unwrap();

        let events = repay(&mut ledger, admin, borrower, 5000);
        assert!(matches!(&events[..], [DebtEvent::Repayed(e)] if e.value == Amount::new(1000)));
        assert_eq!(ledger.balance_of(&borrower), Amount::ZERO);
        assert_eq!(ledger.debtors().count(), 0);
    }

    #[test]
    fn repaying_a_zero_debt_still_emits_a_zero_event() {
        let admin = Identity::new();
        let stranger = Identity::new();
        let mut ledger = opened(admin);

        let events = repay(&mut ledger, admin, stranger, 10);
        assert!(matches!(&events[..], [DebtEvent::Repayed(e)] if e.by == stranger && e.value.is_zero()));
        assert_eq!(ledger.balance_of(&stranger), Amount::ZERO);
    }

    #[test]
    fn repay_by_non_admin_is_ignored() {
        let admin = Identity::new();
        let borrower = Identity::new();
        let mut ledger = opened(admin);
        borrow(&mut ledger, borrower, 1000).unwrap();
        let before = ledger.clone();

        assert!(repay(&mut ledger, borrower, borrower, 1000).is_empty());
        assert!(repay(&mut ledger, Identity::new(), borrower, 1000).is_empty());
        assert_eq!(ledger, before);
        assert_eq!(ledger.balance_of(&borrower), Amount::new(1000));
    }

    #[test]
    fn operations_on_unopened_ledger_are_rejected() {
        let mut ledger = DebtLedger::empty(test_ledger_id());
        assert_eq!(borrow(&mut ledger, Identity::new(), 1).unwrap_err(), DomainError::NotFound);
    }

    #[test]
    fn ledger_cannot_be_opened_twice() {
        let mut ledger = opened(Identity::new());
        let cmd = DebtCommand::OpenLedger(OpenLedger {
            ledger_id: ledger.id_typed(),
            admin: Identity::new(),
            occurred_at: test_time(),
        });
        assert!(matches!(execute(&mut ledger, &cmd), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn command_for_another_ledger_is_rejected() {
        let admin = Identity::new();
        let ledger = opened(admin);
        let cmd = DebtCommand::Borrow(Borrow {
            ledger_id: test_ledger_id(),
            caller: Identity::new(),
            amount: Amount::new(1),
            occurred_at: test_time(),
        });
        assert!(matches!(ledger.handle(&cmd), Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn events_survive_a_json_round_trip() {
        let ledger_id = test_ledger_id();
        let ev = DebtEvent::Borrowed(Borrowed {
            ledger_id,
            by: Identity::new(),
            value: Amount::MAX,
            occurred_at: test_time(),
        });
        let json = serde_json::to_value(&ev).unwrap();
        let back: DebtEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
        assert_eq!(back.event_type(), "debts.ledger.borrowed");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Sequential borrows add up as long as nothing overflows.
        #[test]
        fn sequential_borrows_accumulate(a in 0u128..u128::MAX / 2, b in 0u128..u128::MAX / 2) {
            let admin = Identity::new();
            let borrower = Identity::new();
            let mut ledger = opened(admin);

            borrow(&mut ledger, borrower, a).unwrap();
            borrow(&mut ledger, borrower, b).unwrap();
            prop_assert_eq!(ledger.balance_of(&borrower), Amount::new(a + b));
        }

        /// Admin repayment takes min(amount, debt) and reports exactly that.
        #[test]
        fn admin_repay_clamps(loan in any::<u64>(), amount in any::<u64>()) {
            let admin = Identity::new();
            let borrower = Identity::new();
            let mut ledger = opened(admin);
            borrow(&mut ledger, borrower, loan as u128).unwrap();

            let events = repay(&mut ledger, admin, borrower, amount as u128);
            let expected = loan.min(amount) as u128;
            prop_assert_eq!(events.len(), 1);
            match &events[0] {
                DebtEvent::Repayed(e) => prop_assert_eq!(e.value, Amount::new(expected)),
                other => prop_assert!(false, "expected Repayed, got {:?}", other),
            }
            prop_assert_eq!(ledger.balance_of(&borrower), Amount::new(loan as u128 - expected));
        }

        /// The administrator's balance stays zero whatever it tries to borrow.
        #[test]
        fn admin_never_holds_debt(amounts in prop::collection::vec(any::<u128>(), 1..10)) {
            let admin = Identity::new();
            let mut ledger = opened(admin);
            for a in amounts {
                prop_assert!(borrow(&mut ledger, admin, a).unwrap().is_empty());
            }
            prop_assert_eq!(ledger.balance_of(&admin), Amount::ZERO);
        }

        /// Nobody but the administrator can reduce a debt.
        #[test]
        fn non_admin_repay_never_changes_state(loan in any::<u128>(), amount in any::<u128>()) {
            let admin = Identity::new();
            let borrower = Identity::new();
            let mut ledger = opened(admin);
            borrow(&mut ledger, borrower, loan).unwrap();

            prop_assert!(repay(&mut ledger, borrower, borrower, amount).is_empty());
            prop_assert!(repay(&mut ledger, Identity::new(), borrower, amount).is_empty());
            prop_assert_eq!(ledger.balance_of(&borrower), Amount::new(loan));
        }
    }
}
