//! End-to-end scenarios against the public service API, observed through the
//! event bus the way an external consumer would see them.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use debts_core::{Amount, Identity};
use debts_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};
use debts_infra::event_store::InMemoryEventStore;
use debts_infra::{BorrowOutcome, DebtService, DispatchError, InMemoryDebtService, RepayOutcome};

struct Harness {
    service: InMemoryDebtService,
    events: Subscription<EventEnvelope<JsonValue>>,
    admin: Identity,
}

impl Harness {
    fn new() -> Self {
        let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());
        let admin = Identity::new();
        let service = DebtService::open(Arc::new(InMemoryEventStore::new()), bus.clone(), admin)
            .expect("failed to open ledger");
        // Subscribe after opening: scenarios only look at borrow/repay traffic.
        let events = bus.subscribe();
        Self { service, events, admin }
    }

    /// `(event_type, by, value)` of everything published so far.
    fn published(&self) -> Vec<(String, String, String)> {
        self.events
            .drain()
            .into_iter()
            .map(|env| {
                let body = env
                    .payload()
                    .as_object()
                    .and_then(|o| o.values().next())
                    .cloned()
                    .unwrap_or(JsonValue::Null);
                (
                    env.event_type().to_string(),
                    body["by"].as_str().unwrap_or_default().to_string(),
                    body["value"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

#[test]
fn borrow_then_full_admin_repay_clears_the_debt() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    h.service.borrow(user, Amount::new(1000))?;
    h.service.repay(h.admin, user, Amount::new(1000))?;

    assert_eq!(h.service.balance_of(user)?, Amount::ZERO);
    assert_eq!(
        h.published(),
        vec![
            ("debts.ledger.borrowed".into(), user.to_string(), "1000".into()),
            ("debts.ledger.repayed".into(), user.to_string(), "1000".into()),
        ]
    );
    Ok(())
}

#[test]
fn self_repay_changes_nothing() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    h.service.borrow(user, Amount::new(1000))?;
    let outcome = h.service.repay(user, user, Amount::new(1000))?;

    assert_eq!(outcome, RepayOutcome::Ignored);
    assert_eq!(h.service.balance_of(user)?, Amount::new(1000));
    let repays = h
        .published()
        .into_iter()
        .filter(|(ty, _, _)| ty == "debts.ledger.repayed")
        .count();
    assert_eq!(repays, 0);
    Ok(())
}

#[test]
fn partial_admin_repay_leaves_the_rest() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    h.service.borrow(user, Amount::new(1000))?;
    h.events.drain();
    h.service.repay(h.admin, user, Amount::new(300))?;

    assert_eq!(h.service.balance_of(user)?, Amount::new(700));
    assert_eq!(
        h.published(),
        vec![("debts.ledger.repayed".into(), user.to_string(), "300".into())]
    );
    Ok(())
}

#[test]
fn over_repay_is_clamped_to_the_outstanding_debt() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    h.service.borrow(user, Amount::new(100))?;
    let outcome = h.service.repay(h.admin, user, Amount::new(250))?;

    assert!(matches!(outcome, RepayOutcome::Repaid { value, .. } if value == Amount::new(100)));
    assert_eq!(h.service.balance_of(user)?, Amount::ZERO);
    Ok(())
}

#[test]
fn successive_borrows_accumulate() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    h.service.borrow(user, Amount::new(40))?;
    h.service.borrow(user, Amount::new(2))?;

    assert_eq!(h.service.balance_of(user)?, Amount::new(42));
    Ok(())
}

#[test]
fn overflowing_borrow_fails_and_records_nothing() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    h.service.borrow(user, Amount::MAX)?;
    h.events.drain();

    let err = h.service.borrow(user, Amount::new(1)).unwrap_err();
    assert!(matches!(err, DispatchError::ArithmeticOverflow));
    assert_eq!(h.service.balance_of(user)?, Amount::MAX);
    assert!(h.published().is_empty());
    Ok(())
}

#[test]
fn admin_cannot_borrow() -> anyhow::Result<()> {
    let h = Harness::new();

    let outcome = h.service.borrow(h.admin, Amount::new(500))?;

    assert_eq!(outcome, BorrowOutcome::AdminExempt);
    assert_eq!(h.service.balance_of(h.admin)?, Amount::ZERO);
    assert!(h.published().is_empty());
    Ok(())
}

#[test]
fn zero_borrow_is_recorded() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    let outcome = h.service.borrow(user, Amount::ZERO)?;

    assert!(matches!(outcome, BorrowOutcome::Borrowed { value, .. } if value.is_zero()));
    assert_eq!(h.service.balance_of(user)?, Amount::ZERO);
    assert_eq!(
        h.published(),
        vec![("debts.ledger.borrowed".into(), user.to_string(), "0".into())]
    );
    Ok(())
}

#[test]
fn admin_repay_of_a_clear_account_emits_zero() -> anyhow::Result<()> {
    let h = Harness::new();
    let user = Identity::new();

    let outcome = h.service.repay(h.admin, user, Amount::new(10))?;

    assert!(matches!(outcome, RepayOutcome::Repaid { value, .. } if value.is_zero()));
    assert_eq!(
        h.published(),
        vec![("debts.ledger.repayed".into(), user.to_string(), "0".into())]
    );
    Ok(())
}

#[test]
fn concurrent_borrow_and_repay_apply_in_a_total_order() -> anyhow::Result<()> {
    let h = Harness::new();
    let admin = h.admin;
    let service = Arc::new(h.service);
    let user = Identity::new();
    service.borrow(user, Amount::new(10_000))?;

    let threads: Vec<_> = (0..4)
        .map(|i| {
            let service = service.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let res = if i % 2 == 0 {
                        service.borrow(user, Amount::new(3)).map(|_| ())
                    } else {
                        service.repay(admin, user, Amount::new(2)).map(|_| ())
                    };
                    res.expect("operation failed");
                }
            })
        })
        .collect();
    for t in threads {
        t.join().expect("worker panicked");
    }

    // 2 borrowers * 50 * 3 in, 2 repayers * 50 * 2 out.
    assert_eq!(service.balance_of(user)?, Amount::new(10_000 + 300 - 200));
    assert_eq!(service.history()?.len(), 1 + 1 + 200);
    Ok(())
}
