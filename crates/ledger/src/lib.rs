//! Debt ledger (event-sourced).
//!
//! Pure domain logic only: no IO, no persistence concerns. Any identity may
//! borrow against itself; only the ledger's administrator may repay.

pub mod debt;

pub use debt::{
    Borrow, Borrowed, DebtCommand, DebtEvent, DebtLedger, LedgerId, LedgerOpened, OpenLedger,
    Repay, Repayed, AGGREGATE_TYPE,
};
