//! Infrastructure layer: event store, dispatch pipeline, read models, config.
//!
//! Everything here composes the pure `debts-ledger` aggregate with storage and
//! publication. [`service::DebtService`] is the entry point a hosting platform
//! talks to.

pub mod command_dispatcher;
pub mod config;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod service;
pub mod workers;


pub use command_dispatcher::{CommandDispatcher, DispatchError};
pub use config::{ConfigError, DebtsConfig};
pub use service::{BorrowOutcome, DebtService, InMemoryDebtService, RepayOutcome};
