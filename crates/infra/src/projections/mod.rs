//! Projection implementations (read model builders).
//!
//! Projections consume published envelopes and build query-optimized read
//! models. They are rebuildable from the event stream and idempotent under
//! at-least-once delivery.

pub mod debt_balances;

pub use debt_balances::{BalanceProjectionError, DebtBalance, DebtBalancesProjection};
