//! Process configuration, read from the environment.
//!
//! | variable           | meaning                                   |
//! |--------------------|-------------------------------------------|
//! | `DEBTS_ADMIN`      | administrator identity (UUID, required)   |
//! | `DEBTS_LEDGER_ID`  | ledger stream id (UUID, optional)         |
//! | `DEBTS_LOG_FORMAT` | `json` (default) or `pretty`              |
//! | `RUST_LOG`         | tracing filter directives                 |

use core::str::FromStr;

use thiserror::Error;

use debts_core::{AggregateId, Identity};
use debts_observability::{LogFormat, TracingConfig};

pub const ADMIN_VAR: &str = "DEBTS_ADMIN";
pub const LEDGER_ID_VAR: &str = "DEBTS_LEDGER_ID";
pub const LOG_FORMAT_VAR: &str = "DEBTS_LOG_FORMAT";
pub const LOG_FILTER_VAR: &str = "RUST_LOG";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("DEBTS_ADMIN must be set to the administrator identity")]
    MissingAdmin,

    #[error("{var} is not a valid id: {reason}")]
    InvalidId { var: &'static str, reason: String },

    #[error("DEBTS_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebtsConfig {
    pub admin: Identity,
    /// Existing ledger to attach to; a fresh one is opened when `None`.
    pub ledger_id: Option<AggregateId>,
    pub tracing: TracingConfig,
}

impl DebtsConfig {
    pub fn new(admin: Identity) -> Self {
        Self {
            admin,
            ledger_id: None,
            tracing: TracingConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let admin = get(ADMIN_VAR).ok_or(ConfigError::MissingAdmin)?;
        let admin = parse_id::<Identity>(ADMIN_VAR, &admin)?;

        let ledger_id = get(LEDGER_ID_VAR)
            .map(|raw| parse_id::<AggregateId>(LEDGER_ID_VAR, &raw))
            .transpose()?;

        let format = match get(LOG_FORMAT_VAR) {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|e| ConfigError::InvalidLogFormat(e.to_string()))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            admin,
            ledger_id,
            tracing: TracingConfig {
                filter: get(LOG_FILTER_VAR),
                format,
            },
        })
    }

    /// Install the process-wide subscriber described by `self.tracing`.
    pub fn init_logging(&self) {
        debts_observability::init_with(&self.tracing);
    }
}

fn parse_id<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidId {
        var,
        reason: e.to_string(),
    })
}
