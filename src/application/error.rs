use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    BalanceDimension, BalanceOverflow, CatalogError, Operation, Role, TokenError, Units, VehicleId,
};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid amount: {0} (must be positive)")]
    InvalidAmount(Units),

    #[error("Unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("Insufficient {dimension} on vehicle {vehicle_id}: balance {available}, required {required}")]
    InsufficientBalance {
        vehicle_id: VehicleId,
        dimension: BalanceDimension,
        available: Units,
        required: Units,
    },

    #[error("{dimension} on vehicle {vehicle_id} can't take {amount} more: balance {balance}")]
    BalanceOverflow {
        vehicle_id: VehicleId,
        dimension: BalanceDimension,
        balance: Units,
        amount: Units,
    },

    #[error("Invalid token lifetime: {seconds}s (must be positive and representable)")]
    InvalidTtl { seconds: i64 },

    #[error("Token expired at {expires_at}")]
    TokenExpired { expires_at: DateTime<Utc> },

    #[error("Token already consumed at {consumed_at}")]
    TokenAlreadyConsumed { consumed_at: DateTime<Utc> },

    #[error("Token not found: {0}")]
    TokenNotFound(String),

    #[error("Unknown service center: {0}")]
    UnknownServiceCenter(String),

    #[error("Vehicle {vehicle_id} is busy, gave up after {waited:?}")]
    Busy {
        vehicle_id: VehicleId,
        waited: Duration,
    },

    #[error("Vehicle not found: {0}")]
    VehicleNotFound(VehicleId),

    #[error("Vehicle is deactivated: {0}")]
    VehicleDeactivated(VehicleId),

    #[error("Role {role} may not {operation}")]
    Forbidden { role: Role, operation: Operation },

    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    /// Business-rule failures are expected and the request itself decides
    /// them. Storage failures mean "try again later".
    pub fn is_business_failure(&self) -> bool {
        !matches!(self, LedgerError::Storage(_))
    }

    /// Whether repeating the same request could succeed without changing it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Busy { .. } | LedgerError::Storage(_))
    }
}

impl From<CatalogError> for LedgerError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::UnknownServiceType(service_type) => {
                LedgerError::UnknownServiceType(service_type)
            }
        }
    }
}

impl From<TokenError> for LedgerError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::AlreadyConsumed { consumed_at } => {
                LedgerError::TokenAlreadyConsumed { consumed_at }
            }
            TokenError::Expired { expires_at } => LedgerError::TokenExpired { expires_at },
            TokenError::InvalidTtl { seconds } => LedgerError::InvalidTtl { seconds },
        }
    }
}

/// Committed balances always fold; an overflow while folding the log
/// means the stored data is damaged.
impl From<BalanceOverflow> for LedgerError {
    fn from(err: BalanceOverflow) -> Self {
        LedgerError::Storage(anyhow::Error::new(err).context("Transaction log does not fold"))
    }
}
