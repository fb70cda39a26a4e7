use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type VehicleId = Uuid;
pub type CompanyId = Uuid;

/// Credits and rights are whole units; one right pays for one service.
pub type Units = i64;

/// A vehicle registered to a company. Balances live next to it in storage
/// and are only ever changed by the ledger engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleAccount {
    pub id: VehicleId,
    pub company_id: CompanyId,
    /// Human-facing identifier, typically the plate number
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl VehicleAccount {
    pub fn new(company_id: CompanyId, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            company_id,
            label: label.into(),
            created_at: super::now(),
            deactivated_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

/// Which counter of a vehicle a movement affects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "service_type")]
pub enum BalanceDimension {
    Generic,
    Right(String),
}

impl BalanceDimension {
    pub fn service_type(&self) -> Option<&str> {
        match self {
            BalanceDimension::Generic => None,
            BalanceDimension::Right(service_type) => Some(service_type),
        }
    }
}

impl std::fmt::Display for BalanceDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceDimension::Generic => write!(f, "generic credits"),
            BalanceDimension::Right(service_type) => write!(f, "{} rights", service_type),
        }
    }
}

/// Adding `delta` would leave the range of `Units`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{dimension} would overflow: balance {balance}, delta {delta}")]
pub struct BalanceOverflow {
    pub dimension: BalanceDimension,
    pub balance: Units,
    pub delta: Units,
}

/// Point-in-time balances of one vehicle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub generic: Units,
    pub rights: BTreeMap<String, Units>,
}

impl Balance {
    pub fn get(&self, dimension: &BalanceDimension) -> Units {
        match dimension {
            BalanceDimension::Generic => self.generic,
            BalanceDimension::Right(service_type) => self.right(service_type),
        }
    }

    /// Rights held for a service type; zero when never allocated.
    pub fn right(&self, service_type: &str) -> Units {
        self.rights.get(service_type).copied().unwrap_or(0)
    }

    pub fn add(&mut self, dimension: &BalanceDimension, delta: Units) -> Result<(), BalanceOverflow> {
        let slot = match dimension {
            BalanceDimension::Generic => &mut self.generic,
            BalanceDimension::Right(service_type) => {
                self.rights.entry(service_type.clone()).or_insert(0)
            }
        };
        let current = *slot;
        *slot = current.checked_add(delta).ok_or_else(|| BalanceOverflow {
            dimension: dimension.clone(),
            balance: current,
            delta,
        })?;
        Ok(())
    }

    /// Drop right entries that have gone back to zero so two balances
    /// with the same effective content compare equal.
    pub fn normalized(mut self) -> Self {
        self.rights.retain(|_, units| *units != 0);
        self
    }

    pub fn is_non_negative(&self) -> bool {
        self.generic >= 0 && self.rights.values().all(|units| *units >= 0)
    }
}
