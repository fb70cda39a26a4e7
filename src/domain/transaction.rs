use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Actor, BalanceDimension, Role, Units, VehicleId};

pub type TransactionId = Uuid;

/// Opaque reference to a service center, resolved by an outside directory.
pub type ServiceCenterId = String;

/// Stored transaction type. Both spend flavours share `spend` and are told
/// apart by whether a service type is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Allocate,
    RightAllocate,
    Spend,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Allocate => "allocate",
            TransactionKind::RightAllocate => "right_allocate",
            TransactionKind::Spend => "spend",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "allocate" => Some(TransactionKind::Allocate),
            "right_allocate" => Some(TransactionKind::RightAllocate),
            "spend" => Some(TransactionKind::Spend),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a transaction did to the balance. Each case carries only the
/// fields that make sense for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Movement {
    AllocateGeneric {
        amount: Units,
    },
    AllocateRight {
        service_type: String,
        count: Units,
    },
    SpendGeneric {
        amount: Units,
        service_center: ServiceCenterId,
    },
    SpendRight {
        service_type: String,
        count: Units,
        service_center: ServiceCenterId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MovementError {
    #[error("Unknown transaction kind: {0}")]
    UnknownKind(String),

    #[error("{kind} transaction has inconsistent fields")]
    Inconsistent { kind: TransactionKind },
}

impl Movement {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Movement::AllocateGeneric { .. } => TransactionKind::Allocate,
            Movement::AllocateRight { .. } => TransactionKind::RightAllocate,
            Movement::SpendGeneric { .. } | Movement::SpendRight { .. } => TransactionKind::Spend,
        }
    }

    pub fn dimension(&self) -> BalanceDimension {
        match self {
            Movement::AllocateGeneric { .. } | Movement::SpendGeneric { .. } => {
                BalanceDimension::Generic
            }
            Movement::AllocateRight { service_type, .. }
            | Movement::SpendRight { service_type, .. } => {
                BalanceDimension::Right(service_type.clone())
            }
        }
    }

    /// Unsigned size of the movement.
    pub fn units(&self) -> Units {
        match self {
            Movement::AllocateGeneric { amount } | Movement::SpendGeneric { amount, .. } => *amount,
            Movement::AllocateRight { count, .. } | Movement::SpendRight { count, .. } => *count,
        }
    }

    /// Signed effect on the balance.
    pub fn delta(&self) -> Units {
        if self.is_allocation() {
            self.units()
        } else {
            -self.units()
        }
    }

    pub fn is_allocation(&self) -> bool {
        matches!(
            self,
            Movement::AllocateGeneric { .. } | Movement::AllocateRight { .. }
        )
    }

    pub fn service_type(&self) -> Option<&str> {
        match self {
            Movement::AllocateRight { service_type, .. }
            | Movement::SpendRight { service_type, .. } => Some(service_type),
            _ => None,
        }
    }

    pub fn service_center(&self) -> Option<&str> {
        match self {
            Movement::SpendGeneric { service_center, .. }
            | Movement::SpendRight { service_center, .. } => Some(service_center),
            _ => None,
        }
    }

    /// Rebuild a movement from its stored columns. `delta` is the signed amount.
    pub fn from_parts(
        kind: &str,
        service_type: Option<String>,
        delta: Units,
        service_center: Option<String>,
    ) -> Result<Self, MovementError> {
        let kind =
            TransactionKind::from_str(kind).ok_or_else(|| MovementError::UnknownKind(kind.into()))?;
        let inconsistent = MovementError::Inconsistent { kind };

        match (kind, service_type, service_center) {
            (TransactionKind::Allocate, None, None) if delta > 0 => {
                Ok(Movement::AllocateGeneric { amount: delta })
            }
            (TransactionKind::RightAllocate, Some(service_type), None) if delta > 0 => {
                Ok(Movement::AllocateRight {
                    service_type,
                    count: delta,
                })
            }
            (TransactionKind::Spend, None, Some(service_center)) if delta < 0 => {
                Ok(Movement::SpendGeneric {
                    amount: -delta,
                    service_center,
                })
            }
            (TransactionKind::Spend, Some(service_type), Some(service_center)) if delta < 0 => {
                Ok(Movement::SpendRight {
                    service_type,
                    count: -delta,
                    service_center,
                })
            }
            _ => Err(inconsistent),
        }
    }

    fn default_description(&self) -> String {
        match self {
            Movement::AllocateGeneric { amount } => format!("Allocated {} credits", amount),
            Movement::AllocateRight {
                service_type,
                count,
            } => format!("Allocated {} x {}", count, service_type),
            Movement::SpendGeneric {
                amount,
                service_center,
            } => format!("Spent {} credits at {}", amount, service_center),
            Movement::SpendRight {
                service_type,
                count,
                service_center,
            } => format!("Used {} x {} at {}", count, service_type, service_center),
        }
    }
}

/// Which side of the history to show.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryFilter {
    #[default]
    All,
    Allocation,
    Usage,
}

impl HistoryFilter {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryFilter::All => "all",
            HistoryFilter::Allocation => "allocation",
            HistoryFilter::Usage => "usage",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "all" => Some(HistoryFilter::All),
            "allocation" | "allocations" => Some(HistoryFilter::Allocation),
            "usage" | "spend" | "spends" => Some(HistoryFilter::Usage),
            _ => None,
        }
    }

    /// Stored kinds this filter lets through.
    pub fn kinds(&self) -> &'static [TransactionKind] {
        match self {
            HistoryFilter::All => &[
                TransactionKind::Allocate,
                TransactionKind::RightAllocate,
                TransactionKind::Spend,
            ],
            HistoryFilter::Allocation => &[TransactionKind::Allocate, TransactionKind::RightAllocate],
            HistoryFilter::Usage => &[TransactionKind::Spend],
        }
    }

    pub fn matches(&self, kind: TransactionKind) -> bool {
        self.kinds().contains(&kind)
    }
}

/// An immutable ledger entry. Balances are the running sum of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TransactionId,
    /// Commit order across the whole ledger
    pub sequence: i64,
    pub vehicle_id: VehicleId,
    pub movement: Movement,
    pub description: String,
    pub actor_id: String,
    pub actor_role: Role,
    pub created_at: DateTime<Utc>,
    /// Caller-supplied key; unique per vehicle
    pub idempotency_key: String,
}

impl LedgerTransaction {
    /// Create a transaction. The sequence number is assigned by the repository.
    pub fn new(
        vehicle_id: VehicleId,
        movement: Movement,
        actor: &Actor,
        idempotency_key: impl Into<String>,
    ) -> Self {
        assert!(movement.units() > 0, "Ledger movement must be positive");
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            vehicle_id,
            description: movement.default_description(),
            movement,
            actor_id: actor.id.clone(),
            actor_role: actor.role,
            created_at: super::now(),
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn kind(&self) -> TransactionKind {
        self.movement.kind()
    }

    pub fn delta(&self) -> Units {
        self.movement.delta()
    }

    pub fn dimension(&self) -> BalanceDimension {
        self.movement.dimension()
    }
}
