use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use super::{Balance, BalanceDimension, BalanceOverflow, LedgerTransaction, Units, VehicleId};

/// Fold a vehicle's transactions into its balance.
pub fn compute_balance(transactions: &[LedgerTransaction]) -> Result<Balance, BalanceOverflow> {
    let mut balance = Balance::default();
    for tx in transactions {
        balance.add(&tx.dimension(), tx.delta())?;
    }
    Ok(balance.normalized())
}

/// Fold transactions of many vehicles at once.
pub fn compute_all_balances(
    transactions: &[LedgerTransaction],
) -> Result<HashMap<VehicleId, Balance>, BalanceOverflow> {
    let mut balances: HashMap<VehicleId, Balance> = HashMap::new();

    for tx in transactions {
        balances
            .entry(tx.vehicle_id)
            .or_default()
            .add(&tx.dimension(), tx.delta())?;
    }

    Ok(balances
        .into_iter()
        .map(|(id, balance)| (id, balance.normalized()))
        .collect())
}

/// A cached counter that disagrees with the transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceMismatch {
    pub vehicle_id: VehicleId,
    pub dimension: BalanceDimension,
    pub cached: Units,
    pub derived: Units,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub vehicle_count: i64,
    pub transaction_count: i64,
    pub has_sequence_gaps: bool,
    pub duplicate_idempotency_keys: i64,
    pub mismatches: Vec<BalanceMismatch>,
    pub negative_balances: Vec<BalanceMismatch>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        !self.has_sequence_gaps
            && self.duplicate_idempotency_keys == 0
            && self.mismatches.is_empty()
            && self.negative_balances.is_empty()
    }
}

/// Compare cached balances against the ones derived from the log.
pub fn build_integrity_report(
    cached: &HashMap<VehicleId, Balance>,
    derived: &HashMap<VehicleId, Balance>,
    vehicle_count: i64,
    transaction_count: i64,
    has_sequence_gaps: bool,
    duplicate_idempotency_keys: i64,
) -> IntegrityReport {
    let empty = Balance::default();
    let vehicles: BTreeSet<&VehicleId> = cached.keys().chain(derived.keys()).collect();

    let mut mismatches = Vec::new();
    let mut negative_balances = Vec::new();

    for vehicle_id in vehicles {
        let cached_balance = cached.get(vehicle_id).unwrap_or(&empty);
        let derived_balance = derived.get(vehicle_id).unwrap_or(&empty);

        let dimensions: BTreeSet<BalanceDimension> = std::iter::once(BalanceDimension::Generic)
            .chain(
                cached_balance
                    .rights
                    .keys()
                    .chain(derived_balance.rights.keys())
                    .map(|st| BalanceDimension::Right(st.clone())),
            )
            .collect();

        for dimension in dimensions {
            let entry = BalanceMismatch {
                vehicle_id: *vehicle_id,
                cached: cached_balance.get(&dimension),
                derived: derived_balance.get(&dimension),
                dimension,
            };

            if entry.cached < 0 || entry.derived < 0 {
                negative_balances.push(entry.clone());
            }
            if entry.cached != entry.derived {
                mismatches.push(entry);
            }
        }
    }

    IntegrityReport {
        vehicle_count,
        transaction_count,
        has_sequence_gaps,
        duplicate_idempotency_keys,
        mismatches,
        negative_balances,
    }
}
