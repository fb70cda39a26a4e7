use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;

use crate::application::{HistoryQuery, LedgerEngine};
use crate::domain::{
    Actor, Balance, CompanyId, LedgerTransaction, VehicleAccount, VehicleId, compute_balance,
};

/// Everything known about one vehicle, for audit downloads.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub version: String,
    pub exported_at: DateTime<Utc>,
    pub vehicle: VehicleAccount,
    pub balance: Balance,
    pub transactions: Vec<LedgerTransaction>,
}

/// Exporter for turning ledger data into CSV or JSON.
pub struct Exporter<'a> {
    engine: &'a LedgerEngine,
}

impl<'a> Exporter<'a> {
    pub fn new(engine: &'a LedgerEngine) -> Self {
        Self { engine }
    }

    /// Export a vehicle's transaction history to CSV, newest first.
    pub async fn export_history_csv<W: Write>(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        query: HistoryQuery,
        writer: W,
    ) -> Result<usize> {
        let transactions = self.engine.history_query(actor, vehicle_id, query).await?;
        write_history_csv(&transactions, writer)
    }

    /// Export current balances of every visible vehicle, one row per dimension.
    pub async fn export_balances_csv<W: Write>(
        &self,
        actor: &Actor,
        company_id: Option<CompanyId>,
        writer: W,
    ) -> Result<usize> {
        let vehicles = self.engine.list_vehicles(actor, company_id).await?;
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["vehicle_id", "label", "company_id", "dimension", "balance"])?;

        let mut count = 0;
        for vehicle in &vehicles {
            let balance = self.engine.current_balance(actor, vehicle.id).await?;
            let id = vehicle.id.to_string();
            let company = vehicle.company_id.to_string();

            csv_writer.write_record([
                id.as_str(),
                vehicle.label.as_str(),
                company.as_str(),
                "generic",
                balance.generic.to_string().as_str(),
            ])?;
            for (service_type, units) in &balance.rights {
                csv_writer.write_record([
                    id.as_str(),
                    vehicle.label.as_str(),
                    company.as_str(),
                    service_type.as_str(),
                    units.to_string().as_str(),
                ])?;
            }
            count += 1;
        }

        csv_writer.flush()?;
        Ok(count)
    }

    /// Export one vehicle with its full history as JSON, plus the balance
    /// those transactions add up to.
    pub async fn export_account_json<W: Write>(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        mut writer: W,
    ) -> Result<AccountSnapshot> {
        let vehicle = self.engine.get_vehicle(actor, vehicle_id).await?;
        let transactions = self
            .engine
            .history_query(actor, vehicle_id, HistoryQuery::default())
            .await?;
        // Folded from the exported rows so the two always agree
        let balance = compute_balance(&transactions)?;

        let snapshot = AccountSnapshot {
            version: env!("CARGO_PKG_VERSION").to_string(),
            exported_at: Utc::now(),
            vehicle,
            balance,
            transactions,
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        writer.write_all(json.as_bytes())?;
        writer.flush()?;

        Ok(snapshot)
    }
}

/// Write transactions as CSV rows in the order given.
pub fn write_history_csv<W: Write>(transactions: &[LedgerTransaction], writer: W) -> Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record([
        "id",
        "sequence",
        "created_at",
        "vehicle_id",
        "type",
        "service_type",
        "amount",
        "service_center",
        "description",
        "actor_id",
        "actor_role",
        "idempotency_key",
    ])?;

    let mut count = 0;
    for tx in transactions {
        csv_writer.write_record([
            tx.id.to_string(),
            tx.sequence.to_string(),
            tx.created_at.to_rfc3339(),
            tx.vehicle_id.to_string(),
            tx.kind().as_str().to_string(),
            tx.movement.service_type().unwrap_or_default().to_string(),
            tx.delta().to_string(),
            tx.movement.service_center().unwrap_or_default().to_string(),
            tx.description.clone(),
            tx.actor_id.clone(),
            tx.actor_role.as_str().to_string(),
            tx.idempotency_key.clone(),
        ])?;
        count += 1;
    }

    csv_writer.flush()?;
    Ok(count)
}
