// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::str::FromStr;

use anyhow::Result;
use fleet_ledger::application::LedgerEngine;
use fleet_ledger::config::LedgerConfig;
use fleet_ledger::domain::{Actor, CompanyId, VehicleId};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, SqliteConnection};
use tempfile::TempDir;
use uuid::Uuid;

/// Helper to create a test engine with a temporary database
pub async fn test_engine() -> Result<(LedgerEngine, TempDir)> {
    test_engine_with(|_| {}).await
}

/// Same as `test_engine`, with a chance to adjust the config first
pub async fn test_engine_with(adjust: impl FnOnce(&mut LedgerConfig)) -> Result<(LedgerEngine, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let mut config = LedgerConfig::default().with_database_path(db_path.to_str().unwrap());
    adjust(&mut config);
    let engine = LedgerEngine::init(config).await?;
    Ok((engine, temp_dir))
}

fn db_path(temp_dir: &TempDir) -> String {
    temp_dir.path().join("test.db").to_string_lossy().into_owned()
}

/// A second engine over the database of `test_engine`, as another process would open it
pub async fn second_engine(temp_dir: &TempDir) -> Result<LedgerEngine> {
    let config = LedgerConfig::default().with_database_path(db_path(temp_dir));
    Ok(LedgerEngine::connect(config).await?)
}

/// Take SQLite's write lock from outside any engine. Writers block until
/// `release_write_lock` is called on the returned connection.
pub async fn hold_write_lock(temp_dir: &TempDir) -> Result<SqliteConnection> {
    let mut conn = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path(temp_dir)))?
        .connect()
        .await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut conn).await?;
    Ok(conn)
}

pub async fn release_write_lock(mut conn: SqliteConnection) -> Result<()> {
    sqlx::query("COMMIT").execute(&mut conn).await?;
    Ok(())
}

/// Test fixture: one company with an admin, a driver and a registered vehicle,
/// plus a service center operator.
pub struct Fleet {
    pub company_id: CompanyId,
    pub vehicle_id: VehicleId,
    pub admin: Actor,
    pub driver: Actor,
    pub operator: Actor,
}

impl Fleet {
    pub async fn create(engine: &LedgerEngine) -> Result<Self> {
        let company_id = Uuid::new_v4();
        let admin = Actor::company_admin("admin-1", company_id);
        let vehicle = engine
            .register_vehicle(&admin, company_id, "AB-123-CD".to_string())
            .await?;

        Ok(Self {
            company_id,
            vehicle_id: vehicle.id,
            admin,
            driver: Actor::driver("driver-1", company_id),
            operator: Actor::operator("center-1-desk"),
        })
    }

    /// Create the fleet and fund its vehicle with generic credits
    pub async fn with_credits(engine: &LedgerEngine, amount: i64) -> Result<Self> {
        let fleet = Self::create(engine).await?;
        engine
            .allocate_generic(&fleet.admin, fleet.vehicle_id, amount, "initial-funding", None)
            .await?;
        Ok(fleet)
    }

    /// Register another vehicle for the same company
    pub async fn add_vehicle(&self, engine: &LedgerEngine, label: &str) -> Result<VehicleId> {
        let vehicle = engine
            .register_vehicle(&self.admin, self.company_id, label.to_string())
            .await?;
        Ok(vehicle.id)
    }
}

pub const CENTER: &str = "center-1";
