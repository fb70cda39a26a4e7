use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::domain::{
    Actor, Balance, CompanyId, LedgerTransaction, Movement, QrToken, Role, SpendTarget,
    TokenError, TransactionId, TransactionKind, Units, VehicleAccount, VehicleId,
    format_timestamp,
};

use super::{MIGRATION_001_INITIAL, MIGRATION_002_QR_TOKENS};

const TRANSACTION_COLUMNS: &str = "id, sequence, vehicle_id, kind, service_type, amount, service_center, description, actor_id, actor_role, created_at, idempotency_key";

const TOKEN_COLUMNS: &str = "token, vehicle_id, service_type, amount, issued_by, issued_at, expires_at, consumed_at, transaction_id";

/// Statistics for ledger integrity verification.
#[derive(Debug, Clone)]
pub struct IntegrityStats {
    pub vehicle_count: i64,
    pub transaction_count: i64,
    pub has_sequence_gaps: bool,
    pub duplicate_idempotency_keys: i64,
}

/// Result of trying to append a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Written, balances updated.
    Committed(LedgerTransaction),
    /// A transaction with the same idempotency key already existed; nothing written.
    Replayed(LedgerTransaction),
    /// The spend would have taken the balance below zero; nothing written.
    Insufficient { available: Units, required: Units },
    /// The allocation would have taken the balance past `Units::MAX`; nothing written.
    Overflow { balance: Units, amount: Units },
}

/// Result of trying to redeem a QR token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed {
        token: QrToken,
        transaction: LedgerTransaction,
    },
    NotFound,
    Rejected(TokenError),
    Insufficient {
        available: Units,
        required: Units,
    },
}

/// Repository for persisting vehicles, balances, transactions and tokens.
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database described by `config`, creating the file if needed.
    /// WAL mode lets readers see a committed snapshot while a writer is active.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.database_path))
            .context("Invalid database path")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;

        sqlx::query(MIGRATION_002_QR_TOKENS)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 002")?;

        Ok(())
    }

    /// Initialize a database (connect + migrate).
    pub async fn init(config: &LedgerConfig) -> Result<Self> {
        let repo = Self::connect(config).await?;
        repo.migrate().await?;
        Ok(repo)
    }

    // ========================
    // Vehicle operations
    // ========================

    pub async fn save_vehicle(&self, vehicle: &VehicleAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO vehicles (id, company_id, label, generic_balance, created_at, deactivated_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(vehicle.id.to_string())
        .bind(vehicle.company_id.to_string())
        .bind(&vehicle.label)
        .bind(format_timestamp(vehicle.created_at))
        .bind(vehicle.deactivated_at.map(format_timestamp))
        .execute(&self.pool)
        .await
        .context("Failed to save vehicle")?;
        Ok(())
    }

    pub async fn get_vehicle(&self, id: VehicleId) -> Result<Option<VehicleAccount>> {
        let row = sqlx::query(
            "SELECT id, company_id, label, created_at, deactivated_at FROM vehicles WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch vehicle")?;

        row.as_ref().map(Self::row_to_vehicle).transpose()
    }

    /// List vehicles, optionally restricted to one company.
    pub async fn list_vehicles(&self, company_id: Option<CompanyId>) -> Result<Vec<VehicleAccount>> {
        let rows = match company_id {
            Some(company_id) => sqlx::query(
                "SELECT id, company_id, label, created_at, deactivated_at FROM vehicles WHERE company_id = ? ORDER BY label",
            )
            .bind(company_id.to_string())
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query(
                "SELECT id, company_id, label, created_at, deactivated_at FROM vehicles ORDER BY label",
            )
            .fetch_all(&self.pool)
            .await,
        }
        .context("Failed to list vehicles")?;

        rows.iter().map(Self::row_to_vehicle).collect()
    }

    /// Deactivate a vehicle (soft delete). Balances and history stay.
    pub async fn deactivate_vehicle(&self, id: VehicleId, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE vehicles SET deactivated_at = ? WHERE id = ? AND deactivated_at IS NULL")
            .bind(format_timestamp(at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to deactivate vehicle")?;
        Ok(())
    }

    fn row_to_vehicle(row: &sqlx::sqlite::SqliteRow) -> Result<VehicleAccount> {
        let id_str: String = row.get("id");
        let company_str: String = row.get("company_id");
        let created_at_str: String = row.get("created_at");
        let deactivated_at_str: Option<String> = row.get("deactivated_at");

        Ok(VehicleAccount {
            id: Uuid::parse_str(&id_str).context("Invalid vehicle ID")?,
            company_id: Uuid::parse_str(&company_str).context("Invalid company ID")?,
            label: row.get("label"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
            deactivated_at: deactivated_at_str
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .context("Invalid deactivated_at timestamp")?,
        })
    }

    // ========================
    // Service centers
    // ========================

    pub async fn save_service_center(&self, id: &str, name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_centers (id, name, created_at) VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET name = excluded.name
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(format_timestamp(crate::domain::now()))
        .execute(&self.pool)
        .await
        .context("Failed to save service center")?;
        Ok(())
    }

    pub async fn service_center_exists(&self, id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM service_centers WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to look up service center")?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    // ========================
    // Balances
    // ========================

    /// Cached balances of one vehicle, read in a single snapshot.
    pub async fn get_balance(&self, vehicle_id: VehicleId) -> Result<Balance> {
        let mut db = self.pool.begin().await.context("Failed to begin read")?;
        let id = vehicle_id.to_string();

        let generic: Units = sqlx::query("SELECT generic_balance FROM vehicles WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *db)
            .await
            .context("Failed to read generic balance")?
            .map(|row| row.try_get("generic_balance"))
            .transpose()
            .context("Invalid generic balance")?
            .unwrap_or(0);

        let rows = sqlx::query(
            "SELECT service_type, balance FROM right_balances WHERE vehicle_id = ? AND balance <> 0",
        )
        .bind(&id)
        .fetch_all(&mut *db)
        .await
        .context("Failed to read right balances")?;

        db.commit().await.context("Failed to finish read")?;

        let rights: BTreeMap<String, Units> = rows
            .iter()
            .map(|row| Ok((row.try_get("service_type")?, row.try_get("balance")?)))
            .collect::<Result<_, sqlx::Error>>()
            .context("Invalid right balance")?;

        Ok(Balance { generic, rights })
    }

    /// Cached balances of every vehicle, read in a single snapshot.
    pub async fn get_all_balances(&self) -> Result<HashMap<VehicleId, Balance>> {
        let mut db = self.pool.begin().await.context("Failed to begin read")?;

        let vehicles = sqlx::query("SELECT id, generic_balance FROM vehicles")
            .fetch_all(&mut *db)
            .await
            .context("Failed to read generic balances")?;
        let rights = sqlx::query("SELECT vehicle_id, service_type, balance FROM right_balances")
            .fetch_all(&mut *db)
            .await
            .context("Failed to read right balances")?;

        db.commit().await.context("Failed to finish read")?;

        let mut balances = HashMap::new();
        for row in vehicles {
            let id_str: String = row.get("id");
            let id = Uuid::parse_str(&id_str).context("Invalid vehicle ID")?;
            balances.insert(
                id,
                Balance {
                    generic: row
                        .try_get("generic_balance")
                        .context("Invalid generic balance")?,
                    rights: Default::default(),
                },
            );
        }
        for row in rights {
            let id_str: String = row.get("vehicle_id");
            let id = Uuid::parse_str(&id_str).context("Invalid vehicle ID")?;
            let units: Units = row.try_get("balance").context("Invalid right balance")?;
            if units != 0 {
                balances
                    .entry(id)
                    .or_insert_with(Balance::default)
                    .rights
                    .insert(row.get("service_type"), units);
            }
        }

        Ok(balances)
    }

    // ========================
    // Transaction operations
    // ========================

    /// Append a transaction and move the cached balance in one storage
    /// transaction. The idempotency lookup, the conditional balance update
    /// and the insert either all commit or none do.
    pub async fn append_transaction(&self, tx: &mut LedgerTransaction) -> Result<AppendOutcome> {
        let mut db = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let sequence = Self::claim_sequence(&mut db).await?;
        let outcome = Self::apply_transaction(&mut db, tx, sequence).await?;

        match outcome {
            AppendOutcome::Committed(_) => db.commit().await.context("Failed to commit")?,
            _ => db.rollback().await.context("Failed to roll back")?,
        }

        Ok(outcome)
    }

    /// Claim the next sequence number. Called first in every write so SQLite
    /// takes its write lock before anything is read.
    async fn claim_sequence(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'ledger_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *conn)
        .await
        .context("Failed to get next sequence number")?;

        Ok(row.get("value"))
    }

    async fn apply_transaction(
        conn: &mut SqliteConnection,
        tx: &mut LedgerTransaction,
        sequence: i64,
    ) -> Result<AppendOutcome> {
        if let Some(existing) =
            Self::find_by_idempotency_key(conn, tx.vehicle_id, &tx.idempotency_key).await?
        {
            return Ok(AppendOutcome::Replayed(existing));
        }

        let vehicle_id = tx.vehicle_id.to_string();

        match &tx.movement {
            Movement::AllocateGeneric { amount } => {
                let result = sqlx::query(
                    r#"
                    UPDATE vehicles SET generic_balance = generic_balance + ?
                    WHERE id = ? AND generic_balance <= ? - ?
                    "#,
                )
                .bind(amount)
                .bind(&vehicle_id)
                .bind(Units::MAX)
                .bind(amount)
                .execute(&mut *conn)
                .await
                .context("Failed to credit generic balance")?;

                if result.rows_affected() == 0 {
                    let Some(balance) = Self::read_generic_balance(conn, &vehicle_id).await? else {
                        bail!("Vehicle {} vanished during allocation", vehicle_id);
                    };
                    return Ok(AppendOutcome::Overflow {
                        balance,
                        amount: *amount,
                    });
                }
            }
            Movement::AllocateRight {
                service_type,
                count,
            } => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO right_balances (vehicle_id, service_type, balance)
                    VALUES (?, ?, ?)
                    ON CONFLICT(vehicle_id, service_type) DO UPDATE SET balance = balance + excluded.balance
                    WHERE balance <= ? - excluded.balance
                    "#,
                )
                .bind(&vehicle_id)
                .bind(service_type)
                .bind(count)
                .bind(Units::MAX)
                .execute(&mut *conn)
                .await
                .context("Failed to credit right balance")?;

                if result.rows_affected() == 0 {
                    let balance = Self::read_right_balance(conn, &vehicle_id, service_type).await?;
                    return Ok(AppendOutcome::Overflow {
                        balance,
                        amount: *count,
                    });
                }
            }
            Movement::SpendGeneric { amount, .. } => {
                let result = sqlx::query(
                    r#"
                    UPDATE vehicles SET generic_balance = generic_balance - ?
                    WHERE id = ? AND generic_balance >= ?
                    "#,
                )
                .bind(amount)
                .bind(&vehicle_id)
                .bind(amount)
                .execute(&mut *conn)
                .await
                .context("Failed to debit generic balance")?;

                if result.rows_affected() == 0 {
                    let available = Self::read_generic_balance(conn, &vehicle_id)
                        .await?
                        .unwrap_or(0);
                    return Ok(AppendOutcome::Insufficient {
                        available,
                        required: *amount,
                    });
                }
            }
            Movement::SpendRight {
                service_type,
                count,
                ..
            } => {
                let result = sqlx::query(
                    r#"
                    UPDATE right_balances SET balance = balance - ?
                    WHERE vehicle_id = ? AND service_type = ? AND balance >= ?
                    "#,
                )
                .bind(count)
                .bind(&vehicle_id)
                .bind(service_type)
                .bind(count)
                .execute(&mut *conn)
                .await
                .context("Failed to debit right balance")?;

                if result.rows_affected() == 0 {
                    let available = Self::read_right_balance(conn, &vehicle_id, service_type).await?;
                    return Ok(AppendOutcome::Insufficient {
                        available,
                        required: *count,
                    });
                }
            }
        }

        // Stamped under the write lock so timestamps follow sequence order
        tx.created_at = Self::commit_timestamp(conn).await?;
        tx.sequence = sequence;
        Self::insert_transaction(conn, tx).await?;

        Ok(AppendOutcome::Committed(tx.clone()))
    }

    /// Current time, but never earlier than the newest logged transaction.
    async fn commit_timestamp(conn: &mut SqliteConnection) -> Result<DateTime<Utc>> {
        let last: Option<String> = sqlx::query_scalar(
            "SELECT created_at FROM ledger_transactions ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read latest timestamp")?;

        let now = crate::domain::now();
        match last {
            Some(last) => {
                let last = parse_timestamp(&last).context("Invalid created_at timestamp")?;
                Ok(now.max(last))
            }
            None => Ok(now),
        }
    }

    async fn read_generic_balance(
        conn: &mut SqliteConnection,
        vehicle_id: &str,
    ) -> Result<Option<Units>> {
        sqlx::query("SELECT generic_balance FROM vehicles WHERE id = ?")
            .bind(vehicle_id)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to read generic balance")?
            .map(|row| row.try_get("generic_balance"))
            .transpose()
            .context("Invalid generic balance")
    }

    async fn read_right_balance(
        conn: &mut SqliteConnection,
        vehicle_id: &str,
        service_type: &str,
    ) -> Result<Units> {
        let balance = sqlx::query(
            "SELECT balance FROM right_balances WHERE vehicle_id = ? AND service_type = ?",
        )
        .bind(vehicle_id)
        .bind(service_type)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read right balance")?
        .map(|row| row.try_get("balance"))
        .transpose()
        .context("Invalid right balance")?;

        Ok(balance.unwrap_or(0))
    }

    async fn insert_transaction(conn: &mut SqliteConnection, tx: &LedgerTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (id, sequence, vehicle_id, kind, service_type, amount, service_center, description, actor_id, actor_role, created_at, idempotency_key)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tx.id.to_string())
        .bind(tx.sequence)
        .bind(tx.vehicle_id.to_string())
        .bind(tx.kind().as_str())
        .bind(tx.movement.service_type())
        .bind(tx.delta())
        .bind(tx.movement.service_center())
        .bind(&tx.description)
        .bind(&tx.actor_id)
        .bind(tx.actor_role.as_str())
        .bind(format_timestamp(tx.created_at))
        .bind(&tx.idempotency_key)
        .execute(&mut *conn)
        .await
        .context("Failed to save transaction")?;
        Ok(())
    }

    async fn find_by_idempotency_key(
        conn: &mut SqliteConnection,
        vehicle_id: VehicleId,
        key: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let query = format!(
            "SELECT {} FROM ledger_transactions WHERE vehicle_id = ? AND idempotency_key = ?",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(vehicle_id.to_string())
            .bind(key)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to look up idempotency key")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// Look up a vehicle's transaction by idempotency key.
    pub async fn find_transaction_by_key(
        &self,
        vehicle_id: VehicleId,
        key: &str,
    ) -> Result<Option<LedgerTransaction>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::find_by_idempotency_key(&mut conn, vehicle_id, key).await
    }

    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<LedgerTransaction>> {
        let query = format!(
            "SELECT {} FROM ledger_transactions WHERE id = ?",
            TRANSACTION_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transaction")?;

        row.as_ref().map(Self::row_to_transaction).transpose()
    }

    /// List a vehicle's transactions, newest first, with optional filters.
    pub async fn list_transactions(
        &self,
        vehicle_id: VehicleId,
        kinds: &[TransactionKind],
        from_date: Option<DateTime<Utc>>,
        to_date: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LedgerTransaction>> {
        let mut query = format!(
            "SELECT {} FROM ledger_transactions WHERE vehicle_id = ?",
            TRANSACTION_COLUMNS
        );

        let from_date_str = from_date.map(format_timestamp);
        let to_date_str = to_date.map(format_timestamp);

        if !kinds.is_empty() {
            let placeholders = vec!["?"; kinds.len()].join(", ");
            query.push_str(&format!(" AND kind IN ({})", placeholders));
        }
        if from_date.is_some() {
            query.push_str(" AND created_at >= ?");
        }
        if to_date.is_some() {
            query.push_str(" AND created_at <= ?");
        }

        query.push_str(" ORDER BY sequence DESC");

        if let Some(lim) = limit {
            query.push_str(&format!(" LIMIT {}", lim));
        }

        let mut sql_query = sqlx::query(&query).bind(vehicle_id.to_string());
        for kind in kinds {
            sql_query = sql_query.bind(kind.as_str());
        }
        if let Some(ref fd_str) = from_date_str {
            sql_query = sql_query.bind(fd_str);
        }
        if let Some(ref td_str) = to_date_str {
            sql_query = sql_query.bind(td_str);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// Every transaction in the ledger, in commit order.
    pub async fn list_all_transactions(&self) -> Result<Vec<LedgerTransaction>> {
        let query = format!(
            "SELECT {} FROM ledger_transactions ORDER BY sequence",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list transactions")?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<LedgerTransaction> {
        let id_str: String = row.get("id");
        let vehicle_str: String = row.get("vehicle_id");
        let kind: String = row.get("kind");
        let role_str: String = row.get("actor_role");
        let created_at_str: String = row.get("created_at");

        let amount: Units = row.try_get("amount").context("Invalid transaction amount")?;

        let movement = Movement::from_parts(
            &kind,
            row.get("service_type"),
            amount,
            row.get("service_center"),
        )
        .with_context(|| format!("Invalid movement in transaction {}", id_str))?;

        Ok(LedgerTransaction {
            id: Uuid::parse_str(&id_str).context("Invalid transaction ID")?,
            sequence: row.get("sequence"),
            vehicle_id: Uuid::parse_str(&vehicle_str).context("Invalid vehicle ID")?,
            movement,
            description: row.get("description"),
            actor_id: row.get("actor_id"),
            actor_role: Role::from_str(&role_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid actor role: {}", role_str))?,
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
            idempotency_key: row.get("idempotency_key"),
        })
    }

    // ========================
    // QR tokens
    // ========================

    pub async fn save_token(&self, token: &QrToken) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO qr_tokens (token, vehicle_id, service_type, amount, issued_by, issued_at, expires_at, consumed_at, transaction_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            "#,
        )
        .bind(&token.token)
        .bind(token.vehicle_id.to_string())
        .bind(token.target.service_type())
        .bind(token.amount)
        .bind(&token.issued_by)
        .bind(format_timestamp(token.issued_at))
        .bind(format_timestamp(token.expires_at))
        .execute(&self.pool)
        .await
        .context("Failed to save token")?;
        Ok(())
    }

    pub async fn get_token(&self, token: &str) -> Result<Option<QrToken>> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        Self::fetch_token(&mut conn, token).await
    }

    async fn fetch_token(conn: &mut SqliteConnection, token: &str) -> Result<Option<QrToken>> {
        let query = format!("SELECT {} FROM qr_tokens WHERE token = ?", TOKEN_COLUMNS);
        let row = sqlx::query(&query)
            .bind(token)
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to fetch token")?;

        row.as_ref().map(Self::row_to_token).transpose()
    }

    /// Redeem a token: spend and mark consumed in one storage transaction.
    /// If the spend is refused, the token stays untouched.
    pub async fn redeem_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
        service_center: &str,
        actor: &Actor,
    ) -> Result<RedeemOutcome> {
        let mut db = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        let sequence = Self::claim_sequence(&mut db).await?;

        let Some(mut qr) = Self::fetch_token(&mut db, token).await? else {
            db.rollback().await.context("Failed to roll back")?;
            return Ok(RedeemOutcome::NotFound);
        };

        if let Err(rejection) = qr.ensure_redeemable(now) {
            db.rollback().await.context("Failed to roll back")?;
            return Ok(RedeemOutcome::Rejected(rejection));
        }

        let mut tx = qr.spend_transaction(service_center.to_string(), actor);
        let transaction = match Self::apply_transaction(&mut db, &mut tx, sequence).await? {
            AppendOutcome::Committed(tx) => tx,
            AppendOutcome::Replayed(existing) => {
                // Nothing was appended; hand the claimed number back
                sqlx::query(
                    "UPDATE sequence_counter SET value = value - 1 WHERE name = 'ledger_sequence'",
                )
                .execute(&mut *db)
                .await
                .context("Failed to release sequence number")?;
                existing
            }
            AppendOutcome::Insufficient {
                available,
                required,
            } => {
                db.rollback().await.context("Failed to roll back")?;
                return Ok(RedeemOutcome::Insufficient {
                    available,
                    required,
                });
            }
            AppendOutcome::Overflow { .. } => {
                db.rollback().await.context("Failed to roll back")?;
                bail!("Token {} spend reported a credit overflow", token);
            }
        };

        let result = sqlx::query(
            "UPDATE qr_tokens SET consumed_at = ?, transaction_id = ? WHERE token = ? AND consumed_at IS NULL",
        )
        .bind(format_timestamp(now))
        .bind(transaction.id.to_string())
        .bind(token)
        .execute(&mut *db)
        .await
        .context("Failed to mark token consumed")?;

        if result.rows_affected() != 1 {
            bail!("Token {} was consumed concurrently", token);
        }

        db.commit().await.context("Failed to commit")?;

        qr.consumed_at = Some(now);
        qr.transaction_id = Some(transaction.id);
        Ok(RedeemOutcome::Redeemed {
            token: qr,
            transaction,
        })
    }

    fn row_to_token(row: &sqlx::sqlite::SqliteRow) -> Result<QrToken> {
        let vehicle_str: String = row.get("vehicle_id");
        let service_type: Option<String> = row.get("service_type");
        let issued_at_str: String = row.get("issued_at");
        let expires_at_str: String = row.get("expires_at");
        let consumed_at_str: Option<String> = row.get("consumed_at");
        let transaction_str: Option<String> = row.get("transaction_id");

        Ok(QrToken {
            token: row.get("token"),
            vehicle_id: Uuid::parse_str(&vehicle_str).context("Invalid vehicle ID")?,
            target: match service_type {
                Some(service_type) => SpendTarget::Right(service_type),
                None => SpendTarget::Generic,
            },
            amount: row.try_get("amount").context("Invalid token amount")?,
            issued_by: row.get("issued_by"),
            issued_at: parse_timestamp(&issued_at_str).context("Invalid issued_at timestamp")?,
            expires_at: parse_timestamp(&expires_at_str).context("Invalid expires_at timestamp")?,
            consumed_at: consumed_at_str
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .context("Invalid consumed_at timestamp")?,
            transaction_id: transaction_str
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()
                .context("Invalid transaction ID")?,
        })
    }

    // ========================
    // Integrity
    // ========================

    /// Get statistics for integrity checking.
    pub async fn get_integrity_stats(&self) -> Result<IntegrityStats> {
        let vehicle_count: i64 = sqlx::query("SELECT COUNT(*) as count FROM vehicles")
            .fetch_one(&self.pool)
            .await?
            .get("count");

        let transaction_count: i64 = sqlx::query("SELECT COUNT(*) as count FROM ledger_transactions")
            .fetch_one(&self.pool)
            .await?
            .get("count");

        let sequence_check = sqlx::query(
            r#"
            SELECT
                MIN(sequence) as min_seq,
                MAX(sequence) as max_seq,
                COUNT(*) as count
            FROM ledger_transactions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let min_seq: Option<i64> = sequence_check.get("min_seq");
        let max_seq: Option<i64> = sequence_check.get("max_seq");
        let count: i64 = sequence_check.get("count");

        let has_sequence_gaps = match (min_seq, max_seq) {
            (Some(min), Some(max)) => (max - min + 1) != count,
            _ => false,
        };

        let duplicate_idempotency_keys: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM (
                SELECT 1 FROM ledger_transactions
                GROUP BY vehicle_id, idempotency_key
                HAVING COUNT(*) > 1
            )
            "#,
        )
        .fetch_one(&self.pool)
        .await?
        .get("count");

        Ok(IntegrityStats {
            vehicle_count,
            transaction_count,
            has_sequence_gaps,
            duplicate_idempotency_keys,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
