use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::domain::{
    Actor, Balance, CompanyId, HistoryFilter, IntegrityReport, LedgerTransaction, Movement,
    Operation, ServiceCatalog, Units, VehicleAccount, VehicleId, build_integrity_report,
    compute_all_balances, compute_balance,
};
use crate::storage::{AppendOutcome, Repository};

use super::LedgerError;
use super::locks::{VehicleGuard, VehicleLocks};

/// The rights and credit ledger. Sole writer of balances and transactions;
/// every entry point checks the caller's role first.
pub struct LedgerEngine {
    repo: Repository,
    catalog: Arc<ServiceCatalog>,
    locks: VehicleLocks,
    config: LedgerConfig,
}

/// Narrowing for history reads.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub filter: HistoryFilter,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new(filter: HistoryFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }
}

impl LedgerEngine {
    /// Create an engine over an already-migrated repository.
    pub fn new(repo: Repository, catalog: Arc<ServiceCatalog>, config: LedgerConfig) -> Self {
        Self {
            repo,
            catalog,
            locks: VehicleLocks::new(config.lock_timeout()),
            config,
        }
    }

    /// Open (creating if needed) and migrate the configured database.
    pub async fn init(config: LedgerConfig) -> Result<Self, LedgerError> {
        let repo = Repository::init(&config).await?;
        Ok(Self::new(repo, Arc::new(ServiceCatalog::standard()), config))
    }

    /// Open the configured database without migrating it.
    pub async fn connect(config: LedgerConfig) -> Result<Self, LedgerError> {
        let repo = Repository::connect(&config).await?;
        Ok(Self::new(repo, Arc::new(ServiceCatalog::standard()), config))
    }

    pub fn with_catalog(mut self, catalog: Arc<ServiceCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn catalog(&self) -> &ServiceCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub(crate) fn repo(&self) -> &Repository {
        &self.repo
    }

    // ========================
    // Authorization
    // ========================

    pub(crate) fn authorize(&self, actor: &Actor, operation: Operation) -> Result<(), LedgerError> {
        if operation.permits(actor.role) {
            Ok(())
        } else {
            debug!(actor = %actor.id, role = %actor.role, %operation, "operation denied");
            Err(LedgerError::Forbidden {
                role: actor.role,
                operation,
            })
        }
    }

    /// Role check plus company scope against the vehicle's owner.
    pub(crate) async fn authorize_vehicle(
        &self,
        actor: &Actor,
        operation: Operation,
        vehicle_id: VehicleId,
    ) -> Result<VehicleAccount, LedgerError> {
        self.authorize(actor, operation)?;

        let vehicle = self
            .repo
            .get_vehicle(vehicle_id)
            .await?
            .ok_or(LedgerError::VehicleNotFound(vehicle_id))?;

        if !actor.can_access_company(vehicle.company_id) {
            debug!(actor = %actor.id, %vehicle_id, %operation, "vehicle outside actor's company");
            return Err(LedgerError::Forbidden {
                role: actor.role,
                operation,
            });
        }

        Ok(vehicle)
    }

    pub(crate) async fn lock(&self, vehicle_id: VehicleId) -> Result<VehicleGuard, LedgerError> {
        self.locks.acquire(vehicle_id).await.ok_or_else(|| {
            debug!(%vehicle_id, "vehicle lock wait exceeded");
            LedgerError::Busy {
                vehicle_id,
                waited: self.locks.timeout(),
            }
        })
    }

    pub(crate) async fn validate_service_center(&self, id: &str) -> Result<(), LedgerError> {
        if id.trim().is_empty() {
            return Err(LedgerError::UnknownServiceCenter(id.to_string()));
        }
        if self.config.validate_service_centers && !self.repo.service_center_exists(id).await? {
            return Err(LedgerError::UnknownServiceCenter(id.to_string()));
        }
        Ok(())
    }

    fn ensure_positive(units: Units) -> Result<(), LedgerError> {
        if units <= 0 {
            return Err(LedgerError::InvalidAmount(units));
        }
        Ok(())
    }

    // ========================
    // Vehicle operations
    // ========================

    /// Register a vehicle to a company with empty balances.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn register_vehicle(
        &self,
        actor: &Actor,
        company_id: CompanyId,
        label: String,
    ) -> Result<VehicleAccount, LedgerError> {
        self.authorize(actor, Operation::RegisterVehicle)?;
        if !actor.can_access_company(company_id) {
            return Err(LedgerError::Forbidden {
                role: actor.role,
                operation: Operation::RegisterVehicle,
            });
        }

        let vehicle = VehicleAccount::new(company_id, label);
        self.repo.save_vehicle(&vehicle).await?;

        info!(vehicle_id = %vehicle.id, "vehicle registered");
        Ok(vehicle)
    }

    /// Deactivate a vehicle. Its balances and history are kept for audit.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn deactivate_vehicle(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
    ) -> Result<VehicleAccount, LedgerError> {
        self.authorize_vehicle(actor, Operation::DeactivateVehicle, vehicle_id)
            .await?;

        let _guard = self.lock(vehicle_id).await?;
        self.repo
            .deactivate_vehicle(vehicle_id, crate::domain::now())
            .await?;

        info!(%vehicle_id, "vehicle deactivated");
        self.repo
            .get_vehicle(vehicle_id)
            .await?
            .ok_or(LedgerError::VehicleNotFound(vehicle_id))
    }

    pub async fn get_vehicle(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
    ) -> Result<VehicleAccount, LedgerError> {
        self.authorize_vehicle(actor, Operation::ReadAccount, vehicle_id)
            .await
    }

    /// List vehicles. Company-scoped actors only ever see their own company.
    pub async fn list_vehicles(
        &self,
        actor: &Actor,
        company_id: Option<CompanyId>,
    ) -> Result<Vec<VehicleAccount>, LedgerError> {
        self.authorize(actor, Operation::ReadAccount)?;

        let company_id = if actor.role.is_company_scoped() {
            match (actor.company_id, company_id) {
                (Some(own), None) => Some(own),
                (Some(own), Some(requested)) if own == requested => Some(own),
                _ => {
                    return Err(LedgerError::Forbidden {
                        role: actor.role,
                        operation: Operation::ReadAccount,
                    });
                }
            }
        } else {
            company_id
        };

        Ok(self.repo.list_vehicles(company_id).await?)
    }

    /// Add a service center to the directory used for spend validation.
    pub async fn register_service_center(
        &self,
        actor: &Actor,
        id: &str,
        name: &str,
    ) -> Result<(), LedgerError> {
        self.authorize(actor, Operation::RegisterServiceCenter)?;
        if id.trim().is_empty() {
            return Err(LedgerError::UnknownServiceCenter(id.to_string()));
        }
        self.repo.save_service_center(id, name).await?;
        info!(service_center = id, "service center registered");
        Ok(())
    }

    // ========================
    // Ledger writes
    // ========================

    /// Fund a vehicle with generic credits.
    #[instrument(skip(self, actor, description), fields(actor = %actor.id))]
    pub async fn allocate_generic(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        amount: Units,
        idempotency_key: &str,
        description: Option<String>,
    ) -> Result<LedgerTransaction, LedgerError> {
        self.authorize_vehicle(actor, Operation::AllocateGeneric, vehicle_id)
            .await?;
        Self::ensure_positive(amount)?;

        let tx = self.build(
            vehicle_id,
            Movement::AllocateGeneric { amount },
            actor,
            idempotency_key,
            description,
        );
        self.commit(tx).await
    }

    /// Grant `count` rights for one service type.
    #[instrument(skip(self, actor, description), fields(actor = %actor.id))]
    pub async fn allocate_right(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        service_type: &str,
        count: Units,
        idempotency_key: &str,
        description: Option<String>,
    ) -> Result<LedgerTransaction, LedgerError> {
        self.authorize_vehicle(actor, Operation::AllocateRight, vehicle_id)
            .await?;
        Self::ensure_positive(count)?;
        self.catalog.get(service_type)?;

        let tx = self.build(
            vehicle_id,
            Movement::AllocateRight {
                service_type: service_type.to_string(),
                count,
            },
            actor,
            idempotency_key,
            description,
        );
        self.commit(tx).await
    }

    /// Consume generic credits at a service center.
    #[instrument(skip(self, actor, description), fields(actor = %actor.id))]
    pub async fn spend_generic(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        amount: Units,
        service_center: &str,
        idempotency_key: &str,
        description: Option<String>,
    ) -> Result<LedgerTransaction, LedgerError> {
        self.authorize_vehicle(actor, Operation::SpendGeneric, vehicle_id)
            .await?;
        Self::ensure_positive(amount)?;
        self.validate_service_center(service_center).await?;

        let tx = self.build(
            vehicle_id,
            Movement::SpendGeneric {
                amount,
                service_center: service_center.to_string(),
            },
            actor,
            idempotency_key,
            description,
        );
        self.commit(tx).await
    }

    /// Consume rights of one service type at a service center.
    #[instrument(skip(self, actor, description), fields(actor = %actor.id))]
    pub async fn spend_right(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        service_type: &str,
        count: Units,
        service_center: &str,
        idempotency_key: &str,
        description: Option<String>,
    ) -> Result<LedgerTransaction, LedgerError> {
        self.authorize_vehicle(actor, Operation::SpendRight, vehicle_id)
            .await?;
        Self::ensure_positive(count)?;
        self.catalog.get(service_type)?;
        self.validate_service_center(service_center).await?;

        let tx = self.build(
            vehicle_id,
            Movement::SpendRight {
                service_type: service_type.to_string(),
                count,
                service_center: service_center.to_string(),
            },
            actor,
            idempotency_key,
            description,
        );
        self.commit(tx).await
    }

    fn build(
        &self,
        vehicle_id: VehicleId,
        movement: Movement,
        actor: &Actor,
        idempotency_key: &str,
        description: Option<String>,
    ) -> LedgerTransaction {
        // A blank key can't identify a retry; treat the request as one-off
        let key = if idempotency_key.trim().is_empty() {
            Uuid::new_v4().to_string()
        } else {
            idempotency_key.to_string()
        };

        let tx = LedgerTransaction::new(vehicle_id, movement, actor, key);
        match description {
            Some(description) => tx.with_description(description),
            None => tx,
        }
    }

    /// Apply a transaction while holding the vehicle's lock.
    async fn commit(&self, mut tx: LedgerTransaction) -> Result<LedgerTransaction, LedgerError> {
        let vehicle_id = tx.vehicle_id;
        let _guard = self.lock(vehicle_id).await?;

        self.ensure_active(vehicle_id, &tx.idempotency_key).await?;

        let outcome = self
            .repo
            .append_transaction(&mut tx)
            .await
            .inspect_err(|e| error!(%vehicle_id, error = %e, "ledger append failed"))?;

        match outcome {
            AppendOutcome::Committed(tx) => {
                info!(
                    %vehicle_id,
                    transaction_id = %tx.id,
                    sequence = tx.sequence,
                    kind = %tx.kind(),
                    delta = tx.delta(),
                    "transaction committed"
                );
                Ok(tx)
            }
            AppendOutcome::Replayed(existing) => {
                debug!(
                    %vehicle_id,
                    transaction_id = %existing.id,
                    key = %existing.idempotency_key,
                    "idempotent replay"
                );
                Ok(existing)
            }
            AppendOutcome::Insufficient {
                available,
                required,
            } => {
                debug!(%vehicle_id, available, required, "insufficient balance");
                Err(LedgerError::InsufficientBalance {
                    vehicle_id,
                    dimension: tx.dimension(),
                    available,
                    required,
                })
            }
            AppendOutcome::Overflow { balance, amount } => {
                debug!(%vehicle_id, balance, amount, "allocation would overflow");
                Err(LedgerError::BalanceOverflow {
                    vehicle_id,
                    dimension: tx.dimension(),
                    balance,
                    amount,
                })
            }
        }
    }

    /// Writes to deactivated vehicles are refused, except that a replay of
    /// something committed before deactivation still returns its result.
    pub(crate) async fn ensure_active(
        &self,
        vehicle_id: VehicleId,
        idempotency_key: &str,
    ) -> Result<(), LedgerError> {
        let vehicle = self
            .repo
            .get_vehicle(vehicle_id)
            .await?
            .ok_or(LedgerError::VehicleNotFound(vehicle_id))?;

        if vehicle.is_active() {
            return Ok(());
        }

        let replay = self
            .repo
            .find_transaction_by_key(vehicle_id, idempotency_key)
            .await?;

        if replay.is_some() {
            Ok(())
        } else {
            Err(LedgerError::VehicleDeactivated(vehicle_id))
        }
    }

    // ========================
    // Reads
    // ========================

    /// Current balances, read from the counters kept in step with the log.
    pub async fn current_balance(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
    ) -> Result<Balance, LedgerError> {
        self.authorize_vehicle(actor, Operation::ReadAccount, vehicle_id)
            .await?;
        Ok(self.repo.get_balance(vehicle_id).await?)
    }

    /// Balances as they stood at `at`, folded from the log.
    pub async fn balance_at(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        at: DateTime<Utc>,
    ) -> Result<Balance, LedgerError> {
        self.authorize_vehicle(actor, Operation::ReadAccount, vehicle_id)
            .await?;
        let transactions = self
            .repo
            .list_transactions(vehicle_id, &[], None, Some(at), None)
            .await?;
        Ok(compute_balance(&transactions)?)
    }

    /// Transactions of a vehicle, newest first.
    pub async fn history(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        filter: HistoryFilter,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        self.history_query(actor, vehicle_id, HistoryQuery::new(filter))
            .await
    }

    pub async fn history_query(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        query: HistoryQuery,
    ) -> Result<Vec<LedgerTransaction>, LedgerError> {
        self.authorize_vehicle(actor, Operation::ReadAccount, vehicle_id)
            .await?;
        Ok(self
            .repo
            .list_transactions(
                vehicle_id,
                query.filter.kinds(),
                query.from_date,
                query.to_date,
                query.limit,
            )
            .await?)
    }

    /// Reconcile every cached balance with the fold of the log.
    pub async fn check_integrity(&self, actor: &Actor) -> Result<IntegrityReport, LedgerError> {
        self.authorize(actor, Operation::CheckIntegrity)?;

        let stats = self.repo.get_integrity_stats().await?;
        let cached = self.repo.get_all_balances().await?;
        let transactions = self.repo.list_all_transactions().await?;
        let derived = compute_all_balances(&transactions)?;

        let report = build_integrity_report(
            &cached,
            &derived,
            stats.vehicle_count,
            stats.transaction_count,
            stats.has_sequence_gaps,
            stats.duplicate_idempotency_keys,
        );

        if !report.is_healthy() {
            error!(
                mismatches = report.mismatches.len(),
                negative = report.negative_balances.len(),
                gaps = report.has_sequence_gaps,
                "ledger integrity check failed"
            );
        }

        Ok(report)
    }
}
