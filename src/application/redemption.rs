use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, instrument};

use crate::domain::{Actor, LedgerTransaction, Operation, QrToken, SpendTarget, Units, VehicleId};
use crate::storage::RedeemOutcome;

use super::{LedgerEngine, LedgerError};

/// QR vouchers on top of the ledger: a driver issues a token, a service
/// center redeems it once, and the redemption becomes a spend.
pub struct QrRedemption<'a> {
    engine: &'a LedgerEngine,
}

impl<'a> QrRedemption<'a> {
    pub fn new(engine: &'a LedgerEngine) -> Self {
        Self { engine }
    }

    /// Issue a token for `amount` units of `target`. Balance is not checked
    /// here; it is checked when the token is redeemed.
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn issue(
        &self,
        actor: &Actor,
        vehicle_id: VehicleId,
        target: SpendTarget,
        amount: Units,
        ttl: Option<Duration>,
    ) -> Result<QrToken, LedgerError> {
        let vehicle = self
            .engine
            .authorize_vehicle(actor, Operation::IssueToken, vehicle_id)
            .await?;
        if !vehicle.is_active() {
            return Err(LedgerError::VehicleDeactivated(vehicle_id));
        }
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if let Some(service_type) = target.service_type() {
            self.engine.catalog().get(service_type)?;
        }

        let ttl = match ttl {
            Some(ttl) => ttl,
            None => {
                let config = self.engine.config();
                config.default_token_ttl().ok_or(LedgerError::InvalidTtl {
                    seconds: config.default_token_ttl_secs,
                })?
            }
        };
        let token = QrToken::issue(vehicle_id, target, amount, actor, ttl)?;
        self.engine.repo().save_token(&token).await?;

        info!(%vehicle_id, expires_at = %token.expires_at, "token issued");
        Ok(token)
    }

    /// Redeem a token now.
    pub async fn redeem(
        &self,
        actor: &Actor,
        token: &str,
        service_center: &str,
    ) -> Result<LedgerTransaction, LedgerError> {
        self.redeem_at(actor, token, service_center, crate::domain::now())
            .await
    }

    /// Redeem a token as of `now`. The spend and the consumed mark commit
    /// together; a refused spend leaves the token usable until it expires.
    #[instrument(skip(self, actor, token), fields(actor = %actor.id))]
    pub async fn redeem_at(
        &self,
        actor: &Actor,
        token: &str,
        service_center: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerTransaction, LedgerError> {
        self.engine.authorize(actor, Operation::RedeemToken)?;
        self.engine.validate_service_center(service_center).await?;

        let qr = self
            .engine
            .repo()
            .get_token(token)
            .await?
            .ok_or_else(|| LedgerError::TokenNotFound(token.to_string()))?;
        let vehicle_id = qr.vehicle_id;

        // Re-checked under the lock; this just avoids queueing for a dead token
        qr.ensure_redeemable(now)?;

        let _guard = self.engine.lock(vehicle_id).await?;
        self.engine
            .ensure_active(vehicle_id, &qr.idempotency_key())
            .await?;

        let outcome = self
            .engine
            .repo()
            .redeem_token(token, now, service_center, actor)
            .await
            .inspect_err(|e| error!(%vehicle_id, error = %e, "token redemption failed"))?;

        match outcome {
            RedeemOutcome::Redeemed { transaction, .. } => {
                info!(
                    %vehicle_id,
                    transaction_id = %transaction.id,
                    service_center,
                    "token redeemed"
                );
                Ok(transaction)
            }
            RedeemOutcome::NotFound => Err(LedgerError::TokenNotFound(token.to_string())),
            RedeemOutcome::Rejected(rejection) => {
                debug!(%vehicle_id, %rejection, "token rejected");
                Err(rejection.into())
            }
            RedeemOutcome::Insufficient {
                available,
                required,
            } => {
                debug!(%vehicle_id, available, required, "token redemption refused");
                Err(LedgerError::InsufficientBalance {
                    vehicle_id,
                    dimension: qr.target.dimension(),
                    available,
                    required,
                })
            }
        }
    }

    /// Look up a token, e.g. to show its state on the driver's screen.
    pub async fn get_token(&self, actor: &Actor, token: &str) -> Result<QrToken, LedgerError> {
        let qr = self
            .engine
            .repo()
            .get_token(token)
            .await?
            .ok_or_else(|| LedgerError::TokenNotFound(token.to_string()))?;

        self.engine
            .authorize_vehicle(actor, Operation::ReadAccount, qr.vehicle_id)
            .await?;
        Ok(qr)
    }
}
