use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Actor, BalanceDimension, LedgerTransaction, Movement, ServiceCenterId, TransactionId, Units,
    VehicleId,
};

/// What a QR token pays with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "service_type")]
pub enum SpendTarget {
    Generic,
    Right(String),
}

impl SpendTarget {
    pub fn service_type(&self) -> Option<&str> {
        match self {
            SpendTarget::Generic => None,
            SpendTarget::Right(service_type) => Some(service_type),
        }
    }

    pub fn dimension(&self) -> BalanceDimension {
        match self {
            SpendTarget::Generic => BalanceDimension::Generic,
            SpendTarget::Right(service_type) => BalanceDimension::Right(service_type.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Issued,
    Consumed,
    Expired,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Issued => "issued",
            TokenState::Consumed => "consumed",
            TokenState::Expired => "expired",
        }
    }
}

impl std::fmt::Display for TokenState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a token can't be redeemed right now.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Token already consumed at {consumed_at}")]
    AlreadyConsumed { consumed_at: DateTime<Utc> },

    #[error("Token expired at {expires_at}")]
    Expired { expires_at: DateTime<Utc> },

    #[error("Invalid token lifetime: {seconds}s")]
    InvalidTtl { seconds: i64 },
}

/// Single-use voucher a driver shows at a service center.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrToken {
    pub token: String,
    pub vehicle_id: VehicleId,
    pub target: SpendTarget,
    pub amount: Units,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub transaction_id: Option<TransactionId>,
}

impl QrToken {
    pub fn issue(
        vehicle_id: VehicleId,
        target: SpendTarget,
        amount: Units,
        issued_by: &Actor,
        ttl: Duration,
    ) -> Result<Self, TokenError> {
        assert!(amount > 0, "Token amount must be positive");
        let invalid = TokenError::InvalidTtl {
            seconds: ttl.num_seconds(),
        };
        if ttl <= Duration::zero() {
            return Err(invalid);
        }

        let issued_at = super::now();
        let expires_at = issued_at.checked_add_signed(ttl).ok_or(invalid)?;
        Ok(Self {
            token: Uuid::new_v4().simple().to_string(),
            vehicle_id,
            target,
            amount,
            issued_by: issued_by.id.clone(),
            issued_at,
            expires_at,
            consumed_at: None,
            transaction_id: None,
        })
    }

    /// Consumed wins over expired: a used token stays used.
    pub fn state_at(&self, now: DateTime<Utc>) -> TokenState {
        if self.consumed_at.is_some() {
            TokenState::Consumed
        } else if now > self.expires_at {
            TokenState::Expired
        } else {
            TokenState::Issued
        }
    }

    pub fn ensure_redeemable(&self, now: DateTime<Utc>) -> Result<(), TokenError> {
        if let Some(consumed_at) = self.consumed_at {
            return Err(TokenError::AlreadyConsumed { consumed_at });
        }
        if now > self.expires_at {
            return Err(TokenError::Expired {
                expires_at: self.expires_at,
            });
        }
        Ok(())
    }

    /// Idempotency key of the spend a redemption produces.
    pub fn idempotency_key(&self) -> String {
        format!("qr:{}", self.token)
    }

    /// Build the spend this token turns into at `service_center`.
    pub fn spend_transaction(
        &self,
        service_center: ServiceCenterId,
        actor: &Actor,
    ) -> LedgerTransaction {
        let movement = match &self.target {
            SpendTarget::Generic => Movement::SpendGeneric {
                amount: self.amount,
                service_center,
            },
            SpendTarget::Right(service_type) => Movement::SpendRight {
                service_type: service_type.clone(),
                count: self.amount,
                service_center,
            },
        };

        let tx = LedgerTransaction::new(self.vehicle_id, movement, actor, self.idempotency_key());
        let description = format!("QR redemption: {}", tx.description);
        tx.with_description(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(ttl_minutes: i64) -> QrToken {
        QrToken::issue(
            Uuid::new_v4(),
            SpendTarget::Right("wash_standard".into()),
            1,
            &Actor::system(),
            Duration::minutes(ttl_minutes),
        )
        .unwrap()
    }

    #[test]
    fn test_fresh_token_is_redeemable() {
        let token = token(15);
        assert_eq!(token.state_at(token.issued_at), TokenState::Issued);
        assert!(token.ensure_redeemable(token.issued_at).is_ok());
        // Expiry instant itself is still valid
        assert!(token.ensure_redeemable(token.expires_at).is_ok());
    }

    #[test]
    fn test_expired_token() {
        let token = token(15);
        let later = token.expires_at + Duration::seconds(1);

        assert_eq!(token.state_at(later), TokenState::Expired);
        assert_eq!(
            token.ensure_redeemable(later),
            Err(TokenError::Expired {
                expires_at: token.expires_at
            })
        );
    }

    #[test]
    fn test_consumed_wins_over_expired() {
        let mut token = token(15);
        token.consumed_at = Some(token.issued_at);
        let later = token.expires_at + Duration::hours(1);

        assert_eq!(token.state_at(later), TokenState::Consumed);
        assert!(matches!(
            token.ensure_redeemable(later),
            Err(TokenError::AlreadyConsumed { .. })
        ));
    }

    #[test]
    fn test_spend_transaction_matches_target() {
        let token = token(15);
        let tx = token.spend_transaction("center-9".into(), &Actor::operator("op-1"));

        assert_eq!(tx.vehicle_id, token.vehicle_id);
        assert_eq!(tx.idempotency_key, format!("qr:{}", token.token));
        assert_eq!(
            tx.movement,
            Movement::SpendRight {
                service_type: "wash_standard".into(),
                count: 1,
                service_center: "center-9".into(),
            }
        );
        assert!(tx.description.starts_with("QR redemption"));
    }

    #[test]
    fn test_issue_rejects_unusable_ttl() {
        let issue = |ttl| {
            QrToken::issue(
                Uuid::new_v4(),
                SpendTarget::Generic,
                1,
                &Actor::system(),
                ttl,
            )
        };

        assert_eq!(
            issue(Duration::zero()).unwrap_err(),
            TokenError::InvalidTtl { seconds: 0 }
        );
        assert_eq!(
            issue(Duration::seconds(-30)).unwrap_err(),
            TokenError::InvalidTtl { seconds: -30 }
        );
        assert!(matches!(
            issue(Duration::days(365 * 300_000)).unwrap_err(),
            TokenError::InvalidTtl { .. }
        ));
    }

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(token(1).token, token(1).token);
    }
}
