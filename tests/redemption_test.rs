mod common;

use anyhow::Result;
use chrono::Duration;
use common::{CENTER, Fleet, second_engine, test_engine};
use fleet_ledger::application::{LedgerError, QrRedemption};
use fleet_ledger::domain::{Actor, HistoryFilter, SpendTarget, TokenState, TransactionKind, now};
use uuid::Uuid;

#[tokio::test]
async fn test_token_redeems_exactly_once() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 100).await?;
    let qr = QrRedemption::new(&engine);

    let token = qr
        .issue(&fleet.driver, fleet.vehicle_id, SpendTarget::Generic, 30, None)
        .await?;
    assert_eq!(token.state_at(now()), TokenState::Issued);

    let tx = qr.redeem(&fleet.operator, &token.token, CENTER).await?;
    assert_eq!(tx.kind(), TransactionKind::Spend);
    assert_eq!(tx.delta(), -30);
    assert_eq!(tx.idempotency_key, format!("qr:{}", token.token));

    let err = qr
        .redeem(&fleet.operator, &token.token, CENTER)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::TokenAlreadyConsumed { .. }));

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 70);

    let stored = qr.get_token(&fleet.driver, &token.token).await?;
    assert_eq!(stored.transaction_id, Some(tx.id));
    assert_eq!(stored.state_at(now()), TokenState::Consumed);

    Ok(())
}

#[tokio::test]
async fn test_expired_token_is_refused() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 100).await?;
    let qr = QrRedemption::new(&engine);

    let token = qr
        .issue(
            &fleet.driver,
            fleet.vehicle_id,
            SpendTarget::Generic,
            10,
            Some(Duration::minutes(5)),
        )
        .await?;

    let err = qr
        .redeem_at(
            &fleet.operator,
            &token.token,
            CENTER,
            token.issued_at + Duration::minutes(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::TokenExpired { expires_at } if expires_at == token.expires_at));

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 100);

    // Still fine right at the expiry instant
    qr.redeem_at(&fleet.operator, &token.token, CENTER, token.expires_at)
        .await?;

    Ok(())
}

#[tokio::test]
async fn test_refused_spend_leaves_token_usable() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;
    let qr = QrRedemption::new(&engine);

    engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "wash_premium", 1, "r1", None)
        .await?;

    let token = qr
        .issue(
            &fleet.driver,
            fleet.vehicle_id,
            SpendTarget::Right("wash_premium".into()),
            2,
            None,
        )
        .await?;

    let err = qr
        .redeem(&fleet.operator, &token.token, CENTER)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            available: 1,
            required: 2,
            ..
        }
    ));

    let stored = qr.get_token(&fleet.driver, &token.token).await?;
    assert_eq!(stored.consumed_at, None);

    engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "wash_premium", 1, "r2", None)
        .await?;
    qr.redeem(&fleet.operator, &token.token, CENTER).await?;

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.right("wash_premium"), 0);

    let usage = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::Usage)
        .await?;
    assert_eq!(usage.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_unknown_token() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;
    let qr = QrRedemption::new(&engine);

    let err = qr
        .redeem(&fleet.operator, "not-a-token", CENTER)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::TokenNotFound(ref t) if t == "not-a-token"));

    Ok(())
}

#[tokio::test]
async fn test_issue_validates_request() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;
    let qr = QrRedemption::new(&engine);

    let err = qr
        .issue(&fleet.driver, fleet.vehicle_id, SpendTarget::Generic, 0, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(0)));

    let err = qr
        .issue(
            &fleet.driver,
            fleet.vehicle_id,
            SpendTarget::Right("teleport".into()),
            1,
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnknownServiceType(_)));

    // A driver of another company can't issue against this vehicle
    let outsider = fleet_ledger::domain::Actor::driver("driver-9", Uuid::new_v4());
    let err = qr
        .issue(&outsider, fleet.vehicle_id, SpendTarget::Generic, 1, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden { .. }));

    // Nor can a driver redeem
    let token = qr
        .issue(&fleet.driver, fleet.vehicle_id, SpendTarget::Generic, 1, None)
        .await?;
    let err = qr
        .redeem(&fleet.driver, &token.token, CENTER)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Forbidden { .. }));

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_centers_race_for_one_token() -> Result<()> {
    let (engine_a, temp) = test_engine().await?;
    let engine_b = second_engine(&temp).await?;
    let fleet = Fleet::with_credits(&engine_a, 100).await?;

    let token = QrRedemption::new(&engine_a)
        .issue(&fleet.driver, fleet.vehicle_id, SpendTarget::Generic, 30, None)
        .await?;

    let north = Actor::operator("north-desk");
    let south = Actor::operator("south-desk");
    let redemption_a = QrRedemption::new(&engine_a);
    let redemption_b = QrRedemption::new(&engine_b);
    let (at_north, at_south) = tokio::join!(
        redemption_a.redeem(&north, &token.token, "center-north"),
        redemption_b.redeem(&south, &token.token, "center-south"),
    );

    let (won, lost) = match (at_north, at_south) {
        (Ok(tx), Err(err)) | (Err(err), Ok(tx)) => (tx, err),
        (a, b) => panic!("expected exactly one redemption, got {a:?} and {b:?}"),
    };
    assert!(matches!(lost, LedgerError::TokenAlreadyConsumed { .. }), "{lost:?}");
    assert_eq!(won.delta(), -30);

    let usage = engine_b
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::Usage)
        .await?;
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].id, won.id);

    let balance = engine_a.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 70);

    let report = engine_a.check_integrity(&Actor::system()).await?;
    assert!(report.is_healthy(), "{report:?}");

    Ok(())
}

#[tokio::test]
async fn test_issue_refuses_unusable_lifetimes() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 100).await?;
    let qr = QrRedemption::new(&engine);

    for ttl in [Duration::zero(), Duration::seconds(-90)] {
        let err = qr
            .issue(&fleet.driver, fleet.vehicle_id, SpendTarget::Generic, 10, Some(ttl))
            .await
            .unwrap_err();
        assert!(
            matches!(err, LedgerError::InvalidTtl { seconds } if seconds == ttl.num_seconds()),
            "{err:?}"
        );
    }

    // A far-future expiry is refused rather than wrapping around
    let err = qr
        .issue(
            &fleet.driver,
            fleet.vehicle_id,
            SpendTarget::Generic,
            10,
            Some(Duration::days(365 * 300_000)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidTtl { .. }), "{err:?}");

    Ok(())
}
