mod common;

use std::time::Duration;

use anyhow::Result;
use common::{CENTER, Fleet, test_engine, test_engine_with};
use fleet_ledger::application::{HistoryQuery, LedgerError};
use fleet_ledger::domain::{BalanceDimension, HistoryFilter, TransactionKind, now};
use uuid::Uuid;

#[tokio::test]
async fn test_allocate_generic_credits() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;

    let tx = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 100, "fund-1", None)
        .await?;

    assert_eq!(tx.kind(), TransactionKind::Allocate);
    assert_eq!(tx.delta(), 100);
    assert_eq!(tx.sequence, 1);
    assert_eq!(tx.actor_id, "admin-1");

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 100);
    assert!(balance.rights.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_same_key_is_applied_once() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;

    let first = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 50, "batch-2024-05", None)
        .await?;
    let second = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 50, "batch-2024-05", None)
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(first.sequence, second.sequence);

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 50);

    let history = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::All)
        .await?;
    assert_eq!(history.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_replayed_spend_does_not_debit_twice() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 10).await?;

    for _ in 0..3 {
        engine
            .spend_generic(&fleet.operator, fleet.vehicle_id, 4, CENTER, "wash-ticket-77", None)
            .await?;
    }

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 6);

    Ok(())
}

#[tokio::test]
async fn test_blank_keys_are_distinct_requests() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;

    let first = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 5, "", None)
        .await?;
    let second = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 5, "  ", None)
        .await?;

    assert_ne!(first.id, second.id);
    assert_ne!(first.idempotency_key, second.idempotency_key);

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 10);

    Ok(())
}

#[tokio::test]
async fn test_spend_on_empty_balance_is_rejected() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;

    let err = engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 1, CENTER, "k1", None)
        .await
        .unwrap_err();

    match err {
        LedgerError::InsufficientBalance {
            vehicle_id,
            dimension,
            available,
            required,
        } => {
            assert_eq!(vehicle_id, fleet.vehicle_id);
            assert_eq!(dimension, BalanceDimension::Generic);
            assert_eq!(available, 0);
            assert_eq!(required, 1);
        }
        other => panic!("expected InsufficientBalance, got {other:?}"),
    }

    // Nothing was written
    let history = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::All)
        .await?;
    assert!(history.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_right_allocation_and_spend_round_trip() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;

    engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "tire_repair", 5, "rights-1", None)
        .await?;
    engine
        .spend_right(
            &fleet.operator,
            fleet.vehicle_id,
            "tire_repair",
            3,
            CENTER,
            "repair-1",
            Some("Front left puncture".to_string()),
        )
        .await?;

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.right("tire_repair"), 2);
    assert_eq!(balance.generic, 0);

    let history = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::All)
        .await?;
    assert_eq!(history.len(), 2);
    // Newest first
    assert_eq!(history[0].kind(), TransactionKind::Spend);
    assert_eq!(history[0].delta(), -3);
    assert_eq!(history[0].description, "Front left puncture");
    assert_eq!(history[0].movement.service_center(), Some(CENTER));
    assert_eq!(history[1].kind(), TransactionKind::RightAllocate);
    assert!(history[0].sequence > history[1].sequence);

    Ok(())
}

#[tokio::test]
async fn test_rights_do_not_cover_other_service_types() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 100).await?;

    engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "wash_standard", 2, "wash-rights", None)
        .await?;

    // Neither generic credits nor wash rights pay for a tire change
    let err = engine
        .spend_right(&fleet.operator, fleet.vehicle_id, "tire_change", 1, CENTER, "k", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance { ref dimension, available: 0, .. }
            if *dimension == BalanceDimension::Right("tire_change".into())
    ));

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 100);
    assert_eq!(balance.right("wash_standard"), 2);

    Ok(())
}

#[tokio::test]
async fn test_invalid_requests_are_rejected_before_writing() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 10).await?;

    let err = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 0, "zero", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(0)));

    let err = engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, -5, CENTER, "negative", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidAmount(-5)));

    let err = engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "car_polish", 1, "unknown", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnknownServiceType(ref s) if s == "car_polish"));

    let err = engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 1, "", "no-center", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnknownServiceCenter(_)));

    let err = engine
        .allocate_generic(&fleet.admin, Uuid::new_v4(), 10, "ghost", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VehicleNotFound(_)));

    let history = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::All)
        .await?;
    assert_eq!(history.len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_registered_service_centers_are_enforced_when_enabled() -> Result<()> {
    let (engine, _temp) = test_engine_with(|config| config.validate_service_centers = true).await?;
    let fleet = Fleet::with_credits(&engine, 10).await?;

    let err = engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 1, CENTER, "k1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::UnknownServiceCenter(ref id) if id == CENTER));

    engine
        .register_service_center(&fleet_ledger::domain::Actor::system(), CENTER, "Main St Garage")
        .await?;
    engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 1, CENTER, "k1", None)
        .await?;

    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 9);

    Ok(())
}

#[tokio::test]
async fn test_history_filters() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 100).await?;

    engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "wash_premium", 3, "r1", None)
        .await?;
    engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 20, CENTER, "s1", None)
        .await?;
    engine
        .spend_right(&fleet.operator, fleet.vehicle_id, "wash_premium", 1, CENTER, "s2", None)
        .await?;

    let allocations = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::Allocation)
        .await?;
    assert_eq!(allocations.len(), 2);
    assert!(allocations.iter().all(|tx| tx.movement.is_allocation()));

    let usage = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::Usage)
        .await?;
    assert_eq!(usage.len(), 2);
    assert!(usage.iter().all(|tx| tx.kind() == TransactionKind::Spend));

    let latest = engine
        .history_query(
            &fleet.admin,
            fleet.vehicle_id,
            HistoryQuery {
                limit: Some(1),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].idempotency_key, "s2");

    Ok(())
}

#[tokio::test]
async fn test_balance_at_point_in_time() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 40).await?;

    tokio::time::sleep(Duration::from_millis(5)).await;
    let checkpoint = now();
    tokio::time::sleep(Duration::from_millis(5)).await;

    engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 15, CENTER, "later", None)
        .await?;

    let then = engine
        .balance_at(&fleet.admin, fleet.vehicle_id, checkpoint)
        .await?;
    assert_eq!(then.generic, 40);

    let current = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(current.generic, 25);

    let history = engine
        .history_query(
            &fleet.admin,
            fleet.vehicle_id,
            HistoryQuery {
                from_date: Some(checkpoint),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].idempotency_key, "later");

    Ok(())
}

#[tokio::test]
async fn test_deactivated_vehicle_refuses_new_writes() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, 30).await?;

    let vehicle = engine
        .deactivate_vehicle(&fleet.admin, fleet.vehicle_id)
        .await?;
    assert!(!vehicle.is_active());

    let err = engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 5, CENTER, "after", None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::VehicleDeactivated(id) if id == fleet.vehicle_id));

    // A retry of something committed earlier still gets its original answer
    let replay = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 30, "initial-funding", None)
        .await?;
    assert_eq!(replay.sequence, 1);

    // Balances stay readable for audit
    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, 30);

    Ok(())
}

#[tokio::test]
async fn test_vehicles_are_listed_per_company() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::create(&engine).await?;
    fleet.add_vehicle(&engine, "EF-456-GH").await?;
    let other = Fleet::create(&engine).await?;

    let own = engine.list_vehicles(&fleet.admin, None).await?;
    assert_eq!(own.len(), 2);
    assert!(own.iter().all(|v| v.company_id == fleet.company_id));

    let all = engine
        .list_vehicles(&fleet_ledger::domain::Actor::system(), None)
        .await?;
    assert_eq!(all.len(), 3);

    let theirs = engine
        .list_vehicles(&fleet_ledger::domain::Actor::system(), Some(other.company_id))
        .await?;
    assert_eq!(theirs.len(), 1);
    assert_eq!(theirs[0].id, other.vehicle_id);

    Ok(())
}

#[tokio::test]
async fn test_allocation_past_the_maximum_is_refused() -> Result<()> {
    let (engine, _temp) = test_engine().await?;
    let fleet = Fleet::with_credits(&engine, i64::MAX).await?;

    let err = engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 1, "one-too-many", None)
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            LedgerError::BalanceOverflow { dimension: BalanceDimension::Generic, balance: i64::MAX, amount: 1, .. }
        ),
        "{err:?}"
    );

    engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "maintenance_oil", i64::MAX - 1, "oil", None)
        .await?;
    let err = engine
        .allocate_right(&fleet.admin, fleet.vehicle_id, "maintenance_oil", 2, "more-oil", None)
        .await
        .unwrap_err();
    assert!(
        matches!(&err, LedgerError::BalanceOverflow { dimension: BalanceDimension::Right(t), .. } if t == "maintenance_oil"),
        "{err:?}"
    );

    // Reads and folds still work on a ledger sitting at the limit
    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, i64::MAX);
    assert_eq!(balance.right("maintenance_oil"), i64::MAX - 1);
    let at = engine.balance_at(&fleet.admin, fleet.vehicle_id, now()).await?;
    assert_eq!(at, balance);

    let history = engine
        .history(&fleet.admin, fleet.vehicle_id, HistoryFilter::All)
        .await?;
    assert_eq!(history.len(), 2);

    // Spending still works and the refused keys were never recorded
    engine
        .spend_generic(&fleet.operator, fleet.vehicle_id, 10, CENTER, "oil-run", None)
        .await?;
    engine
        .allocate_generic(&fleet.admin, fleet.vehicle_id, 1, "one-too-many", None)
        .await?;
    let balance = engine.current_balance(&fleet.admin, fleet.vehicle_id).await?;
    assert_eq!(balance.generic, i64::MAX - 9);

    Ok(())
}
