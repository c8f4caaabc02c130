//! Sync sweep and invariant tests

use time::{Duration, OffsetDateTime};

use crate::common::TestContext;

#[tokio::test]
#[ignore] // Requires database
async fn test_sweep_expires_lapsed_users() {
    let mut ctx = TestContext::new().await;
    let lapsed = ctx.create_user().await;
    let current = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();

    ctx.billing
        .ledger
        .activate(lapsed, plan.id, now - Duration::days(31), now - Duration::days(1))
        .await
        .unwrap();
    ctx.billing
        .ledger
        .activate(current, plan.id, now, now + Duration::days(30))
        .await
        .unwrap();

    let stale = ctx
        .billing
        .invariants
        .run_check("stale_active_record")
        .await
        .unwrap();
    assert!(stale.iter().any(|v| v.user_ids.contains(&lapsed)));

    let report = ctx.billing.sync.sweep_expired(10_000).await.unwrap();
    assert!(report.scanned >= 1);
    assert_eq!(report.failed, 0);

    assert_eq!(ctx.projection(lapsed).await, (false, None));
    assert_eq!(ctx.active_record_count(lapsed).await, 0);
    assert!(ctx.projection(current).await.0);
    assert_eq!(ctx.active_record_count(current).await, 1);

    let stale = ctx
        .billing
        .invariants
        .run_check("stale_active_record")
        .await
        .unwrap();
    assert!(!stale.iter().any(|v| v.user_ids.contains(&lapsed)));

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_sync_subscription_reports_current_state() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;

    let before = ctx.billing.sync.sync_subscription(user).await.unwrap();
    assert!(!before.is_vip);

    let record = ctx.billing.ledger.grant(user, plan.id).await.unwrap();
    let after = ctx.billing.sync.sync_subscription(user).await.unwrap();
    assert!(after.is_vip);
    assert_eq!(after.expires_at, Some(record.end_at));

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_repair_sweep_fulfills_paid_orders() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();

    sqlx::query("UPDATE vip_orders SET status = 'paid', paid_at = NOW() WHERE id = $1")
        .bind(order.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    let violations = ctx
        .billing
        .invariants
        .run_check("paid_order_fulfilled")
        .await
        .unwrap();
    assert!(violations.iter().any(|v| v.order_ids.contains(&order.id)));

    let report = ctx.billing.sync.repair_unfulfilled_orders(10_000).await.unwrap();
    assert!(report.repaired >= 1);
    assert!(ctx.billing.ledger.check_entitlement(user).await.unwrap());

    let violations = ctx
        .billing
        .invariants
        .run_check("paid_order_fulfilled")
        .await
        .unwrap();
    assert!(!violations.iter().any(|v| v.order_ids.contains(&order.id)));

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_projection_drift_is_reported() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;

    sqlx::query("UPDATE users SET is_vip = TRUE WHERE id = $1")
        .bind(user)
        .execute(&ctx.pool)
        .await
        .unwrap();
    let summary = ctx.billing.invariants.run_all_checks().await.unwrap();
    assert!(summary
        .violations
        .iter()
        .any(|v| v.invariant == "projection_matches_ledger" && v.user_ids.contains(&user)));

    ctx.billing.sync.sync_subscription(user).await.unwrap();
    let violations = ctx
        .billing
        .invariants
        .run_check("projection_matches_ledger")
        .await
        .unwrap();
    assert!(!violations.iter().any(|v| v.user_ids.contains(&user)));

    ctx.cleanup().await;
}
