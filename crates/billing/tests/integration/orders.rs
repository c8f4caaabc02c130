//! Order flow tests

use time::{Duration, OffsetDateTime};
use vipdesk_billing::BillingError;
use vipdesk_shared::{OrderStatus, PlanId, UserId};

use crate::common::{assert_close, TestContext};

#[tokio::test]
#[ignore] // Requires database
async fn test_purchase_flow_grants_subscription() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;

    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(order.amount(), "19.90");
    assert!(order.paid_at.is_none());
    assert!(order.order_no.starts_with("ORD"));
    assert!(!ctx.billing.ledger.check_entitlement(user).await.unwrap());

    let confirmed = ctx.billing.orders.confirm_order(order.id).await.unwrap();
    assert_eq!(confirmed.order.status, OrderStatus::Paid);
    assert!(confirmed.order.paid_at.is_some());
    assert!(!confirmed.repaired);
    assert_eq!(confirmed.record.order_id, Some(order.id));

    let active = ctx
        .billing
        .ledger
        .active_subscription(user)
        .await
        .unwrap()
        .expect("subscription should be active");
    assert_close(
        active.expires_at,
        OffsetDateTime::now_utc() + Duration::days(30),
        Duration::minutes(1),
    );
    assert_eq!(active.order_id, Some(order.id));
    assert!(ctx.projection(user).await.0);

    let by_no = ctx.billing.orders.get_order_by_no(&order.order_no).await.unwrap();
    assert_eq!(by_no.id, order.id);
    assert_eq!(ctx.billing.orders.list_orders(user).await.unwrap().len(), 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_confirm_twice_is_invalid_state() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();

    ctx.billing.orders.confirm_order(order.id).await.unwrap();
    let again = ctx.billing.orders.confirm_order(order.id).await;
    assert!(matches!(again, Err(BillingError::InvalidState(_))));
    assert_eq!(ctx.billing.ledger.list_records(user).await.unwrap().len(), 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_confirms_grant_once() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..5 {
        let orders = ctx.billing.orders.clone();
        let order_id = order.id;
        handles.push(tokio::spawn(async move { orders.confirm_order(order_id).await }));
    }
    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BillingError::InvalidState(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(ctx.billing.ledger.list_records(user).await.unwrap().len(), 1);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_cancel_only_pending() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;

    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();
    let cancelled = ctx.billing.orders.cancel_order(order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert!(matches!(
        ctx.billing.orders.confirm_order(order.id).await,
        Err(BillingError::InvalidState(_))
    ));
    assert!(matches!(
        ctx.billing.orders.cancel_order(order.id).await,
        Err(BillingError::InvalidState(_))
    ));

    let paid = ctx.billing.orders.create_order(user, plan.id).await.unwrap();
    ctx.billing.orders.confirm_order(paid.id).await.unwrap();
    assert!(matches!(
        ctx.billing.orders.cancel_order(paid.id).await,
        Err(BillingError::InvalidState(_))
    ));
    assert!(ctx.billing.ledger.check_entitlement(user).await.unwrap());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_create_order_requires_user_and_plan() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;

    assert!(matches!(
        ctx.billing.orders.create_order(UserId(i64::MAX), plan.id).await,
        Err(BillingError::NotFound(_))
    ));
    assert!(matches!(
        ctx.billing.orders.create_order(user, PlanId(i64::MAX)).await,
        Err(BillingError::NotFound(_))
    ));
    assert!(ctx.billing.orders.list_orders(user).await.unwrap().is_empty());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_paid_order_without_record_is_repaired() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();

    // Stage the half-finished state: paid, no record
    sqlx::query("UPDATE vip_orders SET status = 'paid', paid_at = NOW() WHERE id = $1")
        .bind(order.id)
        .execute(&ctx.pool)
        .await
        .unwrap();
    let unfulfilled = ctx.billing.orders.list_unfulfilled(100).await.unwrap();
    assert!(unfulfilled.iter().any(|o| o.id == order.id));

    let repaired = ctx.billing.orders.confirm_order(order.id).await.unwrap();
    assert!(repaired.repaired);
    assert_eq!(repaired.record.order_id, Some(order.id));
    assert!(ctx.billing.ledger.check_entitlement(user).await.unwrap());

    let unfulfilled = ctx.billing.orders.list_unfulfilled(100).await.unwrap();
    assert!(!unfulfilled.iter().any(|o| o.id == order.id));

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_failed_repair_needs_reconciliation() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let order = ctx.billing.orders.create_order(user, plan.id).await.unwrap();

    sqlx::query("UPDATE vip_orders SET status = 'paid', paid_at = NOW() WHERE id = $1")
        .bind(order.id)
        .execute(&ctx.pool)
        .await
        .unwrap();

    // Make every ledger insert for this user fail
    let function = format!("reject_vip_records_{}", user);
    let trigger = format!("reject_vip_records_{}_trg", user);
    sqlx::query(&format!(
        r#"
        CREATE FUNCTION {function}() RETURNS trigger AS $$
        BEGIN
            IF NEW.user_id = {user} THEN
                RAISE EXCEPTION 'ledger insert rejected';
            END IF;
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#
    ))
    .execute(&ctx.pool)
    .await
    .unwrap();
    sqlx::query(&format!(
        "CREATE TRIGGER {trigger} BEFORE INSERT ON vip_records \
         FOR EACH ROW EXECUTE FUNCTION {function}()"
    ))
    .execute(&ctx.pool)
    .await
    .unwrap();

    let result = ctx.billing.orders.confirm_order(order.id).await;

    sqlx::query(&format!("DROP TRIGGER {trigger} ON vip_records"))
        .execute(&ctx.pool)
        .await
        .unwrap();
    sqlx::query(&format!("DROP FUNCTION {function}()"))
        .execute(&ctx.pool)
        .await
        .unwrap();

    match result {
        Err(BillingError::NeedsReconciliation { order_id, .. }) => assert_eq!(order_id, order.id),
        other => panic!("expected NeedsReconciliation, got {:?}", other),
    }

    let stored = ctx.billing.orders.get_order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Paid);
    let unfulfilled = ctx.billing.orders.list_unfulfilled(100).await.unwrap();
    assert!(unfulfilled.iter().any(|o| o.id == order.id));
    assert_eq!(ctx.active_record_count(user).await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_confirm_with_out_of_range_duration_keeps_order_pending() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let huge = ctx.insert_plan_unchecked(1990, 5_000_000).await;
    let order = ctx.billing.orders.create_order(user, huge.id).await.unwrap();

    let orders = ctx.billing.orders.clone();
    let order_id = order.id;
    let confirmed = tokio::spawn(async move { orders.confirm_order(order_id).await })
        .await
        .expect("confirm must not panic");
    assert!(matches!(confirmed, Err(BillingError::InvalidInput(_))));

    let stored = ctx.billing.orders.get_order(order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::Pending);
    assert_eq!(ctx.active_record_count(user).await, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_plan_in_use_cannot_be_deleted() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let unused = ctx.create_plan(990, 7).await;
    ctx.billing.orders.create_order(user, plan.id).await.unwrap();

    assert!(matches!(
        ctx.billing.plans.delete_plan(plan.id).await,
        Err(BillingError::InvalidState(_))
    ));
    ctx.billing.plans.delete_plan(unused.id).await.unwrap();
    assert!(matches!(
        ctx.billing.plans.get_plan(unused.id).await,
        Err(BillingError::NotFound(_))
    ));

    ctx.cleanup().await;
}
