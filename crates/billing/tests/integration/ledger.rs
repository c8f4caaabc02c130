//! Subscription ledger tests

use time::{Duration, OffsetDateTime};
use vipdesk_billing::{BillingError, EntitlementState, NewPlan};
use vipdesk_shared::{PlanId, UserId};

use crate::common::TestContext;

#[tokio::test]
#[ignore] // Requires database
async fn test_repeated_activation_leaves_one_active_record() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();

    for i in 0..4 {
        ctx.billing
            .ledger
            .activate(user, plan.id, now, now + Duration::days(30 + i))
            .await
            .unwrap();
        assert_eq!(ctx.active_record_count(user).await, 1);
    }

    let (is_vip, end) = ctx.projection(user).await;
    assert!(is_vip);
    assert_eq!(ctx.billing.ledger.list_records(user).await.unwrap().len(), 4);
    let active = ctx.billing.ledger.active_subscription(user).await.unwrap().unwrap();
    assert_eq!(Some(active.expires_at), end);
    assert_eq!(active.plan_name, plan.name);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_activations_serialize() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let plan_id = plan.id;
    let now = OffsetDateTime::now_utc();

    let mut handles = Vec::new();
    for i in 0..10 {
        let ledger = ctx.billing.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .activate(user, plan_id, now, now + Duration::days(10 + i))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(ctx.active_record_count(user).await, 1);
    let outcome = ctx.billing.ledger.reconcile(user).await.unwrap();
    assert!(outcome.is_vip);
    assert!(!outcome.changed());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_reconcile_is_idempotent() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();
    ctx.billing
        .ledger
        .activate(user, plan.id, now, now + Duration::days(30))
        .await
        .unwrap();

    let first = ctx.billing.ledger.reconcile(user).await.unwrap();
    let (_, updated_before): (bool, OffsetDateTime) =
        sqlx::query_as("SELECT is_vip, updated_at FROM users WHERE id = $1")
            .bind(user)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    let second = ctx.billing.ledger.reconcile(user).await.unwrap();
    let (_, updated_after): (bool, OffsetDateTime) =
        sqlx::query_as("SELECT is_vip, updated_at FROM users WHERE id = $1")
            .bind(user)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();

    assert_eq!((first.is_vip, first.expires_at), (second.is_vip, second.expires_at));
    assert!(!second.changed());
    assert_eq!(updated_before, updated_after);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_activation_in_the_past_reconciles_to_not_vip() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();

    ctx.billing
        .ledger
        .activate(user, plan.id, now - Duration::days(30), now - Duration::seconds(1))
        .await
        .unwrap();
    assert!(!ctx.billing.ledger.check_entitlement(user).await.unwrap());

    let outcome = ctx.billing.ledger.reconcile(user).await.unwrap();
    assert!(!outcome.is_vip);
    assert_eq!(outcome.expires_at, None);
    assert_eq!(outcome.state, EntitlementState::ExpiredUnflagged);
    assert_eq!(outcome.expired_records, 1);
    assert_eq!(ctx.active_record_count(user).await, 0);
    assert_eq!(ctx.projection(user).await, (false, None));

    let again = ctx.billing.ledger.reconcile(user).await.unwrap();
    assert_eq!(again.state, EntitlementState::Inactive);
    assert!(!again.changed());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_check_entitlement_does_not_repair() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();
    ctx.billing
        .ledger
        .activate(user, plan.id, now - Duration::days(30), now - Duration::seconds(1))
        .await
        .unwrap();

    assert!(!ctx.billing.ledger.check_entitlement(user).await.unwrap());
    assert_eq!(ctx.active_record_count(user).await, 1);
    assert!(ctx.projection(user).await.0);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_reconcile_repairs_drifted_projection() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();
    ctx.insert_record(user, &plan, true, now, now + Duration::days(5))
        .await;

    let outcome = ctx.billing.ledger.reconcile(user).await.unwrap();
    assert!(outcome.is_vip);
    assert!(outcome.projection_updated);
    assert!(ctx.projection(user).await.0);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_deactivate_clears_everything() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    ctx.billing.ledger.grant(user, plan.id).await.unwrap();

    let deactivated = ctx.billing.ledger.deactivate(user).await.unwrap();
    assert_eq!(deactivated, 1);
    assert_eq!(ctx.active_record_count(user).await, 0);
    assert_eq!(ctx.projection(user).await, (false, None));
    assert!(ctx.billing.ledger.active_subscription(user).await.unwrap().is_none());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_grant_uses_requested_plan() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let _other = ctx.create_plan(990, 7).await;
    let yearly = ctx.create_plan(14990, 365).await;

    let record = ctx.billing.ledger.grant(user, yearly.id).await.unwrap();
    assert_eq!(record.plan_id, yearly.id);
    assert_eq!(record.end_at - record.start_at, Duration::days(365));
    assert_eq!(record.order_id, None);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_activation_preconditions() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    let now = OffsetDateTime::now_utc();

    let missing_user = ctx
        .billing
        .ledger
        .activate(UserId(i64::MAX), plan.id, now, now + Duration::days(1))
        .await;
    assert!(matches!(missing_user, Err(BillingError::NotFound(_))));

    let missing_plan = ctx
        .billing
        .ledger
        .activate(user, PlanId(i64::MAX), now, now + Duration::days(1))
        .await;
    assert!(matches!(missing_plan, Err(BillingError::NotFound(_))));

    let backwards = ctx
        .billing
        .ledger
        .activate(user, plan.id, now, now - Duration::days(1))
        .await;
    assert!(matches!(backwards, Err(BillingError::InvalidInput(_))));

    assert_eq!(ctx.active_record_count(user).await, 0);
    assert!(ctx.billing.ledger.list_records(user).await.unwrap().is_empty());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_grant_with_out_of_range_duration_is_rejected() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;

    let created = ctx
        .billing
        .plans
        .create_plan(NewPlan {
            name: "Forever".to_string(),
            price_cents: 1990,
            duration_days: 5_000_000,
            features: vec![],
        })
        .await;
    assert!(matches!(created, Err(BillingError::InvalidInput(_))));

    let huge = ctx.insert_plan_unchecked(1990, 5_000_000).await;
    let billing = ctx.billing.clone();
    let plan_id = huge.id;
    let granted = tokio::spawn(async move { billing.ledger.grant(user, plan_id).await })
        .await
        .expect("grant must not panic");
    assert!(matches!(granted, Err(BillingError::InvalidInput(_))));

    assert_eq!(ctx.active_record_count(user).await, 0);
    assert!(!ctx.projection(user).await.0);

    ctx.cleanup().await;
}
