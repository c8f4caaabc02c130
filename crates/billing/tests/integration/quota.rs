//! Quota manager tests

use time::{Duration, OffsetDateTime};
use vipdesk_billing::BillingError;
use vipdesk_shared::{next_month_start, MembershipTier, UsageCategory, UserId};

use crate::common::TestContext;

#[tokio::test]
#[ignore] // Requires database
async fn test_counters_created_with_standard_limits() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;

    let record = ctx.billing.quota.get_or_create(user).await.unwrap();
    assert_eq!(record.tier, MembershipTier::Standard);
    assert_eq!((record.chat_max, record.content_max, record.analysis_max), (10, 5, 3));
    assert_eq!(record.chat_used, 0);
    assert_eq!(record.reset_at, next_month_start(OffsetDateTime::now_utc()).unwrap());

    let again = ctx.billing.quota.get_or_create(user).await.unwrap();
    assert_eq!(again.id, record.id);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_increments_never_pass_limit() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let quota = ctx.billing.quota.clone();
        handles.push(tokio::spawn(async move {
            quota.increment(user, UsageCategory::Chat).await
        }));
    }

    let mut succeeded = 0;
    let mut denied = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(BillingError::QuotaExceeded { .. }) => denied += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(denied, 15);
    let usage = ctx.billing.quota.get_or_create(user).await.unwrap();
    assert_eq!(usage.chat_used, 10);
    assert_eq!(usage.content_used, 0);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_reset_at_boundary_before_limit_check() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    ctx.billing.quota.get_or_create(user).await.unwrap();

    sqlx::query("UPDATE ai_usage SET chat_used = chat_max, reset_at = $2 WHERE user_id = $1")
        .bind(user)
        .bind(OffsetDateTime::now_utc() - Duration::seconds(1))
        .execute(&ctx.pool)
        .await
        .unwrap();

    let record = ctx.billing.quota.increment(user, UsageCategory::Chat).await.unwrap();
    assert_eq!(record.chat_used, 1);
    assert!(record.reset_at > OffsetDateTime::now_utc());

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_vip_downgrade_keeps_usage_over_limit() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;
    let plan = ctx.create_plan(1990, 30).await;
    ctx.billing.ledger.grant(user, plan.id).await.unwrap();

    let record = ctx.billing.quota.get_or_create(user).await.unwrap();
    assert_eq!(record.tier, MembershipTier::Vip);
    assert_eq!(record.chat_max, 100);

    sqlx::query("UPDATE ai_usage SET chat_used = 100 WHERE user_id = $1")
        .bind(user)
        .execute(&ctx.pool)
        .await
        .unwrap();
    assert!(matches!(
        ctx.billing.quota.increment(user, UsageCategory::Chat).await,
        Err(BillingError::QuotaExceeded { used: 100, max: 100, .. })
    ));

    ctx.billing.ledger.deactivate(user).await.unwrap();
    assert!(matches!(
        ctx.billing.quota.increment(user, UsageCategory::Chat).await,
        Err(BillingError::QuotaExceeded { used: 100, max: 10, .. })
    ));

    let usage = ctx.billing.quota.get_usage(user).await.unwrap();
    assert_eq!(usage.tier, MembershipTier::Standard);
    let chat = usage
        .categories
        .iter()
        .find(|c| c.category == UsageCategory::Chat)
        .unwrap();
    assert_eq!((chat.used_count, chat.max_count), (100, 10));

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_tier_follows_ledger_not_projection() {
    let mut ctx = TestContext::new().await;
    let user = ctx.create_user().await;

    sqlx::query("UPDATE users SET is_vip = TRUE WHERE id = $1")
        .bind(user)
        .execute(&ctx.pool)
        .await
        .unwrap();

    let record = ctx.billing.quota.get_or_create(user).await.unwrap();
    assert_eq!(record.tier, MembershipTier::Standard);

    ctx.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unknown_user_is_not_found() {
    let ctx = TestContext::new().await;
    assert!(matches!(
        ctx.billing.quota.increment(UserId(i64::MAX), UsageCategory::Chat).await,
        Err(BillingError::NotFound(_))
    ));
    ctx.cleanup().await;
}
