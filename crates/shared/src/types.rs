//! Common types used across vipdesk

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, UtcOffset};

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

macro_rules! id_wrapper {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_wrapper!(
    /// User ID wrapper
    UserId
);
id_wrapper!(
    /// VIP plan ID wrapper
    PlanId
);
id_wrapper!(
    /// VIP order ID wrapper
    OrderId
);
id_wrapper!(
    /// VIP record ID wrapper
    RecordId
);

// =============================================================================
// Enums
// =============================================================================

/// Membership tier that decides which quota limits apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    Standard,
    Vip,
}

impl Default for MembershipTier {
    fn default() -> Self {
        Self::Standard
    }
}

impl MembershipTier {
    pub fn from_entitlement(is_vip: bool) -> Self {
        if is_vip {
            Self::Vip
        } else {
            Self::Standard
        }
    }
}

impl std::fmt::Display for MembershipTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Vip => write!(f, "vip"),
        }
    }
}

/// Metered AI feature category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageCategory {
    Chat,
    Content,
    Analysis,
}

impl UsageCategory {
    pub const ALL: [UsageCategory; 3] = [Self::Chat, Self::Content, Self::Analysis];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Content => "content",
            Self::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for UsageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UsageCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "content" => Ok(Self::Content),
            "analysis" => Ok(Self::Analysis),
            _ => Err(format!(
                "Invalid usage category '{}'. Valid categories are: chat, content, analysis",
                s
            )),
        }
    }
}

/// Purchase order status
///
/// Transitions only move forward: `pending -> paid` or `pending -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid) | (Self::Pending, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// Quota Limits
// =============================================================================

/// Per-category monthly ceilings for one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub chat: i32,
    pub content: i32,
    pub analysis: i32,
}

impl TierLimits {
    pub fn for_category(&self, category: UsageCategory) -> i32 {
        match category {
            UsageCategory::Chat => self.chat,
            UsageCategory::Content => self.content,
            UsageCategory::Analysis => self.analysis,
        }
    }
}

/// Quota limits for both tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub standard: TierLimits,
    pub vip: TierLimits,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            standard: TierLimits {
                chat: 10,
                content: 5,
                analysis: 3,
            },
            vip: TierLimits {
                chat: 100,
                content: 50,
                analysis: 20,
            },
        }
    }
}

impl QuotaLimits {
    pub fn for_tier(&self, tier: MembershipTier) -> TierLimits {
        match tier {
            MembershipTier::Standard => self.standard,
            MembershipTier::Vip => self.vip,
        }
    }

    /// Every limit must be positive and VIP must never be below standard
    pub fn validate(&self) -> Result<(), SharedError> {
        for category in UsageCategory::ALL {
            let standard = self.standard.for_category(category);
            let vip = self.vip.for_category(category);
            if standard <= 0 || vip <= 0 {
                return Err(SharedError::Validation(format!(
                    "{} quota limits must be positive (standard={}, vip={})",
                    category, standard, vip
                )));
            }
            if vip < standard {
                return Err(SharedError::Validation(format!(
                    "VIP {} limit ({}) is below the standard limit ({})",
                    category, vip, standard
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Calendar and Money Helpers
// =============================================================================

/// First instant (UTC midnight) of the calendar month after `at`
pub fn next_month_start(at: OffsetDateTime) -> Result<OffsetDateTime, SharedError> {
    let at = at.to_offset(UtcOffset::UTC);
    let (year, month) = match at.month() {
        Month::December => (at.year() + 1, Month::January),
        month => (at.year(), month.next()),
    };
    let date = Date::from_calendar_date(year, month, 1)
        .map_err(|e| SharedError::Calendar(e.to_string()))?;
    Ok(date.midnight().assume_utc())
}

/// Render cents as a fixed two-decimal string, e.g. `1990` -> `"19.90"`
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}
