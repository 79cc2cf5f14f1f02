//! Common types used across clipflow

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Plans
// =============================================================================

/// Subscription plan determining quota size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Creator,
    Studio,
}

impl Default for Plan {
    fn default() -> Self {
        Self::Free
    }
}

/// Per-cycle allocation for a plan.
///
/// This table is the single source of plan configuration: allocate, reset and
/// pre-flight estimation all read from here. Changing a limit affects future
/// allocations only, never balances already handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    /// Input token pool per billing cycle
    pub input_tokens: i64,
    /// Output token pool per billing cycle
    pub output_tokens: i64,
    /// Videos processed per billing cycle (secondary unit counter)
    pub monthly_videos: i32,
}

impl Plan {
    /// Quota limits for this plan
    pub fn limits(&self) -> PlanLimits {
        match self {
            Self::Free => PlanLimits {
                input_tokens: 150_000,
                output_tokens: 30_000,
                monthly_videos: 3,
            },
            Self::Creator => PlanLimits {
                input_tokens: 3_000_000,
                output_tokens: 500_000,
                monthly_videos: 50,
            },
            Self::Studio => PlanLimits {
                input_tokens: 10_000_000,
                output_tokens: 2_000_000,
                monthly_videos: 250,
            },
        }
    }

    /// Whether this plan is a paid tier
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Free)
    }

    /// The cheapest paid tier. Used as the fallback when a provider product
    /// id cannot be mapped to a known plan.
    pub fn lowest_paid() -> Self {
        Self::Creator
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Creator => write!(f, "creator"),
            Self::Studio => write!(f, "studio"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "creator" => Ok(Self::Creator),
            "studio" => Ok(Self::Studio),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

// =============================================================================
// Subscription state
// =============================================================================

/// Internal subscription status.
///
/// A projection of the most recent provider fetch plus date math; it is never
/// edited independently of a sync. Unrecognized provider statuses (pending,
/// paused, ...) are mirrored verbatim via `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Free,
    Active,
    /// Cancel requested at the provider; paid until the next billing date
    Cancelling,
    /// Grace period elapsed or provider-side cancellation settled
    Expired,
    /// Subscriber asked us to cancel; pending manual provider-side action
    CancellationRequested,
    /// Verbatim mirror of an unrecognized provider status
    #[serde(untagged)]
    Other(String),
}

impl SubscriptionState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Free => "free",
            Self::Active => "active",
            Self::Cancelling => "cancelling",
            Self::Expired => "expired",
            Self::CancellationRequested => "cancellation_requested",
            Self::Other(s) => s,
        }
    }

    /// Parse a stored status string. Never fails: unknown strings round-trip
    /// through `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "free" => Self::Free,
            "active" => Self::Active,
            "cancelling" => Self::Cancelling,
            "expired" => Self::Expired,
            "cancellation_requested" => Self::CancellationRequested,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Database models
// =============================================================================

/// Subscriber model: one row per account, holding the consumable token budget
/// for the current cycle and the projection of the provider's subscription.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscriber {
    pub id: Uuid,
    pub email: String,
    pub plan: String,
    pub input_tokens_remaining: i64,
    pub output_tokens_remaining: i64,
    pub token_reset_date: Option<OffsetDateTime>,
    pub subscription_id: Option<String>,
    pub subscription_status: String,
    pub next_billing_date: Option<OffsetDateTime>,
    pub cancel_at_billing_date: bool,
    pub videos_processed_this_month: i32,
    pub video_reset_date: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscriber {
    /// Current plan, defaulting to Free if the stored value is unparseable
    pub fn current_plan(&self) -> Plan {
        self.plan.parse().unwrap_or_default()
    }

    /// Current subscription state
    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::parse(&self.subscription_status)
    }

    /// Whether the billing cycle has elapsed and the balance must be reset
    /// before it can be trusted by any reader
    pub fn cycle_elapsed(&self, now: OffsetDateTime) -> bool {
        self.token_reset_date.is_some_and(|reset| reset <= now)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_plan_default() {
        assert_eq!(Plan::default(), Plan::Free);
    }

    #[test]
    fn test_plan_limits() {
        assert_eq!(Plan::Free.limits().input_tokens, 150_000);
        assert_eq!(Plan::Free.limits().output_tokens, 30_000);
        assert_eq!(Plan::Creator.limits().input_tokens, 3_000_000);
        assert_eq!(Plan::Studio.limits().input_tokens, 10_000_000);
        assert_eq!(Plan::Studio.limits().monthly_videos, 250);
    }

    #[test]
    fn test_plan_is_paid() {
        assert!(!Plan::Free.is_paid());
        assert!(Plan::Creator.is_paid());
        assert!(Plan::Studio.is_paid());
    }

    #[test]
    fn test_plan_lowest_paid() {
        assert_eq!(Plan::lowest_paid(), Plan::Creator);
        assert!(Plan::lowest_paid().is_paid());
    }

    #[test]
    fn test_plan_display_and_parse() {
        assert_eq!(Plan::Creator.to_string(), "creator");
        assert_eq!("free".parse::<Plan>().unwrap(), Plan::Free);
        assert_eq!("STUDIO".parse::<Plan>().unwrap(), Plan::Studio);
        assert!("platinum".parse::<Plan>().is_err());
    }

    #[test]
    fn test_subscription_state_round_trip() {
        assert_eq!(
            SubscriptionState::parse("cancellation_requested"),
            SubscriptionState::CancellationRequested
        );
        assert_eq!(SubscriptionState::Cancelling.as_str(), "cancelling");

        // Unknown provider statuses are mirrored verbatim
        let paused = SubscriptionState::parse("paused");
        assert_eq!(paused, SubscriptionState::Other("paused".to_string()));
        assert_eq!(paused.as_str(), "paused");
    }

    fn subscriber_with_reset(reset: Option<OffsetDateTime>) -> Subscriber {
        let now = OffsetDateTime::now_utc();
        Subscriber {
            id: Uuid::new_v4(),
            email: "test@example.com".to_string(),
            plan: "free".to_string(),
            input_tokens_remaining: 0,
            output_tokens_remaining: 0,
            token_reset_date: reset,
            subscription_id: None,
            subscription_status: "free".to_string(),
            next_billing_date: None,
            cancel_at_billing_date: false,
            videos_processed_this_month: 0,
            video_reset_date: reset,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_cycle_elapsed() {
        let now = OffsetDateTime::now_utc();

        let due = subscriber_with_reset(Some(now - Duration::hours(1)));
        assert!(due.cycle_elapsed(now));

        let not_due = subscriber_with_reset(Some(now + Duration::hours(1)));
        assert!(!not_due.cycle_elapsed(now));

        // No reset date scheduled: nothing to reset
        let unscheduled = subscriber_with_reset(None);
        assert!(!unscheduled.cycle_elapsed(now));
    }

    #[test]
    fn test_current_plan_falls_back_to_free() {
        let mut sub = subscriber_with_reset(None);
        sub.plan = "legacy-gold".to_string();
        assert_eq!(sub.current_plan(), Plan::Free);
    }
}
