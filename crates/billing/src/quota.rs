//! Token quota ledger.
//!
//! Each subscriber carries two consumable pools per billing cycle, input and
//! output tokens, plus a secondary per-cycle video counter. Consumption is a
//! single conditional decrement of both pools; a cycle that has elapsed is
//! reset lazily before any balance is trusted, so no reader ever acts on a
//! stale zero.

use clipflow_shared::{Plan, Subscriber};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{QuotaStore, QuotaWrite};

/// Pre-flight estimate for a generation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageEstimate {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// Snapshot of a subscriber's quota, post lazy reset
#[derive(Debug, Clone, Serialize)]
pub struct TokenStatus {
    pub plan: Plan,
    pub input_tokens_remaining: i64,
    pub output_tokens_remaining: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub token_reset_date: Option<OffsetDateTime>,
    /// True when either pool has nothing left to give
    pub exhausted: bool,
    pub videos_processed_this_month: i32,
    pub monthly_video_limit: i32,
}

/// Outcome of a cycle-reset sweep
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetSweep {
    pub reset: usize,
    pub failed: usize,
}

/// Estimate token usage for a prompt of the given character length.
///
/// Roughly four characters per input token, rounded up; expected output is
/// 15% of input, also rounded up, so even a one-character prompt reserves a
/// nonzero output budget.
pub fn estimate_usage(char_count: usize) -> UsageEstimate {
    let chars = char_count as i64;
    let input_tokens = (chars + 3) / 4;
    let output_tokens = (input_tokens * 15 + 99) / 100;
    UsageEstimate {
        input_tokens,
        output_tokens,
    }
}

/// One calendar month after `date`, clamping the day to the target month's
/// length (Jan 31 rolls to Feb 28/29)
pub fn one_month_after(date: OffsetDateTime) -> OffsetDateTime {
    let (year, month) = match date.month() {
        time::Month::December => (date.year() + 1, time::Month::January),
        m => (date.year(), m.next()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    date.replace_day(1)
        .and_then(|d| d.replace_year(year))
        .and_then(|d| d.replace_month(month))
        .and_then(|d| d.replace_day(day))
        .unwrap_or(date + time::Duration::days(30))
}

/// Quota ledger over a durable store
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }

    /// Grant a fresh cycle's worth of tokens for `plan`, overwriting whatever
    /// balance remains. Unused tokens never roll over.
    ///
    /// The next reset is anchored on `cycle_end` (the provider's billing date)
    /// when given, falling back to the stored next billing date, then to one
    /// calendar month out. Every tier gets a scheduled reset; the free grant
    /// refills monthly too.
    pub async fn allocate(
        &self,
        subscriber_id: Uuid,
        plan: Plan,
        cycle_end: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let subscriber = self.store.get(subscriber_id).await?;
        let limits = plan.limits();

        let reset_date = Some(
            cycle_end
                .or(subscriber.next_billing_date)
                .filter(|d| *d > now)
                .unwrap_or_else(|| one_month_after(now)),
        );

        self.store
            .apply_quota(
                subscriber_id,
                QuotaWrite {
                    input_tokens_remaining: limits.input_tokens,
                    output_tokens_remaining: limits.output_tokens,
                    token_reset_date: reset_date,
                    video_reset_date: reset_date,
                },
            )
            .await?;

        tracing::info!(
            subscriber_id = %subscriber_id,
            plan = %plan,
            input_tokens = limits.input_tokens,
            output_tokens = limits.output_tokens,
            reset_date = ?reset_date,
            "Allocated token quota"
        );
        Ok(())
    }

    /// Check that both pools can cover the estimated usage, without
    /// consuming. Resets an elapsed cycle first.
    pub async fn check_availability(
        &self,
        subscriber_id: Uuid,
        input_tokens: i64,
        output_tokens: i64,
    ) -> BillingResult<TokenStatus> {
        let subscriber = self.fresh(subscriber_id).await?;

        if subscriber.input_tokens_remaining < input_tokens
            || subscriber.output_tokens_remaining < output_tokens
        {
            return Err(Self::shortfall_error(
                subscriber.input_tokens_remaining,
                subscriber.output_tokens_remaining,
                subscriber.token_reset_date,
                input_tokens,
                output_tokens,
            ));
        }
        Ok(Self::status_of(&subscriber))
    }

    /// Consume from both pools atomically. Either both decrements apply or
    /// neither does; concurrent requests cannot overspend the balance.
    pub async fn consume(
        &self,
        subscriber_id: Uuid,
        input_tokens: i64,
        output_tokens: i64,
    ) -> BillingResult<TokenStatus> {
        if input_tokens < 0 || output_tokens < 0 {
            return Err(BillingError::Internal(format!(
                "Negative token amounts: {} / {}",
                input_tokens, output_tokens
            )));
        }

        // Lazy reset before the decrement so an elapsed cycle's leftover
        // balance is never spent from
        let subscriber = self.fresh(subscriber_id).await?;

        let outcome = self
            .store
            .decrement_if_sufficient(subscriber_id, input_tokens, output_tokens)
            .await?;

        if !outcome.success {
            tracing::warn!(
                subscriber_id = %subscriber_id,
                input_needed = input_tokens,
                output_needed = output_tokens,
                input_remaining = outcome.input_remaining,
                output_remaining = outcome.output_remaining,
                "Token consumption refused"
            );
            return Err(Self::shortfall_error(
                outcome.input_remaining,
                outcome.output_remaining,
                subscriber.token_reset_date,
                input_tokens,
                output_tokens,
            ));
        }

        tracing::debug!(
            subscriber_id = %subscriber_id,
            input_consumed = input_tokens,
            output_consumed = output_tokens,
            input_remaining = outcome.input_remaining,
            output_remaining = outcome.output_remaining,
            "Consumed tokens"
        );

        Ok(TokenStatus {
            plan: subscriber.current_plan(),
            input_tokens_remaining: outcome.input_remaining,
            output_tokens_remaining: outcome.output_remaining,
            token_reset_date: subscriber.token_reset_date,
            exhausted: outcome.input_remaining <= 0 || outcome.output_remaining <= 0,
            videos_processed_this_month: subscriber.videos_processed_this_month,
            monthly_video_limit: subscriber.current_plan().limits().monthly_videos,
        })
    }

    /// Current quota snapshot, resetting an elapsed cycle first
    pub async fn token_status(&self, subscriber_id: Uuid) -> BillingResult<TokenStatus> {
        let subscriber = self.fresh(subscriber_id).await?;
        Ok(Self::status_of(&subscriber))
    }

    /// Refill the subscriber's pools to their plan limits and schedule the
    /// next reset one month out. Safe to call more than once; a second call
    /// in the same cycle just rewrites the same full balance.
    pub async fn reset_cycle(&self, subscriber_id: Uuid) -> BillingResult<()> {
        let subscriber = self.store.get(subscriber_id).await?;
        self.reset_row(&subscriber).await
    }

    /// Sweep every paid subscriber whose reset date has elapsed. Failures are
    /// logged and counted but never abort the sweep.
    pub async fn reset_all_due_cycles(&self, now: OffsetDateTime) -> BillingResult<ResetSweep> {
        let due = self.store.find_due_for_reset(now).await?;
        let mut sweep = ResetSweep::default();

        for subscriber in &due {
            match self.reset_row(subscriber).await {
                Ok(()) => sweep.reset += 1,
                Err(e) => {
                    sweep.failed += 1;
                    tracing::error!(
                        subscriber_id = %subscriber.id,
                        error = %e,
                        "Cycle reset failed, continuing sweep"
                    );
                }
            }
        }

        if sweep.reset > 0 || sweep.failed > 0 {
            tracing::info!(
                reset = sweep.reset,
                failed = sweep.failed,
                "Cycle reset sweep complete"
            );
        }
        Ok(sweep)
    }

    /// Count one processed video against the current cycle
    pub async fn record_video_processed(&self, subscriber_id: Uuid) -> BillingResult<i32> {
        let subscriber = self.fresh(subscriber_id).await?;
        let limit = subscriber.current_plan().limits().monthly_videos;
        let count = self.store.increment_videos(subscriber_id).await?;
        if count > limit {
            tracing::warn!(
                subscriber_id = %subscriber_id,
                count = count,
                limit = limit,
                "Video count exceeds plan limit"
            );
        }
        Ok(count)
    }

    /// Load a subscriber, resetting their cycle first if it has elapsed
    async fn fresh(&self, subscriber_id: Uuid) -> BillingResult<Subscriber> {
        let subscriber = self.store.get(subscriber_id).await?;
        if subscriber.cycle_elapsed(OffsetDateTime::now_utc()) {
            self.reset_row(&subscriber).await?;
            return self.store.get(subscriber_id).await;
        }
        Ok(subscriber)
    }

    async fn reset_row(&self, subscriber: &Subscriber) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let plan = subscriber.current_plan();
        let limits = plan.limits();
        // Next reset lands on the billing date when one is still ahead,
        // otherwise one calendar month out
        let next_reset = Some(
            subscriber
                .next_billing_date
                .filter(|d| *d > now)
                .unwrap_or_else(|| one_month_after(now)),
        );

        self.store
            .apply_quota(
                subscriber.id,
                QuotaWrite {
                    input_tokens_remaining: limits.input_tokens,
                    output_tokens_remaining: limits.output_tokens,
                    token_reset_date: next_reset,
                    video_reset_date: next_reset,
                },
            )
            .await?;

        tracing::info!(
            subscriber_id = %subscriber.id,
            plan = %plan,
            next_reset = ?next_reset,
            "Reset billing cycle"
        );
        Ok(())
    }

    fn status_of(subscriber: &Subscriber) -> TokenStatus {
        let plan = subscriber.current_plan();
        TokenStatus {
            plan,
            input_tokens_remaining: subscriber.input_tokens_remaining,
            output_tokens_remaining: subscriber.output_tokens_remaining,
            token_reset_date: subscriber.token_reset_date,
            exhausted: subscriber.input_tokens_remaining <= 0
                || subscriber.output_tokens_remaining <= 0,
            videos_processed_this_month: subscriber.videos_processed_this_month,
            monthly_video_limit: plan.limits().monthly_videos,
        }
    }

    /// Pick the error for a refused request: exhausted when either pool has
    /// nothing left to give, otherwise insufficient with the amounts
    fn shortfall_error(
        input_remaining: i64,
        output_remaining: i64,
        reset_date: Option<OffsetDateTime>,
        input_needed: i64,
        output_needed: i64,
    ) -> BillingError {
        if input_remaining <= 0 || output_remaining <= 0 {
            BillingError::QuotaExhausted { reset_date }
        } else {
            BillingError::InsufficientQuota {
                input_needed,
                input_remaining,
                output_needed,
                output_remaining,
                reset_date,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test::{new_free_subscriber, InMemoryQuotaStore};
    use time::Duration;

    fn ledger() -> (QuotaLedger, InMemoryQuotaStore) {
        let store = InMemoryQuotaStore::new();
        (QuotaLedger::new(Arc::new(store.clone())), store)
    }

    fn seed_paid(
        store: &InMemoryQuotaStore,
        plan: Plan,
        input: i64,
        output: i64,
        reset: Option<OffsetDateTime>,
    ) -> Uuid {
        let mut subscriber = new_free_subscriber("paid@example.com");
        subscriber.plan = plan.to_string();
        subscriber.subscription_status = "active".to_string();
        subscriber.input_tokens_remaining = input;
        subscriber.output_tokens_remaining = output;
        subscriber.token_reset_date = reset;
        let id = subscriber.id;
        store.seed(subscriber);
        id
    }

    #[test]
    fn test_estimate_rounds_up() {
        // 1 char -> 1 input token, and output reserve is never zero
        assert_eq!(
            estimate_usage(1),
            UsageEstimate {
                input_tokens: 1,
                output_tokens: 1
            }
        );
        assert_eq!(estimate_usage(8).input_tokens, 2);
        assert_eq!(estimate_usage(9).input_tokens, 3);

        // 1000 chars -> 250 input, 250 * 0.15 = 37.5 -> 38 output
        let estimate = estimate_usage(1000);
        assert_eq!(estimate.input_tokens, 250);
        assert_eq!(estimate.output_tokens, 38);

        assert_eq!(
            estimate_usage(0),
            UsageEstimate {
                input_tokens: 0,
                output_tokens: 0
            }
        );
    }

    #[test]
    fn test_one_month_after_clamps_day() {
        use time::macros::datetime;

        let jan31 = datetime!(2026-01-31 12:00 UTC);
        assert_eq!(one_month_after(jan31), datetime!(2026-02-28 12:00 UTC));

        let leap = datetime!(2028-01-31 00:00 UTC);
        assert_eq!(one_month_after(leap), datetime!(2028-02-29 00:00 UTC));

        let dec = datetime!(2026-12-15 09:30 UTC);
        assert_eq!(one_month_after(dec), datetime!(2027-01-15 09:30 UTC));
    }

    #[tokio::test]
    async fn test_allocate_overwrites_balance() {
        let (ledger, store) = ledger();
        let future = OffsetDateTime::now_utc() + Duration::days(30);
        let id = seed_paid(&store, Plan::Creator, 7, 3, Some(future));

        ledger
            .allocate(id, Plan::Creator, Some(future))
            .await
            .unwrap();

        let row = store.snapshot(id).unwrap();
        assert_eq!(row.input_tokens_remaining, 3_000_000);
        assert_eq!(row.output_tokens_remaining, 500_000);
        assert_eq!(row.token_reset_date, Some(future));
        assert_eq!(row.videos_processed_this_month, 0);
    }

    #[tokio::test]
    async fn test_allocate_free_schedules_monthly_reset() {
        let (ledger, store) = ledger();
        let subscriber = new_free_subscriber("free@example.com");
        let id = subscriber.id;
        store.seed(subscriber);

        ledger.allocate(id, Plan::Free, None).await.unwrap();

        let row = store.snapshot(id).unwrap();
        assert_eq!(row.input_tokens_remaining, 150_000);
        assert_eq!(row.output_tokens_remaining, 30_000);
        // The free grant refills monthly, so a reset must be scheduled
        let reset = row.token_reset_date.expect("free tier gets a reset date");
        assert!(reset > OffsetDateTime::now_utc());
        assert_eq!(row.video_reset_date, row.token_reset_date);

        let status = ledger.check_availability(id, 0, 0).await.unwrap();
        assert!(!status.exhausted);
    }

    #[tokio::test]
    async fn test_free_cycle_refills_lazily() {
        let (ledger, store) = ledger();
        let mut subscriber = new_free_subscriber("refill@example.com");
        subscriber.input_tokens_remaining = 0;
        subscriber.output_tokens_remaining = 0;
        subscriber.videos_processed_this_month = 3;
        subscriber.token_reset_date = Some(OffsetDateTime::now_utc() - Duration::days(1));
        let id = subscriber.id;
        store.seed(subscriber);

        let status = ledger.token_status(id).await.unwrap();
        assert_eq!(status.input_tokens_remaining, 150_000);
        assert_eq!(status.output_tokens_remaining, 30_000);
        assert_eq!(status.videos_processed_this_month, 0);
        assert!(status.token_reset_date.unwrap() > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn test_consume_all_or_nothing() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 100, 20, None);

        let status = ledger.consume(id, 40, 5).await.unwrap();
        assert_eq!(status.input_tokens_remaining, 60);
        assert_eq!(status.output_tokens_remaining, 15);

        // Input covered, output not: neither pool moves
        let err = ledger.consume(id, 10, 100).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientQuota { .. }));
        let row = store.snapshot(id).unwrap();
        assert_eq!(row.input_tokens_remaining, 60);
        assert_eq!(row.output_tokens_remaining, 15);
    }

    #[tokio::test]
    async fn test_exhausted_vs_insufficient() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 60, 0, None);

        let err = ledger.consume(id, 1, 1).await.unwrap_err();
        assert!(matches!(err, BillingError::QuotaExhausted { .. }));

        let id2 = seed_paid(&store, Plan::Creator, 60, 10, None);
        let err = ledger.consume(id2, 80, 1).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientQuota { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_consume_single_winner() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 60, 10, None);

        let a = ledger.consume(id, 50, 10);
        let b = ledger.consume(id, 50, 10);
        let (a, b) = tokio::join!(a, b);

        assert!(
            a.is_ok() ^ b.is_ok(),
            "exactly one of two overlapping consumes may succeed"
        );
        let row = store.snapshot(id).unwrap();
        assert_eq!(row.input_tokens_remaining, 10);
        assert_eq!(row.output_tokens_remaining, 0);
    }

    #[tokio::test]
    async fn test_elapsed_cycle_resets_before_read() {
        let (ledger, store) = ledger();
        let past = OffsetDateTime::now_utc() - Duration::hours(2);
        let id = seed_paid(&store, Plan::Creator, 3, 0, Some(past));

        // The stale zero balance must not be visible
        let status = ledger.token_status(id).await.unwrap();
        assert_eq!(status.input_tokens_remaining, 3_000_000);
        assert_eq!(status.output_tokens_remaining, 500_000);
        assert!(status.token_reset_date.unwrap() > OffsetDateTime::now_utc());
    }

    #[tokio::test]
    async fn test_elapsed_cycle_resets_before_consume() {
        let (ledger, store) = ledger();
        let past = OffsetDateTime::now_utc() - Duration::minutes(1);
        let id = seed_paid(&store, Plan::Creator, 0, 0, Some(past));

        let status = ledger.consume(id, 1_000, 150).await.unwrap();
        assert_eq!(status.input_tokens_remaining, 2_999_000);
        assert_eq!(status.output_tokens_remaining, 499_850);
    }

    #[tokio::test]
    async fn test_check_availability_does_not_consume() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 100, 20, None);

        ledger.check_availability(id, 100, 20).await.unwrap();
        let row = store.snapshot(id).unwrap();
        assert_eq!(row.input_tokens_remaining, 100);
        assert_eq!(row.output_tokens_remaining, 20);

        let err = ledger.check_availability(id, 101, 1).await.unwrap_err();
        assert!(matches!(err, BillingError::InsufficientQuota { .. }));
    }

    #[tokio::test]
    async fn test_status_reports_exhaustion() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 0, 500, None);

        // A zero-amount pre-flight still succeeds but flags the empty pool
        let status = ledger.check_availability(id, 0, 0).await.unwrap();
        assert!(status.exhausted);

        let id2 = seed_paid(&store, Plan::Creator, 10, 500, None);
        let status = ledger.token_status(id2).await.unwrap();
        assert!(!status.exhausted);
    }

    #[tokio::test]
    async fn test_reset_sweep_skips_not_due_and_free() {
        let (ledger, store) = ledger();
        let now = OffsetDateTime::now_utc();

        let due = seed_paid(&store, Plan::Studio, 5, 5, Some(now - Duration::hours(1)));
        let not_due = seed_paid(&store, Plan::Creator, 5, 5, Some(now + Duration::days(10)));
        let free = new_free_subscriber("nobody@example.com");
        let free_id = free.id;
        store.seed(free);

        let sweep = ledger.reset_all_due_cycles(now).await.unwrap();
        assert_eq!(sweep.reset, 1);
        assert_eq!(sweep.failed, 0);

        assert_eq!(
            store.snapshot(due).unwrap().input_tokens_remaining,
            10_000_000
        );
        assert_eq!(store.snapshot(not_due).unwrap().input_tokens_remaining, 5);
        assert_eq!(
            store.snapshot(free_id).unwrap().input_tokens_remaining,
            150_000
        );
    }

    #[tokio::test]
    async fn test_reset_cycle_idempotent() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 12, 4, Some(OffsetDateTime::now_utc()));

        ledger.reset_cycle(id).await.unwrap();
        let first = store.snapshot(id).unwrap();
        ledger.reset_cycle(id).await.unwrap();
        let second = store.snapshot(id).unwrap();

        assert_eq!(first.input_tokens_remaining, second.input_tokens_remaining);
        assert_eq!(second.input_tokens_remaining, 3_000_000);
        assert_eq!(second.output_tokens_remaining, 500_000);
    }

    #[tokio::test]
    async fn test_record_video_processed() {
        let (ledger, store) = ledger();
        let id = seed_paid(&store, Plan::Creator, 100, 100, None);

        assert_eq!(ledger.record_video_processed(id).await.unwrap(), 1);
        assert_eq!(ledger.record_video_processed(id).await.unwrap(), 2);
        assert_eq!(
            store.snapshot(id).unwrap().videos_processed_this_month,
            2
        );
    }
}
