//! Scheduled maintenance jobs.
//!
//! Every job is fire-safe: errors are logged and the schedule keeps running.

use clipflow_billing::{QuotaLedger, QuotaStore};
use time::OffsetDateTime;
use tracing::{error, info};

/// Reset every paid subscriber whose billing cycle has elapsed. Lazy resets
/// cover subscribers the moment they are read; this sweep covers the idle
/// rest so reset dates never drift far past due.
pub async fn run_quota_reset_sweep(ledger: &QuotaLedger) {
    match ledger.reset_all_due_cycles(OffsetDateTime::now_utc()).await {
        Ok(sweep) => {
            if sweep.reset > 0 || sweep.failed > 0 {
                info!(
                    reset = sweep.reset,
                    failed = sweep.failed,
                    "Quota reset sweep finished"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Quota reset sweep failed");
        }
    }
}

/// Drop webhook dedup claims past their retry window
pub async fn run_dedup_purge(store: &dyn QuotaStore) {
    match store
        .purge_expired_deliveries(OffsetDateTime::now_utc())
        .await
    {
        Ok(purged) => {
            if purged > 0 {
                info!(purged = purged, "Webhook dedup purge finished");
            }
        }
        Err(e) => {
            error!(error = %e, "Webhook dedup purge failed");
        }
    }
}
