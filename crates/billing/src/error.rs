//! Billing error types

use thiserror::Error;
use time::OffsetDateTime;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error(
        "Insufficient quota: need {input_needed} input / {output_needed} output tokens, \
         have {input_remaining} / {output_remaining}"
    )]
    InsufficientQuota {
        input_needed: i64,
        input_remaining: i64,
        output_needed: i64,
        output_remaining: i64,
        /// When the next cycle refills the budget, if one is scheduled
        reset_date: Option<OffsetDateTime>,
    },

    #[error("Token quota exhausted for this billing cycle")]
    QuotaExhausted { reset_date: Option<OffsetDateTime> },

    #[error("Payment provider unavailable: {message}")]
    ProviderUnavailable {
        /// Provider HTTP status, passed through verbatim so callers get the
        /// provider's own diagnostic detail
        status_code: Option<u16>,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        let status_code = match &err {
            stripe::StripeError::Stripe(req_err) => Some(req_err.http_status),
            _ => None,
        };
        BillingError::ProviderUnavailable {
            status_code,
            message: err.to_string(),
        }
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_quota_message_carries_amounts() {
        let err = BillingError::InsufficientQuota {
            input_needed: 150,
            input_remaining: 100,
            output_needed: 5,
            output_remaining: 20,
            reset_date: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("150"));
        assert!(msg.contains("100"));
        assert!(msg.contains('5'));
        assert!(msg.contains("20"));
    }
}
