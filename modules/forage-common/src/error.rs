use forage_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ForageError>;

#[derive(Error, Debug)]
pub enum ForageError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("Duplicate {kind}: {key}")]
    Duplicate { kind: String, key: String },

    /// Admission denied by the throttle controller. Retry later.
    #[error("Budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    #[error("Strategy {id} is deprecated")]
    StrategyDeprecated { id: String },

    #[error("Signature verification failed: {0}")]
    Signature(String),

    #[error("Webhook timestamp outside replay window ({age_secs}s)")]
    StaleTimestamp { age_secs: i64 },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ForageError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Expected, back-off-and-retry conditions as opposed to failures.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. } | Self::RateLimited(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for ForageError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { collection, id } => Self::NotFound {
                kind: collection,
                id,
            },
            StoreError::AlreadyExists { collection, id } => Self::Duplicate {
                kind: collection,
                key: id,
            },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_domain_not_found() {
        let err: ForageError = StoreError::not_found("staged_venues", "v1").into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "staged_venues not found: v1");
    }

    #[test]
    fn only_budget_and_rate_limits_are_retryable() {
        assert!(ForageError::BudgetExceeded { reason: "daily".into() }.is_retryable());
        assert!(ForageError::RateLimited("partner".into()).is_retryable());
        assert!(!ForageError::Validation("bad".into()).is_retryable());
    }
}
