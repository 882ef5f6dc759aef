use std::time::Duration;
use thiserror::Error;

/// Classification of every exchange call outcome.
///
/// The resilient client retries `Transient` in place, converts an
/// exhausted retry budget into `Unavailable`, and turns `RateLimited`
/// into a cool-down that defers the call to the next tick. The remaining
/// kinds surface to the control loop unchanged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("transient network failure: {0}")]
    Transient(String),

    #[error("rate limited by exchange")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("unknown trading symbol: {0}")]
    InvalidSymbol(String),

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("rejected market payload: {0}")]
    DataValidation(String),

    #[error("exchange unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Errors the control loop treats as "no fresh data this tick" for
    /// the affected pair rather than as faults to report.
    pub fn is_absorbed(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::RateLimited { .. }
                | Self::Unavailable { .. }
                | Self::DataValidation(_)
        )
    }

    /// Errors that require operator intervention
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::InvalidSymbol(_))
    }
}
