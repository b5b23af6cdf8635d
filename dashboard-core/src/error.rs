use thiserror::Error;

use crate::provider::ProviderId;

/// Why a network-bound call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Timeout,
    Unauthorized,
    RateLimited,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FetchErrorKind::Network => "network error",
            FetchErrorKind::Timeout => "timed out",
            FetchErrorKind::Unauthorized => "unauthorized",
            FetchErrorKind::RateLimited => "rate limited",
        })
    }
}

/// Errors surfaced by the dashboard core.
///
/// The type is `Clone` so that every caller waiting on a coalesced fetch can
/// receive the same failure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DashboardError {
    #[error("{provider} returned an unexpected response (status {status}): {message}")]
    ProviderResponse {
        provider: ProviderId,
        status: u16,
        message: String,
    },

    #[error("Weather fetch failed ({kind}): {message}")]
    WeatherFetch { kind: FetchErrorKind, message: String },

    #[error("Location '{0}' is already in the list")]
    DuplicateLocation(String),

    #[error("Invalid value for '{field}': {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl DashboardError {
    pub fn fetch(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        DashboardError::WeatherFetch { kind, message: message.into() }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        DashboardError::Validation { field, reason: reason.into() }
    }

    pub fn malformed(provider: ProviderId, message: impl Into<String>) -> Self {
        DashboardError::ProviderResponse { provider, status: 200, message: message.into() }
    }

    /// Errors that the aggregator may downgrade to a stale cached result.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            DashboardError::ProviderResponse { .. } | DashboardError::WeatherFetch { .. }
        )
    }
}

impl From<anyhow::Error> for DashboardError {
    fn from(err: anyhow::Error) -> Self {
        DashboardError::Storage(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, DashboardError>;
