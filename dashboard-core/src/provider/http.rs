//! Request plumbing shared by the HTTP adapters.

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use crate::{
    error::{DashboardError, FetchErrorKind, Result},
    provider::ProviderId,
};

/// GET `url` and return the body of a successful response.
pub(crate) async fn get_text(
    http: &Client,
    provider: ProviderId,
    url: &str,
    query: &[(&str, &str)],
) -> Result<String> {
    let res = http
        .get(url)
        .query(query)
        .send()
        .await
        .map_err(|err| transport_error(provider, err))?;

    let status = res.status();
    let body = res.text().await.map_err(|err| transport_error(provider, err))?;

    if !status.is_success() {
        return Err(status_error(provider, status, &body));
    }

    Ok(body)
}

pub(crate) fn parse_json<T: DeserializeOwned>(provider: ProviderId, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|err| {
        DashboardError::malformed(
            provider,
            format!("failed to parse response: {err}; body: {}", truncate_body(body)),
        )
    })
}

/// Parse a supplementary payload; a missing or unreadable one is absent data.
pub(crate) fn parse_optional<T: DeserializeOwned>(
    provider: ProviderId,
    what: &str,
    body: Option<&str>,
) -> Option<T> {
    let body = body?;
    match parse_json(provider, body) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::warn!(%provider, what, error = %err, "ignoring unreadable supplementary payload");
            None
        }
    }
}

/// Keep the body of a supplementary request, logging and dropping failures.
pub(crate) fn optional_body(provider: ProviderId, what: &str, res: Result<String>) -> Option<String> {
    match res {
        Ok(body) => Some(body),
        Err(err) => {
            tracing::warn!(%provider, what, error = %err, "supplementary request failed");
            None
        }
    }
}

pub(crate) fn status_error(provider: ProviderId, status: StatusCode, body: &str) -> DashboardError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DashboardError::fetch(
            FetchErrorKind::Unauthorized,
            format!("{provider} rejected the API key ({status})"),
        ),
        StatusCode::TOO_MANY_REQUESTS => DashboardError::fetch(
            FetchErrorKind::RateLimited,
            format!("{provider} rate limit reached ({status})"),
        ),
        _ => DashboardError::ProviderResponse {
            provider,
            status: status.as_u16(),
            message: truncate_body(body),
        },
    }
}

fn transport_error(provider: ProviderId, err: reqwest::Error) -> DashboardError {
    let kind = if err.is_timeout() { FetchErrorKind::Timeout } else { FetchErrorKind::Network };
    DashboardError::fetch(kind, format!("request to {provider} failed: {err}"))
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    match body.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
