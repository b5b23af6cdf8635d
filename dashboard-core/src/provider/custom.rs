use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::Result,
    model::{
        HOURLY_FORECAST_LIMIT, LocationCandidate, NormalizedWeather, SavedLocation, sample_hourly,
    },
    provider::{
        ProviderId, RawWeather,
        http::{get_text, parse_json},
    },
};

use super::WeatherProvider;

/// A self-hosted endpoint that already speaks the canonical model.
///
/// `GET {base}/weather?lat=..&lon=..[&key=..]` returns a [`NormalizedWeather`]
/// document and `GET {base}/search?q=..` a list of candidates. Results are
/// still sanitized since the server is outside our control.
#[derive(Debug, Clone)]
pub struct CustomProvider {
    base_url: String,
    api_key: Option<String>,
    http: Client,
}

impl CustomProvider {
    pub fn new(base_url: &str, api_key: Option<String>, http: Client) -> Self {
        Self { base_url: base_url.trim().trim_end_matches('/').to_string(), api_key, http }
    }

    fn with_key<'a>(&'a self, mut query: Vec<(&'a str, &'a str)>) -> Vec<(&'a str, &'a str)> {
        if let Some(key) = self.api_key.as_deref() {
            query.push(("key", key));
        }
        query
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomCandidate {
    name: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    country: String,
    lat: f64,
    lon: f64,
    id: Option<String>,
}

#[async_trait]
impl WeatherProvider for CustomProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Custom
    }

    async fn fetch_raw(&self, location: &SavedLocation) -> Result<RawWeather> {
        let url = format!("{}/weather", self.base_url);
        let lat = location.lat.to_string();
        let lon = location.lon.to_string();
        let query = self.with_key(vec![("lat", lat.as_str()), ("lon", lon.as_str())]);

        let body = get_text(&self.http, self.id(), &url, &query).await?;
        Ok(RawWeather::from_current(body))
    }

    fn normalize(&self, raw: &RawWeather) -> Result<NormalizedWeather> {
        let mut weather: NormalizedWeather = parse_json(self.id(), &raw.current)?;

        weather.humidity_pct = weather.humidity_pct.min(100);
        weather.wind.degrees %= 360;
        weather.forecast_daily.sort_by_key(|d| d.date);
        weather.forecast_hourly = sample_hourly(
            std::mem::take(&mut weather.forecast_hourly),
            weather.observed_at_epoch,
            HOURLY_FORECAST_LIMIT,
        );

        Ok(weather)
    }

    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        let url = format!("{}/search", self.base_url);
        let params = self.with_key(vec![("q", query)]);
        let body = get_text(&self.http, self.id(), &url, &params).await?;

        parse_search(&body)
    }
}

pub(crate) fn parse_search(body: &str) -> Result<Vec<LocationCandidate>> {
    let entries: Vec<CustomCandidate> = parse_json(ProviderId::Custom, body)?;

    Ok(entries
        .into_iter()
        .map(|e| LocationCandidate {
            name: e.name,
            region: e.region,
            country: e.country,
            lat: e.lat,
            lon: e.lon,
            provider: ProviderId::Custom,
            provider_location_key: e.id,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DashboardError;

    fn provider() -> CustomProvider {
        CustomProvider::new("https://weather.example.com/api/", None, Client::new())
    }

    #[test]
    fn trailing_slash_is_dropped() {
        assert_eq!(provider().base_url, "https://weather.example.com/api");
    }

    #[test]
    fn canonical_payload_is_sanitized() {
        let body = r#"{
            "locationName": "Home", "coordinates": {"lat": 1.0, "lon": 2.0},
            "observedAtEpoch": 7200, "temperatureC": 20.0, "feelsLikeC": 19.0,
            "tempMinC": 15.0, "tempMaxC": 22.0, "humidityPct": 140, "pressureHpa": 1010.0,
            "visibilityM": 9000, "wind": {"speedKph": 12.0, "degrees": 400},
            "condition": {"summary": "Clear", "iconId": "sun"},
            "forecastHourly": [
                {"epoch": 10800, "tempC": 19.0, "condition": {"summary": "Clear", "iconId": "sun"}},
                {"epoch": 3600, "tempC": 18.0, "condition": {"summary": "Clear", "iconId": "sun"}},
                {"epoch": 7200, "tempC": 20.0, "condition": {"summary": "Clear", "iconId": "sun"}}
            ]
        }"#;

        let weather = provider().normalize(&RawWeather::from_current(body)).unwrap();

        assert_eq!(weather.humidity_pct, 100);
        assert_eq!(weather.wind.degrees, 40);
        assert!(weather.sun.is_none());
        let epochs: Vec<i64> = weather.forecast_hourly.iter().map(|h| h.epoch).collect();
        assert_eq!(epochs, vec![7200, 10800]);
    }

    #[test]
    fn search_accepts_minimal_candidates() {
        let body = r#"[{"name": "Home", "lat": 1.5, "lon": 2.5}, {"name": "Cabin", "lat": 3, "lon": 4, "id": "c1"}]"#;
        let candidates = parse_search(body).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].provider, ProviderId::Custom);
        assert_eq!(candidates[1].provider_location_key.as_deref(), Some("c1"));
    }

    #[test]
    fn non_canonical_payload_is_rejected() {
        let err = provider().normalize(&RawWeather::from_current(r#"{"temp": 1}"#)).unwrap_err();
        assert!(matches!(err, DashboardError::ProviderResponse { provider: ProviderId::Custom, .. }));
    }
}
