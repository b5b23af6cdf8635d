use crate::{
    error::{DashboardError, FetchErrorKind, Result},
    model::{LocationCandidate, NormalizedWeather, SavedLocation},
    provider::{
        custom::CustomProvider,
        openweather::{OpenWeatherProvider, Units},
        qweather::QWeatherProvider,
        weatherapi::WeatherApiProvider,
    },
    settings::Settings,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt::Debug, str::FromStr, sync::Arc, time::Duration};

pub mod custom;
pub(crate) mod http;
pub mod openweather;
pub mod qweather;
pub mod weatherapi;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[serde(alias = "openweather")]
    OpenWeatherMap,
    WeatherApi,
    QWeather,
    Custom,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::OpenWeatherMap => "openweathermap",
            ProviderId::WeatherApi => "weatherapi",
            ProviderId::QWeather => "qweather",
            ProviderId::Custom => "custom",
        }
    }

    pub const fn all() -> &'static [ProviderId] {
        &[ProviderId::OpenWeatherMap, ProviderId::WeatherApi, ProviderId::QWeather, ProviderId::Custom]
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl TryFrom<&str> for ProviderId {
    type Error = DashboardError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        let lower = value.trim().to_lowercase();

        match lower.as_str() {
            "openweathermap" | "openweather" => Ok(ProviderId::OpenWeatherMap),
            "weatherapi" => Ok(ProviderId::WeatherApi),
            "qweather" => Ok(ProviderId::QWeather),
            "custom" => Ok(ProviderId::Custom),
            _ => Err(DashboardError::validation(
                "provider",
                format!(
                    "unknown provider '{value}'. Supported providers: openweathermap, weatherapi, qweather, custom"
                ),
            )),
        }
    }
}

impl FromStr for ProviderId {
    type Err = DashboardError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ProviderId::try_from(s)
    }
}

/// Upstream response bodies, kept verbatim until normalization.
///
/// Adapters that serve everything from one endpoint only fill `current`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawWeather {
    pub current: String,
    pub forecast: Option<String>,
    pub hourly: Option<String>,
    pub air_quality: Option<String>,
}

impl RawWeather {
    pub fn from_current(body: impl Into<String>) -> Self {
        Self { current: body.into(), ..Default::default() }
    }
}

#[async_trait]
pub trait WeatherProvider: Send + Sync + Debug {
    fn id(&self) -> ProviderId;

    /// Download the raw payloads describing `location`.
    async fn fetch_raw(&self, location: &SavedLocation) -> Result<RawWeather>;

    /// Translate raw payloads into the canonical model.
    fn normalize(&self, raw: &RawWeather) -> Result<NormalizedWeather>;

    /// Resolve a free-text query into candidates, in the provider's ranking.
    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>>;

    async fn fetch(&self, location: &SavedLocation) -> Result<NormalizedWeather> {
        let raw = self.fetch_raw(location).await?;
        let mut weather = self.normalize(&raw)?;
        weather.fill_missing_location(location);
        Ok(weather)
    }
}

/// Builds adapters for the aggregator from the current settings.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, id: ProviderId, settings: &Settings) -> Result<Arc<dyn WeatherProvider>>;
}

/// Factory for the real HTTP-backed adapters. All adapters share one client.
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    http: Client,
    openweather_units: Units,
}

impl HttpProviderFactory {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("weather-dashboard/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|err| {
                DashboardError::fetch(
                    FetchErrorKind::Network,
                    format!("Failed to build HTTP client: {err}"),
                )
            })?;

        Ok(Self { http, openweather_units: Units::default() })
    }

    pub fn with_openweather_units(mut self, units: Units) -> Self {
        self.openweather_units = units;
        self
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, id: ProviderId, settings: &Settings) -> Result<Arc<dyn WeatherProvider>> {
        provider_from_settings(id, settings, self.http.clone(), self.openweather_units)
    }
}

/// Construct a provider from settings and explicit ProviderId.
pub fn provider_from_settings(
    id: ProviderId,
    settings: &Settings,
    http: Client,
    openweather_units: Units,
) -> Result<Arc<dyn WeatherProvider>> {
    let api_key = settings.provider_api_key(id);

    let provider: Arc<dyn WeatherProvider> = match id {
        ProviderId::OpenWeatherMap => {
            let provider = OpenWeatherProvider::new(require_key(id, api_key)?, http);
            Arc::new(provider.with_units(openweather_units))
        }
        ProviderId::WeatherApi => Arc::new(WeatherApiProvider::new(require_key(id, api_key)?, http)),
        ProviderId::QWeather => Arc::new(QWeatherProvider::new(
            require_key(id, api_key)?,
            settings.qweather_host.as_deref(),
            http,
        )),
        ProviderId::Custom => {
            let base_url = settings.custom_url.as_deref().filter(|u| !u.trim().is_empty());
            let base_url = base_url.ok_or_else(|| {
                DashboardError::validation(
                    "customUrl",
                    "no URL configured for the custom provider.\n\
                     Hint: run `weather-dashboard settings set custom-url <url>`.",
                )
            })?;
            Arc::new(CustomProvider::new(base_url, api_key.map(str::to_owned), http))
        }
    };

    Ok(provider)
}

fn require_key(id: ProviderId, api_key: Option<&str>) -> Result<String> {
    api_key.map(str::to_owned).ok_or_else(|| {
        DashboardError::validation(
            "apiKeys",
            format!(
                "no API key configured for provider '{id}'.\n\
                 Hint: run `weather-dashboard configure {id}` and enter your API key."
            ),
        )
    })
}
