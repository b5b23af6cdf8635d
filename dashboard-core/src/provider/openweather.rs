use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{
        AirQuality, Condition, Coordinates, DailyForecast, HourlyForecast, LocationCandidate,
        NormalizedWeather, SavedLocation, SunTimes, Wind, HOURLY_FORECAST_LIMIT, clamp_humidity,
        sample_hourly, wrap_degrees,
    },
    provider::{
        ProviderId, RawWeather,
        http::{get_text, optional_body, parse_json, parse_optional},
    },
    units,
};

use super::WeatherProvider;

const BASE_URL: &str = "https://api.openweathermap.org";
const SEARCH_LIMIT: &str = "5";

/// Unit system requested from OpenWeatherMap. The adapter converts back to
/// Celsius and km/h whichever one is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    #[default]
    Metric,
    Imperial,
    Standard,
}

impl Units {
    fn as_str(self) -> &'static str {
        match self {
            Units::Metric => "metric",
            Units::Imperial => "imperial",
            Units::Standard => "standard",
        }
    }

    fn celsius(self, value: f64) -> f64 {
        match self {
            Units::Metric => value,
            Units::Imperial => units::fahrenheit_to_celsius(value),
            Units::Standard => units::kelvin_to_celsius(value),
        }
    }

    fn kph(self, value: f64) -> f64 {
        match self {
            Units::Metric | Units::Standard => units::mps_to_kph(value),
            Units::Imperial => units::mph_to_kph(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenWeatherProvider {
    api_key: String,
    units: Units,
    http: Client,
}

impl OpenWeatherProvider {
    pub fn new(api_key: String, http: Client) -> Self {
        Self { api_key, units: Units::default(), http }
    }

    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    async fn get(&self, path: &str, location: &SavedLocation) -> Result<String> {
        let url = format!("{BASE_URL}{path}");
        let lat = location.lat.to_string();
        let lon = location.lon.to_string();

        get_text(
            &self.http,
            ProviderId::OpenWeatherMap,
            &url,
            &[
                ("lat", lat.as_str()),
                ("lon", lon.as_str()),
                ("appid", self.api_key.as_str()),
                ("units", self.units.as_str()),
            ],
        )
        .await
    }

    fn aggregate_daily(&self, entries: &[OwForecastEntry], offset: i64) -> Vec<DailyForecast> {
        let mut by_date: BTreeMap<NaiveDate, Vec<&OwForecastEntry>> = BTreeMap::new();
        for entry in entries {
            if let Some(local) = DateTime::from_timestamp(entry.dt + offset, 0) {
                by_date.entry(local.date_naive()).or_default().push(entry);
            }
        }

        by_date
            .into_iter()
            .map(|(date, day)| {
                let max_temp_c = day
                    .iter()
                    .map(|e| self.units.celsius(e.main.temp_max.unwrap_or(e.main.temp)))
                    .fold(f64::MIN, f64::max);
                let min_temp_c = day
                    .iter()
                    .map(|e| self.units.celsius(e.main.temp_min.unwrap_or(e.main.temp)))
                    .fold(f64::MAX, f64::min);
                // Closest entry to local noon describes the day.
                let condition = day
                    .iter()
                    .min_by_key(|e| ((e.dt + offset).rem_euclid(86_400) - 43_200).abs())
                    .map(|e| condition(&e.weather))
                    .unwrap_or_else(Condition::unknown);

                DailyForecast { date, max_temp_c, min_temp_c, condition }
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct OwCoord {
    lat: f64,
    lon: f64,
}

#[derive(Debug, Deserialize)]
struct OwMain {
    temp: f64,
    feels_like: Option<f64>,
    temp_min: Option<f64>,
    temp_max: Option<f64>,
    #[serde(default)]
    pressure: f64,
    #[serde(default)]
    humidity: f64,
}

#[derive(Debug, Deserialize)]
struct OwWeather {
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon: String,
}

#[derive(Debug, Default, Deserialize)]
struct OwWind {
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    deg: f64,
}

#[derive(Debug, Deserialize)]
struct OwSys {
    sunrise: Option<i64>,
    sunset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OwCurrentResponse {
    #[serde(default)]
    name: String,
    coord: OwCoord,
    dt: i64,
    #[serde(default)]
    timezone: i32,
    main: OwMain,
    #[serde(default)]
    weather: Vec<OwWeather>,
    #[serde(default)]
    wind: OwWind,
    sys: Option<OwSys>,
    visibility: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwForecastEntry {
    dt: i64,
    main: OwMain,
    #[serde(default)]
    weather: Vec<OwWeather>,
}

#[derive(Debug, Deserialize)]
struct OwForecastResponse {
    #[serde(default)]
    list: Vec<OwForecastEntry>,
}

#[derive(Debug, Deserialize)]
struct OwAqi {
    aqi: u32,
}

#[derive(Debug, Deserialize)]
struct OwAirEntry {
    main: OwAqi,
    #[serde(default)]
    components: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct OwAirResponse {
    #[serde(default)]
    list: Vec<OwAirEntry>,
}

#[derive(Debug, Deserialize)]
struct OwGeoEntry {
    name: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    country: String,
    #[serde(default)]
    state: Option<String>,
}

#[async_trait]
impl WeatherProvider for OpenWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::OpenWeatherMap
    }

    async fn fetch_raw(&self, location: &SavedLocation) -> Result<RawWeather> {
        let (current, forecast, air) = tokio::join!(
            self.get("/data/2.5/weather", location),
            self.get("/data/2.5/forecast", location),
            self.get("/data/2.5/air_pollution", location),
        );

        Ok(RawWeather {
            current: current?,
            forecast: optional_body(self.id(), "forecast", forecast),
            hourly: None,
            air_quality: optional_body(self.id(), "air quality", air),
        })
    }

    fn normalize(&self, raw: &RawWeather) -> Result<NormalizedWeather> {
        let id = self.id();
        let current: OwCurrentResponse = parse_json(id, &raw.current)?;
        let forecast: Option<OwForecastResponse> =
            parse_optional(id, "forecast", raw.forecast.as_deref());
        let air: Option<OwAirResponse> =
            parse_optional(id, "air quality", raw.air_quality.as_deref());

        let units = self.units;
        let offset = i64::from(current.timezone);
        let entries = forecast.map(|f| f.list).unwrap_or_default();

        let hourly = entries
            .iter()
            .map(|e| HourlyForecast {
                epoch: e.dt,
                temp_c: units.celsius(e.main.temp),
                condition: condition(&e.weather),
            })
            .collect();

        let sun = current.sys.as_ref().and_then(|sys| match (sys.sunrise, sys.sunset) {
            (Some(sunrise_epoch), Some(sunset_epoch)) => Some(SunTimes { sunrise_epoch, sunset_epoch }),
            _ => None,
        });

        let air_quality = air
            .and_then(|a| a.list.into_iter().next())
            .map(|entry| AirQuality { index: entry.main.aqi, components: entry.components });

        let temp = current.main.temp;

        Ok(NormalizedWeather {
            location_name: current.name,
            coordinates: Coordinates::new(current.coord.lat, current.coord.lon),
            observed_at_epoch: current.dt,
            utc_offset_seconds: current.timezone,
            temperature_c: units.celsius(temp),
            feels_like_c: units.celsius(current.main.feels_like.unwrap_or(temp)),
            temp_min_c: units.celsius(current.main.temp_min.unwrap_or(temp)),
            temp_max_c: units.celsius(current.main.temp_max.unwrap_or(temp)),
            humidity_pct: clamp_humidity(current.main.humidity),
            pressure_hpa: current.main.pressure,
            visibility_m: current.visibility.map(|v| v.max(0.0).round() as u32).unwrap_or_default(),
            wind: Wind { speed_kph: units.kph(current.wind.speed), degrees: wrap_degrees(current.wind.deg) },
            condition: condition(&current.weather),
            sun,
            air_quality,
            forecast_daily: self.aggregate_daily(&entries, offset),
            forecast_hourly: sample_hourly(hourly, current.dt, HOURLY_FORECAST_LIMIT),
        })
    }

    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        let url = format!("{BASE_URL}/geo/1.0/direct");
        let body = get_text(
            &self.http,
            self.id(),
            &url,
            &[("q", query), ("limit", SEARCH_LIMIT), ("appid", self.api_key.as_str())],
        )
        .await?;

        parse_search(&body)
    }
}

pub(crate) fn parse_search(body: &str) -> Result<Vec<LocationCandidate>> {
    let entries: Vec<OwGeoEntry> = parse_json(ProviderId::OpenWeatherMap, body)?;

    Ok(entries
        .into_iter()
        .map(|e| LocationCandidate {
            name: e.name,
            region: e.state.unwrap_or_default(),
            country: e.country,
            lat: e.lat,
            lon: e.lon,
            provider: ProviderId::OpenWeatherMap,
            provider_location_key: None,
        })
        .collect())
}

fn condition(weather: &[OwWeather]) -> Condition {
    weather
        .first()
        .map(|w| Condition::new(w.description.clone(), w.icon.clone()))
        .unwrap_or_else(Condition::unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DashboardError;

    const CURRENT: &str = r#"{
        "coord": {"lon": -74.01, "lat": 40.71},
        "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}],
        "main": {"temp": 25.5, "feels_like": 26.0, "temp_min": 24.0, "temp_max": 27.0, "pressure": 1013, "humidity": 50},
        "visibility": 10000,
        "wind": {"speed": 5.0, "deg": 180},
        "dt": 1625240000,
        "sys": {"country": "US", "sunrise": 1625212800, "sunset": 1625266800},
        "timezone": -14400,
        "name": "MockCity",
        "cod": 200
    }"#;

    const FORECAST: &str = r#"{
        "list": [
            {"dt": 1625245200, "main": {"temp": 24.0, "temp_min": 23.0, "temp_max": 24.5, "humidity": 45},
             "weather": [{"description": "few clouds", "icon": "02d"}]},
            {"dt": 1625256000, "main": {"temp": 21.0, "temp_min": 20.0, "temp_max": 21.0, "humidity": 55},
             "weather": [{"description": "scattered clouds", "icon": "03d"}]},
            {"dt": 1625266800, "main": {"temp": 18.0, "humidity": 60},
             "weather": [{"description": "clear sky", "icon": "01n"}]}
        ],
        "city": {"coord": {"lat": 40.71, "lon": -74.01}}
    }"#;

    const AIR: &str = r#"{"coord": [50, 50], "list": [{"main": {"aqi": 1},
        "components": {"co": 201.94, "no2": 0.77, "o3": 68.66, "pm2_5": 0.5}, "dt": 1625240000}]}"#;

    fn provider() -> OpenWeatherProvider {
        OpenWeatherProvider::new("KEY".into(), Client::new())
    }

    #[test]
    fn normalizes_full_payload() {
        let raw = RawWeather {
            current: CURRENT.into(),
            forecast: Some(FORECAST.into()),
            hourly: None,
            air_quality: Some(AIR.into()),
        };

        let weather = provider().normalize(&raw).expect("valid payload");

        assert_eq!(weather.location_name, "MockCity");
        assert_eq!(weather.temperature_c, 25.5);
        assert_eq!(weather.temp_max_c, 27.0);
        assert_eq!(weather.humidity_pct, 50);
        assert_eq!(weather.visibility_m, 10_000);
        assert_eq!(weather.wind.speed_kph, 18.0);
        assert_eq!(weather.wind.degrees, 180);
        assert_eq!(weather.condition, Condition::new("clear sky", "01d"));
        assert_eq!(weather.utc_offset_seconds, -14_400);
        assert_eq!(
            weather.sun,
            Some(SunTimes { sunrise_epoch: 1_625_212_800, sunset_epoch: 1_625_266_800 })
        );

        let air = weather.air_quality.expect("air quality present");
        assert_eq!(air.index, 1);
        assert_eq!(air.components.get("pm2_5"), Some(&0.5));

        let epochs: Vec<i64> = weather.forecast_hourly.iter().map(|h| h.epoch).collect();
        assert_eq!(epochs, vec![1_625_245_200, 1_625_256_000, 1_625_266_800]);

        // All three entries fall on 2021-07-02 in UTC-4.
        assert_eq!(weather.forecast_daily.len(), 1);
        let day = &weather.forecast_daily[0];
        assert_eq!(day.date, NaiveDate::from_ymd_opt(2021, 7, 2).unwrap());
        assert_eq!(day.max_temp_c, 24.5);
        assert_eq!(day.min_temp_c, 18.0);
        assert_eq!(day.condition.icon_id, "02d");
    }

    #[test]
    fn tolerates_missing_supplementary_payloads() {
        let weather = provider().normalize(&RawWeather::from_current(CURRENT)).unwrap();

        assert!(weather.air_quality.is_none());
        assert!(weather.forecast_hourly.is_empty());
        assert!(weather.forecast_daily.is_empty());
    }

    #[test]
    fn tolerates_sparse_current_payload() {
        let sparse = r#"{"coord": {"lat": 51.5, "lon": -0.12}, "dt": 1600020000,
            "main": {"temp": 15}, "name": "London"}"#;

        let weather = provider().normalize(&RawWeather::from_current(sparse)).unwrap();

        assert_eq!(weather.feels_like_c, 15.0);
        assert_eq!(weather.condition, Condition::unknown());
        assert!(weather.sun.is_none());
    }

    #[test]
    fn converts_imperial_and_standard_units() {
        let imperial = r#"{"coord": {"lat": 0, "lon": 0}, "dt": 0,
            "main": {"temp": 77.9, "feels_like": 77.9}, "wind": {"speed": 10}}"#;
        let weather = provider()
            .with_units(Units::Imperial)
            .normalize(&RawWeather::from_current(imperial))
            .unwrap();
        assert!((weather.temperature_c - 25.5).abs() < 1e-9);
        assert!((weather.wind.speed_kph - 16.09344).abs() < 1e-9);

        let standard = r#"{"coord": {"lat": 0, "lon": 0}, "dt": 0, "main": {"temp": 298.65}}"#;
        let weather = provider()
            .with_units(Units::Standard)
            .normalize(&RawWeather::from_current(standard))
            .unwrap();
        assert!((weather.temperature_c - 25.5).abs() < 1e-9);
    }

    #[test]
    fn malformed_payload_is_provider_response_error() {
        let err = provider().normalize(&RawWeather::from_current(r#"{"cod": 200}"#)).unwrap_err();
        assert!(matches!(
            err,
            DashboardError::ProviderResponse { provider: ProviderId::OpenWeatherMap, .. }
        ));
    }

    #[test]
    fn search_keeps_provider_order() {
        let body = r#"[
            {"name": "New York", "lat": 40.71, "lon": -74.00, "country": "US", "state": "New York"},
            {"name": "New London", "lat": 41.35, "lon": -72.09, "country": "US", "state": "Connecticut"},
            {"name": "Newcastle", "lat": 54.97, "lon": -1.61, "country": "GB"}
        ]"#;

        let candidates = parse_search(body).unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(names, vec!["New York", "New London", "Newcastle"]);
        assert_eq!(candidates[1].region, "Connecticut");
        assert_eq!(candidates[2].region, "");
        assert!(candidates.iter().all(|c| c.provider == ProviderId::OpenWeatherMap));
    }
}
