use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::Result,
    model::{
        AirQuality, Condition, Coordinates, DailyForecast, HourlyForecast, LocationCandidate,
        NormalizedWeather, SavedLocation, SunTimes, Wind, HOURLY_FORECAST_LIMIT, clamp_humidity,
        sample_hourly, wrap_degrees,
    },
    provider::{
        ProviderId, RawWeather,
        http::{get_text, parse_json},
    },
    units,
};

use super::WeatherProvider;

const BASE_URL: &str = "https://api.weatherapi.com/v1";
const FORECAST_DAYS: &str = "3";

#[derive(Debug, Clone)]
pub struct WeatherApiProvider {
    api_key: String,
    http: Client,
}

impl WeatherApiProvider {
    pub fn new(api_key: String, http: Client) -> Self {
        Self { api_key, http }
    }

    fn query_for(location: &SavedLocation) -> String {
        match location.provider_key_for(ProviderId::WeatherApi) {
            Some(id) => format!("id:{id}"),
            None => format!("{},{}", location.lat, location.lon),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WaLocation {
    name: String,
    lat: f64,
    lon: f64,
    tz_id: Option<String>,
    localtime_epoch: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WaCondition {
    #[serde(default)]
    text: String,
    #[serde(default)]
    icon: String,
    code: Option<u32>,
}

impl WaCondition {
    fn to_condition(&self) -> Condition {
        let icon_id = match self.code {
            Some(code) => code.to_string(),
            None => self.icon.clone(),
        };
        Condition::new(self.text.clone(), icon_id)
    }
}

#[derive(Debug, Deserialize)]
struct WaAirQuality {
    #[serde(rename = "us-epa-index")]
    us_epa_index: Option<u32>,
    #[serde(flatten)]
    components: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WaCurrent {
    last_updated_epoch: Option<i64>,
    temp_c: f64,
    feelslike_c: Option<f64>,
    #[serde(default)]
    humidity: f64,
    #[serde(default)]
    wind_kph: f64,
    #[serde(default)]
    wind_degree: f64,
    #[serde(default)]
    pressure_mb: f64,
    vis_km: Option<f64>,
    #[serde(default)]
    condition: WaCondition,
    air_quality: Option<WaAirQuality>,
}

#[derive(Debug, Deserialize)]
struct WaDay {
    maxtemp_c: f64,
    mintemp_c: f64,
    #[serde(default)]
    condition: WaCondition,
}

#[derive(Debug, Deserialize)]
struct WaAstro {
    sunrise: Option<String>,
    sunset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WaHour {
    time_epoch: i64,
    temp_c: f64,
    #[serde(default)]
    condition: WaCondition,
}

#[derive(Debug, Deserialize)]
struct WaForecastDay {
    date: NaiveDate,
    day: WaDay,
    astro: Option<WaAstro>,
    #[serde(default)]
    hour: Vec<WaHour>,
}

#[derive(Debug, Default, Deserialize)]
struct WaForecast {
    #[serde(default)]
    forecastday: Vec<WaForecastDay>,
}

#[derive(Debug, Deserialize)]
struct WaResponse {
    location: WaLocation,
    current: WaCurrent,
    #[serde(default)]
    forecast: WaForecast,
}

#[derive(Debug, Deserialize)]
struct WaSearchEntry {
    id: Option<i64>,
    name: String,
    #[serde(default)]
    region: String,
    #[serde(default)]
    country: String,
    lat: f64,
    lon: f64,
}

#[async_trait]
impl WeatherProvider for WeatherApiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::WeatherApi
    }

    async fn fetch_raw(&self, location: &SavedLocation) -> Result<RawWeather> {
        let url = format!("{BASE_URL}/forecast.json");
        let q = Self::query_for(location);

        let body = get_text(
            &self.http,
            self.id(),
            &url,
            &[
                ("key", self.api_key.as_str()),
                ("q", q.as_str()),
                ("days", FORECAST_DAYS),
                ("aqi", "yes"),
                ("alerts", "no"),
            ],
        )
        .await?;

        Ok(RawWeather::from_current(body))
    }

    fn normalize(&self, raw: &RawWeather) -> Result<NormalizedWeather> {
        let parsed: WaResponse = parse_json(self.id(), &raw.current)?;
        let WaResponse { location, current, forecast } = parsed;

        let tz: Tz = location.tz_id.as_deref().and_then(|id| id.parse().ok()).unwrap_or(Tz::UTC);
        let observed_at = current
            .last_updated_epoch
            .or(location.localtime_epoch)
            .unwrap_or_else(|| Utc::now().timestamp());
        let utc_offset_seconds = DateTime::from_timestamp(observed_at, 0)
            .map(|dt| tz.offset_from_utc_datetime(&dt.naive_utc()).fix().local_minus_utc())
            .unwrap_or_default();

        let today = forecast.forecastday.first();
        let sun = today.and_then(|day| {
            let astro = day.astro.as_ref()?;
            Some(SunTimes {
                sunrise_epoch: local_clock_to_epoch(tz, day.date, astro.sunrise.as_deref()?)?,
                sunset_epoch: local_clock_to_epoch(tz, day.date, astro.sunset.as_deref()?)?,
            })
        });

        let air_quality = current.air_quality.as_ref().and_then(|aq| {
            let index = aq.us_epa_index?;
            let components = aq
                .components
                .iter()
                .filter(|(name, _)| !name.ends_with("-index"))
                .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
                .collect();
            Some(AirQuality { index, components })
        });

        let forecast_daily = forecast
            .forecastday
            .iter()
            .map(|day| DailyForecast {
                date: day.date,
                max_temp_c: day.day.maxtemp_c,
                min_temp_c: day.day.mintemp_c,
                condition: day.day.condition.to_condition(),
            })
            .collect();

        let hourly = forecast
            .forecastday
            .iter()
            .flat_map(|day| day.hour.iter())
            .map(|h| HourlyForecast { epoch: h.time_epoch, temp_c: h.temp_c, condition: h.condition.to_condition() })
            .collect();

        Ok(NormalizedWeather {
            location_name: location.name,
            coordinates: Coordinates::new(location.lat, location.lon),
            observed_at_epoch: observed_at,
            utc_offset_seconds,
            temperature_c: current.temp_c,
            feels_like_c: current.feelslike_c.unwrap_or(current.temp_c),
            temp_min_c: today.map(|d| d.day.mintemp_c).unwrap_or(current.temp_c),
            temp_max_c: today.map(|d| d.day.maxtemp_c).unwrap_or(current.temp_c),
            humidity_pct: clamp_humidity(current.humidity),
            pressure_hpa: current.pressure_mb,
            visibility_m: current.vis_km.map(units::km_to_m).unwrap_or_default(),
            wind: Wind { speed_kph: current.wind_kph, degrees: wrap_degrees(current.wind_degree) },
            condition: current.condition.to_condition(),
            sun,
            air_quality,
            forecast_daily,
            forecast_hourly: sample_hourly(hourly, observed_at, HOURLY_FORECAST_LIMIT),
        })
    }

    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        let url = format!("{BASE_URL}/search.json");
        let body =
            get_text(&self.http, self.id(), &url, &[("key", self.api_key.as_str()), ("q", query)]).await?;

        parse_search(&body)
    }
}

pub(crate) fn parse_search(body: &str) -> Result<Vec<LocationCandidate>> {
    let entries: Vec<WaSearchEntry> = parse_json(ProviderId::WeatherApi, body)?;

    Ok(entries
        .into_iter()
        .map(|e| LocationCandidate {
            name: e.name,
            region: e.region,
            country: e.country,
            lat: e.lat,
            lon: e.lon,
            provider: ProviderId::WeatherApi,
            provider_location_key: e.id.map(|id| id.to_string()),
        })
        .collect())
}

/// Resolve an astro clock string such as "06:45 PM" on `date` in `tz`.
fn local_clock_to_epoch(tz: Tz, date: NaiveDate, clock: &str) -> Option<i64> {
    let time = NaiveTime::parse_from_str(clock.trim(), "%I:%M %p").ok()?;
    tz.from_local_datetime(&date.and_time(time)).earliest().map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DashboardError;

    fn forecast_payload(tz_id: &str) -> String {
        let hours: Vec<String> = (0..24)
            .map(|i| {
                format!(
                    r#"{{"time_epoch": {}, "time": "2023-10-27 {:02}:00", "temp_c": {},
                        "condition": {{"text": "Clear", "icon": "//cdn.weatherapi.com/weather/64x64/day/113.png"}}}}"#,
                    1_698_364_800 + i * 3600,
                    i,
                    15 + i
                )
            })
            .collect();

        format!(
            r#"{{
            "location": {{"name": "TestCity", "region": "TestRegion", "country": "TestCountry",
                "lat": 0, "lon": 0, "tz_id": "{tz_id}", "localtime_epoch": 1698408000,
                "localtime": "2023-10-27 12:00"}},
            "current": {{"temp_c": 20, "condition": {{"text": "Clear", "icon": "//cdn.weatherapi.com/weather/64x64/day/113.png", "code": 1000}},
                "humidity": 50, "wind_kph": 10, "wind_degree": 370, "feelslike_c": 20, "pressure_mb": 1000,
                "vis_km": 10, "uv": 1, "air_quality": {{"us-epa-index": 1, "gb-defra-index": 2, "pm2_5": 4.5}}}},
            "forecast": {{"forecastday": [{{
                "date": "2023-10-27",
                "day": {{"maxtemp_c": 25, "mintemp_c": 15,
                    "condition": {{"text": "Sunny", "icon": "//cdn.weatherapi.com/weather/64x64/day/113.png"}}}},
                "astro": {{"sunrise": "06:15 AM", "sunset": "06:45 PM"}},
                "hour": [{}]
            }}]}}
        }}"#,
            hours.join(",")
        )
    }

    fn provider() -> WeatherApiProvider {
        WeatherApiProvider::new("KEY".into(), Client::new())
    }

    #[test]
    fn normalizes_forecast_payload() {
        let raw = RawWeather::from_current(forecast_payload("UTC"));
        let weather = provider().normalize(&raw).expect("valid payload");

        assert_eq!(weather.location_name, "TestCity");
        assert_eq!(weather.observed_at_epoch, 1_698_408_000);
        assert_eq!(weather.utc_offset_seconds, 0);
        assert_eq!(weather.temp_max_c, 25.0);
        assert_eq!(weather.temp_min_c, 15.0);
        assert_eq!(weather.visibility_m, 10_000);
        assert_eq!(weather.wind.degrees, 10);
        assert_eq!(weather.condition, Condition::new("Clear", "1000"));

        // 2023-10-27 06:15 and 18:45 UTC
        assert_eq!(
            weather.sun,
            Some(SunTimes { sunrise_epoch: 1_698_387_300, sunset_epoch: 1_698_432_300 })
        );

        let air = weather.air_quality.expect("air quality present");
        assert_eq!(air.index, 1);
        assert_eq!(air.components.len(), 1);
        assert_eq!(air.components.get("pm2_5"), Some(&4.5));
    }

    #[test]
    fn hourly_forecast_starts_at_local_now() {
        let weather = provider().normalize(&RawWeather::from_current(forecast_payload("UTC"))).unwrap();

        assert_eq!(weather.forecast_hourly.len(), 12);
        assert_eq!(weather.forecast_hourly[0].epoch, 1_698_408_000);
        // 15:00 is among the sampled hours
        assert!(weather.forecast_hourly.iter().any(|h| h.epoch == 1_698_364_800 + 15 * 3600));
    }

    #[test]
    fn astro_times_are_resolved_in_location_zone() {
        let weather =
            provider().normalize(&RawWeather::from_current(forecast_payload("Europe/Paris"))).unwrap();

        // Paris is UTC+2 on 2023-10-27.
        assert_eq!(weather.utc_offset_seconds, 7200);
        let sun = weather.sun.expect("sun times");
        assert_eq!(sun.sunrise_epoch, 1_698_387_300 - 7200);
    }

    #[test]
    fn polar_astro_strings_mean_no_sun_times() {
        let payload = forecast_payload("UTC").replace("06:15 AM", "No sunrise");
        let weather = provider().normalize(&RawWeather::from_current(payload)).unwrap();
        assert!(weather.sun.is_none());
    }

    #[test]
    fn current_only_payload_is_accepted() {
        let body = r#"{"location": {"name": "X", "lat": 1, "lon": 2},
            "current": {"temp_c": 3.5, "last_updated_epoch": 1700000000}}"#;
        let weather = provider().normalize(&RawWeather::from_current(body)).unwrap();

        assert_eq!(weather.temp_max_c, 3.5);
        assert!(weather.forecast_daily.is_empty());
        assert!(weather.air_quality.is_none());
        assert!(weather.sun.is_none());
    }

    #[test]
    fn empty_object_is_provider_response_error() {
        let err = provider().normalize(&RawWeather::from_current("{}")).unwrap_err();
        assert!(matches!(err, DashboardError::ProviderResponse { provider: ProviderId::WeatherApi, .. }));
    }

    #[test]
    fn search_maps_ids_to_location_keys() {
        let body = r#"[{"id": 123, "name": "TestCity", "region": "TestRegion",
            "country": "TestCountry", "lat": 0, "lon": 0, "url": "test-city"}]"#;

        let candidates = parse_search(body).unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider_location_key.as_deref(), Some("123"));
        assert_eq!(candidates[0].region, "TestRegion");
    }

    #[test]
    fn saved_weatherapi_location_is_queried_by_id() {
        let loc = SavedLocation {
            id: "x".into(),
            display_name: "TestCity".into(),
            lat: 0.0,
            lon: 0.0,
            provider: ProviderId::WeatherApi,
            provider_location_key: Some("123".into()),
            sort_index: 0,
        };
        assert_eq!(WeatherApiProvider::query_for(&loc), "id:123");

        let other = SavedLocation { provider: ProviderId::OpenWeatherMap, ..loc };
        assert_eq!(WeatherApiProvider::query_for(&other), "0,0");
    }
}
