use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::{
    error::{DashboardError, FetchErrorKind, Result},
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

const DEFAULT_HOST: &str = "devapi.qweather.com";
const GEO_HOST: &str = "geoapi.qweather.com";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M%:z";

/// QWeather returns every number as a string and reports failures through a
/// `code` field in the body.
#[derive(Debug, Clone)]
pub struct QWeatherProvider {
    api_key: String,
    host: String,
    http: Client,
}

impl QWeatherProvider {
    pub fn new(api_key: String, host: Option<&str>, http: Client) -> Self {
        let host = host
            .map(|h| h.trim().trim_start_matches("https://").trim_end_matches('/'))
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST)
            .to_string();

        Self { api_key, host, http }
    }

    fn location_param(location: &SavedLocation) -> String {
        match location.provider_key_for(ProviderId::QWeather) {
            Some(id) => id.to_string(),
            // QWeather expects "lon,lat" with at most two decimals.
            None => format!("{:.2},{:.2}", location.lon, location.lat),
        }
    }

    async fn get(&self, path: &str, location: &str) -> Result<String> {
        let url = format!("https://{}{path}", self.host);
        get_text(
            &self.http,
            ProviderId::QWeather,
            &url,
            &[("location", location), ("key", self.api_key.as_str())],
        )
        .await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QwNow {
    #[serde(default)]
    obs_time: String,
    temp: String,
    feels_like: Option<String>,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    text: String,
    wind360: Option<String>,
    wind_speed: Option<String>,
    humidity: Option<String>,
    pressure: Option<String>,
    vis: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QwNowResponse {
    code: String,
    update_time: Option<String>,
    now: Option<QwNow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QwDaily {
    fx_date: NaiveDate,
    sunrise: Option<String>,
    sunset: Option<String>,
    temp_max: String,
    temp_min: String,
    #[serde(default)]
    icon_day: String,
    #[serde(default)]
    text_day: String,
}

#[derive(Debug, Deserialize)]
struct QwDailyResponse {
    #[serde(default)]
    daily: Vec<QwDaily>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QwHourly {
    fx_time: String,
    temp: String,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct QwHourlyResponse {
    #[serde(default)]
    hourly: Vec<QwHourly>,
}

#[derive(Debug, Deserialize)]
struct QwAirNow {
    aqi: String,
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct QwAirResponse {
    now: Option<QwAirNow>,
}

#[derive(Debug, Deserialize)]
struct QwGeoLocation {
    name: String,
    id: String,
    lat: String,
    lon: String,
    #[serde(default)]
    adm1: String,
    #[serde(default)]
    country: String,
}

#[derive(Debug, Deserialize)]
struct QwGeoResponse {
    code: String,
    #[serde(default)]
    location: Vec<QwGeoLocation>,
}

const AIR_COMPONENTS: &[&str] = &["pm10", "pm2p5", "no2", "so2", "co", "o3"];

#[async_trait]
impl WeatherProvider for QWeatherProvider {
    fn id(&self) -> ProviderId {
        ProviderId::QWeather
    }

    async fn fetch_raw(&self, location: &SavedLocation) -> Result<RawWeather> {
        let param = Self::location_param(location);
        let (now, daily, hourly, air) = tokio::join!(
            self.get("/v7/weather/now", &param),
            self.get("/v7/weather/7d", &param),
            self.get("/v7/weather/24h", &param),
            self.get("/v7/air/now", &param),
        );

        Ok(RawWeather {
            current: now?,
            forecast: optional_body(self.id(), "daily forecast", daily),
            hourly: optional_body(self.id(), "hourly forecast", hourly),
            air_quality: optional_body(self.id(), "air quality", air),
        })
    }

    fn normalize(&self, raw: &RawWeather) -> Result<NormalizedWeather> {
        let id = self.id();
        let response: QwNowResponse = parse_json(id, &raw.current)?;
        check_code(&response.code)?;
        let now = response.now.ok_or_else(|| DashboardError::malformed(id, "missing 'now' block"))?;

        // `updateTime` is when the API refreshed, so it only stands in for a
        // missing observation time.
        let observed = parse_time(id, &now.obs_time).or_else(|err| match response.update_time.as_deref() {
            Some(update_time) => parse_time(id, update_time),
            None => Err(err),
        })?;
        let offset = *observed.offset();

        let daily: Vec<QwDaily> = parse_optional::<QwDailyResponse>(id, "daily", raw.forecast.as_deref())
            .map(|d| d.daily)
            .unwrap_or_default();
        let hourly: Vec<QwHourly> =
            parse_optional::<QwHourlyResponse>(id, "hourly", raw.hourly.as_deref())
                .map(|h| h.hourly)
                .unwrap_or_default();
        let air: Option<QwAirResponse> = parse_optional(id, "air quality", raw.air_quality.as_deref());

        let temp = number(id, "temp", &now.temp)?;
        let today = daily.first();

        let sun = today.and_then(|day| {
            Some(SunTimes {
                sunrise_epoch: local_clock_to_epoch(offset, day.fx_date, day.sunrise.as_deref()?)?,
                sunset_epoch: local_clock_to_epoch(offset, day.fx_date, day.sunset.as_deref()?)?,
            })
        });

        let forecast_daily = daily
            .iter()
            .filter_map(|day| {
                Some(DailyForecast {
                    date: day.fx_date,
                    max_temp_c: day.temp_max.parse().ok()?,
                    min_temp_c: day.temp_min.parse().ok()?,
                    condition: Condition::new(day.text_day.clone(), day.icon_day.clone()),
                })
            })
            .collect();

        let hourly = hourly
            .iter()
            .filter_map(|h| {
                Some(HourlyForecast {
                    epoch: DateTime::parse_from_str(&h.fx_time, TIME_FORMAT).ok()?.timestamp(),
                    temp_c: h.temp.parse().ok()?,
                    condition: Condition::new(h.text.clone(), h.icon.clone()),
                })
            })
            .collect();

        let air_quality = air.and_then(|a| a.now).and_then(|now| {
            let index = now.aqi.parse::<u32>().ok()?;
            let components = AIR_COMPONENTS
                .iter()
                .filter_map(|name| {
                    let value = now.fields.get(*name)?.as_str()?.parse::<f64>().ok()?;
                    Some((name.to_string(), value))
                })
                .collect();
            Some(AirQuality { index, components })
        });

        let optional = |value: &Option<String>| value.as_deref().and_then(|v| v.parse::<f64>().ok());

        Ok(NormalizedWeather {
            // The now endpoint carries no name or coordinates; `fetch` fills
            // them in from the saved location.
            location_name: String::new(),
            coordinates: Coordinates::new(0.0, 0.0),
            observed_at_epoch: observed.timestamp(),
            utc_offset_seconds: offset.local_minus_utc(),
            temperature_c: temp,
            feels_like_c: optional(&now.feels_like).unwrap_or(temp),
            temp_min_c: today.and_then(|d| d.temp_min.parse().ok()).unwrap_or(temp),
            temp_max_c: today.and_then(|d| d.temp_max.parse().ok()).unwrap_or(temp),
            humidity_pct: clamp_humidity(optional(&now.humidity).unwrap_or_default()),
            pressure_hpa: optional(&now.pressure).unwrap_or_default(),
            visibility_m: optional(&now.vis).map(units::km_to_m).unwrap_or_default(),
            wind: Wind {
                speed_kph: optional(&now.wind_speed).unwrap_or_default(),
                degrees: wrap_degrees(optional(&now.wind360).unwrap_or_default()),
            },
            condition: Condition::new(now.text, now.icon),
            sun,
            air_quality,
            forecast_daily,
            forecast_hourly: sample_hourly(hourly, observed.timestamp(), HOURLY_FORECAST_LIMIT),
        })
    }

    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        let url = format!("https://{GEO_HOST}/v2/city/lookup");
        let body =
            get_text(&self.http, self.id(), &url, &[("location", query), ("key", self.api_key.as_str())])
                .await?;

        parse_search(&body)
    }
}

pub(crate) fn parse_search(body: &str) -> Result<Vec<LocationCandidate>> {
    let response: QwGeoResponse = parse_json(ProviderId::QWeather, body)?;
    // 404 means "no match" for the lookup endpoint.
    if response.code == "404" {
        return Ok(Vec::new());
    }
    check_code(&response.code)?;

    response
        .location
        .into_iter()
        .map(|loc| {
            Ok(LocationCandidate {
                lat: number(ProviderId::QWeather, "lat", &loc.lat)?,
                lon: number(ProviderId::QWeather, "lon", &loc.lon)?,
                name: loc.name,
                region: loc.adm1,
                country: loc.country,
                provider: ProviderId::QWeather,
                provider_location_key: Some(loc.id),
            })
        })
        .collect()
}

fn check_code(code: &str) -> Result<()> {
    match code {
        "200" => Ok(()),
        "401" | "403" => Err(DashboardError::fetch(
            FetchErrorKind::Unauthorized,
            format!("qweather rejected the request (code {code})"),
        )),
        "402" | "429" => Err(DashboardError::fetch(
            FetchErrorKind::RateLimited,
            format!("qweather quota exhausted (code {code})"),
        )),
        other => Err(DashboardError::ProviderResponse {
            provider: ProviderId::QWeather,
            status: other.parse().unwrap_or_default(),
            message: format!("qweather returned code {other}"),
        }),
    }
}

fn number<T: std::str::FromStr>(provider: ProviderId, field: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DashboardError::malformed(provider, format!("'{field}' is not a number: {value:?}")))
}

fn parse_time(provider: ProviderId, value: &str) -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value, TIME_FORMAT)
        .map_err(|err| DashboardError::malformed(provider, format!("bad timestamp {value:?}: {err}")))
}

fn local_clock_to_epoch(offset: FixedOffset, date: NaiveDate, clock: &str) -> Option<i64> {
    let time = NaiveTime::parse_from_str(clock.trim(), "%H:%M").ok()?;
    offset.from_local_datetime(&date.and_time(time)).single().map(|dt| dt.with_timezone(&Utc).timestamp())
}
