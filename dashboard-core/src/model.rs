use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::provider::ProviderId;

/// Upper bound on hourly forecast entries kept in [`NormalizedWeather`].
pub const HOURLY_FORECAST_LIMIT: usize = 24;

/// Two coordinates closer than this (in degrees) describe the same place.
pub const COORDINATE_EPSILON: f64 = 1e-4;

const SECONDS_PER_HOUR: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn approx_eq(&self, other: &Coordinates) -> bool {
        (self.lat - other.lat).abs() < COORDINATE_EPSILON
            && (self.lon - other.lon).abs() < COORDINATE_EPSILON
    }
}

/// Provider-agnostic weather snapshot.
///
/// Temperatures are Celsius, speeds km/h, every timestamp is UTC epoch
/// seconds. `utc_offset_seconds` is only consulted when formatting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedWeather {
    pub location_name: String,
    pub coordinates: Coordinates,
    pub observed_at_epoch: i64,
    #[serde(default)]
    pub utc_offset_seconds: i32,
    pub temperature_c: f64,
    pub feels_like_c: f64,
    pub temp_min_c: f64,
    pub temp_max_c: f64,
    pub humidity_pct: u8,
    pub pressure_hpa: f64,
    pub visibility_m: u32,
    pub wind: Wind,
    pub condition: Condition,
    #[serde(default)]
    pub sun: Option<SunTimes>,
    #[serde(default)]
    pub air_quality: Option<AirQuality>,
    #[serde(default)]
    pub forecast_daily: Vec<DailyForecast>,
    #[serde(default)]
    pub forecast_hourly: Vec<HourlyForecast>,
}

impl NormalizedWeather {
    /// Use the saved location's name and coordinates where the provider sent none.
    pub fn fill_missing_location(&mut self, location: &SavedLocation) {
        if self.location_name.trim().is_empty() {
            self.location_name = location.display_name.clone();
        }
        if self.coordinates == Coordinates::new(0.0, 0.0) {
            self.coordinates = location.coordinates();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wind {
    pub speed_kph: f64,
    pub degrees: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub summary: String,
    pub icon_id: String,
}

impl Condition {
    pub fn new(summary: impl Into<String>, icon_id: impl Into<String>) -> Self {
        Self { summary: summary.into(), icon_id: icon_id.into() }
    }

    pub fn unknown() -> Self {
        Self::new("Unknown", "")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SunTimes {
    pub sunrise_epoch: i64,
    pub sunset_epoch: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirQuality {
    pub index: u32,
    /// Pollutant concentrations keyed by pollutant name, e.g. `pm2_5`.
    pub components: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyForecast {
    pub date: NaiveDate,
    pub max_temp_c: f64,
    pub min_temp_c: f64,
    pub condition: Condition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyForecast {
    pub epoch: i64,
    pub temp_c: f64,
    pub condition: Condition,
}

/// A place returned by a provider's geocoding/search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationCandidate {
    pub name: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    pub lat: f64,
    pub lon: f64,
    pub provider: ProviderId,
    #[serde(default)]
    pub provider_location_key: Option<String>,
}

impl LocationCandidate {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }
}

/// A location the user keeps in the city list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedLocation {
    pub id: String,
    pub display_name: String,
    pub lat: f64,
    pub lon: f64,
    pub provider: ProviderId,
    #[serde(default)]
    pub provider_location_key: Option<String>,
    pub sort_index: usize,
}

impl SavedLocation {
    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lon)
    }

    /// Key under which `provider` knows this location.
    ///
    /// The provider that created the entry may have handed out its own id;
    /// every other provider falls back to rounded coordinates.
    pub fn location_key(&self, provider: ProviderId) -> String {
        match self.provider_key_for(provider) {
            Some(key) => key.to_string(),
            None => format!("{:.4},{:.4}", self.lat, self.lon),
        }
    }

    pub fn provider_key_for(&self, provider: ProviderId) -> Option<&str> {
        if self.provider == provider {
            self.provider_location_key.as_deref().filter(|k| !k.is_empty())
        } else {
            None
        }
    }
}

/// Keep at most one entry per hour starting at the hour that contains
/// `observed_at`, in chronological order, capped at `limit`.
pub fn sample_hourly(
    mut points: Vec<HourlyForecast>,
    observed_at: i64,
    limit: usize,
) -> Vec<HourlyForecast> {
    points.sort_by_key(|p| p.epoch);

    let start = observed_at - observed_at.rem_euclid(SECONDS_PER_HOUR);
    let mut last_slot = None;
    let mut sampled = Vec::with_capacity(limit.min(points.len()));

    for point in points {
        if sampled.len() == limit {
            break;
        }
        if point.epoch < start {
            continue;
        }
        let slot = (point.epoch - start) / SECONDS_PER_HOUR;
        if last_slot == Some(slot) {
            continue;
        }
        last_slot = Some(slot);
        sampled.push(point);
    }

    sampled
}

pub(crate) fn clamp_humidity(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

pub(crate) fn wrap_degrees(value: f64) -> u16 {
    (value.round() as i64).rem_euclid(360) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hour(epoch: i64) -> HourlyForecast {
        HourlyForecast { epoch, temp_c: 10.0, condition: Condition::unknown() }
    }

    #[test]
    fn sample_hourly_starts_at_observation_hour() {
        let base = 1_698_364_800; // 2023-10-27 00:00 UTC
        let points = (0..24).map(|i| hour(base + i * 3600)).collect();
        let observed = base + 12 * 3600 + 600;

        let sampled = sample_hourly(points, observed, HOURLY_FORECAST_LIMIT);

        assert_eq!(sampled.len(), 12);
        assert_eq!(sampled[0].epoch, base + 12 * 3600);
        assert_eq!(sampled.last().map(|p| p.epoch), Some(base + 23 * 3600));
    }

    #[test]
    fn sample_hourly_collapses_sub_hour_points_and_sorts() {
        let base = 1_700_000_000 - 1_700_000_000 % 3600;
        let points = vec![
            hour(base + 3600 + 1800),
            hour(base + 900),
            hour(base),
            hour(base + 3600),
            hour(base + 3600),
        ];

        let sampled = sample_hourly(points, base, HOURLY_FORECAST_LIMIT);
        let epochs: Vec<i64> = sampled.iter().map(|p| p.epoch).collect();

        assert_eq!(epochs, vec![base, base + 3600]);
    }

    #[test]
    fn sample_hourly_caps_entries() {
        let points = (0..100).map(|i| hour(i * 3600)).collect();
        let sampled = sample_hourly(points, 0, HOURLY_FORECAST_LIMIT);
        assert_eq!(sampled.len(), HOURLY_FORECAST_LIMIT);
    }

    #[test]
    fn location_key_prefers_own_provider_key() {
        let loc = SavedLocation {
            id: "a".into(),
            display_name: "Beijing".into(),
            lat: 39.90499,
            lon: 116.40529,
            provider: ProviderId::QWeather,
            provider_location_key: Some("101010100".into()),
            sort_index: 0,
        };

        assert_eq!(loc.location_key(ProviderId::QWeather), "101010100");
        assert_eq!(loc.location_key(ProviderId::OpenWeatherMap), "39.9050,116.4053");
    }

    #[test]
    fn coordinates_match_within_epsilon() {
        let london = Coordinates::new(51.5, -0.12);
        assert!(london.approx_eq(&Coordinates::new(51.50004, -0.12003)));
        assert!(!london.approx_eq(&Coordinates::new(51.501, -0.12)));
    }

    #[test]
    fn humidity_and_degrees_are_bounded() {
        assert_eq!(clamp_humidity(104.2), 100);
        assert_eq!(clamp_humidity(-3.0), 0);
        assert_eq!(wrap_degrees(360.0), 0);
        assert_eq!(wrap_degrees(-90.0), 270);
    }
}
