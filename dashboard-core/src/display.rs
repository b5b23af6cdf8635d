//! Read-time formatting. Stored data is always metric and in UTC epochs;
//! these helpers only decide how it is shown.

use chrono::{DateTime, FixedOffset, Utc};

use crate::settings::TimeFormat;

/// Rounds half up, so 25.5 shows as "26°" and -0.5 as "0°".
pub fn format_temperature(temp_c: f64) -> String {
    let rounded = (temp_c + 0.5).floor();
    // Avoid printing "-0°".
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{rounded:.0}°")
}

/// Local clock time of `epoch` at the given UTC offset.
///
/// Falls back to UTC when the offset is out of range and to an empty string
/// when the epoch cannot be represented.
pub fn format_clock(epoch: i64, utc_offset_seconds: i32, format: TimeFormat) -> String {
    let Some(local) = local_time(epoch, utc_offset_seconds) else {
        return String::new();
    };

    match format {
        TimeFormat::TwelveHour => local.format("%-I:%M %p").to_string(),
        TimeFormat::TwentyFourHour => local.format("%H:%M").to_string(),
    }
}

/// Label for hourly forecast columns: "15:00" or "3:00 PM".
pub fn format_hour_label(epoch: i64, utc_offset_seconds: i32, format: TimeFormat) -> String {
    let Some(local) = local_time(epoch, utc_offset_seconds) else {
        return String::new();
    };

    match format {
        TimeFormat::TwelveHour => local.format("%-I:00 %p").to_string(),
        TimeFormat::TwentyFourHour => local.format("%H:00").to_string(),
    }
}

pub fn format_wind(speed_kph: f64, degrees: u16) -> String {
    const POINTS: [&str; 8] = ["N", "NE", "E", "SE", "S", "SW", "W", "NW"];
    let point = POINTS[((f64::from(degrees % 360) + 22.5) / 45.0) as usize % POINTS.len()];
    format!("{speed_kph:.0} km/h {point}")
}

fn local_time(epoch: i64, utc_offset_seconds: i32) -> Option<DateTime<FixedOffset>> {
    let offset = FixedOffset::east_opt(utc_offset_seconds).or_else(|| FixedOffset::east_opt(0))?;
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|utc| utc.with_timezone(&offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2023-10-27 06:15 and 18:45 UTC.
    const SUNRISE: i64 = 1_698_387_300;
    const SUNSET: i64 = 1_698_432_300;

    #[test]
    fn temperature_rounds_half_up() {
        assert_eq!(format_temperature(25.5), "26°");
        assert_eq!(format_temperature(25.49), "25°");
        assert_eq!(format_temperature(-0.5), "0°");
        assert_eq!(format_temperature(-0.2), "0°");
        assert_eq!(format_temperature(-3.6), "-4°");
    }

    #[test]
    fn sun_times_follow_time_format() {
        assert_eq!(format_clock(SUNRISE, 0, TimeFormat::TwentyFourHour), "06:15");
        assert_eq!(format_clock(SUNSET, 0, TimeFormat::TwentyFourHour), "18:45");
        assert_eq!(format_clock(SUNRISE, 0, TimeFormat::TwelveHour), "6:15 AM");
        assert_eq!(format_clock(SUNSET, 0, TimeFormat::TwelveHour), "6:45 PM");
    }

    #[test]
    fn clock_uses_location_offset() {
        assert_eq!(format_clock(SUNRISE, 2 * 3600, TimeFormat::TwentyFourHour), "08:15");
        assert_eq!(format_clock(SUNRISE, -7 * 3600, TimeFormat::TwelveHour), "11:15 PM");
    }

    #[test]
    fn hour_labels() {
        let three_pm = 1_698_418_800; // 2023-10-27 15:00 UTC
        assert_eq!(format_hour_label(three_pm, 0, TimeFormat::TwentyFourHour), "15:00");
        assert_eq!(format_hour_label(three_pm, 0, TimeFormat::TwelveHour), "3:00 PM");
        assert_eq!(format_hour_label(three_pm, 9 * 3600, TimeFormat::TwelveHour), "12:00 AM");
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        assert_eq!(format_clock(SUNRISE, 200_000, TimeFormat::TwentyFourHour), "06:15");
    }

    #[test]
    fn wind_compass_point() {
        assert_eq!(format_wind(18.4, 0), "18 km/h N");
        assert_eq!(format_wind(5.0, 230), "5 km/h SW");
        assert_eq!(format_wind(5.0, 350), "5 km/h N");
    }
}
