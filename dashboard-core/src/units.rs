//! Unit conversions used by the provider adapters.

const KELVIN_OFFSET: f64 = 273.15;
const KPH_PER_MPS: f64 = 3.6;
const KPH_PER_MPH: f64 = 1.609_344;

pub fn kelvin_to_celsius(k: f64) -> f64 {
    k - KELVIN_OFFSET
}

pub fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

pub fn mps_to_kph(mps: f64) -> f64 {
    mps * KPH_PER_MPS
}

pub fn mph_to_kph(mph: f64) -> f64 {
    mph * KPH_PER_MPH
}

pub fn km_to_m(km: f64) -> u32 {
    (km * 1000.0).round().max(0.0) as u32
}
