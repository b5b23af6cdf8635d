//! Core library for the `weather-dashboard` CLI.
//!
//! This crate defines:
//! - Provider adapters normalizing OpenWeatherMap, WeatherAPI, QWeather and
//!   custom endpoints into one weather model
//! - A persisted weather cache and an aggregator that coalesces fetches
//! - The search box, city list and settings state machines
//! - Persistence behind a small key-value interface
//!
//! Front-ends normally talk to [`Dashboard`] only.

pub mod aggregator;
pub mod cache;
pub mod cities;
pub mod config;
pub mod dashboard;
pub mod display;
pub mod error;
pub mod model;
pub mod provider;
pub mod reorder;
pub mod search;
pub mod settings;
pub mod storage;
pub mod units;

pub use aggregator::{WeatherAggregator, WeatherReport};
pub use config::AppConfig;
pub use dashboard::{Dashboard, DashboardOptions};
pub use error::{DashboardError, FetchErrorKind, Result};
pub use model::{LocationCandidate, NormalizedWeather, SavedLocation};
pub use provider::{ProviderId, WeatherProvider};
pub use search::{SearchController, SearchEvent, SearchKey, SearchOutcome};
pub use settings::{DetailSection, SectionMove, Settings, SettingsPatch, TimeFormat};
