use std::{collections::BTreeMap, str::FromStr, sync::Arc};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};

use crate::{
    error::{DashboardError, Result},
    provider::ProviderId,
    reorder::{can_move_down, can_move_up, move_item},
    storage::{KeyValueStore, SETTINGS_KEY, load_json, save_json},
};

/// Longest accepted auto-refresh interval: one day.
pub const MAX_REFRESH_INTERVAL_MINUTES: u32 = 24 * 60;
const DEFAULT_REFRESH_INTERVAL_MINUTES: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TimeFormat {
    #[serde(rename = "12h")]
    TwelveHour,
    #[default]
    #[serde(rename = "24h")]
    TwentyFourHour,
}

impl FromStr for TimeFormat {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "12h" => Ok(TimeFormat::TwelveHour),
            "24h" => Ok(TimeFormat::TwentyFourHour),
            other => Err(DashboardError::validation(
                "timeFormat",
                format!("'{other}' is not one of 12h, 24h"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Auto,
    Light,
    Dark,
}

impl FromStr for Theme {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "auto" => Ok(Theme::Auto),
            "light" => Ok(Theme::Light),
            "dark" => Ok(Theme::Dark),
            other => Err(DashboardError::validation(
                "theme",
                format!("'{other}' is not one of auto, light, dark"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum StartupView {
    #[default]
    Home,
    LastCity,
}

impl FromStr for StartupView {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "home" => Ok(StartupView::Home),
            "lastCity" => Ok(StartupView::LastCity),
            other => Err(DashboardError::validation(
                "startupView",
                format!("'{other}' is not one of home, lastCity"),
            )),
        }
    }
}

/// Panels of the detail view, in the order the user arranged them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetailSection {
    Hourly,
    Daily,
    Conditions,
    Sun,
    AirQuality,
}

impl DetailSection {
    pub const fn all() -> &'static [DetailSection] {
        &[
            DetailSection::Hourly,
            DetailSection::Daily,
            DetailSection::Conditions,
            DetailSection::Sun,
            DetailSection::AirQuality,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetailSection::Hourly => "hourly",
            DetailSection::Daily => "daily",
            DetailSection::Conditions => "conditions",
            DetailSection::Sun => "sun",
            DetailSection::AirQuality => "airQuality",
        }
    }
}

impl std::fmt::Display for DetailSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DetailSection {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        DetailSection::all()
            .iter()
            .copied()
            .find(|section| section.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DashboardError::validation("detailViewSectionOrder", format!("unknown section '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionMove {
    Up,
    Down,
}

/// Whether a section's move buttons are enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionControl {
    pub section: DetailSection,
    pub can_move_up: bool,
    pub can_move_down: bool,
}

/// User preferences, persisted under the `settings` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    #[serde(alias = "source")]
    pub active_provider: ProviderId,
    pub api_keys: BTreeMap<ProviderId, String>,
    pub custom_url: Option<String>,
    pub qweather_host: Option<String>,
    #[serde(alias = "autoRefreshInterval")]
    pub auto_refresh_interval_minutes: u32,
    pub time_format: TimeFormat,
    pub theme: Theme,
    pub language: String,
    pub detail_view_section_order: Vec<DetailSection>,
    pub startup_view: StartupView,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            active_provider: ProviderId::OpenWeatherMap,
            api_keys: BTreeMap::new(),
            custom_url: None,
            qweather_host: None,
            auto_refresh_interval_minutes: DEFAULT_REFRESH_INTERVAL_MINUTES,
            time_format: TimeFormat::default(),
            theme: Theme::default(),
            language: "en".to_string(),
            detail_view_section_order: DetailSection::all().to_vec(),
            startup_view: StartupView::default(),
        }
    }
}

impl Settings {
    /// Returns the API key for a provider; empty strings count as unset.
    pub fn provider_api_key(&self, provider_id: ProviderId) -> Option<&str> {
        self.api_keys.get(&provider_id).map(|k| k.trim()).filter(|k| !k.is_empty())
    }

    pub fn is_provider_configured(&self, provider_id: ProviderId) -> bool {
        match provider_id {
            ProviderId::Custom => self.custom_url.as_deref().is_some_and(|u| !u.trim().is_empty()),
            other => self.provider_api_key(other).is_some(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auto_refresh_interval_minutes > MAX_REFRESH_INTERVAL_MINUTES {
            return Err(DashboardError::validation(
                "autoRefreshIntervalMinutes",
                format!("must be between 0 and {MAX_REFRESH_INTERVAL_MINUTES}"),
            ));
        }

        if self.language.trim().is_empty() {
            return Err(DashboardError::validation("language", "must not be empty"));
        }

        let order = &self.detail_view_section_order;
        let complete = order.len() == DetailSection::all().len()
            && DetailSection::all().iter().all(|s| order.contains(s));
        if !complete {
            return Err(DashboardError::validation(
                "detailViewSectionOrder",
                "must list every section exactly once",
            ));
        }

        if let Some(url) = self.custom_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Url::parse(url.trim())
                .map_err(|err| DashboardError::validation("customUrl", format!("'{url}': {err}")))?;
        }

        if let Some(host) = self.qweather_host.as_deref() {
            if host.chars().any(char::is_whitespace) {
                return Err(DashboardError::validation("qweatherHost", "must not contain whitespace"));
            }
        }

        Ok(())
    }

    pub fn section_controls(&self) -> Vec<SectionControl> {
        let len = self.detail_view_section_order.len();
        self.detail_view_section_order
            .iter()
            .enumerate()
            .map(|(index, &section)| SectionControl {
                section,
                can_move_up: can_move_up(index),
                can_move_down: can_move_down(index, len),
            })
            .collect()
    }

    fn move_section(&mut self, section: DetailSection, direction: SectionMove) -> Result<()> {
        let order = &mut self.detail_view_section_order;
        let index = order
            .iter()
            .position(|s| *s == section)
            .ok_or_else(|| DashboardError::NotFound(format!("section '{section}'")))?;

        let target = match direction {
            SectionMove::Up if can_move_up(index) => index - 1,
            SectionMove::Down if can_move_down(index, order.len()) => index + 1,
            _ => {
                return Err(DashboardError::validation(
                    "detailViewSectionOrder",
                    format!("section '{section}' cannot move {direction:?} any further"),
                ));
            }
        };

        move_item(order, index, target);
        Ok(())
    }
}

/// A partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsPatch {
    pub active_provider: Option<ProviderId>,
    pub api_keys: Option<BTreeMap<ProviderId, String>>,
    pub custom_url: Option<String>,
    pub qweather_host: Option<String>,
    pub auto_refresh_interval_minutes: Option<i64>,
    pub time_format: Option<TimeFormat>,
    pub theme: Option<Theme>,
    pub language: Option<String>,
    pub detail_view_section_order: Option<Vec<DetailSection>>,
    pub startup_view: Option<StartupView>,
}

impl SettingsPatch {
    /// Build a single-field patch from textual input, e.g. from the CLI.
    pub fn from_field(field: &str, value: &str) -> Result<Self> {
        let mut patch = SettingsPatch::default();

        match field {
            "activeProvider" | "provider" | "source" => {
                patch.active_provider = Some(ProviderId::from_str(value)?)
            }
            "customUrl" | "custom-url" => patch.custom_url = Some(value.trim().to_string()),
            "qweatherHost" | "qweather-host" => patch.qweather_host = Some(value.trim().to_string()),
            "autoRefreshIntervalMinutes" | "refresh-interval" => {
                let minutes = value.trim().parse::<i64>().map_err(|_| {
                    DashboardError::validation("autoRefreshIntervalMinutes", format!("'{value}' is not a number"))
                })?;
                patch.auto_refresh_interval_minutes = Some(minutes);
            }
            "timeFormat" | "time-format" => patch.time_format = Some(value.parse()?),
            "theme" => patch.theme = Some(value.parse()?),
            "language" => patch.language = Some(value.trim().to_string()),
            "startupView" | "startup-view" => patch.startup_view = Some(value.parse()?),
            "detailViewSectionOrder" | "sections" => {
                let order = value
                    .split(',')
                    .map(DetailSection::from_str)
                    .collect::<Result<Vec<_>>>()?;
                patch.detail_view_section_order = Some(order);
            }
            other => {
                return Err(DashboardError::validation("field", format!("unknown setting '{other}'")));
            }
        }

        Ok(patch)
    }

    fn apply_to(self, settings: &mut Settings) -> Result<()> {
        if let Some(provider) = self.active_provider {
            settings.active_provider = provider;
        }
        if let Some(keys) = self.api_keys {
            settings.api_keys.extend(keys);
        }
        if let Some(url) = self.custom_url {
            settings.custom_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(host) = self.qweather_host {
            settings.qweather_host = Some(host).filter(|h| !h.is_empty());
        }
        if let Some(minutes) = self.auto_refresh_interval_minutes {
            settings.auto_refresh_interval_minutes = u32::try_from(minutes).map_err(|_| {
                DashboardError::validation(
                    "autoRefreshIntervalMinutes",
                    format!("must be between 0 and {MAX_REFRESH_INTERVAL_MINUTES}"),
                )
            })?;
        }
        if let Some(format) = self.time_format {
            settings.time_format = format;
        }
        if let Some(theme) = self.theme {
            settings.theme = theme;
        }
        if let Some(language) = self.language {
            settings.language = language;
        }
        if let Some(order) = self.detail_view_section_order {
            settings.detail_view_section_order = order;
        }
        if let Some(view) = self.startup_view {
            settings.startup_view = view;
        }
        Ok(())
    }
}

/// Process-wide settings: loaded once, changed only through validated
/// updates, persisted after each one.
pub struct SettingsStore {
    store: Arc<dyn KeyValueStore>,
    current: watch::Sender<Settings>,
    update_lock: Mutex<()>,
}

impl SettingsStore {
    /// Load persisted settings, falling back to defaults when nothing is
    /// stored or the payload does not validate.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let settings = match load_json::<Settings>(store.as_ref(), SETTINGS_KEY) {
            Ok(Some(settings)) => match settings.validate() {
                Ok(()) => settings,
                Err(err) => {
                    tracing::warn!(error = %err, "persisted settings are invalid, using defaults");
                    Settings::default()
                }
            },
            Ok(None) => Settings::default(),
            Err(err) => {
                tracing::warn!(error = %err, "persisted settings are unreadable, using defaults");
                Settings::default()
            }
        };

        let (current, _) = watch::channel(settings);
        Self { store, current, update_lock: Mutex::new(()) }
    }

    pub fn current(&self) -> Settings {
        self.current.borrow().clone()
    }

    /// Receive every successfully applied settings value.
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.current.subscribe()
    }

    pub async fn update(&self, patch: SettingsPatch) -> Result<Settings> {
        self.update_with(|settings| patch.apply_to(settings)).await
    }

    pub async fn move_section(&self, section: DetailSection, direction: SectionMove) -> Result<Settings> {
        self.update_with(|settings| settings.move_section(section, direction)).await
    }

    pub fn section_controls(&self) -> Vec<SectionControl> {
        self.current.borrow().section_controls()
    }

    /// Apply `change` to a copy of the current settings. Concurrent callers
    /// are serialized, and nothing is stored or published unless the
    /// result validates and persists.
    async fn update_with<F>(&self, change: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings) -> Result<()>,
    {
        let _guard = self.update_lock.lock().await;

        let mut next = self.current();
        change(&mut next)?;
        next.validate()?;
        save_json(self.store.as_ref(), SETTINGS_KEY, &next)?;

        self.current.send_replace(next.clone());
        tracing::info!(provider = %next.active_provider, "settings updated");
        Ok(next)
    }
}
