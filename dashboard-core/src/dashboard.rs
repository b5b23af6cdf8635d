//! Single entry point for a front-end: owns the settings, the city list and
//! the aggregator and keeps them consistent with each other.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    aggregator::{WeatherAggregator, WeatherReport},
    cities::CityListController,
    config::AppConfig,
    error::{DashboardError, Result},
    model::{LocationCandidate, SavedLocation},
    provider::{HttpProviderFactory, ProviderFactory, ProviderId},
    search::{SearchConfig, SearchController},
    settings::{DetailSection, SectionControl, SectionMove, Settings, SettingsPatch, SettingsStore, StartupView},
    storage::{KeyValueStore, LAST_VIEWED_KEY, load_json, save_json},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DashboardOptions {
    pub fetch_timeout: Duration,
    pub search: SearchConfig,
}

impl Default for DashboardOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(crate::config::DEFAULT_FETCH_TIMEOUT_SECS),
            search: SearchConfig::default(),
        }
    }
}

impl From<&AppConfig> for DashboardOptions {
    fn from(config: &AppConfig) -> Self {
        Self { fetch_timeout: config.fetch_timeout(), search: config.search_config() }
    }
}

pub struct Dashboard {
    settings: Arc<SettingsStore>,
    cities: Mutex<CityListController>,
    aggregator: WeatherAggregator,
    store: Arc<dyn KeyValueStore>,
    last_viewed: Mutex<Option<String>>,
    options: DashboardOptions,
}

impl Dashboard {
    pub fn open(
        store: Arc<dyn KeyValueStore>,
        factory: Arc<dyn ProviderFactory>,
        options: DashboardOptions,
    ) -> Self {
        let settings = Arc::new(SettingsStore::load(store.clone()));
        let cities = CityListController::load(store.clone());
        let aggregator = WeatherAggregator::new(settings.clone(), factory, store.clone(), options.fetch_timeout);
        let last_viewed = load_json::<String>(store.as_ref(), LAST_VIEWED_KEY).unwrap_or_else(|err| {
            warn!(error = %err, "discarding unreadable last viewed city");
            None
        });

        Self {
            settings,
            cities: Mutex::new(cities),
            aggregator,
            store,
            last_viewed: Mutex::new(last_viewed),
            options,
        }
    }

    /// Dashboard backed by the on-disk store and the real providers.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(config.file_store()?);
        let factory = HttpProviderFactory::new(config.fetch_timeout())?
            .with_openweather_units(config.openweather_units);
        let factory = Arc::new(factory);

        Ok(Self::open(store, factory, DashboardOptions::from(config)))
    }

    pub fn settings(&self) -> Settings {
        self.settings.current()
    }

    pub fn subscribe_settings(&self) -> watch::Receiver<Settings> {
        self.settings.subscribe()
    }

    /// Apply a settings change and drop cached weather it made obsolete.
    pub async fn update_settings(&self, patch: SettingsPatch) -> Result<Settings> {
        let before = self.settings.current();
        let after = self.settings.update(patch).await?;

        if before.active_provider != after.active_provider {
            info!(from = %before.active_provider, to = %after.active_provider, "active provider changed");
            self.aggregator.invalidate_other_providers(after.active_provider);
        }

        for &provider in ProviderId::all() {
            if credentials_changed(&before, &after, provider) {
                self.aggregator.invalidate_provider(provider);
            }
        }

        Ok(after)
    }

    pub async fn move_section(&self, section: DetailSection, direction: SectionMove) -> Result<Settings> {
        self.settings.move_section(section, direction).await
    }

    pub fn section_controls(&self) -> Vec<SectionControl> {
        self.settings.section_controls()
    }

    pub fn locations(&self) -> Vec<SavedLocation> {
        self.cities().locations().to_vec()
    }

    pub fn add_location(&self, candidate: &LocationCandidate) -> Result<SavedLocation> {
        self.cities().add(candidate)
    }

    pub fn remove_location(&self, id: &str) -> Result<SavedLocation> {
        self.cities().remove(id)
    }

    pub fn reorder_location(&self, id: &str, new_index: usize) -> Result<()> {
        self.cities().reorder(id, new_index)
    }

    pub fn move_location_onto(&self, dragged: &str, target: &str) -> Result<()> {
        self.cities().move_onto(dragged, target)
    }

    /// Saved city names that have no coordinates yet.
    pub fn unresolved_locations(&self) -> Vec<String> {
        self.cities().unresolved().to_vec()
    }

    pub fn forget_unresolved(&self, name: &str) -> Result<()> {
        self.cities().forget_unresolved(name)
    }

    /// Look up every name-only city with the active provider and save the
    /// best match. Names without a match stay pending.
    pub async fn resolve_pending_locations(&self) -> Vec<SavedLocation> {
        let pending = self.unresolved_locations();
        let mut resolved = Vec::new();

        for name in pending {
            let candidates = match self.aggregator.search(&name).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(%name, error = %err, "could not look up saved city");
                    continue;
                }
            };
            let Some(candidate) = candidates.first() else {
                warn!(%name, "no match for saved city");
                continue;
            };

            let outcome = self.cities().resolve(&name, candidate);
            match outcome {
                Ok(location) => resolved.push(location),
                Err(err) => warn!(%name, error = %err, "failed to save resolved city"),
            }
        }

        resolved
    }

    /// The city last opened through [`Dashboard::weather`] when the start-up
    /// view asks for it and the city is still saved.
    pub fn startup_location(&self) -> Option<SavedLocation> {
        match self.settings.current().startup_view {
            StartupView::Home => None,
            StartupView::LastCity => {
                let id = self.last_viewed().clone()?;
                self.cities().get(&id).cloned()
            }
        }
    }

    pub async fn weather(&self, id: &str) -> Result<WeatherReport> {
        let location = self
            .cities()
            .get(id)
            .cloned()
            .ok_or_else(|| DashboardError::NotFound(format!("location '{id}'")))?;

        self.remember_viewed(&location.id);
        self.aggregator.get_weather(&location).await
    }

    /// Weather for every saved location, in list order.
    pub async fn weather_for_all(&self) -> Vec<(SavedLocation, Result<WeatherReport>)> {
        self.resolve_pending_locations().await;
        let locations = self.locations();
        let reports = join_all(locations.iter().map(|l| self.aggregator.get_weather(l))).await;

        locations.into_iter().zip(reports).collect()
    }

    pub async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        self.aggregator.search(query).await
    }

    /// A fresh search box bound to the active provider.
    pub fn search_controller(&self) -> SearchController {
        SearchController::new(Arc::new(self.aggregator.clone()), self.options.search)
    }

    fn cities(&self) -> MutexGuard<'_, CityListController> {
        self.cities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_viewed(&self) -> MutexGuard<'_, Option<String>> {
        self.last_viewed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember_viewed(&self, id: &str) {
        let mut last_viewed = self.last_viewed();
        if last_viewed.as_deref() == Some(id) {
            return;
        }

        if let Err(err) = save_json(self.store.as_ref(), LAST_VIEWED_KEY, id) {
            warn!(error = %err, "failed to persist last viewed city");
        }
        *last_viewed = Some(id.to_string());
    }
}

fn credentials_changed(before: &Settings, after: &Settings, provider: ProviderId) -> bool {
    let endpoint_changed = match provider {
        ProviderId::Custom => before.custom_url != after.custom_url,
        ProviderId::QWeather => before.qweather_host != after.qweather_host,
        _ => false,
    };

    endpoint_changed || before.provider_api_key(provider) != after.provider_api_key(provider)
}
