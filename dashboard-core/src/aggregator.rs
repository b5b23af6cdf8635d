use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheEntry, CacheKey, WeatherCache},
    error::{DashboardError, FetchErrorKind, Result},
    model::{LocationCandidate, NormalizedWeather, SavedLocation},
    provider::{ProviderFactory, ProviderId},
    search::LocationSearch,
    settings::{Settings, SettingsStore},
    storage::KeyValueStore,
};

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry>>>;

/// Source of "now" for freshness checks.
pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// What the dashboard shows for one location.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReport {
    pub weather: NormalizedWeather,
    pub provider: ProviderId,
    pub fetched_at_epoch: i64,
    /// Set when a refetch failed and an older cached payload is shown instead.
    pub stale: bool,
    pub warning: Option<String>,
}

impl WeatherReport {
    fn fresh(entry: CacheEntry) -> Self {
        Self {
            weather: entry.payload,
            provider: entry.provider,
            fetched_at_epoch: entry.fetched_at_epoch,
            stale: false,
            warning: None,
        }
    }

    fn stale(entry: CacheEntry, err: &DashboardError) -> Self {
        Self {
            warning: Some(format!("Showing cached data: {err}")),
            stale: true,
            ..Self::fresh(entry)
        }
    }
}

/// Routes weather requests to the active provider through the cache.
///
/// Concurrent requests for the same `(provider, location)` share a single
/// upstream call.
#[derive(Clone)]
pub struct WeatherAggregator {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Arc<SettingsStore>,
    factory: Arc<dyn ProviderFactory>,
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<WeatherCache>,
    in_flight: Mutex<HashMap<CacheKey, SharedFetch>>,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
}

impl WeatherAggregator {
    pub fn new(
        settings: Arc<SettingsStore>,
        factory: Arc<dyn ProviderFactory>,
        store: Arc<dyn KeyValueStore>,
        fetch_timeout: Duration,
    ) -> Self {
        Self::with_clock(settings, factory, store, fetch_timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(
        settings: Arc<SettingsStore>,
        factory: Arc<dyn ProviderFactory>,
        store: Arc<dyn KeyValueStore>,
        fetch_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = WeatherCache::load(store.as_ref());
        debug!(entries = cache.len(), "loaded weather cache");

        Self {
            inner: Arc::new(Inner {
                settings,
                factory,
                store,
                cache: Mutex::new(cache),
                in_flight: Mutex::new(HashMap::new()),
                clock,
                fetch_timeout,
            }),
        }
    }

    pub async fn get_weather(&self, location: &SavedLocation) -> Result<WeatherReport> {
        let settings = self.inner.settings.current();
        let provider = settings.active_provider;
        let key = CacheKey::new(provider, location.location_key(provider));
        let now = self.inner.clock.now_epoch();

        let cached = self.inner.cache().get(&key).cloned();
        if let Some(entry) = cached.filter(|e| e.is_fresh(now, settings.auto_refresh_interval_minutes)) {
            debug!(%provider, location = %key.location_key, "weather cache hit");
            return Ok(WeatherReport::fresh(entry));
        }

        match self.fetch_shared(key.clone(), location, &settings, now).await {
            Ok(entry) => Ok(WeatherReport::fresh(entry)),
            Err(err) if err.is_upstream() => {
                let Some(entry) = self.inner.cache().get(&key).cloned() else {
                    return Err(err);
                };
                warn!(%provider, location = %key.location_key, error = %err, "serving stale weather");
                Ok(WeatherReport::stale(entry, &err))
            }
            Err(err) => Err(err),
        }
    }

    /// Look up locations with the active provider.
    pub async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        let settings = self.inner.settings.current();
        let provider = self.inner.factory.create(settings.active_provider, &settings)?;

        timeout(self.inner.fetch_timeout, provider.search(query))
            .await
            .map_err(|_| self.inner.timeout_error(settings.active_provider))?
    }

    /// Drop cached entries of every provider except `active`.
    pub fn invalidate_other_providers(&self, active: ProviderId) -> usize {
        self.inner.invalidate(|entry| entry.provider != active)
    }

    pub fn invalidate_provider(&self, provider: ProviderId) -> usize {
        self.inner.invalidate(|entry| entry.provider == provider)
    }

    pub fn cached_entries(&self) -> usize {
        self.inner.cache().len()
    }

    fn fetch_shared(&self, key: CacheKey, location: &SavedLocation, settings: &Settings, now: i64) -> SharedFetch {
        let mut in_flight = self.inner.in_flight();
        if let Some(pending) = in_flight.get(&key) {
            debug!(provider = %key.provider, location = %key.location_key, "joining in-flight fetch");
            return pending.clone();
        }

        // A fetch that finished after the caller's cache lookup has already
        // stored its entry, since it leaves `in_flight` only after `put`.
        let fresh = self
            .inner
            .cache()
            .get(&key)
            .filter(|e| e.is_fresh(now, settings.auto_refresh_interval_minutes))
            .cloned();
        if let Some(entry) = fresh {
            debug!(provider = %key.provider, location = %key.location_key, "weather stored by a concurrent fetch");
            return future::ready(Ok(entry)).boxed().shared();
        }

        let inner = self.inner.clone();
        let location = location.clone();
        let settings = settings.clone();
        let fetch_key = key.clone();

        let fetch = async move {
            let result = inner.fetch_and_store(&fetch_key, &location, &settings).await;
            inner.in_flight().remove(&fetch_key);
            result
        }
        .boxed()
        .shared();

        in_flight.insert(key, fetch.clone());
        fetch
    }
}

impl Inner {
    fn cache(&self) -> MutexGuard<'_, WeatherCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<CacheKey, SharedFetch>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timeout_error(&self, provider: ProviderId) -> DashboardError {
        DashboardError::fetch(
            FetchErrorKind::Timeout,
            format!("{provider} did not answer within {}s", self.fetch_timeout.as_secs_f32()),
        )
    }

    async fn fetch_and_store(
        &self,
        key: &CacheKey,
        location: &SavedLocation,
        settings: &Settings,
    ) -> Result<CacheEntry> {
        let provider = self.factory.create(key.provider, settings)?;

        let weather = timeout(self.fetch_timeout, provider.fetch(location))
            .await
            .map_err(|_| self.timeout_error(key.provider))??;

        let entry = CacheEntry {
            provider: key.provider,
            location_key: key.location_key.clone(),
            payload: weather,
            fetched_at_epoch: self.clock.now_epoch(),
        };

        let mut cache = self.cache();
        cache.put(entry.clone());
        if let Err(err) = cache.persist(self.store.as_ref()) {
            warn!(error = %err, "failed to persist weather cache");
        }
        info!(provider = %key.provider, location = %key.location_key, "weather updated");

        Ok(entry)
    }

    fn invalidate<F>(&self, predicate: F) -> usize
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        let mut cache = self.cache();
        let removed = cache.invalidate(predicate);
        if removed > 0 {
            if let Err(err) = cache.persist(self.store.as_ref()) {
                warn!(error = %err, "failed to persist weather cache");
            }
            info!(removed, "invalidated cached weather");
        }
        removed
    }
}

#[async_trait]
impl LocationSearch for WeatherAggregator {
    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
        WeatherAggregator::search(self, query).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

    use futures::future::join_all;

    use super::*;
    use crate::{
        cache::tests::sample_weather,
        provider::{RawWeather, WeatherProvider},
        settings::SettingsPatch,
        storage::MemoryStore,
    };

    #[derive(Debug, Default)]
    pub(crate) struct ManualClock(AtomicI64);

    impl ManualClock {
        pub(crate) fn advance(&self, seconds: i64) {
            self.0.fetch_add(seconds, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_epoch(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) enum Outcome {
        Temperature(f64),
        Fail(DashboardError),
        Hang,
    }

    /// Provider double whose behaviour the test can change between calls.
    #[derive(Debug, Clone)]
    pub(crate) struct MockFactory {
        pub(crate) calls: Arc<AtomicUsize>,
        pub(crate) outcome: Arc<Mutex<Outcome>>,
        pub(crate) delay: Duration,
    }

    impl MockFactory {
        pub(crate) fn new(outcome: Outcome) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                outcome: Arc::new(Mutex::new(outcome)),
                delay: Duration::from_millis(50),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn set(&self, outcome: Outcome) {
            *self.outcome.lock().unwrap() = outcome;
        }
    }

    impl ProviderFactory for MockFactory {
        fn create(&self, id: ProviderId, _settings: &Settings) -> Result<Arc<dyn WeatherProvider>> {
            Ok(Arc::new(MockProvider { id, factory: self.clone() }))
        }
    }

    #[derive(Debug)]
    struct MockProvider {
        id: ProviderId,
        factory: MockFactory,
    }

    #[async_trait]
    impl WeatherProvider for MockProvider {
        fn id(&self) -> ProviderId {
            self.id
        }

        async fn fetch_raw(&self, _location: &SavedLocation) -> Result<RawWeather> {
            self.factory.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.factory.delay).await;

            let outcome = self.factory.outcome.lock().unwrap().clone();
            match outcome {
                Outcome::Temperature(t) => Ok(RawWeather::from_current(t.to_string())),
                Outcome::Fail(err) => Err(err),
                Outcome::Hang => std::future::pending().await,
            }
        }

        fn normalize(&self, raw: &RawWeather) -> Result<NormalizedWeather> {
            let temperature = raw
                .current
                .parse()
                .map_err(|_| DashboardError::malformed(self.id, "not a number"))?;
            Ok(sample_weather("", temperature))
        }

        async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>> {
            self.factory.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.factory.delay).await;

            Ok(vec![LocationCandidate {
                name: query.to_string(),
                region: String::new(),
                country: "GB".to_string(),
                lat: 51.5,
                lon: -0.12,
                provider: self.id,
                provider_location_key: None,
            }])
        }
    }

    pub(crate) fn london() -> SavedLocation {
        SavedLocation {
            id: "london".to_string(),
            display_name: "London".to_string(),
            lat: 51.5074,
            lon: -0.1278,
            provider: ProviderId::OpenWeatherMap,
            provider_location_key: None,
            sort_index: 0,
        }
    }

    struct Fixture {
        aggregator: WeatherAggregator,
        factory: MockFactory,
        clock: Arc<ManualClock>,
        settings: Arc<SettingsStore>,
        store: Arc<dyn KeyValueStore>,
    }

    fn fixture(outcome: Outcome) -> Fixture {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let settings = Arc::new(SettingsStore::load(store.clone()));
        let factory = MockFactory::new(outcome);
        let clock = Arc::new(ManualClock::default());
        clock.advance(1_700_000_000);

        let aggregator = WeatherAggregator::with_clock(
            settings.clone(),
            Arc::new(factory.clone()),
            store.clone(),
            Duration::from_secs(10),
            clock.clone(),
        );

        Fixture { aggregator, factory, clock, settings, store }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_cache_hit_skips_network() {
        let fx = fixture(Outcome::Temperature(21.0));

        let first = fx.aggregator.get_weather(&london()).await.unwrap();
        fx.clock.advance(60);
        let second = fx.aggregator.get_weather(&london()).await.unwrap();

        assert_eq!(fx.factory.calls(), 1);
        assert_eq!(first, second);
        assert!(!second.stale);
        assert_eq!(second.weather.location_name, "London", "filled from the saved location");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refetched() {
        let fx = fixture(Outcome::Temperature(21.0));

        fx.aggregator.get_weather(&london()).await.unwrap();
        fx.clock.advance(15 * 60);
        fx.factory.set(Outcome::Temperature(23.0));
        let report = fx.aggregator.get_weather(&london()).await.unwrap();

        assert_eq!(fx.factory.calls(), 2);
        assert_eq!(report.weather.temperature_c, 23.0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_interval_always_fetches() {
        let fx = fixture(Outcome::Temperature(21.0));
        let patch = SettingsPatch { auto_refresh_interval_minutes: Some(0), ..Default::default() };
        fx.settings.update(patch).await.unwrap();

        fx.aggregator.get_weather(&london()).await.unwrap();
        fx.aggregator.get_weather(&london()).await.unwrap();

        assert_eq!(fx.factory.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_fetch() {
        let fx = fixture(Outcome::Temperature(21.0));
        let location = london();

        let reports = join_all((0..8).map(|_| fx.aggregator.get_weather(&location))).await;

        assert_eq!(fx.factory.calls(), 1);
        let reports: Vec<WeatherReport> = reports.into_iter().map(|r| r.unwrap()).collect();
        assert!(reports.windows(2).all(|w| w[0] == w[1]));
        assert!(fx.aggregator.inner.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_finds_entry_stored_after_cache_lookup() {
        let fx = fixture(Outcome::Temperature(21.0));
        fx.aggregator.get_weather(&london()).await.unwrap();

        let settings = fx.settings.current();
        let key = CacheKey::new(settings.active_provider, london().location_key(settings.active_provider));
        let entry = fx
            .aggregator
            .fetch_shared(key, &london(), &settings, fx.clock.now_epoch())
            .await
            .unwrap();

        assert_eq!(fx.factory.calls(), 1);
        assert_eq!(entry.payload.temperature_c, 21.0);
        assert!(fx.aggregator.inner.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_failures_are_shared_too() {
        let fx = fixture(Outcome::Fail(DashboardError::fetch(FetchErrorKind::Network, "offline")));
        let location = london();

        let results = join_all((0..3).map(|_| fx.aggregator.get_weather(&location))).await;

        assert_eq!(fx.factory.calls(), 1);
        for result in results {
            assert!(matches!(
                result,
                Err(DashboardError::WeatherFetch { kind: FetchErrorKind::Network, .. })
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_falls_back_to_stale_entry() {
        let fx = fixture(Outcome::Temperature(21.0));
        fx.aggregator.get_weather(&london()).await.unwrap();

        fx.clock.advance(16 * 60);
        fx.factory.set(Outcome::Fail(DashboardError::fetch(FetchErrorKind::RateLimited, "slow down")));
        let report = fx.aggregator.get_weather(&london()).await.unwrap();

        assert!(report.stale);
        assert_eq!(report.weather.temperature_c, 21.0);
        assert!(report.warning.unwrap().contains("rate limited"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_upstream_failure_is_not_downgraded() {
        let fx = fixture(Outcome::Temperature(21.0));
        fx.aggregator.get_weather(&london()).await.unwrap();

        fx.clock.advance(16 * 60);
        fx.factory.set(Outcome::Fail(DashboardError::validation("apiKeys", "missing")));
        let err = fx.aggregator.get_weather(&london()).await.unwrap_err();

        assert!(matches!(err, DashboardError::Validation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_provider_times_out() {
        let fx = fixture(Outcome::Hang);

        let err = fx.aggregator.get_weather(&london()).await.unwrap_err();

        assert!(matches!(err, DashboardError::WeatherFetch { kind: FetchErrorKind::Timeout, .. }));
        assert_eq!(fx.aggregator.cached_entries(), 0);
        assert!(fx.aggregator.inner.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provider_switch_uses_new_provider_and_invalidates_old_entries() {
        let fx = fixture(Outcome::Temperature(21.0));
        let report = fx.aggregator.get_weather(&london()).await.unwrap();
        assert_eq!(report.provider, ProviderId::OpenWeatherMap);

        let patch = SettingsPatch { active_provider: Some(ProviderId::WeatherApi), ..Default::default() };
        fx.settings.update(patch).await.unwrap();

        let report = fx.aggregator.get_weather(&london()).await.unwrap();
        assert_eq!(report.provider, ProviderId::WeatherApi);
        assert_eq!(fx.factory.calls(), 2, "a cached payload of another provider is never served");

        assert_eq!(fx.aggregator.invalidate_other_providers(ProviderId::WeatherApi), 1);
        assert_eq!(fx.aggregator.cached_entries(), 1);
        assert_eq!(fx.aggregator.invalidate_provider(ProviderId::WeatherApi), 1);
        assert_eq!(fx.aggregator.cached_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_survives_restart() {
        let fx = fixture(Outcome::Temperature(21.0));
        fx.aggregator.get_weather(&london()).await.unwrap();

        let restarted = WeatherAggregator::with_clock(
            fx.settings.clone(),
            Arc::new(fx.factory.clone()),
            fx.store.clone(),
            Duration::from_secs(10),
            fx.clock.clone(),
        );
        let report = restarted.get_weather(&london()).await.unwrap();

        assert_eq!(fx.factory.calls(), 1);
        assert_eq!(report.weather.temperature_c, 21.0);
    }

    #[tokio::test(start_paused = true)]
    async fn search_goes_to_active_provider() {
        let fx = fixture(Outcome::Temperature(21.0));
        let candidates = fx.aggregator.search("London").await.unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].provider, ProviderId::OpenWeatherMap);
    }
}
