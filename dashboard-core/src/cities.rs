use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    error::{DashboardError, Result},
    model::{LocationCandidate, SavedLocation},
    provider::ProviderId,
    reorder::move_item,
    storage::{KeyValueStore, SAVED_CITIES_KEY, load_json, save_json},
};

/// Shapes found under `savedCities`, newest first.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredCity {
    Saved(SavedLocation),
    Legacy {
        name: String,
        source: Option<String>,
        lat: f64,
        lon: f64,
    },
    NameOnly(String),
}

/// Write-side twin of [`StoredCity`]; names without coordinates are kept
/// after the saved locations.
#[derive(Serialize)]
#[serde(untagged)]
enum StoredCityRef<'a> {
    Saved(&'a SavedLocation),
    NameOnly(&'a str),
}

/// The user's ordered list of saved locations.
///
/// `sort_index` always equals the position in the list. Every mutation is
/// persisted before it becomes visible.
///
/// Entries stored as a bare name are kept in `unresolved` until a search
/// supplies their coordinates.
pub struct CityListController {
    store: Arc<dyn KeyValueStore>,
    locations: Vec<SavedLocation>,
    unresolved: Vec<String>,
}

impl CityListController {
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let stored = match load_json::<Vec<StoredCity>>(store.as_ref(), SAVED_CITIES_KEY) {
            Ok(stored) => stored.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "discarding unreadable city list");
                Vec::new()
            }
        };

        let mut migrated = false;
        let mut unresolved = Vec::new();
        let mut locations: Vec<SavedLocation> = stored
            .into_iter()
            .filter_map(|city| match city {
                StoredCity::Saved(location) => Some(location),
                StoredCity::Legacy { name, source, lat, lon } => {
                    migrated = true;
                    let provider = source
                        .as_deref()
                        .and_then(|s| s.parse::<ProviderId>().ok())
                        .unwrap_or(ProviderId::OpenWeatherMap);
                    Some(new_location(name, lat, lon, provider, None))
                }
                StoredCity::NameOnly(name) => {
                    info!(%name, "saved city has no coordinates yet");
                    unresolved.push(name);
                    None
                }
            })
            .collect();

        locations.sort_by_key(|l| l.sort_index);
        let mut controller = Self { store, locations, unresolved };
        if controller.densify() || migrated {
            if let Err(err) = controller.persist(&controller.locations, &controller.unresolved) {
                warn!(error = %err, "failed to persist migrated city list");
            }
        }
        controller
    }

    pub fn locations(&self) -> &[SavedLocation] {
        &self.locations
    }

    pub fn get(&self, id: &str) -> Option<&SavedLocation> {
        self.locations.iter().find(|l| l.id == id)
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Names of stored cities still waiting for coordinates.
    pub fn unresolved(&self) -> &[String] {
        &self.unresolved
    }

    /// Replace the bare name `name` with a location at `candidate`'s
    /// coordinates, keeping the name the user saved.
    ///
    /// If the same place is already saved, the name is folded into it.
    pub fn resolve(&mut self, name: &str, candidate: &LocationCandidate) -> Result<SavedLocation> {
        let pending = self
            .unresolved
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| DashboardError::NotFound(format!("unresolved city '{name}'")))?;

        let mut unresolved = self.unresolved.clone();
        unresolved.remove(pending);
        let mut next = self.locations.clone();

        let location = match self.find_duplicate(candidate) {
            Some(existing) => existing.clone(),
            None => {
                let mut location = new_location(
                    name.to_string(),
                    candidate.lat,
                    candidate.lon,
                    candidate.provider,
                    candidate.provider_location_key.clone(),
                );
                location.sort_index = next.len();
                next.push(location.clone());
                location
            }
        };

        renumber(&mut next);
        self.persist(&next, &unresolved)?;
        self.locations = next;
        self.unresolved = unresolved;

        info!(id = %location.id, name, "saved city resolved");
        Ok(location)
    }

    /// Drop a bare name that cannot be resolved.
    pub fn forget_unresolved(&mut self, name: &str) -> Result<()> {
        let pending = self
            .unresolved
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| DashboardError::NotFound(format!("unresolved city '{name}'")))?;

        let mut unresolved = self.unresolved.clone();
        unresolved.remove(pending);
        self.persist(&self.locations, &unresolved)?;
        self.unresolved = unresolved;

        info!(name, "unresolved city removed");
        Ok(())
    }

    /// Append `candidate` unless the same provider already has a location at
    /// (almost) the same coordinates.
    pub fn add(&mut self, candidate: &LocationCandidate) -> Result<SavedLocation> {
        if self.find_duplicate(candidate).is_some() {
            return Err(DashboardError::DuplicateLocation(candidate.name.clone()));
        }

        let mut location = new_location(
            candidate.name.clone(),
            candidate.lat,
            candidate.lon,
            candidate.provider,
            candidate.provider_location_key.clone(),
        );
        location.sort_index = self.locations.len();

        let mut next = self.locations.clone();
        next.push(location.clone());
        self.commit(next)?;

        info!(id = %location.id, name = %location.display_name, "saved location added");
        Ok(location)
    }

    pub fn remove(&mut self, id: &str) -> Result<SavedLocation> {
        let index = self.index_of(id)?;

        let mut next = self.locations.clone();
        let removed = next.remove(index);
        self.commit(next)?;

        info!(id, name = %removed.display_name, "saved location removed");
        Ok(removed)
    }

    /// Move `id` to `new_index`, clamped to the list bounds.
    pub fn reorder(&mut self, id: &str, new_index: usize) -> Result<()> {
        let from = self.index_of(id)?;

        let mut next = self.locations.clone();
        let to = move_item(&mut next, from, new_index)
            .ok_or_else(|| DashboardError::NotFound(format!("location '{id}'")))?;
        if from == to {
            return Ok(());
        }
        self.commit(next)?;

        info!(id, from, to, "saved location reordered");
        Ok(())
    }

    /// Drop `dragged` onto `target`: the dragged entry takes the target's
    /// position and everything in between shifts by one.
    pub fn move_onto(&mut self, dragged: &str, target: &str) -> Result<()> {
        let to = self.index_of(target)?;
        self.reorder(dragged, to)
    }

    fn find_duplicate(&self, candidate: &LocationCandidate) -> Option<&SavedLocation> {
        let coordinates = candidate.coordinates();
        self.locations
            .iter()
            .find(|l| l.provider == candidate.provider && l.coordinates().approx_eq(&coordinates))
    }

    fn index_of(&self, id: &str) -> Result<usize> {
        self.locations
            .iter()
            .position(|l| l.id == id)
            .ok_or_else(|| DashboardError::NotFound(format!("location '{id}'")))
    }

    fn commit(&mut self, mut next: Vec<SavedLocation>) -> Result<()> {
        renumber(&mut next);
        self.persist(&next, &self.unresolved)?;
        self.locations = next;
        Ok(())
    }

    fn persist(&self, locations: &[SavedLocation], unresolved: &[String]) -> Result<()> {
        let stored: Vec<StoredCityRef<'_>> = locations
            .iter()
            .map(StoredCityRef::Saved)
            .chain(unresolved.iter().map(|name| StoredCityRef::NameOnly(name)))
            .collect();
        save_json(self.store.as_ref(), SAVED_CITIES_KEY, &stored)
    }

    /// Returns whether any index had to change.
    fn densify(&mut self) -> bool {
        let changed = self.locations.iter().enumerate().any(|(i, l)| l.sort_index != i);
        renumber(&mut self.locations);
        changed
    }
}

fn renumber(locations: &mut [SavedLocation]) {
    for (index, location) in locations.iter_mut().enumerate() {
        location.sort_index = index;
    }
}

fn new_location(
    display_name: String,
    lat: f64,
    lon: f64,
    provider: ProviderId,
    provider_location_key: Option<String>,
) -> SavedLocation {
    SavedLocation {
        id: Uuid::new_v4().to_string(),
        display_name,
        lat,
        lon,
        provider,
        provider_location_key,
        sort_index: 0,
    }
}
