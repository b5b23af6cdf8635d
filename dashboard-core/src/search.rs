//! Debounced location search with keyboard navigation.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{
    error::{DashboardError, Result},
    model::LocationCandidate,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_MIN_QUERY_LEN: usize = 2;

/// Anything that can turn a query into ranked candidates.
#[async_trait]
pub trait LocationSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<LocationCandidate>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchConfig {
    pub debounce: Duration,
    pub min_query_len: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { debounce: DEFAULT_DEBOUNCE, min_query_len: DEFAULT_MIN_QUERY_LEN }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    Idle,
    Typing,
    SuggestionsVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKey {
    ArrowDown,
    ArrowUp,
    Enter,
    Escape,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchEvent {
    Selected(LocationCandidate),
    Dismissed,
}

/// Result of applying one completed search.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Suggestions(usize),
    NoResults,
    Failed(DashboardError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuggestionView {
    pub candidate: LocationCandidate,
    pub highlighted: bool,
}

struct SearchResult {
    generation: u64,
    result: Result<Vec<LocationCandidate>>,
}

/// Each keystroke bumps `generation`; results tagged with an older
/// generation are dropped when they arrive.
pub struct SearchController {
    source: Arc<dyn LocationSearch>,
    config: SearchConfig,
    state: SearchState,
    query: String,
    suggestions: Vec<LocationCandidate>,
    highlighted: Option<usize>,
    generation: u64,
    awaiting: bool,
    pending: Option<JoinHandle<()>>,
    results_tx: mpsc::UnboundedSender<SearchResult>,
    results_rx: mpsc::UnboundedReceiver<SearchResult>,
}

impl SearchController {
    pub fn new(source: Arc<dyn LocationSearch>, config: SearchConfig) -> Self {
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        Self {
            source,
            config,
            state: SearchState::Idle,
            query: String::new(),
            suggestions: Vec::new(),
            highlighted: None,
            generation: 0,
            awaiting: false,
            pending: None,
            results_tx,
            results_rx,
        }
    }

    pub fn state(&self) -> SearchState {
        self.state
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Replace the query text and (re)start the debounce timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn input(&mut self, text: &str) {
        self.query = text.to_string();
        self.generation += 1;
        self.cancel_pending();
        self.awaiting = false;
        self.highlighted = None;

        if text.trim().is_empty() {
            self.reset();
            return;
        }

        self.state = SearchState::Typing;
        if text.trim().chars().count() < self.config.min_query_len {
            self.suggestions.clear();
            return;
        }

        let generation = self.generation;
        let query = text.trim().to_string();
        let source = self.source.clone();
        let tx = self.results_tx.clone();
        let debounce = self.config.debounce;

        self.awaiting = true;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            debug!(%query, generation, "searching locations");
            let result = source.search(&query).await;
            // The receiver lives as long as the controller.
            let _ = tx.send(SearchResult { generation, result });
        }));
    }

    /// Wait for the outstanding search and apply it. Returns `None` when no
    /// search is outstanding.
    pub async fn next_outcome(&mut self) -> Option<SearchOutcome> {
        while self.awaiting {
            let SearchResult { generation, result } = self.results_rx.recv().await?;
            if generation != self.generation {
                debug!(generation, current = self.generation, "discarding superseded search results");
                continue;
            }

            self.awaiting = false;
            self.pending = None;
            return Some(self.apply(result));
        }
        None
    }

    pub fn key(&mut self, key: SearchKey) -> Option<SearchEvent> {
        match key {
            SearchKey::Escape => {
                let was_active = self.state != SearchState::Idle;
                self.dismiss();
                was_active.then_some(SearchEvent::Dismissed)
            }
            _ if self.state != SearchState::SuggestionsVisible => None,
            SearchKey::ArrowDown => {
                let last = self.suggestions.len() - 1;
                self.highlighted = Some(self.highlighted.map_or(0, |i| (i + 1).min(last)));
                None
            }
            SearchKey::ArrowUp => {
                self.highlighted = Some(self.highlighted.map_or(0, |i| i.saturating_sub(1)));
                None
            }
            SearchKey::Enter => self.highlighted.and_then(|i| self.select(i)),
        }
    }

    /// Pick a suggestion with the pointer.
    pub fn click(&mut self, index: usize) -> Option<SearchEvent> {
        if self.state != SearchState::SuggestionsVisible {
            return None;
        }
        self.select(index)
    }

    pub fn blur(&mut self) {
        self.dismiss();
    }

    /// Visible suggestions in provider order.
    pub fn suggestions(&self) -> Vec<SuggestionView> {
        if self.state != SearchState::SuggestionsVisible {
            return Vec::new();
        }

        self.suggestions
            .iter()
            .enumerate()
            .map(|(i, candidate)| SuggestionView {
                candidate: candidate.clone(),
                highlighted: self.highlighted == Some(i),
            })
            .collect()
    }

    fn apply(&mut self, result: Result<Vec<LocationCandidate>>) -> SearchOutcome {
        match result {
            Ok(candidates) if candidates.is_empty() => {
                self.suggestions.clear();
                self.state = SearchState::Typing;
                SearchOutcome::NoResults
            }
            Ok(candidates) => {
                let count = candidates.len();
                self.suggestions = candidates;
                self.highlighted = None;
                self.state = SearchState::SuggestionsVisible;
                SearchOutcome::Suggestions(count)
            }
            Err(err) => {
                self.suggestions.clear();
                self.state = SearchState::Typing;
                SearchOutcome::Failed(err)
            }
        }
    }

    fn select(&mut self, index: usize) -> Option<SearchEvent> {
        let candidate = self.suggestions.get(index).cloned()?;
        self.query.clear();
        self.reset();
        Some(SearchEvent::Selected(candidate))
    }

    fn dismiss(&mut self) {
        self.generation += 1;
        self.cancel_pending();
        self.reset();
    }

    fn reset(&mut self) {
        self.suggestions.clear();
        self.highlighted = None;
        self.awaiting = false;
        self.state = SearchState::Idle;
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

impl Drop for SearchController {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}
