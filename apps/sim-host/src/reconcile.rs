//! Turns a victory into exactly one completion write.
//!
//! The simulator does not always know which map it is running, so the map key
//! is resolved through an ordered chain (session, event, last opened level,
//! location) and then mapped to an id through the catalog, refreshing it at
//! most twice. Any step that fails falls through to the next; when the chain
//! runs dry nothing is written.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use progress_sdk::{CompletionError, CompletionStore, LevelHintStore, MapCatalog, MapCatalogEntry};
use sim_proto::VictoryEvent;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Reports the embedding page's current location.
pub trait LocationSource: Send + Sync {
    fn current_location(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Wait after the first forced catalog refresh before looking again.
    pub first_settle: Duration,
    pub second_settle: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            first_settle: Duration::from_millis(250),
            second_settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKeySource {
    Session,
    Event,
    LevelHint,
    Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Recorded {
        map_key: String,
        map_id: Uuid,
        source: MapKeySource,
    },
    AlreadyCompleted {
        map_key: String,
        map_id: Uuid,
    },
    /// `isVictory: false`; nothing to record.
    NotAVictory,
    /// No map key could be resolved.
    Unresolved,
    /// The key resolved but the catalog never learned about it.
    UnknownMap { map_key: String },
    /// The write failed. The map stays marked so replays do not hammer the store.
    WriteFailed {
        map_key: String,
        map_id: Uuid,
        error: String,
    },
}

pub struct Reconciler {
    catalog: Arc<dyn MapCatalog>,
    store: Arc<dyn CompletionStore>,
    hints: Option<Arc<dyn LevelHintStore>>,
    location: Option<Arc<dyn LocationSource>>,
    settings: ReconcilerSettings,
    completed: Mutex<HashSet<Uuid>>,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn MapCatalog>, store: Arc<dyn CompletionStore>) -> Self {
        Self {
            catalog,
            store,
            hints: None,
            location: None,
            settings: ReconcilerSettings::default(),
            completed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_hints(mut self, hints: Arc<dyn LevelHintStore>) -> Self {
        self.hints = Some(hints);
        self
    }

    pub fn with_location(mut self, location: Arc<dyn LocationSource>) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Seeds the completed set from the store so maps finished in earlier runs are skipped.
    pub async fn prime(&self) -> Result<usize, CompletionError> {
        let known = self.store.completed_map_ids().await?;
        let mut completed = self.completed.lock();
        completed.extend(known);
        Ok(completed.len())
    }

    pub fn is_completed(&self, map_id: &Uuid) -> bool {
        self.completed.lock().contains(map_id)
    }

    pub fn resolve_map_key(
        &self,
        session_key: Option<&str>,
        event: &VictoryEvent,
    ) -> Option<(String, MapKeySource)> {
        if let Some(key) = non_empty(session_key) {
            return Some((key, MapKeySource::Session));
        }
        if let Some(key) = non_empty(event.map_key.as_deref()) {
            return Some((key, MapKeySource::Event));
        }
        if let Some(hints) = &self.hints {
            match hints.last_opened() {
                Ok(hint) => {
                    if let Some(key) = non_empty(hint.as_deref()) {
                        return Some((key, MapKeySource::LevelHint));
                    }
                }
                Err(err) => {
                    debug!(target: "sim.reconcile", error = %err, "level hint unavailable");
                }
            }
        }
        let location = self.location.as_ref()?.current_location()?;
        map_key_from_location(&location).map(|key| (key, MapKeySource::Location))
    }

    async fn resolve_map(&self, map_key: &str) -> Option<MapCatalogEntry> {
        if let Some(entry) = self.catalog.lookup(map_key).await {
            return Some(entry);
        }
        for (attempt, settle) in [self.settings.first_settle, self.settings.second_settle]
            .into_iter()
            .enumerate()
        {
            match self.catalog.refresh().await {
                Ok(entries) => {
                    debug!(target: "sim.reconcile", map_key, attempt = attempt + 1, entries, "catalog refreshed");
                }
                Err(err) => {
                    debug!(target: "sim.reconcile", map_key, attempt = attempt + 1, error = %err, "catalog refresh failed");
                }
            }
            tokio::time::sleep(settle).await;
            if let Some(entry) = self.catalog.lookup(map_key).await {
                return Some(entry);
            }
        }
        None
    }

    pub async fn reconcile(&self, session_key: Option<&str>, event: &VictoryEvent) -> ReconcileOutcome {
        if event.is_victory == Some(false) {
            return ReconcileOutcome::NotAVictory;
        }
        let Some((map_key, source)) = self.resolve_map_key(session_key, event) else {
            info!(target: "sim.reconcile", "victory without a resolvable map; progress not recorded");
            return ReconcileOutcome::Unresolved;
        };
        let Some(entry) = self.resolve_map(&map_key).await else {
            warn!(target: "sim.reconcile", map_key = %map_key, "map not found in catalog; progress not recorded");
            return ReconcileOutcome::UnknownMap { map_key };
        };
        let map_id = entry.id;

        // Check and mark in one step so concurrent victories cannot both write.
        if !self.completed.lock().insert(map_id) {
            debug!(target: "sim.reconcile", map_key = %map_key, map_id = %map_id, "map already completed");
            return ReconcileOutcome::AlreadyCompleted { map_key, map_id };
        }

        match self.store.mark_completed(map_id).await {
            Ok(message) => {
                info!(
                    target: "sim.reconcile",
                    map_key = %map_key,
                    map_id = %map_id,
                    source = ?source,
                    message = %message,
                    "map completion recorded"
                );
                ReconcileOutcome::Recorded {
                    map_key,
                    map_id,
                    source,
                }
            }
            Err(err) => {
                warn!(
                    target: "sim.reconcile",
                    map_key = %map_key,
                    map_id = %map_id,
                    error = %err,
                    "failed to record map completion"
                );
                ReconcileOutcome::WriteFailed {
                    map_key,
                    map_id,
                    error: err.to_string(),
                }
            }
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Trailing path segment of a URL or bare path, ignoring query and fragment.
pub fn map_key_from_location(location: &str) -> Option<String> {
    let location = location.trim();
    let path = match Url::parse(location) {
        Ok(url) => url.path().to_string(),
        Err(_) => location
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    path.split('/')
        .rev()
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}
