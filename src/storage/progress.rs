use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::atomic_write;
use crate::error::StoreError;
use crate::models::{Batch, ProgressState};
use crate::utils::Clock;

/// Durable scheduling state, kept as pretty-printed JSON.
///
/// `load` never fails: a missing file yields (and persists) a fresh state, an
/// unreadable or malformed one yields a fresh state in memory. `save` never
/// fails either; errors are logged and the state is held in memory, and
/// `load` returns it until a later save reaches disk.
pub struct ProgressStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    unsaved: Mutex<Option<ProgressState>>,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            unsaved: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> ProgressState {
        if let Some(state) = self.unsaved_state() {
            debug!("Progress file is behind; using unsaved in-memory state");
            return state;
        }

        match self.try_load() {
            Ok(Some(state)) => {
                debug!(
                    "Progress loaded: batch {} next, {} completed, {} pages on {}",
                    state.current_batch_id,
                    state.completed_batches.len(),
                    state.daily_pages_scraped,
                    state.last_scrape_date
                );
                state
            }
            Ok(None) => {
                info!("No progress file at {:?}, creating one", self.path);
                let state = ProgressState::new(self.clock.today());
                self.save(&state);
                state
            }
            Err(e) => {
                error!("Progress load failed, falling back to a fresh state: {}", e);
                if matches!(e, StoreError::Json { .. }) {
                    self.quarantine();
                }
                ProgressState::new(self.clock.today())
            }
        }
    }

    /// `Ok(None)` when the file does not exist.
    pub fn try_load(&self) -> Result<Option<ProgressState>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Json {
                path: self.path.clone(),
                source,
            })
    }

    /// Returns whether the state reached disk.
    pub fn save(&self, state: &ProgressState) -> bool {
        match self.try_save(state) {
            Ok(()) => {
                debug!("Progress saved to {:?}", self.path);
                self.set_unsaved(None);
                true
            }
            Err(e) => {
                error!("Progress save failed, continuing with unsaved state: {}", e);
                self.set_unsaved(Some(state.clone()));
                false
            }
        }
    }

    pub fn try_save(&self, state: &ProgressState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state).map_err(|source| StoreError::Json {
            path: self.path.clone(),
            source,
        })?;
        atomic_write(&self.path, format!("{}\n", json).as_bytes()).map_err(|source| {
            StoreError::Write {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// The configured batch matching the persisted `current_batch_id`;
    /// `None` once every configured batch is done.
    pub fn next_batch(&self, batches: &[Batch]) -> Option<Batch> {
        self.load().next_batch(batches).cloned()
    }

    fn unsaved_state(&self) -> Option<ProgressState> {
        match self.unsaved.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_unsaved(&self, state: Option<ProgressState>) {
        match self.unsaved.lock() {
            Ok(mut guard) => *guard = state,
            Err(poisoned) => *poisoned.into_inner() = state,
        }
    }

    /// Move a malformed file aside so the next save keeps it for inspection.
    fn quarantine(&self) {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".corrupt");
        let target = PathBuf::from(name);
        match fs::rename(&self.path, &target) {
            Ok(()) => warn!("Malformed progress file moved to {:?}", target),
            Err(e) => warn!("Could not move malformed progress file aside: {}", e),
        }
    }
}
