//! Durable engine state
//!
//! A tiny JSON record (`skip`, `active`, `initialized`, `enabled`) rewritten on
//! every mutation. Loading never fails: a missing or unreadable file yields the
//! default state. Saving goes through a sibling temp file and a rename.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Persisted projection of the request lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default)]
    pub skip: Vec<String>,
    #[serde(default)]
    pub active: Option<String>,
    #[serde(default)]
    pub initialized: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            skip: Vec::new(),
            active: None,
            initialized: false,
            enabled: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Failed to write state file {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("State lock poisoned")]
    Poisoned,
}

struct Inner {
    state: EngineState,
    skip_index: HashSet<String>,
}

impl Inner {
    fn new(state: EngineState) -> Self {
        let skip_index = state.skip.iter().cloned().collect();
        Self { state, skip_index }
    }
}

/// Write-through store for [`EngineState`]
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Load state from `path`, falling back to defaults on any read or parse failure
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<EngineState>(&content) {
                Ok(mut state) => {
                    dedup_preserving_order(&mut state.skip);
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "State file unparsable, starting from defaults");
                    EngineState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting from defaults");
                EngineState::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file unreadable, starting from defaults");
                EngineState::default()
            }
        };

        Self {
            path,
            inner: Mutex::new(Inner::new(state)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> EngineState {
        self.inner
            .lock()
            .map(|inner| inner.state.clone())
            .unwrap_or_default()
    }

    pub fn is_skipped(&self, identifier: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.skip_index.contains(identifier))
            .unwrap_or(false)
    }

    pub fn skip_len(&self) -> usize {
        self.inner.lock().map(|inner| inner.skip_index.len()).unwrap_or(0)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().map(|inner| inner.state.enabled).unwrap_or(false)
    }

    pub fn active(&self) -> Option<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.state.active.clone())
    }

    /// Add `identifier` to the skip set. Returns whether it was newly added.
    pub fn mark_skipped(&self, identifier: &str) -> Result<bool, StateError> {
        self.mutate(|inner| {
            if inner.skip_index.insert(identifier.to_string()) {
                inner.state.skip.push(identifier.to_string());
                true
            } else {
                false
            }
        })
    }

    /// Record a won claim: the identifier becomes active and skipped
    pub fn record_claim(&self, identifier: &str) -> Result<(), StateError> {
        self.mutate(|inner| {
            if inner.skip_index.insert(identifier.to_string()) {
                inner.state.skip.push(identifier.to_string());
            }
            inner.state.active = Some(identifier.to_string());
        })
    }

    /// Release the active slot, keeping `identifier` in the skip set
    pub fn release_active(&self, identifier: &str) -> Result<(), StateError> {
        self.mutate(|inner| {
            if inner.skip_index.insert(identifier.to_string()) {
                inner.state.skip.push(identifier.to_string());
            }
            if inner.state.active.as_deref() == Some(identifier) {
                inner.state.active = None;
            }
        })
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), StateError> {
        self.mutate(|inner| inner.state.enabled = enabled)
    }

    pub fn set_initialized(&self) -> Result<(), StateError> {
        self.mutate(|inner| inner.state.initialized = true)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T, StateError> {
        let mut inner = self.inner.lock().map_err(|_| StateError::Poisoned)?;
        let result = f(&mut inner);
        write_atomically(&self.path, &inner.state)?;
        Ok(result)
    }
}

fn dedup_preserving_order(items: &mut Vec<String>) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(item.clone()));
}

fn write_atomically(path: &Path, state: &EngineState) -> Result<(), StateError> {
    let payload = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    let to_save_error = |source| StateError::Save {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(to_save_error)?;
    }
    std::fs::write(&tmp, payload).map_err(to_save_error)?;
    std::fs::rename(&tmp, path).map_err(to_save_error)?;
    Ok(())
}
