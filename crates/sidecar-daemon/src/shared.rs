//! State shared by every connection of the daemon.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::info;

use sidecar_core::ConfigStore;

/// The settings store, shared across connections and backend launches.
pub type SharedConfig = Arc<tokio::sync::RwLock<ConfigStore>>;

pub fn shared_config(store: ConfigStore) -> SharedConfig {
    Arc::new(tokio::sync::RwLock::new(store))
}

/// Directory new backend processes are started in.
#[derive(Debug, Clone)]
pub struct WorkingDirectory {
    path: Arc<RwLock<PathBuf>>,
}

impl WorkingDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(RwLock::new(path.into())),
        }
    }

    pub fn get(&self) -> PathBuf {
        self.path
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, path: &Path) {
        *self.path.write().unwrap_or_else(PoisonError::into_inner) = path.to_path_buf();
        info!(path = %path.display(), "Working directory changed");
    }
}

/// Monotonic counter bumped whenever stored credentials change.
///
/// Sessions subscribe and clear their agent's cached generation artifact
/// on every bump.
#[derive(Debug, Clone)]
pub struct CredentialEpoch {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for CredentialEpoch {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }
}

impl CredentialEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the epoch and return the new value.
    pub fn bump(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        info!(epoch = next, "Credentials changed");
        next
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}
