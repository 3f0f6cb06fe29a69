//! Local state file and the simulated collaborators restored from it.
//!
//! Each invocation loads the file, runs against in-memory provider, vault
//! and state store seeded from it, then writes the updated snapshot back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use keel_flow::config::EngineConfig;
use keel_flow::provider::InMemoryProvider;
use keel_flow::provider::memory::{InMemoryVault, ProviderSnapshot, VaultSnapshot};
use keel_flow::scheduler::Scheduler;
use keel_flow::secrets::SecretStore;
use keel_flow::state::{AppliedRecord, InMemoryStateStore};

/// On-disk snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateFile {
    /// Applied records.
    #[serde(default)]
    pub records: Vec<AppliedRecord>,
    /// Simulated provider resources.
    #[serde(default)]
    pub provider: ProviderSnapshot,
    /// Simulated vault contents (digests only).
    #[serde(default)]
    pub vault: VaultSnapshot,
}

impl StateFile {
    /// Reads a state file; a missing file is an empty state.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no state file; starting empty");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))
    }

    /// Writes the state file, replacing it atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize state")?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, json)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        std::fs::rename(&staging, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Collaborators restored from a state file.
pub struct Workspace {
    path: PathBuf,
    /// Simulated provider.
    pub provider: Arc<InMemoryProvider>,
    /// Applied records.
    pub state: Arc<InMemoryStateStore>,
    /// Simulated vault.
    pub vault: Arc<InMemoryVault>,
}

impl Workspace {
    /// Loads the state file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn open(path: &Path) -> Result<Self> {
        let file = StateFile::load(path)?;
        tracing::debug!(records = file.records.len(), "state loaded");
        Ok(Self {
            path: path.to_path_buf(),
            provider: Arc::new(InMemoryProvider::from_snapshot(file.provider)),
            state: Arc::new(InMemoryStateStore::from_records(file.records)),
            vault: Arc::new(InMemoryVault::from_snapshot(file.vault)),
        })
    }

    /// Builds a scheduler over the workspace collaborators.
    #[must_use]
    pub fn scheduler(&self, config: EngineConfig) -> Scheduler {
        Scheduler::new(
            config,
            self.provider.clone(),
            self.state.clone(),
            Arc::new(SecretStore::new(self.vault.clone())),
        )
    }

    /// Writes the current snapshot back to the state file.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be taken or written.
    pub fn persist(&self) -> Result<()> {
        let file = StateFile {
            records: self.state.snapshot().context("Failed to snapshot records")?,
            provider: self.provider.snapshot(),
            vault: self.vault.snapshot(),
        };
        file.save(&self.path)?;
        tracing::debug!(path = %self.path.display(), records = file.records.len(), "state saved");
        Ok(())
    }
}
