//! Settings Coordinator
//!
//! Applies engine settings changes. Updates that only touch live values are
//! committed immediately; updates that change the execution runtime,
//! service address or credentials restart the adapter with the new settings,
//! which only replace the previous ones once the restart succeeded. Settings
//! are persisted only after they took effect. Updates to one adapter are
//! strictly serialized.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::storage::Persistence;
use crate::vision::{AdapterRegistry, EngineSettings, OcrAdapter, OcrError, SettingsUpdate};

/// How an accepted settings update took effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsApplied {
    /// Committed without a restart
    Live,
    /// The active adapter was restarted with the new settings
    Restarted,
    /// Staged; the adapter is inactive and restarts with them when next
    /// activated. Nothing is committed or persisted until then.
    Deferred,
}

pub struct SettingsCoordinator {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn Persistence>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SettingsCoordinator {
    pub fn new(registry: Arc<AdapterRegistry>, store: Arc<dyn Persistence>) -> Self {
        Self {
            registry,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, adapter: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(adapter.to_string())
            .or_default()
            .clone()
    }

    /// Validate `update` against the adapter's current settings and apply it
    pub async fn apply(
        &self,
        adapter_name: &str,
        update: EngineSettings,
    ) -> Result<SettingsApplied, OcrError> {
        let adapter = self.registry.get(adapter_name)?;
        let lock = self.lock_for(adapter_name);
        let _serial = lock.lock().await;

        // Updates to an adapter with staged settings build on those
        let staged = self.registry.staged_settings(adapter_name);
        let base = staged.clone().unwrap_or_else(|| adapter.settings());
        let SettingsUpdate { settings, restart } = adapter
            .update_settings(update, Some(base))
            .await
            .map_err(|e| apply_failed(adapter_name, e))?;

        if !restart && staged.is_none() {
            adapter
                .commit_settings(settings.clone())
                .map_err(|e| apply_failed(adapter_name, e))?;
            self.persist(adapter_name, &settings);
            debug!("Applied live settings to {}", adapter_name);
            return Ok(SettingsApplied::Live);
        }

        // Holds off captures until the restart is done
        let _exclusive = self.registry.exclusive().await;

        if !self.registry.is_active(adapter_name) {
            self.registry.stage_restart(adapter_name, settings);
            info!("{} is inactive; restart deferred until activation", adapter_name);
            return Ok(SettingsApplied::Deferred);
        }

        match adapter.restart_with(settings).await {
            Ok(()) => {
                self.persist(adapter_name, &adapter.settings());
                info!("Restarted {} with new settings", adapter_name);
                Ok(SettingsApplied::Restarted)
            }
            Err(e) => {
                warn!("Restart of {} failed, previous settings kept: {}", adapter_name, e);
                Err(apply_failed(adapter_name, e))
            }
        }
    }

    /// Activate an adapter through the registry. Settings staged while it
    /// was inactive are persisted once the activation restart succeeded.
    pub async fn activate(&self, adapter_name: &str) -> Result<(), OcrError> {
        let adapter = self.registry.get(adapter_name)?;
        let lock = self.lock_for(adapter_name);
        let _serial = lock.lock().await;

        let staged = self.registry.has_staged_restart(adapter_name);
        self.registry.set_active(adapter_name).await?;
        if staged {
            self.persist(adapter_name, &adapter.settings());
        }
        Ok(())
    }

    /// Restart the active adapter with its current settings
    pub async fn restart(&self, adapter_name: &str) -> Result<(), OcrError> {
        let adapter = self.registry.get(adapter_name)?;
        let lock = self.lock_for(adapter_name);
        let _serial = lock.lock().await;

        let _exclusive = self.registry.exclusive().await;
        if !self.registry.is_active(adapter_name) {
            return Err(OcrError::EngineUnavailable(format!(
                "{} is not the active engine",
                adapter_name
            )));
        }
        adapter.restart().await?;
        info!("Restarted {}", adapter_name);
        Ok(())
    }

    /// Replace each adapter's settings with its persisted copy, if any.
    /// Call before the adapters are initialized.
    pub async fn load_persisted(&self) -> Result<(), OcrError> {
        for name in self.registry.names() {
            let Some(stored) = self.store.load_settings(&name)? else {
                continue;
            };
            let adapter = self.registry.get(&name)?;
            match restore(adapter.as_ref(), stored).await {
                Ok(()) => debug!("Loaded persisted settings for {}", name),
                Err(e) => warn!("Ignoring persisted settings for {}: {}", name, e),
            }
        }
        Ok(())
    }

    fn persist(&self, adapter_name: &str, settings: &EngineSettings) {
        if let Err(e) = self.store.save_settings(adapter_name, settings) {
            warn!("Failed to persist settings for {}: {}", adapter_name, e);
        }
    }
}

async fn restore(adapter: &dyn OcrAdapter, stored: EngineSettings) -> Result<(), OcrError> {
    let validated = adapter.update_settings(stored, None).await?;
    adapter.commit_settings(validated.settings)
}

fn apply_failed(adapter: &str, error: OcrError) -> OcrError {
    match error {
        e @ OcrError::SettingsApplyFailed { .. } => e,
        e => OcrError::SettingsApplyFailed {
            adapter: adapter.to_string(),
            reason: e.to_string(),
        },
    }
}
