//! Adapter registry
//!
//! Owns every engine adapter and the active-adapter pointer. Captures hold a
//! shared recognition gate for their whole duration; switching the active
//! adapter and restarting an adapter take the gate exclusively, so they are
//! deferred until in-flight recognition settles.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard};
use tracing::{info, warn};

use super::{AdapterStatus, EngineSettings, OcrAdapter, OcrError};

struct AdapterEntry {
    adapter: Arc<dyn OcrAdapter>,
    /// Restart-requiring settings accepted while inactive, applied on activation
    staged: Option<EngineSettings>,
}

/// Registry of recognition engine adapters
pub struct AdapterRegistry {
    adapters: RwLock<BTreeMap<String, AdapterEntry>>,
    active: RwLock<Option<String>>,
    gate: Arc<tokio::sync::RwLock<()>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: RwLock::new(BTreeMap::new()),
            active: RwLock::new(None),
            gate: Arc::new(tokio::sync::RwLock::new(())),
        }
    }

    /// Register an adapter under its name, replacing any previous one
    pub fn register(&self, adapter: Arc<dyn OcrAdapter>) {
        let name = adapter.name().to_string();
        let previous = self.adapters.write().insert(
            name.clone(),
            AdapterEntry {
                adapter,
                staged: None,
            },
        );
        if previous.is_some() {
            warn!("Replaced registered adapter {}", name);
        } else {
            info!("Registered adapter {}", name);
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn OcrAdapter>, OcrError> {
        self.adapters
            .read()
            .get(name)
            .map(|entry| entry.adapter.clone())
            .ok_or_else(|| OcrError::UnknownAdapter(name.to_string()))
    }

    /// Registered adapter names, sorted
    pub fn names(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    pub fn active_name(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.read().as_deref() == Some(name)
    }

    /// The active adapter. Do not hold on to it across awaits that outlive
    /// the current capture; the active adapter may change between calls.
    pub fn active(&self) -> Result<Arc<dyn OcrAdapter>, OcrError> {
        let name = self
            .active_name()
            .ok_or_else(|| OcrError::EngineUnavailable("no active adapter".into()))?;
        self.get(&name)
    }

    /// Shared gate held by a capture for its whole duration
    pub async fn recognition_gate(&self) -> OwnedRwLockReadGuard<()> {
        self.gate.clone().read_owned().await
    }

    /// Exclusive gate: waits for in-flight captures and holds off new ones
    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        self.gate.clone().write_owned().await
    }

    /// Stage restart-requiring settings for an inactive adapter. They are
    /// not committed; the restart on activation applies them. A later stage
    /// replaces an earlier one.
    pub fn stage_restart(&self, name: &str, settings: EngineSettings) {
        if let Some(entry) = self.adapters.write().get_mut(name) {
            entry.staged = Some(settings);
        }
    }

    /// Settings staged for `name`, if any
    pub fn staged_settings(&self, name: &str) -> Option<EngineSettings> {
        self.adapters
            .read()
            .get(name)
            .and_then(|entry| entry.staged.clone())
    }

    pub fn has_staged_restart(&self, name: &str) -> bool {
        self.adapters
            .read()
            .get(name)
            .is_some_and(|entry| entry.staged.is_some())
    }

    fn take_staged(&self, name: &str) -> Option<EngineSettings> {
        self.adapters
            .write()
            .get_mut(name)
            .and_then(|entry| entry.staged.take())
    }

    /// Make `name` the active adapter.
    ///
    /// Waits for any in-flight capture on the current adapter to settle. The
    /// newly active adapter is restarted only if restart-requiring settings
    /// were staged while it was inactive; otherwise a disabled adapter is
    /// re-initialized. On failure the active adapter is left unchanged, and
    /// a failed staged restart is dropped with the adapter's settings intact.
    pub async fn set_active(&self, name: &str) -> Result<(), OcrError> {
        let adapter = self.get(name)?;
        let _exclusive = self.exclusive().await;

        if self.is_active(name) && adapter.status() != AdapterStatus::Disabled {
            return Ok(());
        }

        if let Some(staged) = self.take_staged(name) {
            info!("Applying deferred restart of {}", name);
            if let Err(e) = adapter.restart_with(staged).await {
                warn!("Deferred restart of {} failed, keeping previous settings: {}", name, e);
                return Err(OcrError::SettingsApplyFailed {
                    adapter: name.to_string(),
                    reason: e.to_string(),
                });
            }
        } else if adapter.status() == AdapterStatus::Disabled {
            adapter.initialize(None).await?;
        }

        let previous = self.active.write().replace(name.to_string());
        if let Some(previous) = previous.filter(|p| p != name) {
            if let Ok(previous_adapter) = self.get(&previous) {
                if let Err(e) = previous_adapter.core().disable() {
                    warn!("Could not disable {}: {}", previous, e);
                }
            }
        }

        info!("Active adapter: {}", name);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory adapter used by tests across the crate

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{BTreeSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::vision::{
        AdapterCore, EngineSettings, OcrAdapter, OcrError, RecognitionInput, RecognitionResult,
        Rect, SettingsOptions, SettingsUpdate, TextSpan,
    };

    /// Scripted response of one recognize call
    pub enum Scripted {
        Text(&'static str, Duration),
        Empty,
        Fail(OcrError),
    }

    pub struct FakeAdapter {
        core: AdapterCore,
        settings: Mutex<EngineSettings>,
        script: Mutex<VecDeque<Scripted>>,
        pub fail_restart: Mutex<bool>,
        pub restart_delay: Mutex<Duration>,
        pub restarts: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl FakeAdapter {
        pub fn new(name: &str) -> Self {
            let core = AdapterCore::new(name);
            core.enable();
            Self {
                core,
                settings: Mutex::new(EngineSettings::new(json!({ "runtime": "cpu", "threshold": 0.5 }))),
                script: Mutex::new(VecDeque::new()),
                fail_restart: Mutex::new(false),
                restart_delay: Mutex::new(Duration::from_millis(5)),
                restarts: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn push(&self, response: Scripted) {
            self.script.lock().push_back(response);
        }

        pub fn restart_count(&self) -> usize {
            self.restarts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OcrAdapter for FakeAdapter {
        fn core(&self) -> &AdapterCore {
            &self.core
        }

        async fn initialize(&self, _endpoint: Option<String>) -> Result<(), OcrError> {
            self.core.enable();
            Ok(())
        }

        async fn recognize(
            &self,
            input: RecognitionInput,
        ) -> Result<Option<RecognitionResult>, OcrError> {
            let _processing = self.core.begin_processing()?;
            self.calls.fetch_add(1, Ordering::SeqCst);
            image::guess_format(&input.image_bytes)
                .map_err(|e| OcrError::InvalidImage(e.to_string()))?;

            let next = self.script.lock().pop_front();
            match next {
                Some(Scripted::Text(text, delay)) => {
                    tokio::time::sleep(delay).await;
                    Ok(Some(RecognitionResult {
                        spans: vec![TextSpan {
                            text: text.to_string(),
                            bounding_box: Rect::new(1, 1, 4, 2),
                            region_id: None,
                            confidence: Some(1.0),
                        }],
                        adapter: self.core.name().to_string(),
                        processing_time_ms: delay.as_millis() as u64,
                    }))
                }
                Some(Scripted::Fail(e)) => Err(e),
                Some(Scripted::Empty) | None => Ok(None),
            }
        }

        async fn supported_languages(&self) -> Result<BTreeSet<String>, OcrError> {
            Ok(BTreeSet::from(["ja".to_string(), "en".to_string()]))
        }

        async fn update_settings(
            &self,
            update: EngineSettings,
            old: Option<EngineSettings>,
        ) -> Result<SettingsUpdate, OcrError> {
            let base = old.unwrap_or_else(|| self.settings());
            let merged = base.merged_with(&update);
            let threshold = merged.as_value()["threshold"].as_f64().unwrap_or(0.0);
            if !(0.0..=1.0).contains(&threshold) {
                return Err(OcrError::InvalidSettings("threshold out of range".into()));
            }
            Ok(SettingsUpdate {
                restart: merged.as_value()["runtime"] != base.as_value()["runtime"],
                settings: merged,
            })
        }

        fn commit_settings(&self, settings: EngineSettings) -> Result<(), OcrError> {
            *self.settings.lock() = settings;
            Ok(())
        }

        fn settings(&self) -> EngineSettings {
            self.settings.lock().clone()
        }

        fn default_settings(&self) -> EngineSettings {
            EngineSettings::new(json!({ "runtime": "cpu", "threshold": 0.5 }))
        }

        fn settings_options(&self) -> SettingsOptions {
            SettingsOptions::default()
        }

        async fn restart_with(&self, settings: EngineSettings) -> Result<(), OcrError> {
            let fail = *self.fail_restart.lock();
            let delay = *self.restart_delay.lock();
            self.core
                .run_restart(|| async move {
                    self.restarts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    if fail {
                        return Err(OcrError::EngineUnavailable("restart failed".into()));
                    }
                    *self.settings.lock() = settings;
                    Ok(())
                })
                .await
        }
    }
}
