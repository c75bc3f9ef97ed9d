//! Adapter status state machine
//!
//! Every adapter owns an [`AdapterCore`] that tracks its status, serializes
//! restarts and caches the backend's supported languages.
//!
//! ```text
//! Enabled  --recognize-->  Processing  --done-->  Enabled
//! Enabled | Disabled  --restart-->  Restarting  --ok-->  Enabled
//!                                               --err--> Disabled
//! Disabled --initialize--> Enabled
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use super::error::OcrError;

/// Lifecycle status of a recognition engine adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterStatus {
    /// Idle and ready to recognize
    Enabled,
    /// Not selected as active, deliberately turned off, or failed to restart
    Disabled,
    /// Backend is being torn down and re-created
    Restarting,
    /// A recognize call is in flight
    Processing,
}

impl std::fmt::Display for AdapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AdapterStatus::Enabled => "Enabled",
            AdapterStatus::Disabled => "Disabled",
            AdapterStatus::Restarting => "Restarting",
            AdapterStatus::Processing => "Processing",
        };
        f.write_str(label)
    }
}

/// Status, restart serialization and language cache shared by all adapter variants
pub struct AdapterCore {
    name: String,
    status: Mutex<AdapterStatus>,
    restart_lock: tokio::sync::Mutex<()>,
    languages: Mutex<Option<BTreeSet<String>>>,
}

impl AdapterCore {
    /// Create a core in the `Disabled` state; `initialize` enables it
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: Mutex::new(AdapterStatus::Disabled),
            restart_lock: tokio::sync::Mutex::new(()),
            languages: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> AdapterStatus {
        *self.status.lock()
    }

    fn busy(&self, status: AdapterStatus) -> OcrError {
        OcrError::EngineBusy {
            adapter: self.name.clone(),
            status,
        }
    }

    /// `Enabled -> Processing`. The returned guard moves the adapter back to
    /// `Enabled` when dropped, whether the call succeeded, failed or was abandoned.
    pub fn begin_processing(&self) -> Result<ProcessingGuard<'_>, OcrError> {
        let mut status = self.status.lock();
        match *status {
            AdapterStatus::Enabled => {
                *status = AdapterStatus::Processing;
                Ok(ProcessingGuard { core: self })
            }
            AdapterStatus::Disabled => Err(OcrError::EngineUnavailable(format!(
                "{} is disabled",
                self.name
            ))),
            other => Err(self.busy(other)),
        }
    }

    /// `Enabled | Disabled -> Restarting`
    fn enter_restarting(&self) -> Result<AdapterStatus, OcrError> {
        let mut status = self.status.lock();
        match *status {
            previous @ (AdapterStatus::Enabled | AdapterStatus::Disabled) => {
                *status = AdapterStatus::Restarting;
                debug!("{}: {} -> Restarting", self.name, previous);
                Ok(previous)
            }
            other => Err(self.busy(other)),
        }
    }

    fn leave_restarting(&self, succeeded: bool) {
        let mut status = self.status.lock();
        *status = if succeeded {
            AdapterStatus::Enabled
        } else {
            AdapterStatus::Disabled
        };
        debug!("{}: Restarting -> {}", self.name, *status);
    }

    /// Run `work` as a restart: calls are queued behind any restart already
    /// running on this adapter, the status is `Restarting` for the duration,
    /// and ends as `Enabled` on success or `Disabled` on failure.
    pub async fn run_restart<F, Fut>(&self, work: F) -> Result<(), OcrError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), OcrError>>,
    {
        let _serial = self.restart_lock.lock().await;
        self.enter_restarting()?;
        self.invalidate_languages();

        let result = work().await;
        self.leave_restarting(result.is_ok());
        result
    }

    /// `Disabled -> Enabled`; no-op in any other state
    pub fn enable(&self) {
        let mut status = self.status.lock();
        if *status == AdapterStatus::Disabled {
            *status = AdapterStatus::Enabled;
            debug!("{}: Disabled -> Enabled", self.name);
        }
    }

    /// `Enabled -> Disabled`; no-op when already disabled
    pub fn disable(&self) -> Result<(), OcrError> {
        let mut status = self.status.lock();
        match *status {
            AdapterStatus::Enabled => {
                *status = AdapterStatus::Disabled;
                debug!("{}: Enabled -> Disabled", self.name);
                Ok(())
            }
            AdapterStatus::Disabled => Ok(()),
            other => Err(self.busy(other)),
        }
    }

    pub fn cached_languages(&self) -> Option<BTreeSet<String>> {
        self.languages.lock().clone()
    }

    pub fn cache_languages(&self, languages: BTreeSet<String>) {
        *self.languages.lock() = Some(languages);
    }

    pub fn invalidate_languages(&self) {
        *self.languages.lock() = None;
    }
}

/// Holds an adapter in `Processing` until dropped
pub struct ProcessingGuard<'a> {
    core: &'a AdapterCore,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        let mut status = self.core.status.lock();
        if *status == AdapterStatus::Processing {
            *status = AdapterStatus::Enabled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_new_core_is_disabled() {
        let core = AdapterCore::new("test");
        assert_eq!(core.status(), AdapterStatus::Disabled);
        core.enable();
        assert_eq!(core.status(), AdapterStatus::Enabled);
    }

    #[test]
    fn test_processing_guard_restores_enabled() {
        let core = AdapterCore::new("test");
        core.enable();
        {
            let _guard = core.begin_processing().unwrap();
            assert_eq!(core.status(), AdapterStatus::Processing);

            // Second recognize while processing fails fast
            let err = core.begin_processing().err().unwrap();
            assert!(matches!(err, OcrError::EngineBusy { status: AdapterStatus::Processing, .. }));
        }
        assert_eq!(core.status(), AdapterStatus::Enabled);
    }

    #[test]
    fn test_processing_on_disabled_is_unavailable() {
        let core = AdapterCore::new("test");
        let err = core.begin_processing().err().unwrap();
        assert!(matches!(err, OcrError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_failed_restart_disables() {
        let core = AdapterCore::new("test");
        core.enable();
        core.cache_languages(BTreeSet::from(["ja".to_string()]));

        let result = core
            .run_restart(|| async { Err(OcrError::EngineUnavailable("boom".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(core.status(), AdapterStatus::Disabled);
        assert!(core.cached_languages().is_none());
    }

    #[tokio::test]
    async fn test_recognize_during_restart_is_busy() {
        let core = Arc::new(AdapterCore::new("test"));
        core.enable();

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let restarting = core.clone();
        let task = tokio::spawn(async move {
            restarting
                .run_restart(|| async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
        });

        started_rx.await.unwrap();
        assert_eq!(core.status(), AdapterStatus::Restarting);
        let err = core.begin_processing().err().unwrap();
        assert!(matches!(err, OcrError::EngineBusy { status: AdapterStatus::Restarting, .. }));

        task.await.unwrap().unwrap();
        assert_eq!(core.status(), AdapterStatus::Enabled);
    }

    #[tokio::test]
    async fn test_second_restart_is_queued_not_dropped() {
        let core = Arc::new(AdapterCore::new("test"));
        core.enable();
        let runs = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..2 {
            let core = core.clone();
            let runs = runs.clone();
            tasks.push(tokio::spawn(async move {
                core.run_restart(|| async move {
                    runs.lock().push(format!("start {}", i));
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    runs.lock().push(format!("end {}", i));
                    Ok(())
                })
                .await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // Both restarts ran, one after the other
        let runs = runs.lock().clone();
        assert_eq!(runs, vec!["start 0", "end 0", "start 1", "end 1"]);
        assert_eq!(core.status(), AdapterStatus::Enabled);
    }
}
