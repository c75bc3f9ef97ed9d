//! Recognition Orchestrator
//!
//! Turns a capture into one ordered recognition result: the whole image goes
//! to the active adapter, or, with a template, one crop per target region.
//! At most one capture is in flight per adapter.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CapturedFrame;
use crate::templates::{to_pixel_regions, OcrTemplate};
use crate::vision::{
    normalize_language, AdapterRegistry, OcrAdapter, OcrError, RecognitionInput,
    RecognitionResult, TextSpan,
};

/// One capture action
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    /// Encoded captured image
    pub image_bytes: Vec<u8>,
    /// Two-letter language code
    pub language_code: String,
    /// Template whose target regions scope the recognition
    pub template: Option<OcrTemplate>,
}

/// Marks an adapter as busy with a capture until dropped
struct InFlight {
    adapters: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.adapters.lock().remove(&self.name);
    }
}

/// A capture running in the background. Resolves to the capture's outcome,
/// `Ok(None)` when nothing was found or the capture was cancelled.
#[derive(Debug)]
pub struct CaptureHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<Option<RecognitionResult>, OcrError>>,
}

impl CaptureHandle {
    /// Abandon the capture. Calls already sent to the backend finish on
    /// their own; their results are discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Future for CaptureHandle {
    type Output = Result<Option<RecognitionResult>, OcrError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task)
            .poll(cx)
            .map(|joined| joined.map_err(task_failed).and_then(|outcome| outcome))
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<AdapterRegistry>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether a capture on `adapter` is still unresolved
    pub fn is_in_flight(&self, adapter: &str) -> bool {
        self.in_flight.lock().contains(adapter)
    }

    fn claim(&self, adapter: &str) -> Result<InFlight, OcrError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(adapter.to_string()) {
            return Err(OcrError::RecognitionInProgress(adapter.to_string()));
        }
        Ok(InFlight {
            adapters: self.in_flight.clone(),
            name: adapter.to_string(),
        })
    }

    /// Recognize a capture with the active adapter in the background
    pub fn capture(&self, request: RecognitionRequest) -> CaptureHandle {
        let cancel = CancellationToken::new();
        let orchestrator = self.clone();
        let token = cancel.clone();
        let task =
            tokio::spawn(async move { orchestrator.capture_cancellable(request, token).await });
        CaptureHandle { cancel, task }
    }

    /// Recognize a capture; resolves to `Ok(None)` as soon as `cancel` fires.
    ///
    /// The work itself keeps the adapter claimed until the call already sent
    /// to the backend settles, so a new capture on the same adapter is
    /// rejected with `RecognitionInProgress` until then.
    async fn capture_cancellable(
        &self,
        request: RecognitionRequest,
        cancel: CancellationToken,
    ) -> Result<Option<RecognitionResult>, OcrError> {
        // Claim before queueing on the gate, so a capture issued while a
        // switch or restart waits still fails fast on the busy adapter
        let early = self
            .registry
            .active_name()
            .map(|name| self.claim(&name))
            .transpose()?;
        let gate = self.registry.recognition_gate().await;
        let adapter = self.registry.active()?;
        let claim = match early {
            Some(claim) if claim.name == adapter.name() => claim,
            stale => {
                drop(stale);
                self.claim(adapter.name())?
            }
        };

        let work_cancel = cancel.clone();
        let work = tokio::spawn(async move {
            let _gate = gate;
            let _claim = claim;
            run_capture(adapter, request, work_cancel).await
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Capture cancelled; pending results will be discarded");
                Ok(None)
            }
            joined = work => joined.map_err(task_failed)?,
        }
    }
}

fn task_failed(e: tokio::task::JoinError) -> OcrError {
    OcrError::EngineUnavailable(format!("capture task failed: {}", e))
}

async fn run_capture(
    adapter: Arc<dyn OcrAdapter>,
    request: RecognitionRequest,
    cancel: CancellationToken,
) -> Result<Option<RecognitionResult>, OcrError> {
    let started = Instant::now();
    let language_code = normalize_language(&request.language_code);

    let template = match request.template {
        Some(template) if !template.target_regions.is_empty() => template,
        _ => {
            let result = adapter
                .recognize(RecognitionInput {
                    image_bytes: request.image_bytes,
                    language_code,
                })
                .await?;
            return Ok(result.filter(|r| !r.is_empty()));
        }
    };

    let frame = CapturedFrame::decode(&request.image_bytes)?;
    let regions = to_pixel_regions(&template, frame.width, frame.height);
    debug!(
        "Capturing {} regions of '{}' at {}x{}",
        regions.len(),
        template.name,
        frame.width,
        frame.height
    );

    // Slots follow the template's region order
    let mut slots: Vec<Vec<TextSpan>> = vec![Vec::new(); regions.len()];
    let mut failures = 0usize;
    let mut last_error = None;

    for (slot, region) in slots.iter_mut().zip(&regions) {
        if cancel.is_cancelled() {
            debug!("Capture abandoned before region {}", region.region_id);
            return Ok(None);
        }

        let outcome = match frame.crop_png(region.rect) {
            Ok(crop) => {
                adapter
                    .recognize(RecognitionInput {
                        image_bytes: crop,
                        language_code: language_code.clone(),
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(result)) => {
                *slot = result
                    .spans
                    .into_iter()
                    .map(|span| TextSpan {
                        bounding_box: span.bounding_box.offset(region.rect.x, region.rect.y),
                        region_id: Some(region.region_id.clone()),
                        ..span
                    })
                    .collect();
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Region {} failed: {}", region.region_id, e);
                failures += 1;
                last_error = Some(e);
            }
        }
    }

    if failures == regions.len() {
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        return Err(OcrError::EngineUnavailable(format!(
            "all {} regions failed: {}",
            failures, reason
        )));
    }

    let spans: Vec<TextSpan> = slots.into_iter().flatten().collect();
    if spans.is_empty() {
        return Ok(None);
    }

    Ok(Some(RecognitionResult {
        spans,
        adapter: adapter.name().to_string(),
        processing_time_ms: started.elapsed().as_millis() as u64,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_png;
    use crate::settings::SettingsCoordinator;
    use crate::storage::MemoryStore;
    use crate::templates::{Position, RegionDraft, Size, TemplateTargeting};
    use crate::vision::registry::testing::{FakeAdapter, Scripted};
    use crate::vision::{AdapterStatus, EngineSettings, Rect};
    use serde_json::json;
    use std::time::Duration;

    fn setup(names: &[&str]) -> (Orchestrator, Arc<AdapterRegistry>, Vec<Arc<FakeAdapter>>) {
        let registry = Arc::new(AdapterRegistry::new());
        let adapters: Vec<Arc<FakeAdapter>> =
            names.iter().map(|n| Arc::new(FakeAdapter::new(n))).collect();
        for adapter in &adapters {
            registry.register(adapter.clone());
        }
        (Orchestrator::new(registry.clone()), registry, adapters)
    }

    /// Template on a 100x100 reference with `count` side-by-side regions
    fn template(count: usize) -> OcrTemplate {
        let targeting = TemplateTargeting::default();
        let mut template = OcrTemplate::new("t", test_png(100, 100)).unwrap();
        for i in 0..count {
            let draft = RegionDraft {
                position: Position { top: 0.1, left: 0.2 * i as f32 },
                size: Size { width: 0.1, height: 0.1 },
                angle: 0.0,
            };
            template.target_regions = targeting.add_region(&template, draft).unwrap();
        }
        template
    }

    fn request(template: Option<OcrTemplate>) -> RecognitionRequest {
        RecognitionRequest {
            image_bytes: test_png(200, 100),
            language_code: "ja-JP".into(),
            template,
        }
    }

    #[tokio::test]
    async fn test_capture_without_template_uses_full_image() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Text("hello", Duration::ZERO));

        let result = orchestrator.capture(request(None)).await.unwrap().unwrap();
        assert_eq!(result.text(), "hello");
        assert_eq!(result.spans[0].region_id, None);
        assert_eq!(result.spans[0].bounding_box, Rect::new(1, 1, 4, 2));
    }

    #[tokio::test]
    async fn test_no_active_adapter() {
        let (orchestrator, _registry, _) = setup(&["a"]);
        let err = orchestrator.capture(request(None)).await.unwrap_err();
        assert!(matches!(err, OcrError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_nothing_found_is_none() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Empty);

        assert!(orchestrator.capture(request(None)).await.unwrap().is_none());

        let result = orchestrator.capture(request(Some(template(2)))).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_regions_merge_in_template_order() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Text("first", Duration::from_millis(30)));
        adapters[0].push(Scripted::Text("second", Duration::from_millis(1)));
        adapters[0].push(Scripted::Text("third", Duration::from_millis(10)));

        let template = template(3);
        let ids: Vec<String> = template.target_regions.iter().map(|r| r.id.clone()).collect();

        let result = orchestrator.capture(request(Some(template))).await.unwrap().unwrap();
        let texts: Vec<&str> = result.spans.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);

        let tagged: Vec<String> = result.spans.iter().filter_map(|s| s.region_id.clone()).collect();
        assert_eq!(tagged, ids);

        // Boxes are in capture coordinates: region 2 starts at x=0.2*200, y=0.1*100
        assert_eq!(result.spans[1].bounding_box, Rect::new(41, 11, 4, 2));
    }

    #[tokio::test]
    async fn test_partial_region_failure_is_absorbed() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Text("kept", Duration::ZERO));
        adapters[0].push(Scripted::Fail(OcrError::EngineUnavailable("timeout".into())));
        adapters[0].push(Scripted::Text("also kept", Duration::ZERO));

        let result = orchestrator.capture(request(Some(template(3)))).await.unwrap().unwrap();
        assert_eq!(result.text(), "kept\nalso kept");
        assert_eq!(adapters[0].status(), AdapterStatus::Enabled);
    }

    #[tokio::test]
    async fn test_all_regions_failing_is_engine_unavailable() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Fail(OcrError::EngineUnavailable("down".into())));
        adapters[0].push(Scripted::Fail(OcrError::UnsupportedLanguage("xx".into())));

        let err = orchestrator.capture(request(Some(template(2)))).await.unwrap_err();
        assert!(matches!(err, OcrError::EngineUnavailable(_)));
        assert!(!orchestrator.is_in_flight("a"));
    }

    #[tokio::test]
    async fn test_invalid_capture_with_template() {
        let (orchestrator, registry, _) = setup(&["a"]);
        registry.set_active("a").await.unwrap();

        let mut req = request(Some(template(1)));
        req.image_bytes = b"not an image".to_vec();
        let err = orchestrator.capture(req).await.unwrap_err();
        assert!(matches!(err, OcrError::InvalidImage(_)));
    }

    #[tokio::test]
    async fn test_second_capture_rejected_while_in_flight() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Text("slow", Duration::from_millis(100)));

        let first = orchestrator.capture(request(None));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = orchestrator.capture(request(None)).await.unwrap_err();
        assert_eq!(err, OcrError::RecognitionInProgress("a".into()));

        let result = first.await.unwrap().unwrap();
        assert_eq!(result.text(), "slow");

        // Accepted again once the first one resolved
        adapters[0].push(Scripted::Text("next", Duration::ZERO));
        assert!(orchestrator.capture(request(None)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_capture_rejected_while_restart_queued() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        let coordinator = Arc::new(SettingsCoordinator::new(
            registry.clone(),
            Arc::new(MemoryStore::new()),
        ));
        adapters[0].push(Scripted::Text("slow", Duration::from_millis(100)));
        adapters[0].push(Scripted::Text("second", Duration::ZERO));

        let first = orchestrator.capture(request(None));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let applying = coordinator.clone();
        let apply = tokio::spawn(async move {
            applying
                .apply("a", EngineSettings::new(json!({ "runtime": "gpu" })))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = orchestrator.capture(request(None)).await.unwrap_err();
        assert_eq!(err, OcrError::RecognitionInProgress("a".into()));

        assert_eq!(first.await.unwrap().unwrap().text(), "slow");
        apply.await.unwrap().unwrap();
        assert_eq!(adapters[0].restart_count(), 1);
        assert_eq!(adapters[0].calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capture_queued_behind_switch_runs_on_new_adapter() {
        let (orchestrator, registry, adapters) = setup(&["a", "b"]);
        registry.set_active("a").await.unwrap();

        // Hold the gate so the switch queues, then queue a capture behind it
        let gate = registry.recognition_gate().await;
        let switching = registry.clone();
        let switch = tokio::spawn(async move { switching.set_active("b").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        adapters[1].push(Scripted::Text("from b", Duration::ZERO));
        let capture = orchestrator.capture(request(None));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(gate);

        switch.await.unwrap().unwrap();
        let result = capture.await.unwrap().unwrap();
        assert_eq!(result.adapter, "b");
        assert!(!orchestrator.is_in_flight("a"));
        assert!(!orchestrator.is_in_flight("b"));
    }

    #[tokio::test]
    async fn test_cancelled_capture_discards_results() {
        let (orchestrator, registry, adapters) = setup(&["a"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Text("late", Duration::from_millis(80)));
        adapters[0].push(Scripted::Text("never", Duration::ZERO));

        let handle = orchestrator.capture(request(Some(template(2))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        assert!(handle.await.unwrap().is_none());

        // The call already issued settles on its own; the next region is not issued
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(adapters[0].calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(adapters[0].status(), AdapterStatus::Enabled);
        assert!(!orchestrator.is_in_flight("a"));
    }

    #[tokio::test]
    async fn test_switch_deferred_until_capture_settles() {
        let (orchestrator, registry, adapters) = setup(&["a", "b"]);
        registry.set_active("a").await.unwrap();
        adapters[0].push(Scripted::Text("from a", Duration::from_millis(60)));

        let capture = orchestrator.capture(request(None));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let switching = registry.clone();
        let switch = tokio::spawn(async move { switching.set_active("b").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.active_name().as_deref(), Some("a"));

        let result = capture.await.unwrap().unwrap();
        assert_eq!(result.adapter, "a");

        switch.await.unwrap().unwrap();
        assert_eq!(registry.active_name().as_deref(), Some("b"));
        assert_eq!(adapters[0].status(), AdapterStatus::Disabled);
    }
}
