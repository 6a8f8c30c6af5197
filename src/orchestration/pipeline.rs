// Pipeline orchestrator: detect → translate → render → composite
//
// Stages run strictly in sequence. Only configuration errors, detection
// errors, cancellation and an internal count mismatch end a run without an
// image; everything else degrades per block and is recorded in the report.

use image::RgbaImage;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::core::config::{Config, OutputConfig, RenderingConfig};
use crate::core::errors::{
    ConfigError, DetectionError, PipelineError, PipelineResult, RenderingResult,
};
use crate::core::types::{
    BlockReport, BoundingRect, PipelineOutput, RenderedPatch, RunReport, SkipStage, SkippedBlock,
    StageTimings, TextBlock,
};
use crate::services::compositing::{ImageCompositor, Placement};
use crate::services::detection::{TextRegionDetector, VisionDetector};
use crate::services::rendering::TextImageRenderer;
use crate::services::translation::BatchTranslator;
use crate::utils::image_ops::{decode_rgba_async, encode_image_async};
use crate::utils::metrics::{Metrics, Stage};

/// What the renderer is asked to draw for one block
#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub block_id: u32,
    pub text: String,
    pub width: u32,
    pub height: u32,
    pub font_size: f32,
}

/// Cooperative cancellation flag shared between a run and its caller
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Detecting,
    Translating,
    Rendering,
    Compositing,
    Done,
    Failed,
    Cancelled,
}

impl PipelineState {
    fn stage_name(self) -> &'static str {
        match self {
            PipelineState::Detecting => "detection",
            PipelineState::Translating => "translation",
            PipelineState::Rendering => "rendering",
            PipelineState::Compositing => "compositing",
            PipelineState::Idle => "idle",
            PipelineState::Done => "done",
            PipelineState::Failed => "failed",
            PipelineState::Cancelled => "cancelled",
        }
    }
}

/// Main pipeline coordinator
pub struct PipelineOrchestrator {
    detector: Arc<dyn TextRegionDetector>,
    translator: Arc<BatchTranslator>,
    renderer: Arc<TextImageRenderer>,
    compositor: ImageCompositor,
    rendering: RenderingConfig,
    output: OutputConfig,
    metrics: Option<Metrics>,
    /// State of the most recent run
    state: Mutex<PipelineState>,
}

impl PipelineOrchestrator {
    pub fn new(
        detector: Arc<dyn TextRegionDetector>,
        translator: Arc<BatchTranslator>,
        renderer: Arc<TextImageRenderer>,
        rendering: RenderingConfig,
        output: OutputConfig,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            detector,
            translator,
            renderer,
            compositor: ImageCompositor::new(),
            rendering,
            output,
            metrics,
            state: Mutex::new(PipelineState::Idle),
        }
    }

    /// Wire the Vision detector, DeepL translator and font renderer from config
    #[instrument(skip_all)]
    pub fn from_config(config: &Config, metrics: Option<Metrics>) -> PipelineResult<Self> {
        info!("Initializing services...");

        let detector = VisionDetector::new(&config.detection, metrics.clone())?;
        let translator = BatchTranslator::deepl(config.translation.clone(), metrics.clone())?;
        let renderer = TextImageRenderer::new(&config.rendering)
            .map_err(|e| ConfigError::InvalidRenderingConfig(e.to_string()))?;

        info!(
            "✓ Ready (batch size: {}, output: {:?})",
            translator.batch_size(),
            config.output.format
        );

        Ok(Self::new(
            Arc::new(detector),
            Arc::new(translator),
            Arc::new(renderer),
            config.rendering.clone(),
            config.output.clone(),
            metrics,
        ))
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn output_config(&self) -> &OutputConfig {
        &self.output
    }

    /// Patch canvas for a block: rectangle scaled per axis, truncated
    pub fn canvas_size(&self, rect: &BoundingRect) -> (u32, u32) {
        (
            (rect.width() as f64 * self.rendering.canvas_scale_x as f64) as u32,
            (rect.height() as f64 * self.rendering.canvas_scale_y as f64) as u32,
        )
    }

    /// Canvas and font size for one block. The font follows the detected
    /// box height, not the enlarged canvas.
    pub fn render_job(&self, block: &TextBlock) -> RenderJob {
        let rect = block.rect();
        let (width, height) = self.canvas_size(&rect);
        RenderJob {
            block_id: block.id,
            text: block.text.clone(),
            width,
            height,
            font_size: self.renderer.font_size_for(rect.height()),
        }
    }

    /// Enter `next` unless the caller has asked to stop
    fn advance(&self, next: PipelineState, cancel: &CancelSignal) -> PipelineResult<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled {
                stage: next.stage_name(),
            });
        }
        debug!("Entering {}", next.stage_name());
        *self.state.lock() = next;
        Ok(())
    }

    /// Run the full pipeline on one encoded page image
    #[instrument(skip(self, image_bytes, cancel), fields(bytes = image_bytes.len()))]
    pub async fn run(
        &self,
        image_bytes: &[u8],
        source_lang: &str,
        target_lang: &str,
        cancel: &CancelSignal,
    ) -> PipelineResult<PipelineOutput> {
        let result = self
            .run_stages(image_bytes, source_lang, target_lang, cancel)
            .await;

        let final_state = match &result {
            Ok(_) => PipelineState::Done,
            Err(e) if e.is_cancelled() => PipelineState::Cancelled,
            Err(_) => PipelineState::Failed,
        };
        *self.state.lock() = final_state;

        match &result {
            Ok(output) => {
                let report = &output.report;
                info!(
                    "✓ Run complete: {} blocks, {} degraded, {} skipped ({:.0}ms)",
                    report.blocks.len(),
                    report.degraded_ids().len(),
                    report.skipped.len(),
                    report.timings.total_ms
                );
                if let Some(ref m) = self.metrics {
                    m.record_run(
                        true,
                        report.blocks.len(),
                        report.degraded_ids().len(),
                        report.skipped.len(),
                    );
                }
            }
            Err(e) => {
                warn!("Run ended in state {:?}: {}", final_state, e);
                if let Some(ref m) = self.metrics {
                    m.record_run(false, 0, 0, 0);
                }
            }
        }

        result
    }

    async fn run_stages(
        &self,
        image_bytes: &[u8],
        source_lang: &str,
        target_lang: &str,
        cancel: &CancelSignal,
    ) -> PipelineResult<PipelineOutput> {
        let run_start = Instant::now();
        let mut timings = StageTimings::default();

        // Detection
        self.advance(PipelineState::Detecting, cancel)?;
        let stage_start = Instant::now();
        let base = decode_rgba_async(image_bytes.to_vec())
            .await
            .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
            .map_err(DetectionError::UndecodableImage)?;
        let blocks = self.detector.detect(image_bytes).await?;
        timings.detect_ms = self.finish_stage(Stage::Detect, stage_start);
        info!(
            "Detection: {} blocks on {}x{} page",
            blocks.len(),
            base.width(),
            base.height()
        );

        // Translation
        self.advance(PipelineState::Translating, cancel)?;
        let stage_start = Instant::now();
        let texts: Vec<String> = blocks.iter().map(|b| b.text.clone()).collect();
        let outcomes = self
            .translator
            .translate_batch_detailed(&texts, source_lang, target_lang)
            .await?;
        if outcomes.len() != blocks.len() {
            return Err(PipelineError::TranslationCountMismatch {
                got: outcomes.len(),
                want: blocks.len(),
            });
        }

        let mut block_reports = Vec::with_capacity(blocks.len());
        let translated: Vec<TextBlock> = blocks
            .into_iter()
            .zip(outcomes)
            .map(|(block, outcome)| {
                block_reports.push(BlockReport {
                    id: block.id,
                    original_text: block.text.clone(),
                    final_text: outcome.text.clone(),
                    degraded: outcome.degraded(),
                });
                TextBlock {
                    text: outcome.text,
                    ..block
                }
            })
            .collect();
        timings.translate_ms = self.finish_stage(Stage::Translate, stage_start);

        // Rendering
        self.advance(PipelineState::Rendering, cancel)?;
        let stage_start = Instant::now();
        let mut rendered = self.render_all(&translated).await?;

        let mut skipped = Vec::new();
        let mut placements = Vec::with_capacity(translated.len());
        for block in &translated {
            match rendered.remove(&block.id) {
                Some(Ok(img)) => {
                    placements.push(Placement::new(block, RenderedPatch::new(block.id, img)))
                }
                Some(Err(e)) => {
                    warn!("Skipping block {}: render failed: {}", block.id, e);
                    skipped.push(SkippedBlock {
                        id: block.id,
                        stage: SkipStage::Render,
                        reason: e.to_string(),
                    });
                }
                None => placements.push(Placement::missing(block)),
            }
        }
        timings.render_ms = self.finish_stage(Stage::Render, stage_start);

        // Compositing
        self.advance(PipelineState::Compositing, cancel)?;
        let stage_start = Instant::now();
        let compositor = self.compositor;
        let outcome = tokio::task::spawn_blocking(move || compositor.composite(base, placements))
            .await
            .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?;
        skipped.extend(outcome.skipped);

        let (width, height) = outcome.image.dimensions();
        let image_bytes = encode_image_async(outcome.image, self.output.format)
            .await
            .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))?
            .map_err(PipelineError::EncodeFailed)?;
        timings.composite_ms = self.finish_stage(Stage::Composite, stage_start);
        timings.total_ms = StageTimings::ms(run_start.elapsed());

        Ok(PipelineOutput {
            image_bytes,
            width,
            height,
            format: self.output.format,
            blocks: translated,
            report: RunReport {
                blocks: block_reports,
                skipped,
                timings,
            },
        })
    }

    /// Render every block in parallel, keyed by block id
    async fn render_all(
        &self,
        blocks: &[TextBlock],
    ) -> PipelineResult<HashMap<u32, RenderingResult<RgbaImage>>> {
        let jobs: Vec<RenderJob> = blocks.iter().map(|b| self.render_job(b)).collect();
        let renderer = self.renderer.clone();

        tokio::task::spawn_blocking(move || {
            jobs.into_par_iter()
                .map(|job| {
                    let rendered = renderer.render_with_font_size(
                        &job.text,
                        job.width,
                        job.height,
                        job.font_size,
                    );
                    (job.block_id, rendered)
                })
                .collect::<HashMap<_, _>>()
        })
        .await
        .map_err(|e| PipelineError::TaskJoinFailed(e.to_string()))
    }

    fn finish_stage(&self, stage: Stage, start: Instant) -> f64 {
        let elapsed = start.elapsed();
        if let Some(ref m) = self.metrics {
            m.record_stage_duration(stage, elapsed);
        }
        StageTimings::ms(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::TranslationConfig;
    use crate::core::errors::{DetectionResult, TranslationError, TranslationResult};
    use crate::services::translation::TranslationBackend;
    use crate::utils::image_ops::{decode_rgba, encode_image, OutputFormat};
    use async_trait::async_trait;
    use image::Rgba;
    use std::sync::atomic::AtomicUsize;

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    struct FakeDetector {
        blocks: Vec<TextBlock>,
        fail: bool,
        cancel_during_detect: Option<CancelSignal>,
        calls: AtomicUsize,
    }

    impl FakeDetector {
        fn returning(blocks: Vec<TextBlock>) -> Self {
            Self {
                blocks,
                fail: false,
                cancel_during_detect: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TextRegionDetector for FakeDetector {
        async fn detect(&self, _image_bytes: &[u8]) -> DetectionResult<Vec<TextBlock>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref cancel) = self.cancel_during_detect {
                cancel.cancel();
            }
            if self.fail {
                return Err(DetectionError::ServiceStatus {
                    status: 500,
                    body: "unavailable".into(),
                });
            }
            Ok(self.blocks.clone())
        }
    }

    /// Upper-cases text; fails any call containing "bad"
    struct FakeBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TranslationBackend for FakeBackend {
        async fn translate(
            &self,
            texts: &[String],
            _source_lang: &str,
            _target_lang: &str,
        ) -> TranslationResult<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|t| t.contains("bad")) {
                return Err(TranslationError::ServiceStatus {
                    status: 500,
                    body: "boom".into(),
                });
            }
            Ok(texts.iter().map(|t| t.to_uppercase()).collect())
        }
    }

    fn block(id: u32, text: &str, min: (i32, i32), max: (i32, i32)) -> TextBlock {
        TextBlock::new(
            id,
            text,
            [[min.0, min.1], [max.0, min.1], [max.0, max.1], [min.0, max.1]],
        )
    }

    fn page(width: u32, height: u32) -> Vec<u8> {
        encode_image(&RgbaImage::from_pixel(width, height, BLACK), OutputFormat::Png).unwrap()
    }

    struct Harness {
        orchestrator: PipelineOrchestrator,
        detector: Arc<FakeDetector>,
        backend: Arc<FakeBackend>,
        metrics: Metrics,
    }

    fn harness_with(detector: FakeDetector, auth_key: Option<&str>) -> Harness {
        let detector = Arc::new(detector);
        let backend = Arc::new(FakeBackend {
            calls: AtomicUsize::new(0),
        });
        let metrics = Metrics::new();

        let translator = BatchTranslator::new(
            TranslationConfig {
                auth_key: auth_key.map(str::to_string),
                ..Default::default()
            },
            backend.clone(),
            Some(metrics.clone()),
        )
        .unwrap();
        let rendering = RenderingConfig::default();
        let renderer = TextImageRenderer::new(&rendering).unwrap();
        let output = OutputConfig {
            format: OutputFormat::Png,
            ..Default::default()
        };

        Harness {
            orchestrator: PipelineOrchestrator::new(
                detector.clone(),
                Arc::new(translator),
                Arc::new(renderer),
                rendering,
                output,
                Some(metrics.clone()),
            ),
            detector,
            backend,
            metrics,
        }
    }

    fn harness(detector: FakeDetector) -> Harness {
        harness_with(detector, Some("key"))
    }

    #[tokio::test]
    async fn test_full_run_produces_page_and_report() {
        let h = harness(FakeDetector::returning(vec![
            block(1, "hello ", (10, 10), (110, 60)),
            block(2, "world ", (20, 70), (80, 90)),
        ]));

        let output = h
            .orchestrator
            .run(&page(200, 100), "ja", "en", &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!((output.width, output.height), (200, 100));
        let decoded = decode_rgba(&output.image_bytes).unwrap();
        assert_eq!(decoded.dimensions(), (200, 100));
        // Top row of the first patch (160x60 at (-20, 5)) is background
        assert_eq!(*decoded.get_pixel(0, 5), WHITE);
        assert_eq!(*decoded.get_pixel(0, 4), BLACK);

        let report = &output.report;
        assert_eq!(report.blocks.len(), 2);
        assert_eq!(report.blocks[0].original_text, "hello ");
        assert_eq!(report.blocks[0].final_text, "HELLO ");
        assert!(report.degraded_ids().is_empty());
        assert!(report.skipped.is_empty());
        assert_eq!(output.blocks[1].text, "WORLD ");
        assert_eq!(output.blocks[1].bounds[0], [20, 70]);
        assert_eq!(h.orchestrator.state(), PipelineState::Done);
        assert_eq!(h.metrics.snapshot().runs_completed, 1);
    }

    #[tokio::test]
    async fn test_detection_failure_is_fatal() {
        let mut detector = FakeDetector::returning(Vec::new());
        detector.fail = true;
        let h = harness(detector);

        let result = h
            .orchestrator
            .run(&page(20, 20), "ja", "en", &CancelSignal::new())
            .await;

        assert!(matches!(result, Err(PipelineError::Detection(_))));
        assert_eq!(h.orchestrator.state(), PipelineState::Failed);
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.snapshot().runs_failed, 1);
    }

    #[tokio::test]
    async fn test_undecodable_page_fails_before_detection() {
        let h = harness(FakeDetector::returning(Vec::new()));

        let result = h
            .orchestrator
            .run(b"not an image", "ja", "en", &CancelSignal::new())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Detection(DetectionError::UndecodableImage(_)))
        ));
        assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_translation_failure_degrades_block() {
        let h = harness(FakeDetector::returning(vec![
            block(1, "fine", (0, 0), (40, 20)),
            block(2, "bad text", (0, 40), (40, 60)),
        ]));

        let output = h
            .orchestrator
            .run(&page(100, 100), "ja", "en", &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(output.report.degraded_ids(), vec![2]);
        assert_eq!(output.report.blocks[1].final_text, "bad text");
        assert_eq!(output.report.blocks[0].final_text, "FINE");
    }

    #[tokio::test]
    async fn test_missing_translation_credential_aborts() {
        let h = harness_with(
            FakeDetector::returning(vec![block(1, "a", (0, 0), (10, 10))]),
            None,
        );

        let result = h
            .orchestrator
            .run(&page(20, 20), "ja", "en", &CancelSignal::new())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::MissingCredential(_)))
        ));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let h = harness(FakeDetector::returning(Vec::new()));
        let cancel = CancelSignal::new();
        cancel.cancel();

        let result = h.orchestrator.run(&page(20, 20), "ja", "en", &cancel).await;

        assert!(matches!(
            result,
            Err(PipelineError::Cancelled { stage: "detection" })
        ));
        assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.orchestrator.state(), PipelineState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_between_stages() {
        let cancel = CancelSignal::new();
        let mut detector = FakeDetector::returning(vec![block(1, "a", (0, 0), (10, 10))]);
        detector.cancel_during_detect = Some(cancel.clone());
        let h = harness(detector);

        let result = h.orchestrator.run(&page(20, 20), "ja", "en", &cancel).await;

        assert!(matches!(
            result,
            Err(PipelineError::Cancelled { stage: "translation" })
        ));
        assert_eq!(h.backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blank_page_round_trips() {
        let h = harness(FakeDetector::returning(Vec::new()));

        let output = h
            .orchestrator
            .run(&page(30, 40), "ja", "en", &CancelSignal::new())
            .await
            .unwrap();

        let decoded = decode_rgba(&output.image_bytes).unwrap();
        assert!(decoded.pixels().all(|p| *p == BLACK));
        assert!(output.report.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_empty_text_block_still_pasted() {
        // Rect 50x20 -> 80x24 canvas centered at (35, 20): covers x -5..75, y 8..32
        let h = harness(FakeDetector::returning(vec![block(1, "", (10, 10), (60, 30))]));

        let output = h
            .orchestrator
            .run(&page(100, 50), "ja", "en", &CancelSignal::new())
            .await
            .unwrap();

        let decoded = decode_rgba(&output.image_bytes).unwrap();
        assert_eq!(*decoded.get_pixel(0, 8), WHITE);
        assert_eq!(*decoded.get_pixel(74, 31), WHITE);
        assert_eq!(*decoded.get_pixel(75, 31), BLACK);
        assert_eq!(*decoded.get_pixel(10, 7), BLACK);
        assert!(output.report.skipped.is_empty());
    }

    #[tokio::test]
    async fn test_degenerate_block_skipped_at_render() {
        let h = harness(FakeDetector::returning(vec![
            block(1, "flat", (10, 10), (60, 10)),
            block(2, "ok", (0, 20), (20, 40)),
        ]));

        let output = h
            .orchestrator
            .run(&page(100, 50), "ja", "en", &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(output.report.skipped_ids(), vec![1]);
        assert_eq!(output.report.skipped[0].stage, SkipStage::Render);
        assert_eq!(output.report.blocks.len(), 2);
    }

    #[test]
    fn test_canvas_size_scales_rect() {
        let h = harness(FakeDetector::returning(Vec::new()));
        let rect = BoundingRect::from_vertices(&[[10, 10], [110, 10], [110, 60], [10, 60]]);
        assert_eq!(h.orchestrator.canvas_size(&rect), (160, 60));
    }

    #[test]
    fn test_font_follows_box_height_not_canvas() {
        let h = harness(FakeDetector::returning(Vec::new()));
        let job = h
            .orchestrator
            .render_job(&block(4, "tall", (0, 0), (200, 100)));

        assert_eq!((job.width, job.height), (320, 120));
        // 100 / 5, where the 120px canvas would give 24
        assert_eq!(job.font_size, 20.0);
        assert_eq!(job.block_id, 4);

        let small = h.orchestrator.render_job(&block(5, "", (0, 0), (40, 30)));
        assert_eq!((small.width, small.height), (64, 36));
        assert_eq!(small.font_size, 12.0);
    }
}
