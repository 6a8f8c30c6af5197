use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// External service a call was made to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Detection,
    Translation,
}

/// Pipeline stage for duration tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Detect,
    Translate,
    Render,
    Composite,
}

/// Process-wide metrics collector.
///
/// Tracks external calls, stage durations and degradation counts.
/// Thread-safe; observation only, no pipeline decision reads it.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Service call metrics
    detection_calls_success: AtomicUsize,
    detection_calls_failed: AtomicUsize,
    translation_calls_success: AtomicUsize,
    translation_calls_failed: AtomicUsize,
    api_latency_ms: RwLock<Vec<u64>>,

    // Stage metrics
    detect_duration_ms: RwLock<Vec<u64>>,
    translate_duration_ms: RwLock<Vec<u64>>,
    render_duration_ms: RwLock<Vec<u64>>,
    composite_duration_ms: RwLock<Vec<u64>>,

    // Run metrics
    runs_completed: AtomicUsize,
    runs_failed: AtomicUsize,
    blocks_processed: AtomicUsize,
    blocks_degraded: AtomicUsize,
    blocks_skipped: AtomicUsize,

    // Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                detection_calls_success: AtomicUsize::new(0),
                detection_calls_failed: AtomicUsize::new(0),
                translation_calls_success: AtomicUsize::new(0),
                translation_calls_failed: AtomicUsize::new(0),
                api_latency_ms: RwLock::new(Vec::new()),
                detect_duration_ms: RwLock::new(Vec::new()),
                translate_duration_ms: RwLock::new(Vec::new()),
                render_duration_ms: RwLock::new(Vec::new()),
                composite_duration_ms: RwLock::new(Vec::new()),
                runs_completed: AtomicUsize::new(0),
                runs_failed: AtomicUsize::new(0),
                blocks_processed: AtomicUsize::new(0),
                blocks_degraded: AtomicUsize::new(0),
                blocks_skipped: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_api_call(&self, service: Service, success: bool, duration: Duration) {
        let counter = match (service, success) {
            (Service::Detection, true) => &self.inner.detection_calls_success,
            (Service::Detection, false) => &self.inner.detection_calls_failed,
            (Service::Translation, true) => &self.inner.translation_calls_success,
            (Service::Translation, false) => &self.inner.translation_calls_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.inner.api_latency_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_stage_duration(&self, stage: Stage, duration: Duration) {
        let durations = match stage {
            Stage::Detect => &self.inner.detect_duration_ms,
            Stage::Translate => &self.inner.translate_duration_ms,
            Stage::Render => &self.inner.render_duration_ms,
            Stage::Composite => &self.inner.composite_duration_ms,
        };
        durations.write().push(duration.as_millis() as u64);
    }

    pub fn record_run(&self, success: bool, blocks: usize, degraded: usize, skipped: usize) {
        if success {
            self.inner.runs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.runs_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.blocks_processed.fetch_add(blocks, Ordering::Relaxed);
        self.inner.blocks_degraded.fetch_add(degraded, Ordering::Relaxed);
        self.inner.blocks_skipped.fetch_add(skipped, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let api_latency = self.inner.api_latency_ms.read();
        let api_latency_avg = avg(&api_latency);
        let api_latency_p50 = percentile(&api_latency, 0.5);
        let api_latency_p95 = percentile(&api_latency, 0.95);
        drop(api_latency);

        MetricsSnapshot {
            detection_calls_success: self.inner.detection_calls_success.load(Ordering::Relaxed),
            detection_calls_failed: self.inner.detection_calls_failed.load(Ordering::Relaxed),
            translation_calls_success: self.inner.translation_calls_success.load(Ordering::Relaxed),
            translation_calls_failed: self.inner.translation_calls_failed.load(Ordering::Relaxed),
            api_latency_avg_ms: api_latency_avg,
            api_latency_p50_ms: api_latency_p50,
            api_latency_p95_ms: api_latency_p95,
            detect_avg_ms: avg(&self.inner.detect_duration_ms.read()),
            translate_avg_ms: avg(&self.inner.translate_duration_ms.read()),
            render_avg_ms: avg(&self.inner.render_duration_ms.read()),
            composite_avg_ms: avg(&self.inner.composite_duration_ms.read()),
            runs_completed: self.inner.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.inner.runs_failed.load(Ordering::Relaxed),
            blocks_processed: self.inner.blocks_processed.load(Ordering::Relaxed),
            blocks_degraded: self.inner.blocks_degraded.load(Ordering::Relaxed),
            blocks_skipped: self.inner.blocks_skipped.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP api_calls_total External service calls by outcome
# TYPE api_calls_total counter
api_calls_total {{service="detection",outcome="success"}} {}
api_calls_total {{service="detection",outcome="failure"}} {}
api_calls_total {{service="translation",outcome="success"}} {}
api_calls_total {{service="translation",outcome="failure"}} {}

# HELP api_latency_avg_ms Average external call latency in milliseconds
# TYPE api_latency_avg_ms gauge
api_latency_avg_ms {{}} {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms {{stage="detect"}} {}
stage_avg_duration_ms {{stage="translate"}} {}
stage_avg_duration_ms {{stage="render"}} {}
stage_avg_duration_ms {{stage="composite"}} {}

# HELP runs_total Pipeline runs by outcome
# TYPE runs_total counter
runs_total {{outcome="completed"}} {}
runs_total {{outcome="failed"}} {}

# HELP blocks_total Text blocks by outcome
# TYPE blocks_total counter
blocks_total {{outcome="processed"}} {}
blocks_total {{outcome="degraded"}} {}
blocks_total {{outcome="skipped"}} {}

# HELP uptime_seconds Process uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            s.detection_calls_success,
            s.detection_calls_failed,
            s.translation_calls_success,
            s.translation_calls_failed,
            s.api_latency_avg_ms,
            s.detect_avg_ms,
            s.translate_avg_ms,
            s.render_avg_ms,
            s.composite_avg_ms,
            s.runs_completed,
            s.runs_failed,
            s.blocks_processed,
            s.blocks_degraded,
            s.blocks_skipped,
            s.uptime_seconds,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub detection_calls_success: usize,
    pub detection_calls_failed: usize,
    pub translation_calls_success: usize,
    pub translation_calls_failed: usize,
    pub api_latency_avg_ms: u64,
    pub api_latency_p50_ms: u64,
    pub api_latency_p95_ms: u64,
    pub detect_avg_ms: u64,
    pub translate_avg_ms: u64,
    pub render_avg_ms: u64,
    pub composite_avg_ms: u64,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub blocks_processed: usize,
    pub blocks_degraded: usize,
    pub blocks_skipped: usize,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
