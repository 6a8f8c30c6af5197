// Library exports for the page translation pipeline
//
// Detects text on a scanned page, translates it, renders the translations
// into patches and pastes them back over the original text regions.

pub mod core;
pub mod orchestration;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use crate::core::{
    config::Config,
    errors::{
        CompositeError, ConfigError, DetectionError, PipelineError, RenderingError,
        TranslationError,
    },
    types::{
        blocks_from_json, blocks_to_json, BlockReport, BoundingRect, PipelineOutput,
        RenderedPatch, RunReport, SkippedBlock, TextBlock, TranslationOutcome, TranslationPath,
    },
};

pub use orchestration::{CancelSignal, PipelineOrchestrator, PipelineState, RenderJob};

pub use services::{
    BatchTranslator, DeepLClient, ImageCompositor, TextImageRenderer, TextRegionDetector,
    TranslationBackend, VisionDetector,
};

pub use utils::{Metrics, OutputFormat};
