pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    CompositeError, ConfigError, DetectionError, PipelineError, RenderingError, TranslationError,
};
pub use types::{
    BlockReport, BoundingRect, PipelineOutput, RenderedPatch, RunReport, SkipStage, TextBlock,
    TranslationOutcome, TranslationPath,
};
