pub mod pipeline;

pub use pipeline::{CancelSignal, PipelineOrchestrator, PipelineState, RenderJob};
