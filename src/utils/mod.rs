pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{
    decode_rgba, decode_rgba_async, encode_image, encode_image_async, probe_dimensions,
    OutputFormat,
};
pub use metrics::{Metrics, MetricsSnapshot, Service, Stage};
