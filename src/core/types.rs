// Data model shared by the pipeline stages

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::utils::image_ops::{encode_image, OutputFormat};

/// One detected unit of text with its quadrilateral pixel bounds.
///
/// This is also the interchange shape between stages:
/// `{ "id": 1, "text": "...", "bounds": [[x,y],[x,y],[x,y],[x,y]] }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBlock {
    /// Unique within one detection pass, starting at 1
    pub id: u32,
    pub text: String,
    /// Four vertices as returned by the detector (not necessarily axis-aligned)
    pub bounds: [[i32; 2]; 4],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl TextBlock {
    pub fn new(id: u32, text: impl Into<String>, bounds: [[i32; 2]; 4]) -> Self {
        Self {
            id,
            text: text.into(),
            bounds,
            source: None,
        }
    }

    /// Axis-aligned rectangle used as the effective placement region
    pub fn rect(&self) -> BoundingRect {
        BoundingRect::from_vertices(&self.bounds)
    }
}

/// Axis-aligned bounding rectangle (min/max of the four vertices)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingRect {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl BoundingRect {
    pub fn from_vertices(vertices: &[[i32; 2]; 4]) -> Self {
        let [first_x, first_y] = vertices[0];
        vertices.iter().fold(
            Self {
                min_x: first_x,
                min_y: first_y,
                max_x: first_x,
                max_y: first_y,
            },
            |r, &[x, y]| Self {
                min_x: r.min_x.min(x),
                min_y: r.min_y.min(y),
                max_x: r.max_x.max(x),
                max_y: r.max_y.max(y),
            },
        )
    }

    // Extents and midpoints are taken in i64; any i32 pair fits there.
    pub fn width(&self) -> u32 {
        (self.max_x as i64 - self.min_x as i64).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.max_y as i64 - self.min_y as i64).max(0) as u32
    }

    /// Geometric center, truncating like integer pixel math
    pub fn center(&self) -> (i32, i32) {
        (
            ((self.min_x as i64 + self.max_x as i64) / 2) as i32,
            ((self.min_y as i64 + self.max_y as i64) / 2) as i32,
        )
    }
}

/// Serialize blocks to the interchange JSON array
pub fn blocks_to_json(blocks: &[TextBlock]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(blocks)
}

/// Parse blocks from the interchange JSON array
pub fn blocks_from_json(json: &str) -> serde_json::Result<Vec<TextBlock>> {
    serde_json::from_str(json)
}

/// Rendered replacement image for one block
#[derive(Debug, Clone)]
pub struct RenderedPatch {
    pub block_id: u32,
    pub image: RgbaImage,
    pub width: u32,
    pub height: u32,
}

impl RenderedPatch {
    pub fn new(block_id: u32, image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            block_id,
            image,
            width,
            height,
        }
    }

    /// Raster bytes for callers that persist patches between stages
    pub fn encode(&self, format: OutputFormat) -> Result<Vec<u8>, image::ImageError> {
        encode_image(&self.image, format)
    }
}

/// How a block's final text was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationPath {
    /// Translated by the combined batch call
    Batch,
    /// Translated by the per-item fallback after the batch failed
    Fallback,
    /// Both attempts failed; original text kept
    Original,
}

/// Per-item result of the batch translator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationOutcome {
    pub text: String,
    pub path: TranslationPath,
}

impl TranslationOutcome {
    pub fn degraded(&self) -> bool {
        self.path == TranslationPath::Original
    }
}

/// Stage at which a block was dropped from the composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipStage {
    Render,
    Composite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedBlock {
    pub id: u32,
    pub stage: SkipStage,
    pub reason: String,
}

/// Per-block line of the run report
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReport {
    pub id: u32,
    pub original_text: String,
    pub final_text: String,
    pub degraded: bool,
}

/// Stage timings for one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageTimings {
    pub detect_ms: f64,
    pub translate_ms: f64,
    pub render_ms: f64,
    pub composite_ms: f64,
    pub total_ms: f64,
}

impl StageTimings {
    pub fn ms(duration: Duration) -> f64 {
        duration.as_secs_f64() * 1000.0
    }
}

/// Out-of-band report of what was degraded or skipped in a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub blocks: Vec<BlockReport>,
    pub skipped: Vec<SkippedBlock>,
    pub timings: StageTimings,
}

impl RunReport {
    pub fn degraded_ids(&self) -> Vec<u32> {
        self.blocks.iter().filter(|b| b.degraded).map(|b| b.id).collect()
    }

    pub fn skipped_ids(&self) -> Vec<u32> {
        self.skipped.iter().map(|s| s.id).collect()
    }
}

/// Final result of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub image_bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
    /// Blocks carrying their final text, in detection order
    pub blocks: Vec<TextBlock>,
    pub report: RunReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounding_rect_from_skewed_quad() {
        let rect = BoundingRect::from_vertices(&[[12, 8], [110, 10], [108, 62], [10, 60]]);
        assert_eq!(rect.min_x, 10);
        assert_eq!(rect.min_y, 8);
        assert_eq!(rect.max_x, 110);
        assert_eq!(rect.max_y, 62);
        assert_eq!(rect.width(), 100);
        assert_eq!(rect.height(), 54);
    }

    #[test]
    fn test_center_of_axis_aligned_box() {
        let block = TextBlock::new(1, "x", [[10, 10], [110, 10], [110, 60], [10, 60]]);
        assert_eq!(block.rect().center(), (60, 35));
    }

    #[test]
    fn test_extreme_coordinates_do_not_overflow() {
        let json = format!(
            r#"[{{"id":0,"text":"x","bounds":[[{min},{min}],[{max},{min}],[{max},{max}],[{min},{max}]]}}]"#,
            min = i32::MIN,
            max = i32::MAX
        );
        let rect = blocks_from_json(&json).unwrap()[0].rect();
        assert_eq!(rect.width(), u32::MAX);
        assert_eq!(rect.height(), u32::MAX);
        assert_eq!(rect.center(), (0, 0));

        let edge = i32::MAX;
        let far = TextBlock::new(1, "x", [[edge - 10, 0], [edge, 0], [edge, 4], [edge - 10, 4]]);
        assert_eq!(far.rect().center(), (edge - 5, 2));
        assert_eq!(far.rect().width(), 10);
    }

    #[test]
    fn test_interchange_json_shape() {
        let mut block = TextBlock::new(3, "こんにちは ", [[1, 2], [3, 2], [3, 4], [1, 4]]);
        let json = blocks_to_json(std::slice::from_ref(&block)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["id"], 3);
        assert_eq!(value[0]["bounds"][2], serde_json::json!([3, 4]));
        assert!(value[0].get("source").is_none());

        block.source = Some("page-7.jpg".to_string());
        let parsed = blocks_from_json(&blocks_to_json(&[block.clone()]).unwrap()).unwrap();
        assert_eq!(parsed, vec![block]);
    }

    #[test]
    fn test_interchange_rejects_three_vertices() {
        let json = r#"[{"id":1,"text":"a","bounds":[[0,0],[1,0],[1,1]]}]"#;
        assert!(blocks_from_json(json).is_err());
    }

    #[test]
    fn test_report_serializes_camel_case_block_fields() {
        let report = RunReport {
            blocks: vec![BlockReport {
                id: 2,
                original_text: "a".into(),
                final_text: "b".into(),
                degraded: true,
            }],
            ..Default::default()
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["blocks"][0]["originalText"], "a");
        assert_eq!(value["blocks"][0]["finalText"], "b");
        assert_eq!(report.degraded_ids(), vec![2]);
    }
}
