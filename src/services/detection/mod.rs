// Text region detection backed by a document-OCR service
//
// The pipeline only depends on the `TextRegionDetector` trait; `VisionDetector`
// is the REST implementation for Google Cloud Vision document text detection.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::core::config::DetectionConfig;
use crate::core::errors::{ConfigError, ConfigResult, DetectionError, DetectionResult};
use crate::core::types::TextBlock;
use crate::utils::image_ops::probe_dimensions;
use crate::utils::metrics::{Metrics, Service};

/// Detects text blocks and their quadrilateral bounds in an image.
///
/// Blocks come back in the service's reading order with ids starting at 1.
/// An empty vector is a valid result (blank page).
#[async_trait]
pub trait TextRegionDetector: Send + Sync {
    async fn detect(&self, image_bytes: &[u8]) -> DetectionResult<Vec<TextBlock>>;
}

/// Google Cloud Vision `DOCUMENT_TEXT_DETECTION` client
pub struct VisionDetector {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
    metrics: Option<Metrics>,
}

// Response schema (only the fields the pipeline reads)

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnnotateBatchResponse {
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AnnotateImageResponse {
    full_text_annotation: Option<TextAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiStatus {
    code: i64,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TextAnnotation {
    pages: Vec<Page>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Page {
    blocks: Vec<Block>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct Block {
    bounding_box: Option<BoundingPoly>,
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BoundingPoly {
    vertices: Vec<Vertex>,
}

/// The service omits zero coordinates
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Vertex {
    x: i32,
    y: i32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Paragraph {
    words: Vec<Word>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Word {
    symbols: Vec<Symbol>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Symbol {
    text: String,
}

impl VisionDetector {
    pub fn new(config: &DetectionConfig, metrics: Option<Metrics>) -> ConfigResult<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingCredential("VISION_API_KEY"))?
            .to_string();

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(ConfigError::HttpClient)?;

        Ok(Self {
            http_client,
            endpoint: config.endpoint.clone(),
            api_key,
            timeout: config.timeout,
            metrics,
        })
    }

    async fn annotate(&self, image_bytes: &[u8]) -> DetectionResult<AnnotateBatchResponse> {
        let request_body = serde_json::json!({
            "requests": [{
                "image": { "content": general_purpose::STANDARD.encode(image_bytes) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }]
            }]
        });

        let response = self
            .http_client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectionError::ServiceStatus {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| DetectionError::InvalidResponse(format!("malformed JSON: {}", e)))
    }
}

#[async_trait]
impl TextRegionDetector for VisionDetector {
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    async fn detect(&self, image_bytes: &[u8]) -> DetectionResult<Vec<TextBlock>> {
        let (width, height) =
            probe_dimensions(image_bytes).map_err(DetectionError::UndecodableImage)?;
        debug!("Detecting text in {}x{} image", width, height);

        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.annotate(image_bytes)).await {
            Ok(result) => result,
            Err(_) => Err(DetectionError::Timeout(self.timeout)),
        };

        if let Some(ref m) = self.metrics {
            m.record_api_call(Service::Detection, result.is_ok(), start.elapsed());
        }

        let blocks = blocks_from_response(result?)?;
        info!(
            "Detected {} text blocks in {:.0}ms",
            blocks.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(blocks)
    }
}

/// Flatten the annotation into blocks in reading order
fn blocks_from_response(response: AnnotateBatchResponse) -> DetectionResult<Vec<TextBlock>> {
    let Some(first) = response.responses.into_iter().next() else {
        return Ok(Vec::new());
    };

    if let Some(error) = first.error {
        if error.code != 0 {
            return Err(DetectionError::ServiceError {
                code: error.code,
                message: error.message,
            });
        }
    }

    let Some(annotation) = first.full_text_annotation else {
        return Ok(Vec::new());
    };

    let mut blocks = Vec::new();
    let mut next_id = 1u32;

    for block in annotation.pages.into_iter().flat_map(|p| p.blocks) {
        let vertices = block.bounding_box.map(|b| b.vertices).unwrap_or_default();
        let bounds: [[i32; 2]; 4] = match vertices.as_slice() {
            [a, b, c, d] => [[a.x, a.y], [b.x, b.y], [c.x, c.y], [d.x, d.y]],
            other => {
                warn!(
                    "Skipping text block with {} bounding vertices (expected 4)",
                    other.len()
                );
                continue;
            }
        };

        blocks.push(TextBlock::new(next_id, block_text(&block.paragraphs), bounds));
        next_id += 1;
    }

    Ok(blocks)
}

/// Every word's symbols, each word followed by one space (including the last)
fn block_text(paragraphs: &[Paragraph]) -> String {
    let mut text = String::new();
    for word in paragraphs.iter().flat_map(|p| &p.words) {
        for symbol in &word.symbols {
            text.push_str(&symbol.text);
        }
        text.push(' ');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::image_ops::{encode_image, OutputFormat};
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use image::{Rgba, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_response() -> serde_json::Value {
        serde_json::json!({
            "responses": [{
                "fullTextAnnotation": {
                    "pages": [{
                        "blocks": [
                            {
                                "boundingBox": { "vertices": [
                                    {"x": 10, "y": 10}, {"x": 110, "y": 10},
                                    {"x": 110, "y": 60}, {"x": 10, "y": 60}
                                ]},
                                "paragraphs": [{ "words": [
                                    { "symbols": [{"text": "こ"}, {"text": "ん"}] },
                                    { "symbols": [{"text": "に"}] }
                                ]}]
                            },
                            {
                                "boundingBox": { "vertices": [
                                    {"y": 5}, {"x": 40, "y": 5}, {"x": 40, "y": 20}, {"y": 20}
                                ]},
                                "paragraphs": [
                                    { "words": [{ "symbols": [{"text": "A"}] }] },
                                    { "words": [{ "symbols": [{"text": "B"}] }] }
                                ]
                            },
                            {
                                "boundingBox": { "vertices": [{"x": 1, "y": 1}] },
                                "paragraphs": []
                            }
                        ]
                    }]
                }
            }]
        })
    }

    fn png_bytes() -> Vec<u8> {
        encode_image(&RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 255])), OutputFormat::Png)
            .unwrap()
    }

    async fn spawn_fake_vision(status: StatusCode, body: serde_json::Value) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/v1/images:annotate",
                post(
                    move |State(calls): State<Arc<AtomicUsize>>| {
                        let body = body.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            (status, Json(body))
                        }
                    },
                ),
            )
            .with_state(calls.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1/images:annotate", addr), calls)
    }

    fn detector(endpoint: String) -> VisionDetector {
        let config = DetectionConfig {
            api_key: Some("test-key".to_string()),
            endpoint,
            timeout: Duration::from_secs(5),
        };
        VisionDetector::new(&config, None).unwrap()
    }

    #[test]
    fn test_blocks_from_response() {
        let response: AnnotateBatchResponse = serde_json::from_value(sample_response()).unwrap();
        let blocks = blocks_from_response(response).unwrap();

        // The three-vertex block is dropped
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id, 1);
        assert_eq!(blocks[0].text, "こん に ");
        assert_eq!(blocks[0].bounds, [[10, 10], [110, 10], [110, 60], [10, 60]]);
        assert_eq!(blocks[1].id, 2);
        assert_eq!(blocks[1].text, "A B ");
        assert_eq!(blocks[1].bounds[0], [0, 5]);
    }

    #[test]
    fn test_empty_annotation_is_not_an_error() {
        let response: AnnotateBatchResponse =
            serde_json::from_value(serde_json::json!({ "responses": [{}] })).unwrap();
        assert!(blocks_from_response(response).unwrap().is_empty());
    }

    #[test]
    fn test_api_error_object_fails() {
        let response: AnnotateBatchResponse = serde_json::from_value(serde_json::json!({
            "responses": [{ "error": { "code": 3, "message": "Bad image data." } }]
        }))
        .unwrap();
        assert!(matches!(
            blocks_from_response(response),
            Err(DetectionError::ServiceError { code: 3, .. })
        ));
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let config = DetectionConfig::default();
        assert!(matches!(
            VisionDetector::new(&config, None),
            Err(ConfigError::MissingCredential("VISION_API_KEY"))
        ));
    }

    #[tokio::test]
    async fn test_detect_is_stable_across_calls() {
        let (endpoint, calls) = spawn_fake_vision(StatusCode::OK, sample_response()).await;
        let detector = detector(endpoint);

        let first = detector.detect(&png_bytes()).await.unwrap();
        let second = detector.detect(&png_bytes()).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_image_never_reaches_service() {
        let (endpoint, calls) = spawn_fake_vision(StatusCode::OK, sample_response()).await;
        let detector = detector(endpoint);

        let result = detector.detect(b"\x89PNG but not really").await;
        assert!(matches!(result, Err(DetectionError::UndecodableImage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_service_status_error() {
        let (endpoint, _) = spawn_fake_vision(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({"error": "boom"}),
        )
        .await;
        let detector = detector(endpoint);

        let result = detector.detect(&png_bytes()).await;
        assert!(matches!(
            result,
            Err(DetectionError::ServiceStatus { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        // Port 9 (discard) on localhost is not served in test environments
        let detector = detector("http://127.0.0.1:9/v1/images:annotate".to_string());
        let result = detector.detect(&png_bytes()).await;
        assert!(matches!(
            result,
            Err(DetectionError::RequestFailed(_)) | Err(DetectionError::Timeout(_))
        ));
    }
}
