// Pastes rendered patches back onto the page
//
// Each patch is centered on the axis-aligned rectangle of its block and keeps
// its own size; it is never scaled to fit the rectangle.

use image::{imageops, RgbaImage};
use tracing::{debug, info, warn};

use crate::core::errors::{CompositeError, CompositeResult};
use crate::core::types::{BoundingRect, RenderedPatch, SkipStage, SkippedBlock, TextBlock};
use crate::utils::image_ops::decode_rgba;

/// Patch content as handed to the compositor
#[derive(Debug, Clone)]
pub enum PatchImage {
    Decoded(RgbaImage),
    /// Raster bytes, decoded on use
    Encoded(Vec<u8>),
    Missing,
}

/// One patch and where it belongs
#[derive(Debug, Clone)]
pub struct Placement {
    pub block_id: u32,
    pub rect: BoundingRect,
    pub patch: PatchImage,
}

impl Placement {
    pub fn new(block: &TextBlock, patch: RenderedPatch) -> Self {
        Self {
            block_id: block.id,
            rect: block.rect(),
            patch: PatchImage::Decoded(patch.image),
        }
    }

    pub fn missing(block: &TextBlock) -> Self {
        Self {
            block_id: block.id,
            rect: block.rect(),
            patch: PatchImage::Missing,
        }
    }

    fn resolve(self) -> CompositeResult<RgbaImage> {
        match self.patch {
            PatchImage::Decoded(img) => Ok(img),
            PatchImage::Encoded(bytes) => {
                decode_rgba(&bytes).map_err(|source| CompositeError::UndecodablePatch {
                    block_id: self.block_id,
                    source,
                })
            }
            PatchImage::Missing => Err(CompositeError::MissingPatch {
                block_id: self.block_id,
            }),
        }
    }
}

/// Composited page plus the patches that could not be placed
#[derive(Debug)]
pub struct CompositeOutcome {
    pub image: RgbaImage,
    pub skipped: Vec<SkippedBlock>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCompositor;

impl ImageCompositor {
    pub fn new() -> Self {
        Self
    }

    /// Top-left corner that centers a `width`×`height` patch on `rect`
    pub fn top_left(rect: &BoundingRect, width: u32, height: u32) -> (i64, i64) {
        let (cx, cy) = rect.center();
        (
            cx as i64 - (width / 2) as i64,
            cy as i64 - (height / 2) as i64,
        )
    }

    /// Paste every placement onto `base` in order.
    ///
    /// Output keeps the base dimensions; patches hanging off an edge are
    /// clipped. Later placements draw over earlier ones.
    pub fn composite(&self, mut base: RgbaImage, placements: Vec<Placement>) -> CompositeOutcome {
        let total = placements.len();
        let mut skipped = Vec::new();

        for placement in placements {
            let block_id = placement.block_id;
            let rect = placement.rect;

            let patch = match placement.resolve() {
                Ok(patch) => patch,
                Err(e) => {
                    warn!("Skipping patch: {}", e);
                    skipped.push(SkippedBlock {
                        id: block_id,
                        stage: SkipStage::Composite,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let (x, y) = Self::top_left(&rect, patch.width(), patch.height());
            debug!(
                "Block {}: {}x{} patch at ({}, {})",
                block_id,
                patch.width(),
                patch.height(),
                x,
                y
            );
            imageops::overlay(&mut base, &patch, x, y);
        }

        info!(
            "Composited {} of {} patches",
            total - skipped.len(),
            total
        );
        CompositeOutcome {
            image: base,
            skipped,
        }
    }
}
