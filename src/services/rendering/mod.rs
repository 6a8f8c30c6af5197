use cosmic_text::{
    fontdb, Attrs, Buffer, Color as CosmicColor, Family, FontSystem, Metrics, Shaping, SwashCache,
    Wrap,
};
use image::{Rgba, RgbaImage};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::core::config::RenderingConfig;
use crate::core::errors::{RenderingError, RenderingResult};
use crate::utils::image_ops::{encode_image, OutputFormat};

/// Line advance relative to font size
const LINE_HEIGHT_RATIO: f32 = 1.2;

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Pixel width of a run of text at a fixed font size
pub trait TextMeasure {
    fn measure(&mut self, text: &str) -> f32;
}

/// Greedy per-character wrapping.
///
/// A character goes on the current line unless that would make the line wider
/// than `max_width`, in which case the line is closed first. A line always
/// holds at least one character, so a glyph wider than the canvas still gets
/// its own line. `\n` always closes the current line.
pub fn wrap_lines<M: TextMeasure + ?Sized>(text: &str, max_width: f32, measure: &mut M) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch == '\n' {
            lines.push(std::mem::take(&mut current));
            continue;
        }

        let had_content = !current.is_empty();
        current.push(ch);
        if had_content && measure.measure(&current) > max_width {
            current.pop();
            lines.push(std::mem::take(&mut current));
            current.push(ch);
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

struct FontState {
    font_system: FontSystem,
    swash_cache: SwashCache,
}

impl FontState {
    fn new(font_system: FontSystem) -> Self {
        Self {
            font_system,
            swash_cache: SwashCache::new(),
        }
    }
}

/// Shapes text without wrapping and reports the widest layout run
struct CosmicMeasure<'a> {
    font_system: &'a mut FontSystem,
    metrics: Metrics,
    attrs: Attrs<'a>,
}

impl TextMeasure for CosmicMeasure<'_> {
    fn measure(&mut self, text: &str) -> f32 {
        let buffer = shape_line(self.font_system, self.metrics, &self.attrs, text);
        buffer
            .layout_runs()
            .map(|run| run.line_w)
            .fold(0.0, f32::max)
    }
}

fn shape_line(font_system: &mut FontSystem, metrics: Metrics, attrs: &Attrs, text: &str) -> Buffer {
    let mut buffer = Buffer::new(font_system, metrics);
    buffer.set_wrap(font_system, Wrap::None);
    buffer.set_size(font_system, None, None);
    buffer.set_text(font_system, text, attrs, Shaping::Advanced);
    buffer.shape_until_scroll(font_system, false);
    buffer
}

/// Renders text onto white canvases of an exact size using cosmic-text
pub struct TextImageRenderer {
    /// One font system per rendering worker, all over the same font database
    slots: Vec<Mutex<FontState>>,
    /// Family of the configured font file, if one was loaded
    family_name: Option<String>,
    min_font_size: f32,
    max_font_size: f32,
}

impl TextImageRenderer {
    pub fn new(config: &RenderingConfig) -> RenderingResult<Self> {
        let (font_system, family_name) = match &config.font_path {
            Some(path) => {
                let data = std::fs::read(path).map_err(|e| {
                    RenderingError::FontLoadError(format!("{}: {}", path.display(), e))
                })?;

                let mut db = fontdb::Database::new();
                db.load_font_data(data);
                let family = db
                    .faces()
                    .next()
                    .and_then(|face| face.families.first().map(|(name, _)| name.clone()))
                    .ok_or_else(|| {
                        RenderingError::FontLoadError(format!(
                            "{}: no usable font faces",
                            path.display()
                        ))
                    })?;

                info!("Loaded font '{}' from {}", family, path.display());
                (
                    FontSystem::new_with_locale_and_db("en-US".to_string(), db),
                    Some(family),
                )
            }
            None => {
                let font_system = FontSystem::new();
                if font_system.db().is_empty() {
                    warn!("No system fonts found; rendered patches will be blank");
                }
                (font_system, None)
            }
        };

        let pool_size = rayon::current_num_threads().max(1);
        let locale = font_system.locale().to_string();
        let db = font_system.db().clone();

        let mut slots = Vec::with_capacity(pool_size);
        slots.push(Mutex::new(FontState::new(font_system)));
        for _ in 1..pool_size {
            let font_system = FontSystem::new_with_locale_and_db(locale.clone(), db.clone());
            slots.push(Mutex::new(FontState::new(font_system)));
        }
        debug!("Font state pool of {}", pool_size);

        Ok(Self {
            slots,
            family_name,
            min_font_size: config.min_font_size,
            max_font_size: config.max_font_size,
        })
    }

    /// One fifth of `height`, clamped to the configured bounds
    pub fn font_size_for(&self, height: u32) -> f32 {
        (height as f32 / 5.0).clamp(self.min_font_size, self.max_font_size)
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// First idle font state, else the one assigned to this rayon worker
    fn font_state(&self) -> MutexGuard<'_, FontState> {
        if let Some(guard) = self.slots.iter().find_map(|slot| slot.try_lock()) {
            return guard;
        }
        let index = rayon::current_thread_index().unwrap_or(0) % self.slots.len();
        self.slots[index].lock()
    }

    fn attrs(&self) -> Attrs<'_> {
        match &self.family_name {
            Some(name) => Attrs::new().family(Family::Name(name.as_str())),
            None => Attrs::new().family(Family::SansSerif),
        }
    }

    /// Render `text` onto a `width`×`height` white canvas, sizing the font
    /// from the canvas height.
    pub fn render(&self, text: &str, width: u32, height: u32) -> RenderingResult<RgbaImage> {
        self.render_with_font_size(text, width, height, self.font_size_for(height))
    }

    /// Render `text` onto a `width`×`height` white canvas at `font_size`.
    ///
    /// Lines are stacked around the vertical center and each line is
    /// horizontally centered. Anything outside the canvas is clipped.
    pub fn render_with_font_size(
        &self,
        text: &str,
        width: u32,
        height: u32,
        font_size: f32,
    ) -> RenderingResult<RgbaImage> {
        if width == 0 || height == 0 {
            return Err(RenderingError::InvalidDimensions { width, height });
        }

        let mut img = RgbaImage::from_pixel(width, height, BACKGROUND);

        let line_height = (font_size * LINE_HEIGHT_RATIO).ceil();
        let metrics = Metrics::new(font_size, line_height);
        let attrs = self.attrs();

        let mut guard = self.font_state();
        let FontState {
            font_system,
            swash_cache,
        } = &mut *guard;

        let mut measure = CosmicMeasure {
            font_system,
            metrics,
            attrs: attrs.clone(),
        };
        let lines = wrap_lines(text, width as f32, &mut measure);

        let center_x = width as i32 / 2;
        let center_y = height as i32 / 2;
        let total_height = lines.len() as i32 * line_height as i32;
        let start_y = center_y - total_height / 2;

        debug!(
            "Rendering {} lines at {:.1}px into {}x{}",
            lines.len(),
            font_size,
            width,
            height
        );

        for (index, line) in lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            let line_width = measure.measure(line).round() as i32;
            let x = center_x - line_width / 2;
            let y = start_y + index as i32 * line_height as i32;

            let buffer = shape_line(measure.font_system, metrics, &attrs, line);
            draw_buffer(&mut img, &buffer, measure.font_system, swash_cache, x, y);
        }

        Ok(img)
    }

    /// Render and encode in one step
    pub fn render_encoded(
        &self,
        text: &str,
        width: u32,
        height: u32,
        format: OutputFormat,
    ) -> RenderingResult<Vec<u8>> {
        let img = self.render(text, width, height)?;
        Ok(encode_image(&img, format)?)
    }
}

/// Source-over blend of a shaped buffer with its top-left at (x, y)
fn draw_buffer(
    img: &mut RgbaImage,
    buffer: &Buffer,
    font_system: &mut FontSystem,
    swash_cache: &mut SwashCache,
    x: i32,
    y: i32,
) {
    let (img_w, img_h) = (img.width() as i32, img.height() as i32);

    buffer.draw(font_system, swash_cache, CosmicColor::rgb(0, 0, 0), |px, py, w, h, color| {
        let alpha = color.a() as f32 / 255.0;
        if alpha == 0.0 {
            return;
        }

        for dy in 0..h as i32 {
            for dx in 0..w as i32 {
                let ix = x + px + dx;
                let iy = y + py + dy;
                if ix < 0 || iy < 0 || ix >= img_w || iy >= img_h {
                    continue;
                }

                let existing = img.get_pixel(ix as u32, iy as u32);
                let inv_alpha = 1.0 - alpha;
                let blended = Rgba([
                    (color.r() as f32 * alpha + existing[0] as f32 * inv_alpha) as u8,
                    (color.g() as f32 * alpha + existing[1] as f32 * inv_alpha) as u8,
                    (color.b() as f32 * alpha + existing[2] as f32 * inv_alpha) as u8,
                    existing[3].max(color.a()),
                ]);
                img.put_pixel(ix as u32, iy as u32, blended);
            }
        }
    });
}

impl std::fmt::Debug for TextImageRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextImageRenderer")
            .field("pool_size", &self.slots.len())
            .field("family_name", &self.family_name)
            .field("min_font_size", &self.min_font_size)
            .field("max_font_size", &self.max_font_size)
            .finish()
    }
}
