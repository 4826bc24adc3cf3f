//! Drawing Canvas
//!
//! The drawing context handed to draw callbacks and context handlers. It wraps
//! a `tiny_skia::PixmapMut` over the window buffer's mapped memory and, for
//! drawing contexts, confines drawing to the context's rectangle.
//!
//! The buffer is ARGB8888 in little-endian order (bytes B, G, R, A), while
//! tiny-skia writes R, G, B, A. Colors are swizzled on the way in so callers
//! always use ordinary RGBA `Color`s.

use tiny_skia::{
    Color, FillRule, Mask, Paint, Path, PathBuilder, PixmapMut, Rect, Stroke, Transform,
};

use crate::shared::Geometry;
use crate::window::buffer::BYTES_PER_PIXEL;

pub struct Canvas<'a> {
    pixmap: PixmapMut<'a>,
    stride: u32,
    region: Geometry,
    clip: Option<Mask>,
}

impl<'a> Canvas<'a> {
    /// Canvas over a whole `width` x `height` buffer
    ///
    /// Returns `None` if `pixels` is too small or a dimension is zero.
    pub fn new(pixels: &'a mut [u8], width: u32, height: u32) -> Option<Self> {
        Self::with_region(pixels, width, height, Geometry::full(width, height))
    }

    /// Canvas confined to `region` of a `width` x `height` buffer
    ///
    /// The region is clipped to the buffer; coordinates used for drawing are
    /// relative to its top-left corner.
    pub fn with_region(
        pixels: &'a mut [u8],
        width: u32,
        height: u32,
        region: Geometry,
    ) -> Option<Self> {
        let pixmap = PixmapMut::from_bytes(pixels, width, height)?;
        let region = region.clip_to(width, height);

        Some(Self {
            pixmap,
            stride: width * BYTES_PER_PIXEL,
            region,
            clip: None,
        })
    }

    /// Width of the drawable area
    pub fn width(&self) -> u32 {
        self.region.width
    }

    /// Height of the drawable area
    pub fn height(&self) -> u32 {
        self.region.height
    }

    /// Bytes per row of the underlying buffer
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// The drawable area in buffer coordinates
    pub fn region(&self) -> Geometry {
        self.region
    }

    /// Raw bytes of one row of the drawable area (B, G, R, A per pixel)
    pub fn row_mut(&mut self, y: u32) -> Option<&mut [u8]> {
        if y >= self.region.height {
            return None;
        }

        let start = Geometry::new(self.region.x, self.region.y + y, 0, 0)
            .byte_offset(self.stride, BYTES_PER_PIXEL);
        let end = start + (self.region.width * BYTES_PER_PIXEL) as usize;
        self.pixmap.data_mut().get_mut(start..end)
    }

    /// Raw pixel memory starting at the drawable area's first pixel
    ///
    /// Rows are `stride()` bytes apart; for a full-buffer canvas this is the
    /// whole buffer. For a region canvas the slice runs through the last
    /// pixel of the region's bottom row, so bytes outside the region on
    /// intermediate rows are reachable and must be left alone.
    pub fn data_mut(&mut self) -> &mut [u8] {
        if self.region.is_empty() {
            return &mut [];
        }

        let start = self.region.byte_offset(self.stride, BYTES_PER_PIXEL);
        let end = Geometry::new(self.region.x, self.region.bottom() - 1, 0, 0)
            .byte_offset(self.stride, BYTES_PER_PIXEL)
            + (self.region.width * BYTES_PER_PIXEL) as usize;
        &mut self.pixmap.data_mut()[start..end]
    }

    /// Fill the whole drawable area with `color`
    pub fn clear(&mut self, color: Color) {
        let pixel = argb_bytes(color);
        for y in 0..self.region.height {
            if let Some(row) = self.row_mut(y) {
                for px in row.chunks_exact_mut(BYTES_PER_PIXEL as usize) {
                    px.copy_from_slice(&pixel);
                }
            }
        }
    }

    /// Fill a rectangle given in canvas coordinates
    pub fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Color) {
        let Some(rect) = Rect::from_xywh(x, y, width, height) else {
            return;
        };

        if self.region.is_empty() {
            return;
        }

        let paint = paint(color);
        let transform = self.transform();
        self.ensure_clip();
        self.pixmap.fill_rect(rect, &paint, transform, self.clip.as_ref());
    }

    /// Fill a path given in canvas coordinates
    pub fn fill_path(&mut self, path: &Path, color: Color, fill_rule: FillRule) {
        if self.region.is_empty() {
            return;
        }

        let paint = paint(color);
        let transform = self.transform();
        self.ensure_clip();
        self.pixmap
            .fill_path(path, &paint, fill_rule, transform, self.clip.as_ref());
    }

    /// Stroke a path given in canvas coordinates
    pub fn stroke_path(&mut self, path: &Path, color: Color, stroke: &Stroke) {
        if self.region.is_empty() {
            return;
        }

        let paint = paint(color);
        let transform = self.transform();
        self.ensure_clip();
        self.pixmap
            .stroke_path(path, &paint, stroke, transform, self.clip.as_ref());
    }

    /// Translation from canvas to buffer coordinates
    pub fn transform(&self) -> Transform {
        Transform::from_translate(self.region.x as f32, self.region.y as f32)
    }

    fn is_whole_buffer(&self) -> bool {
        self.region == Geometry::full(self.pixmap.width(), self.pixmap.height())
    }

    // Built on first use; whole-buffer canvases never need one
    fn ensure_clip(&mut self) {
        if self.clip.is_some() || self.is_whole_buffer() {
            return;
        }

        let rect = Rect::from_xywh(
            self.region.x as f32,
            self.region.y as f32,
            self.region.width as f32,
            self.region.height as f32,
        );
        let mask = Mask::new(self.pixmap.width(), self.pixmap.height());
        if let (Some(rect), Some(mut mask)) = (rect, mask) {
            let path = PathBuilder::from_rect(rect);
            mask.fill_path(&path, FillRule::Winding, false, Transform::identity());
            self.clip = Some(mask);
        }
    }
}

/// Premultiplied ARGB8888 pixel in memory order
pub fn argb_bytes(color: Color) -> [u8; 4] {
    let c = color.premultiply().to_color_u8();
    [c.blue(), c.green(), c.red(), c.alpha()]
}

/// Paint whose RGBA output lands as ARGB8888 in memory
fn paint(color: Color) -> Paint<'static> {
    let c = color.to_color_u8();
    let mut paint = Paint::default();
    paint.set_color_rgba8(c.blue(), c.green(), c.red(), c.alpha());
    paint.anti_alias = true;
    paint
}
