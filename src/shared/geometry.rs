//! Rectangle geometry in buffer pixel coordinates

/// Rectangle geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Geometry {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Rectangle covering a whole `width` x `height` area
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Exclusive right edge
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    /// Exclusive bottom edge
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    /// Part of this rectangle inside a `width` x `height` area
    pub fn clip_to(&self, width: u32, height: u32) -> Geometry {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Geometry {
            x,
            y,
            width: self.right().min(width) - x,
            height: self.bottom().min(height) - y,
        }
    }

    /// Byte offset of the top-left pixel in a buffer with the given stride
    pub fn byte_offset(&self, stride: u32, bytes_per_pixel: u32) -> usize {
        self.y as usize * stride as usize + self.x as usize * bytes_per_pixel as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_inside_is_identity() {
        let rect = Geometry::new(10, 20, 30, 40);
        assert_eq!(rect.clip_to(100, 100), rect);
    }

    #[test]
    fn test_clip_overhanging_rect() {
        let rect = Geometry::new(90, 50, 30, 80);
        assert_eq!(rect.clip_to(100, 100), Geometry::new(90, 50, 10, 50));
    }

    #[test]
    fn test_clip_outside_is_empty() {
        let rect = Geometry::new(150, 10, 30, 30);
        assert!(rect.clip_to(100, 100).is_empty());
    }

    #[test]
    fn test_byte_offset() {
        let rect = Geometry::new(3, 2, 5, 5);
        // row offset y * stride, column offset x * 4
        assert_eq!(rect.byte_offset(400 * 4, 4), 2 * 1600 + 12);
    }
}
