//! Screen-space rectangle math shared by selection, reflow and damage filtering

/// An axis-aligned rectangle in root-window coordinates (device pixels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Intersection with `other`, or `None` if they do not overlap.
    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        if x1 < x2 && y1 < y2 {
            Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
        } else {
            None
        }
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.intersect(other).is_some()
    }

    /// Area of the intersection with `other` (0 when disjoint).
    pub fn overlap_area(&self, other: &Rect) -> i64 {
        self.intersect(other)
            .map(|r| r.width as i64 * r.height as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect_overlapping() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(50, 50, 100, 100);
        assert_eq!(a.intersect(&b), Some(Rect::new(50, 50, 50, 50)));
        assert_eq!(a.overlap_area(&b), 2500);
    }

    #[test]
    fn test_intersect_disjoint() {
        let a = Rect::new(0, 0, 100, 100);
        let b = Rect::new(100, 0, 100, 100);
        assert_eq!(a.intersect(&b), None);
        assert_eq!(a.overlap_area(&b), 0);
        assert!(!a.intersects(&b));
    }

    #[test]
    fn test_intersect_contained() {
        let outer = Rect::new(0, 0, 1920, 1080);
        let inner = Rect::new(100, 100, 50, 50);
        assert_eq!(outer.intersect(&inner), Some(inner));
    }
}
