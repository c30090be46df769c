//! Blit-offset computation for destinations smaller than the source
//!
//! When the destination surface cannot hold the whole source region, the
//! captured content pans so the pointer's projected position stays visible.

use crate::geometry::Rect;

/// A signed translation applied when presenting the captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Offset {
    pub x: i32,
    pub y: i32,
}

/// Adjust one axis of the blit offset.
///
/// With `dst >= src` the content is statically centered. Otherwise the
/// offset pans just enough to keep `cursor + offset` inside `[0, dst)`;
/// with the cursor off-region (negative) only unused slack is pulled back
/// toward zero so an idle pointer never causes panning.
pub fn adjust_offset_axis(offset: i32, src: i32, dst: i32, cursor: i32) -> i32 {
    if dst >= src {
        return (dst - src) / 2;
    }

    if cursor >= 0 {
        let projected = cursor + offset;
        if projected < 0 {
            offset - projected
        } else if projected >= dst {
            offset - (projected - dst + 1)
        } else {
            offset
        }
    } else if offset > 0 {
        0
    } else {
        let min_offset = dst - src;
        offset.max(min_offset)
    }
}

/// Recompute both axes for the current cursor position. Returns the new
/// offset; callers reposition the blit target when it differs.
pub fn adjust_offset(offset: Offset, src: Rect, dst: Rect, cursor: (i32, i32)) -> Offset {
    Offset {
        x: adjust_offset_axis(offset.x, src.width, dst.width, cursor.0),
        y: adjust_offset_axis(offset.y, src.height, dst.height, cursor.1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_destination_centers_statically() {
        // Any cursor position yields the same centered offset
        for cursor in [-1, 0, 500, 1199] {
            assert_eq!(adjust_offset_axis(0, 1280, 1920, cursor), 320);
            assert_eq!(adjust_offset_axis(-77, 1280, 1920, cursor), 320);
        }
        // Equal extents center at zero
        assert_eq!(adjust_offset_axis(12, 1024, 1024, 3), 0);
    }

    #[test]
    fn test_small_destination_keeps_cursor_visible() {
        // cursor at the right edge of a 1200-wide source, 800-wide dest
        let off = adjust_offset_axis(0, 1200, 800, 1199);
        assert_eq!(off, -400);
        // projected position is inside [0, 800)
        assert_eq!(1199 + off, 799);

        // cursor at the left edge with the content panned right
        let off = adjust_offset_axis(-400, 1200, 800, 0);
        assert_eq!(off, 0);
    }

    #[test]
    fn test_pan_is_idempotent() {
        let mut off = 0;
        for _ in 0..5 {
            let next = adjust_offset_axis(off, 1200, 800, 600);
            if next == off {
                break;
            }
            off = next;
        }
        assert_eq!(adjust_offset_axis(off, 1200, 800, 600), off);
    }

    #[test]
    fn test_pan_is_monotonic_left_to_right() {
        // cursor sweeps from 0 to 1199; offset moves from 0 toward -400
        // without overshooting
        let mut off = 0;
        let mut prev = off;
        for cursor in 0..1200 {
            off = adjust_offset_axis(off, 1200, 800, cursor);
            assert!(off <= prev, "offset moved backwards at {cursor}");
            assert!(off >= -400, "offset overshot at {cursor}");
            prev = off;
        }
        assert_eq!(off, -400);
    }

    #[test]
    fn test_off_region_only_reclaims_slack() {
        // negative offset beyond the minimum is pulled back to dst - src
        assert_eq!(adjust_offset_axis(-500, 1200, 800, -1), -400);
        // positive slack collapses to zero
        assert_eq!(adjust_offset_axis(120, 1200, 800, -1), 0);
        // an in-range offset is left alone
        assert_eq!(adjust_offset_axis(-200, 1200, 800, -1), -200);
    }

    #[test]
    fn test_adjust_offset_per_axis() {
        let src = Rect::new(0, 0, 1920, 1080);
        let dst = Rect::new(0, 0, 1280, 1024);
        let off = adjust_offset(Offset::default(), src, dst, (-1, -1));
        // both axes smaller than the source, no slack to reclaim
        assert_eq!(off, Offset { x: 0, y: 0 });

        let dst = Rect::new(0, 0, 2560, 1440);
        let off = adjust_offset(Offset::default(), src, dst, (-1, -1));
        assert_eq!(off, Offset { x: 320, y: 180 });
    }
}
