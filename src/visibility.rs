//! Raise/lower arbitration for the mirror window
//!
//! The mirror must stay out of the way while the user works on the
//! destination monitor, but pop back up as soon as they interact with
//! content that lives under the mirrored area.

use crate::geometry::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Raised,
    Lowered,
}

/// Decide whether the mirror should be visible.
///
/// The pointer being inside the source region always wins. Otherwise the
/// focused window's overlap with the source region is weighed against its
/// overlap with the destination region; with no focused window tracked,
/// the mirror stays down.
pub fn decide(
    cursor_on_region: bool,
    active_window: Option<&Rect>,
    source: &Rect,
    dest: &Rect,
) -> Visibility {
    if cursor_on_region {
        return Visibility::Raised;
    }

    match active_window {
        Some(rect) => {
            if rect.overlap_area(source) > rect.overlap_area(dest) {
                Visibility::Raised
            } else {
                Visibility::Lowered
            }
        }
        None => Visibility::Lowered,
    }
}

/// Two-state machine holding the current stacking position. Transitions
/// are reported to the caller exactly once; repeated applications of the
/// same target are no-ops.
#[derive(Debug)]
pub struct VisibilityState {
    current: Visibility,
}

impl VisibilityState {
    pub fn new() -> Self {
        Self {
            current: Visibility::Lowered,
        }
    }

    pub fn current(&self) -> Visibility {
        self.current
    }

    /// Move to `target`; returns `Some(target)` if the state actually
    /// changed and the surface must be restacked.
    pub fn apply(&mut self, target: Visibility) -> Option<Visibility> {
        if self.current == target {
            None
        } else {
            self.current = target;
            Some(target)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> Rect {
        Rect::new(1920, 0, 1280, 1024)
    }

    fn dst() -> Rect {
        Rect::new(0, 0, 1920, 1080)
    }

    #[test]
    fn test_pointer_on_region_raises() {
        assert_eq!(decide(true, None, &src(), &dst()), Visibility::Raised);
        // even with a window parked on the destination
        let w = Rect::new(100, 100, 800, 600);
        assert_eq!(decide(true, Some(&w), &src(), &dst()), Visibility::Raised);
    }

    #[test]
    fn test_pointer_off_region_no_window_lowers() {
        assert_eq!(decide(false, None, &src(), &dst()), Visibility::Lowered);
    }

    #[test]
    fn test_active_window_overlap_arbitrates() {
        // window fully on the source monitor
        let on_src = Rect::new(2000, 50, 640, 480);
        assert_eq!(
            decide(false, Some(&on_src), &src(), &dst()),
            Visibility::Raised
        );

        // window fully on the destination monitor
        let on_dst = Rect::new(100, 100, 640, 480);
        assert_eq!(
            decide(false, Some(&on_dst), &src(), &dst()),
            Visibility::Lowered
        );

        // straddling, but mostly on the source side
        let straddle = Rect::new(1800, 0, 400, 400);
        assert!(straddle.overlap_area(&src()) > straddle.overlap_area(&dst()));
        assert_eq!(
            decide(false, Some(&straddle), &src(), &dst()),
            Visibility::Raised
        );
    }

    #[test]
    fn test_transitions_are_idempotent() {
        let mut state = VisibilityState::new();
        assert_eq!(state.current(), Visibility::Lowered);
        assert_eq!(state.apply(Visibility::Lowered), None);
        assert_eq!(state.apply(Visibility::Raised), Some(Visibility::Raised));
        assert_eq!(state.apply(Visibility::Raised), None);
        assert_eq!(state.apply(Visibility::Lowered), Some(Visibility::Lowered));
    }

    #[test]
    fn test_pointer_transition_drives_state() {
        let mut state = VisibilityState::new();
        // pointer enters the source region
        state.apply(decide(true, None, &src(), &dst()));
        assert_eq!(state.current(), Visibility::Raised);
        // pointer leaves, nothing focused
        state.apply(decide(false, None, &src(), &dst()));
        assert_eq!(state.current(), Visibility::Lowered);
    }
}
