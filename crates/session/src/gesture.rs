//! Per-connection touch gesture detection: multi-finger taps, swipes and
//! repeated taps.

use std::time::Duration;

use navi_pose::Vec2;
use navi_wire::{TouchEvent, TouchPhase};

/// A swipe is abandoned after this many stationary touch reports.
pub const MAX_STATIONARY_FRAMES: u32 = 6;

/// A swipe must end within this long of starting.
pub const MAX_SWIPE_TIME: Duration = Duration::from_secs(10);

/// Minimum travel in pixels along the swipe axis.
pub const MIN_SWIPE_DIST: f32 = 300.0;

/// Finger counts that report a multi-finger tap.
pub const TAP_FINGER_COUNTS: [u32; 3] = [3, 5, 6];

/// Finger count of the reset tap.
pub const RESET_FINGERS: u32 = 5;

/// Counter resets above this, recovering from lost releases.
const MAX_TRACKED_FINGERS: u32 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Left,
    Right,
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gesture {
    MultiFingerTap(u32),
    Swipe(SwipeDirection),
    DoubleTap,
    TripleTap,
}

#[derive(Debug, Clone, Copy)]
struct Swipe {
    start: Vec2,
    started_at: Duration,
    stationary_frames: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GestureTracker {
    fingers_down: u32,
    swipe: Option<Swipe>,
}

impl GestureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fingers_down(&self) -> u32 {
        self.fingers_down
    }

    /// Update finger count and swipe state. Returns a gesture if one completed.
    pub fn on_touch(&mut self, touch: &TouchEvent, now: Duration) -> Option<Gesture> {
        match touch.phase {
            TouchPhase::Began => {
                self.fingers_down += 1;
                if self.fingers_down > MAX_TRACKED_FINGERS {
                    self.fingers_down = 0;
                }
                if self.fingers_down == 1 {
                    self.swipe = Some(Swipe {
                        start: touch.position,
                        started_at: now,
                        stationary_frames: 0,
                    });
                } else {
                    self.swipe = None;
                }
                TAP_FINGER_COUNTS
                    .contains(&self.fingers_down)
                    .then_some(Gesture::MultiFingerTap(self.fingers_down))
            }
            TouchPhase::Stationary => {
                if let Some(swipe) = self.swipe.as_mut() {
                    swipe.stationary_frames += 1;
                    if swipe.stationary_frames > MAX_STATIONARY_FRAMES {
                        self.swipe = None;
                    }
                }
                None
            }
            TouchPhase::Moved => None,
            TouchPhase::Ended | TouchPhase::Canceled => {
                self.fingers_down = self.fingers_down.saturating_sub(1);
                let swipe = self.swipe.take();
                if touch.phase == TouchPhase::Canceled {
                    return None;
                }
                if let Some(direction) = swipe.and_then(|s| s.direction(touch.position, now)) {
                    return Some(Gesture::Swipe(direction));
                }
                match touch.tap_count {
                    2 => Some(Gesture::DoubleTap),
                    3 => Some(Gesture::TripleTap),
                    _ => None,
                }
            }
        }
    }

    /// Forget all fingers, e.g. after a role change.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Swipe {
    fn direction(&self, end: Vec2, now: Duration) -> Option<SwipeDirection> {
        if now.saturating_sub(self.started_at) >= MAX_SWIPE_TIME {
            return None;
        }
        let dx = end.x - self.start.x;
        let dy = end.y - self.start.y;
        if dx.abs() > MIN_SWIPE_DIST {
            Some(if dx < 0.0 {
                SwipeDirection::Left
            } else {
                SwipeDirection::Right
            })
        } else if dy.abs() > MIN_SWIPE_DIST {
            Some(if dy < 0.0 {
                SwipeDirection::Down
            } else {
                SwipeDirection::Up
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(phase: TouchPhase, x: f32, y: f32, tap_count: i32) -> TouchEvent {
        TouchEvent {
            finger_id: 0,
            phase,
            position: Vec2::new(x, y),
            tap_count,
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_multi_finger_taps() {
        let mut tracker = GestureTracker::new();
        let mut taps = Vec::new();
        for i in 0..6 {
            if let Some(g) = tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 1), ms(i)) {
                taps.push(g);
            }
        }
        assert_eq!(
            taps,
            vec![
                Gesture::MultiFingerTap(3),
                Gesture::MultiFingerTap(5),
                Gesture::MultiFingerTap(6)
            ]
        );
        for _ in 0..8 {
            tracker.on_touch(&touch(TouchPhase::Ended, 0.0, 0.0, 1), ms(10));
        }
        assert_eq!(tracker.fingers_down(), 0);
    }

    #[test]
    fn test_finger_count_resets_past_limit() {
        let mut tracker = GestureTracker::new();
        for _ in 0..MAX_TRACKED_FINGERS + 1 {
            tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 1), ms(0));
        }
        assert_eq!(tracker.fingers_down(), 0);
    }

    #[test]
    fn test_swipe_directions() {
        let cases = [
            (-400.0, 0.0, SwipeDirection::Left),
            (400.0, 50.0, SwipeDirection::Right),
            (10.0, 350.0, SwipeDirection::Up),
            (0.0, -350.0, SwipeDirection::Down),
        ];
        for (x, y, expected) in cases {
            let mut tracker = GestureTracker::new();
            tracker.on_touch(&touch(TouchPhase::Began, 500.0, 500.0, 1), ms(0));
            tracker.on_touch(&touch(TouchPhase::Moved, 500.0 + x / 2.0, 500.0 + y / 2.0, 1), ms(100));
            let gesture = tracker.on_touch(&touch(TouchPhase::Ended, 500.0 + x, 500.0 + y, 1), ms(200));
            assert_eq!(gesture, Some(Gesture::Swipe(expected)), "dx={x} dy={y}");
        }
    }

    #[test]
    fn test_swipe_too_short_or_slow() {
        let mut tracker = GestureTracker::new();
        tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 1), ms(0));
        assert_eq!(tracker.on_touch(&touch(TouchPhase::Ended, 250.0, 0.0, 1), ms(100)), None);

        tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 1), ms(0));
        assert_eq!(
            tracker.on_touch(&touch(TouchPhase::Ended, 900.0, 0.0, 1), MAX_SWIPE_TIME),
            None
        );
    }

    #[test]
    fn test_stationary_frames_cancel_swipe() {
        let mut tracker = GestureTracker::new();
        tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 1), ms(0));
        for i in 0..=MAX_STATIONARY_FRAMES {
            tracker.on_touch(&touch(TouchPhase::Stationary, 0.0, 0.0, 1), ms(u64::from(i) * 16));
        }
        assert_eq!(tracker.on_touch(&touch(TouchPhase::Ended, 900.0, 0.0, 1), ms(200)), None);
    }

    #[test]
    fn test_repeated_taps() {
        let mut tracker = GestureTracker::new();
        tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 2), ms(0));
        assert_eq!(
            tracker.on_touch(&touch(TouchPhase::Ended, 0.0, 0.0, 2), ms(50)),
            Some(Gesture::DoubleTap)
        );
        tracker.on_touch(&touch(TouchPhase::Began, 0.0, 0.0, 3), ms(100));
        assert_eq!(
            tracker.on_touch(&touch(TouchPhase::Ended, 0.0, 0.0, 3), ms(150)),
            Some(Gesture::TripleTap)
        );
    }
}
