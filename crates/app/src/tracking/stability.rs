//! Per-person motion stability classification.
//!
//! The tracker keeps a short, time-windowed position history per track id and
//! classifies the person as stable when their net drift over the window is no
//! larger than what the current instantaneous speed would cover in a small
//! fraction of it. Gesture logic downstream only fires for stable people.
//!
//! All reads and writes happen on the frame-delivery context, so the tracker
//! needs no internal locking; independent track ids never interact.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use nalgebra::Point3;

/// Hard cap on retained samples per track id, applied on top of the time
/// window.
pub(crate) const HISTORY_CAPACITY: usize = 64;

/// One observed position for a track id.
struct PositionSample {
    position: Point3<f32>,
    timestamp_ms: i64,
}

pub(crate) struct StabilityTracker {
    window: Duration,
    drift_factor: f32,
    histories: HashMap<u32, VecDeque<PositionSample>>,
}

impl StabilityTracker {
    pub(crate) fn new(window: Duration, drift_factor: f32) -> Self {
        Self {
            window,
            drift_factor,
            histories: HashMap::new(),
        }
    }

    /// Record a position observation for `track_id`, evicting samples that
    /// have aged out of the window relative to the newest one.
    pub(crate) fn add(&mut self, track_id: u32, position: Point3<f32>, timestamp_ms: i64) {
        let history = self.histories.entry(track_id).or_default();
        history.push_back(PositionSample {
            position,
            timestamp_ms,
        });

        let horizon = timestamp_ms - self.window.as_millis() as i64;
        while history
            .front()
            .is_some_and(|sample| sample.timestamp_ms < horizon)
        {
            history.pop_front();
        }
        while history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    /// Classify recent motion of `track_id`.
    ///
    /// With fewer than two retained samples there is no evidence either way
    /// and the answer is `false`. Otherwise the person is stable when the
    /// displacement between the oldest and newest retained samples stays
    /// within `drift_factor * recent_speed * window`: a stationary point is
    /// stable, drift the current speed cannot account for is not, and a jump
    /// spanning a whole frame interval exceeds the tolerance as well.
    pub(crate) fn is_stable(&self, track_id: u32) -> bool {
        let Some(history) = self.histories.get(&track_id) else {
            return false;
        };
        if history.len() < 2 {
            return false;
        }

        let newest = &history[history.len() - 1];
        let previous = &history[history.len() - 2];
        let oldest = &history[0];

        let window_displacement = (newest.position - oldest.position).norm();
        if window_displacement == 0.0 {
            return true;
        }

        let delta_ms = newest.timestamp_ms - previous.timestamp_ms;
        if delta_ms <= 0 {
            return false;
        }
        let recent_speed = (newest.position - previous.position).norm() / (delta_ms as f32 / 1e3);

        window_displacement <= self.drift_factor * recent_speed * self.window.as_secs_f32()
    }

    /// Number of track ids with at least one retained sample.
    #[cfg(test)]
    fn tracked_ids(&self) -> usize {
        self.histories.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StabilityTracker {
        // 500 ms window with a 0.05 drift factor: tolerance horizon is
        // 25 ms of travel at the current speed, below one 30 fps frame
        // interval.
        StabilityTracker::new(Duration::from_millis(500), 0.05)
    }

    fn at(x: f32, y: f32, z: f32) -> Point3<f32> {
        Point3::new(x, y, z)
    }

    #[test]
    fn unknown_or_single_sample_is_never_stable() {
        let mut tracker = tracker();
        assert!(!tracker.is_stable(5));
        tracker.add(5, at(0.0, 0.0, 0.0), 0);
        assert!(!tracker.is_stable(5));
    }

    #[test]
    fn stationary_person_is_stable() {
        let mut tracker = tracker();
        tracker.add(5, at(0.0, 0.0, 0.0), 0);
        tracker.add(5, at(0.0, 0.0, 0.0), 33);
        tracker.add(5, at(0.0, 0.0, 0.0), 66);
        assert!(tracker.is_stable(5));
    }

    #[test]
    fn frame_interval_jump_is_unstable() {
        let mut tracker = tracker();
        tracker.add(6, at(0.0, 0.0, 0.0), 0);
        tracker.add(6, at(0.0, 0.0, 0.0), 33);
        tracker.add(6, at(10.0, 0.0, 0.0), 66);
        assert!(!tracker.is_stable(6));
    }

    #[test]
    fn drift_with_near_zero_recent_speed_is_unstable() {
        let mut tracker = tracker();
        tracker.add(3, at(0.0, 0.0, 0.0), 0);
        tracker.add(3, at(0.5, 0.0, 0.0), 200);
        tracker.add(3, at(0.5, 0.0, 0.0), 400);
        assert!(!tracker.is_stable(3));
    }

    #[test]
    fn drift_within_speed_tolerance_boundary() {
        // Recent step: 0.02 m over 25 ms -> 0.8 m/s; tolerance is
        // 0.05 * 0.8 * 0.5 = 0.02 m of drift over the window.
        let mut tracker = tracker();
        tracker.add(1, at(0.0, 0.0, 0.0), 0);
        tracker.add(1, at(-0.0011, 0.0, 0.0), 475);
        tracker.add(1, at(0.0189, 0.0, 0.0), 500);
        assert!(tracker.is_stable(1));

        tracker.add(2, at(0.0, 0.0, 0.0), 0);
        tracker.add(2, at(0.0011, 0.0, 0.0), 475);
        tracker.add(2, at(0.0211, 0.0, 0.0), 500);
        assert!(!tracker.is_stable(2));
    }

    #[test]
    fn samples_age_out_of_the_window() {
        let mut tracker = tracker();
        // Big drift early on, then standing still long enough that the
        // drifted sample leaves the window.
        tracker.add(9, at(5.0, 0.0, 0.0), 0);
        tracker.add(9, at(0.0, 0.0, 0.0), 400);
        assert!(!tracker.is_stable(9));
        tracker.add(9, at(0.0, 0.0, 0.0), 700);
        tracker.add(9, at(0.0, 0.0, 0.0), 950);
        assert!(tracker.is_stable(9));
    }

    #[test]
    fn history_is_capped() {
        let mut tracker = StabilityTracker::new(Duration::from_secs(3600), 0.05);
        for i in 0..(HISTORY_CAPACITY as i64 * 2) {
            tracker.add(1, at(0.0, 0.0, 0.0), i);
        }
        let history = tracker.histories.get(&1).unwrap();
        assert_eq!(history.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn non_increasing_timestamps_are_unstable() {
        let mut tracker = tracker();
        tracker.add(4, at(0.0, 0.0, 0.0), 100);
        tracker.add(4, at(1.0, 0.0, 0.0), 100);
        assert!(!tracker.is_stable(4));
    }

    #[test]
    fn track_ids_never_interact() {
        let mut tracker = tracker();
        for t in [0i64, 33, 66] {
            tracker.add(1, at(0.0, 0.0, 0.0), t);
            tracker.add(2, at(t as f32, 0.0, 0.0), t);
        }
        assert!(tracker.is_stable(1));
        assert!(!tracker.is_stable(2));
        assert_eq!(tracker.tracked_ids(), 2);
    }
}
