// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Motion & split policy (spec.md §4.5), grounded on
//! `original_source/manager.py`'s `check_spacetime`. Kept as a plain,
//! synchronous, clock-injected state machine so the coordinator's
//! select-loop can poll it without owning a background thread, and so the
//! boundary/hysteresis behavior (spec.md §8) is unit-testable without
//! sleeping.

use std::time::Instant;

use fraicap_common::config::CaptureConfig;

/// Distance/time/motion thresholds lifted from the capture config document.
#[derive(Debug, Clone, Copy)]
pub struct SegmentationConfig {
    pub splitting_distance_m: f64,
    pub splitting_time_s: f64,
    pub pause_speed_mps: f64,
    pub resume_speed_mps: f64,
}

impl From<&CaptureConfig> for SegmentationConfig {
    fn from(cfg: &CaptureConfig) -> Self {
        Self {
            splitting_distance_m: cfg.splitting_distance,
            splitting_time_s: cfg.splitting_time,
            pause_speed_mps: cfg.pause_speed,
            resume_speed_mps: cfg.resume_speed,
        }
    }
}

/// Tracks the accumulated distance and elapsed time of the segment
/// currently being captured, plus the Schmitt-trigger motion detector.
pub struct SegmentationEngine {
    cfg: SegmentationConfig,
    distance_accum_m: f64,
    segment_init: Instant,
    vehicle_moving: bool,
}

impl SegmentationEngine {
    pub fn new(cfg: SegmentationConfig, now: Instant) -> Self {
        Self { cfg, distance_accum_m: 0.0, segment_init: now, vehicle_moving: false }
    }

    /// Reset the accumulator and init-time for a freshly opened segment
    /// (`new_segment`, spec.md §4.4 step 2).
    pub fn begin_segment(&mut self, now: Instant) {
        self.distance_accum_m = 0.0;
        self.segment_init = now;
    }

    pub fn distance_accum_m(&self) -> f64 {
        self.distance_accum_m
    }

    pub fn vehicle_moving(&self) -> bool {
        self.vehicle_moving
    }

    /// Force the motion flag on regardless of the last observed speed, for
    /// an operator-initiated forced start (spec.md §4.4 "force start").
    pub fn force_moving(&mut self) {
        self.vehicle_moving = true;
    }

    /// `now − segment_init_time > splitting_time` (spec.md §4.5).
    pub fn check_timeout(&self, now: Instant) -> bool {
        now.duration_since(self.segment_init).as_secs_f64() > self.cfg.splitting_time_s
    }

    /// Elapsed wall time since the current segment began, for the
    /// catalog row's `duracion` (spec.md §4.4 "Segment finalization").
    pub fn elapsed_since_init(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.segment_init)
    }

    /// Feed one GPS fix's distance delta and speed. Updates the distance
    /// accumulator and the hysteretic motion flag, and reports whether the
    /// distance split threshold was just exceeded.
    pub fn observe_fix(&mut self, distance_delta_m: f64, speed_mps: f64) -> bool {
        self.distance_accum_m += distance_delta_m;
        if speed_mps < self.cfg.pause_speed_mps {
            self.vehicle_moving = false;
        } else if speed_mps > self.cfg.resume_speed_mps {
            self.vehicle_moving = true;
        }
        self.distance_accum_m > self.cfg.splitting_distance_m
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SegmentationConfig {
        SegmentationConfig {
            splitting_distance_m: 500.0,
            splitting_time_s: 60.0,
            pause_speed_mps: 0.5,
            resume_speed_mps: 1.5,
        }
    }

    #[test]
    fn segment_ended_fires_at_first_tick_past_distance_threshold() {
        let mut engine = SegmentationEngine::new(cfg(), Instant::now());
        assert!(!engine.observe_fix(499.0, 2.0));
        assert!(engine.observe_fix(1.01, 2.0));
    }

    #[test]
    fn segment_ended_fires_at_first_tick_past_time_threshold() {
        let base = Instant::now();
        let engine = SegmentationEngine::new(cfg(), base);
        assert!(!engine.check_timeout(base + std::time::Duration::from_secs(60)));
        assert!(engine.check_timeout(base + std::time::Duration::from_millis(60_100)));
    }

    #[test]
    fn motion_hysteresis_produces_exactly_one_edge_on_last_sample() {
        let mut engine = SegmentationEngine::new(cfg(), Instant::now());
        let eps = 0.01;
        let samples =
            [cfg().pause_speed_mps - eps, cfg().pause_speed_mps + eps, cfg().resume_speed_mps - eps, cfg().resume_speed_mps + eps];

        let mut edges = 0;
        let mut prev = engine.vehicle_moving();
        for speed in samples {
            engine.observe_fix(0.0, speed);
            if engine.vehicle_moving() != prev {
                edges += 1;
            }
            prev = engine.vehicle_moving();
        }
        assert_eq!(edges, 1);
        assert!(engine.vehicle_moving());
    }

    #[test]
    fn speeds_between_thresholds_do_not_change_motion_state() {
        let mut engine = SegmentationEngine::new(cfg(), Instant::now());
        engine.observe_fix(0.0, 2.0);
        assert!(engine.vehicle_moving());
        engine.observe_fix(0.0, 1.0);
        assert!(engine.vehicle_moving(), "debounce band must not clear vehicle_moving");
    }

    #[test]
    fn begin_segment_resets_distance_and_clock() {
        let base = Instant::now();
        let mut engine = SegmentationEngine::new(cfg(), base);
        engine.observe_fix(100.0, 2.0);
        let later = base + std::time::Duration::from_secs(10);
        engine.begin_segment(later);
        assert_eq!(engine.distance_accum_m(), 0.0);
        assert!(!engine.check_timeout(later + std::time::Duration::from_secs(30)));
    }
}
