// THEORY:
// The `OutlineStabilizer` locates the silhouette of the physical object in
// camera space before any individual light is hunted. Every light on the
// strand is lit while it runs, so the detector reports a cloud of bright
// rectangles each tick; the stabilizer reduces each accepted tick to one
// outlier-filtered bounding rectangle and waits until several consecutive
// reductions agree before trusting any of them.
//
// Key architectural principles:
// 1.  **Warm-Up Offset**: the first ~2 seconds of detections are discarded by
//     stamping the phase-start and throttle timestamps into the future on the
//     first event. Consumer cameras spend that long converging on an exposure
//     level, and rectangles observed during convergence are garbage. This is a
//     deliberate reproduction of the original behavior, not an accident.
// 2.  **Sample-Rate Throttling**: the detector delivers events far faster than
//     outline estimates are worth computing. Events inside the minimum
//     inter-sample interval are ignored entirely.
// 3.  **Consensus Before Commitment**: stability is declared only when the most
//     recent samples in the window are all similar to the newest one. One
//     disagreeing sample throws the whole window away and implicitly restarts
//     the warm-up, because a moving camera invalidates everything seen so far.
//     Retry is unbounded; a feed that never stabilizes simply never resolves.
// 4.  **Immutable Result**: once declared, the outline (expanded by a breathing
//     margin) never shrinks or moves for the rest of the run.

use crate::core_modules::geometry::{Rect, RectSample, bounding_rect, rects_are_similar};
use crate::pipeline::CalibrationConfig;
use std::time::Instant;

/// Outcome of feeding one detector event to the stabilizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutlineProgress {
    /// Still collecting samples; nothing to report.
    Accumulating,
    /// The stability window disagreed with itself and was discarded.
    Unstable,
    /// Consensus reached; the expanded outline is final for this run.
    Found(Rect),
}

/// State machine that aggregates per-tick bounding rectangles until several
/// consecutive ones agree, then freezes the object outline.
pub struct OutlineStabilizer {
    /// One outlier-filtered bounding rect per accepted sample tick.
    recent_outlines: Vec<Rect>,
    /// When the current attempt started. Unset until the first event, and
    /// deliberately set in the future to swallow the camera warm-up.
    phase_start: Option<Instant>,
    /// When the last sample was accepted, for rate throttling.
    last_sample_at: Option<Instant>,
    /// The frozen result, once found.
    outline: Option<Rect>,
}

impl OutlineStabilizer {
    pub fn new() -> Self {
        Self {
            recent_outlines: Vec::new(),
            phase_start: None,
            last_sample_at: None,
            outline: None,
        }
    }

    /// The frozen outline, if stability has been declared.
    pub fn outline(&self) -> Option<Rect> {
        self.outline
    }

    /// Feeds one detector event, stamped with the injected current time.
    pub fn on_sample(
        &mut self,
        config: &CalibrationConfig,
        sample: &RectSample,
        now: Instant,
    ) -> OutlineProgress {
        if let Some(outline) = self.outline {
            return OutlineProgress::Found(outline);
        }

        if self.phase_start.is_none() {
            // First event of the attempt. Push both timestamps into the future
            // so the camera's auto-exposure settles before anything counts.
            let start = now + config.camera_warm_up;
            self.phase_start = Some(start);
            self.last_sample_at = Some(start);
            log::debug!(
                "outline attempt started, discarding {:?} of warm-up",
                config.camera_warm_up
            );
        }
        let (Some(phase_start), Some(last_sample_at)) = (self.phase_start, self.last_sample_at)
        else {
            return OutlineProgress::Accumulating;
        };

        if now.saturating_duration_since(last_sample_at) > config.min_sample_interval {
            self.last_sample_at = Some(now);
            match bounding_rect(&sample.rects, config.outline_outlier_std_devs) {
                Some(rect) => self.recent_outlines.push(rect),
                // An empty tick carries no outline information. Skip it but
                // keep the throttle moving.
                None => log::debug!("outline tick with no usable rects"),
            }
        }

        if now.saturating_duration_since(phase_start) > config.stability_check_interval {
            return self.check_stability(config);
        }
        OutlineProgress::Accumulating
    }

    /// Inspects the tail of `recent_outlines` for consensus.
    fn check_stability(&mut self, config: &CalibrationConfig) -> OutlineProgress {
        let window = config.stability_window;
        if self.recent_outlines.len() >= window {
            let tail = &self.recent_outlines[self.recent_outlines.len() - window..];
            let most_recent = tail[window - 1];
            if tail
                .iter()
                .all(|rect| rects_are_similar(rect, &most_recent, config.similarity_threshold_px))
            {
                // Give the object a bit of room to breathe.
                let outline = most_recent.expand(config.outline_margin_px);
                log::info!(
                    "outline stable at ({:.0}, {:.0}) {:.0}x{:.0}",
                    outline.x,
                    outline.y,
                    outline.width,
                    outline.height
                );
                self.outline = Some(outline);
                return OutlineProgress::Found(outline);
            }
        }

        log::info!(
            "outline not stable after {} samples, retrying",
            self.recent_outlines.len()
        );
        self.recent_outlines.clear();
        self.phase_start = None;
        self.last_sample_at = None;
        OutlineProgress::Unstable
    }
}

impl Default for OutlineStabilizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(rect: Rect) -> RectSample {
        RectSample::from(vec![rect])
    }

    /// Replays one event per 100ms-and-a-bit so every event clears the
    /// throttle, starting after the warm-up offset has elapsed.
    fn replay(
        stabilizer: &mut OutlineStabilizer,
        config: &CalibrationConfig,
        t0: Instant,
        samples: &[RectSample],
    ) -> Vec<OutlineProgress> {
        let mut results = Vec::new();
        // First event only arms the timestamps.
        results.push(stabilizer.on_sample(config, &samples[0], t0));
        let warm = config.camera_warm_up + Duration::from_millis(101);
        for (i, s) in samples.iter().enumerate().skip(1) {
            let now = t0 + warm + Duration::from_millis(101 * i as u64);
            results.push(stabilizer.on_sample(config, s, now));
        }
        results
    }

    #[test]
    fn declares_stability_after_agreeing_window() {
        let config = CalibrationConfig::default();
        let mut stabilizer = OutlineStabilizer::new();
        let t0 = Instant::now();

        let base = Rect::new(50.0, 50.0, 20.0, 30.0);
        // Enough agreeing samples to fill the window and pass the check
        // interval: 12 events spread over ~1.2s after warm-up.
        let samples = vec![sample(base); 12];
        let results = replay(&mut stabilizer, &config, t0, &samples);

        let expected = base.expand(10.0);
        assert_eq!(*results.last().unwrap(), OutlineProgress::Found(expected));
        assert_eq!(stabilizer.outline(), Some(expected));
    }

    #[test]
    fn outline_is_expansion_of_final_sample() {
        let config = CalibrationConfig::default();
        let mut stabilizer = OutlineStabilizer::new();
        let t0 = Instant::now();

        // Samples drift within the 5px similarity threshold; the result must
        // track the newest one, not an average.
        let mut samples: Vec<RectSample> = (0..10)
            .map(|i| sample(Rect::new(50.0 + (i % 3) as f64, 50.0, 20.0, 30.0)))
            .collect();
        let last = Rect::new(52.0, 50.0, 20.0, 30.0);
        *samples.last_mut().unwrap() = sample(last);

        let results = replay(&mut stabilizer, &config, t0, &samples);
        assert_eq!(*results.last().unwrap(), OutlineProgress::Found(last.expand(10.0)));
    }

    #[test]
    fn divergent_window_resets_all_state() {
        let config = CalibrationConfig::default();
        let mut stabilizer = OutlineStabilizer::new();
        let t0 = Instant::now();

        // One sample inside the final window diverges by far more than 5px.
        // The replay ends right at the stability check so the reset is the
        // last thing that happens.
        let base = Rect::new(50.0, 50.0, 20.0, 30.0);
        let mut samples = vec![sample(base); 10];
        samples[8] = sample(Rect::new(200.0, 200.0, 20.0, 30.0));

        let results = replay(&mut stabilizer, &config, t0, &samples);
        assert_eq!(*results.last().unwrap(), OutlineProgress::Unstable);
        assert_eq!(stabilizer.outline(), None);
        // The failed attempt must leave nothing behind.
        assert!(stabilizer.recent_outlines.is_empty());
        assert!(stabilizer.phase_start.is_none());
        assert!(stabilizer.last_sample_at.is_none());
    }

    #[test]
    fn events_inside_throttle_interval_are_ignored() {
        let config = CalibrationConfig::default();
        let mut stabilizer = OutlineStabilizer::new();
        let t0 = Instant::now();
        let base = Rect::new(50.0, 50.0, 20.0, 30.0);

        stabilizer.on_sample(&config, &sample(base), t0);
        let after_warm_up = t0 + config.camera_warm_up;
        // A burst of events 10ms apart must collapse to a single sample.
        for i in 1..5 {
            stabilizer.on_sample(
                &config,
                &sample(base),
                after_warm_up + Duration::from_millis(101 + 10 * i),
            );
        }
        assert_eq!(stabilizer.recent_outlines.len(), 1);
    }

    #[test]
    fn warm_up_period_contributes_no_samples() {
        let config = CalibrationConfig::default();
        let mut stabilizer = OutlineStabilizer::new();
        let t0 = Instant::now();
        let base = Rect::new(50.0, 50.0, 20.0, 30.0);

        for i in 0..10 {
            stabilizer.on_sample(&config, &sample(base), t0 + Duration::from_millis(150 * i));
        }
        // 1.5s of events, all within the 2s warm-up offset.
        assert!(stabilizer.recent_outlines.is_empty());
        assert_eq!(stabilizer.outline(), None);
    }

    #[test]
    fn empty_ticks_do_not_poison_the_window() {
        let config = CalibrationConfig::default();
        let mut stabilizer = OutlineStabilizer::new();
        let t0 = Instant::now();
        let base = Rect::new(50.0, 50.0, 20.0, 30.0);

        let mut samples = vec![sample(base); 12];
        samples[3] = RectSample::default();
        let results = replay(&mut stabilizer, &config, t0, &samples);
        assert_eq!(
            *results.last().unwrap(),
            OutlineProgress::Found(base.expand(10.0))
        );
    }
}
