// THEORY:
// The `LedLocator` is the heart of the calibration engine. With the outline
// frozen, it walks the strand one light at a time: strobe a single index at
// the marker color, dwell on it while the detector reports candidate
// rectangles, keep the best observation, advance. Because exactly one genuine
// light is ever lit, any candidate inside the outline is attributed to the
// current index; anything outside the outline is reflections or room light and
// is discarded unseen.
//
// Key architectural principles:
// 1.  **One Dwell, One Index**: observations only ever bind to the currently
//     strobed index. The per-dwell settle filter discards ticks captured
//     before the camera could possibly have seen the new strobe.
// 2.  **Adaptive Passes**: the first sweeps are coarse. A light that fails to
//     resolve is not worth stalling on while its neighbors are easy wins, so
//     early passes skip ahead by a stride when the current light stays
//     unresolved. Later passes creep index by index to mop up the misses.
// 3.  **Progress-Gated Termination**: the run wraps into another pass only
//     while the pass budget holds AND the pass just completed observed at
//     least one light. A full pass with zero observations means the remaining
//     lights are hidden (behind the trunk, dead, out of frame) and more passes
//     would only repeat the failure. Unresolved lights stay absent from the
//     map; a partial map is a reported outcome, not an error.
// 4.  **Eager Commitment**: observations are written into the map as they
//     arrive, newest wins within a dwell. Aborting mid-dwell therefore always
//     leaves a coherent, discoverable map.

use crate::core_modules::geometry::{Rect, RectSample};
use crate::core_modules::light_sink::LightSink;
use crate::pipeline::CalibrationConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Outcome of feeding one detector event to the locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorProgress {
    /// Still dwelling on some light.
    Searching,
    /// Every pass is spent; the map is frozen.
    Done,
}

/// The calibration product: light index to camera-space rectangle.
///
/// Entries only exist for resolved lights; `missing` lists the rest. Re-runs
/// of an index overwrite its entry, they never accumulate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedLocationMap {
    num_leds: usize,
    locations: HashMap<usize, Rect>,
}

impl LedLocationMap {
    pub fn new(num_leds: usize) -> Self {
        Self {
            num_leds,
            locations: HashMap::new(),
        }
    }

    /// Records a location for `index`, returning whether it was stored.
    /// Zero-area rectangles are never stored.
    fn insert(&mut self, index: usize, rect: Rect) -> bool {
        if rect.is_empty() {
            return false;
        }
        self.locations.insert(index, rect);
        true
    }

    pub fn num_leds(&self) -> usize {
        self.num_leds
    }

    pub fn get(&self, index: usize) -> Option<&Rect> {
        self.locations.get(&index)
    }

    pub fn is_resolved(&self, index: usize) -> bool {
        self.locations.contains_key(&index)
    }

    pub fn resolved_count(&self) -> usize {
        self.locations.len()
    }

    pub fn is_fully_resolved(&self) -> bool {
        self.locations.len() == self.num_leds
    }

    /// Indices that never resolved, in ascending order.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.num_leds)
            .filter(|i| !self.locations.contains_key(i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Rect)> {
        self.locations.iter().map(|(i, r)| (*i, r))
    }
}

/// State machine that strobes one light at a time and accumulates the
/// index-to-location map across adaptive passes.
pub struct LedLocator {
    /// The frozen silhouette; candidates outside it are noise.
    outline: Rect,
    num_leds: usize,
    current_index: usize,
    /// Zero-based pass counter.
    pass_count: u32,
    /// Detection ticks accepted during the current dwell.
    samples_this_led: u32,
    /// Whether the current dwell has committed an observation yet.
    committed_this_dwell: bool,
    /// Dwells that committed an observation during the current pass. The pass
    /// budget only continues while this stays positive: a sweep that observes
    /// nothing at all means the remaining lights are simply not visible.
    found_this_pass: u32,
    /// When the current light was strobed. Offset into the future for the
    /// very first light to absorb camera warm-up.
    strobed_at: Option<Instant>,
    done: bool,
    locations: LedLocationMap,
}

impl LedLocator {
    pub fn new(outline: Rect, num_leds: usize) -> Self {
        Self {
            outline,
            num_leds,
            current_index: 0,
            pass_count: 0,
            samples_this_led: 0,
            committed_this_dwell: false,
            found_this_pass: 0,
            strobed_at: None,
            done: num_leds == 0,
            locations: LedLocationMap::new(num_leds),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn pass_count(&self) -> u32 {
        self.pass_count
    }

    pub fn locations(&self) -> &LedLocationMap {
        &self.locations
    }

    /// Freezes and yields whatever has been resolved so far. Valid at any
    /// point, including after an abort mid-dwell.
    pub fn into_locations(self) -> LedLocationMap {
        self.locations
    }

    /// Clears the strand and strobes the starting light.
    ///
    /// The starting offset deliberately lands partway along the strand: the
    /// lowest indices sit near the power feed where wiring and trunk overlap
    /// make misses likeliest, and early passes should bank easy finds first.
    pub fn start<S: LightSink>(
        &mut self,
        config: &CalibrationConfig,
        sink: &mut S,
        now: Instant,
    ) -> anyhow::Result<()> {
        sink.clear()?;
        if self.done {
            return Ok(());
        }
        self.current_index = config.start_index % self.num_leds;
        sink.set_led(self.current_index, config.marker_color)?;
        // Only the very first strobe carries the warm-up offset.
        self.strobed_at = Some(now + config.camera_warm_up);
        self.samples_this_led = 0;
        self.committed_this_dwell = false;
        log::info!(
            "locating {} leds, starting at index {}",
            self.num_leds,
            self.current_index
        );
        Ok(())
    }

    /// Feeds one detector event, stamped with the injected current time.
    pub fn on_sample<S: LightSink>(
        &mut self,
        config: &CalibrationConfig,
        sink: &mut S,
        sample: &RectSample,
        now: Instant,
    ) -> anyhow::Result<LocatorProgress> {
        if self.done {
            return Ok(LocatorProgress::Done);
        }
        let Some(strobed_at) = self.strobed_at else {
            return Ok(LocatorProgress::Searching);
        };

        let dwell = now.saturating_duration_since(strobed_at);
        if dwell < config.settle_time {
            // The camera cannot have seen this strobe yet.
            return Ok(LocatorProgress::Searching);
        }
        self.samples_this_led += 1;

        let mut candidates = sample
            .rects
            .iter()
            .filter(|rect| !rect.is_empty() && self.outline.contains(rect));
        if let Some(observation) = candidates.next() {
            let extras = candidates.count();
            if extras > 0 {
                // Exactly one light is lit, so multiple survivors inside the
                // outline must be detection noise. First match wins.
                log::warn!(
                    "led {}: {} extra candidates inside outline, keeping the first",
                    self.current_index,
                    extras
                );
            }
            // Newest observation wins within a dwell.
            if self.locations.insert(self.current_index, *observation)
                && !self.committed_this_dwell
            {
                self.committed_this_dwell = true;
                self.found_this_pass += 1;
            }
        }

        if dwell > config.max_time_per_led && self.samples_this_led > config.min_samples_per_led {
            self.advance(config, sink, now)?;
        }
        Ok(if self.done {
            LocatorProgress::Done
        } else {
            LocatorProgress::Searching
        })
    }

    /// Moves to the next light, wraps into a new pass, or finishes the run.
    fn advance<S: LightSink>(
        &mut self,
        config: &CalibrationConfig,
        sink: &mut S,
        now: Instant,
    ) -> anyhow::Result<()> {
        let coarse = !self.locations.is_resolved(self.current_index)
            && self.pass_count < config.coarse_pass_limit;
        let stride = if coarse { config.coarse_stride } else { 1 };
        let next = self.current_index + stride;

        if next >= self.num_leds {
            let more_passes_allowed = self.pass_count + 1 < config.max_passes;
            if more_passes_allowed && self.found_this_pass > 0 && !self.locations.is_fully_resolved()
            {
                self.pass_count += 1;
                log::info!(
                    "pass {} starting with {}/{} leds resolved",
                    self.pass_count,
                    self.locations.resolved_count(),
                    self.num_leds
                );
                self.found_this_pass = 0;
                self.current_index = 0;
            } else {
                return self.finish(sink);
            }
        } else {
            self.current_index = next;
        }

        sink.set_led(self.current_index, config.marker_color)?;
        self.strobed_at = Some(now);
        self.samples_this_led = 0;
        self.committed_this_dwell = false;
        Ok(())
    }

    /// Freezes the map and darkens the strand.
    fn finish<S: LightSink>(&mut self, sink: &mut S) -> anyhow::Result<()> {
        self.done = true;
        self.strobed_at = None;
        sink.clear()?;
        log::info!(
            "led location pass budget spent: {}/{} resolved, missing {:?}",
            self.locations.resolved_count(),
            self.num_leds,
            self.locations.missing()
        );
        Ok(())
    }
}
