// THEORY:
// The `pipeline` module is the top-level API for the calibration engine. It
// owns the two state machines, sequences them (outline first, then lights),
// and is the only place that touches the detector subscription, the light
// sink, and the clock together. Everything underneath is synchronous and
// event-driven; the pipeline's async run loop exists purely to serialize
// detector events from the channel onto those synchronous handlers, so there
// is never concurrent mutation of run state.
//
// Explicit construction only: a run owns its stabilizer and locator instances,
// and owns the sink exclusively while active. There are no process-wide
// singletons. Aborting a run is done by closing the detector channel; the
// locator's partially built map survives the abort.

use crate::core_modules::clock::{Clock, SystemClock};
use crate::core_modules::geometry::{Rect, RectSample};
use crate::core_modules::led_locator::{LedLocationMap, LedLocator, LocatorProgress};
use crate::core_modules::light_sink::{Color, LightSink};
use crate::core_modules::outline_stabilizer::{OutlineProgress, OutlineStabilizer};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Configuration for a calibration run, allowing for tunable behavior.
/// Defaults reproduce the values the engine was tuned with on a real tree.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// How long to distrust the camera after a phase starts, while automatic
    /// exposure settles.
    pub camera_warm_up: Duration,
    /// Minimum spacing between accepted outline samples.
    pub min_sample_interval: Duration,
    /// How long an outline attempt accumulates before checking for consensus.
    pub stability_check_interval: Duration,
    /// Number of consecutive outline samples that must agree.
    pub stability_window: usize,
    /// Corner-distance tolerance for two outline samples to agree, in pixels.
    pub similarity_threshold_px: f64,
    /// Outlier rejection threshold for per-tick outline aggregation, in
    /// standard deviations.
    pub outline_outlier_std_devs: f64,
    /// Breathing room added around the stabilized outline, in pixels.
    pub outline_margin_px: f64,
    /// Index of the first light strobed (reduced modulo the strand length).
    pub start_index: usize,
    /// Color the whole strand is filled at while the outline is discovered.
    pub outline_color: Color,
    /// Color each light is strobed at while being located.
    pub marker_color: Color,
    /// Observations earlier than this after a strobe are discarded.
    pub settle_time: Duration,
    /// Maximum dwell on a single light before advancing.
    pub max_time_per_led: Duration,
    /// A dwell must collect strictly more than this many detection ticks
    /// before it may advance.
    pub min_samples_per_led: u32,
    /// How far an early pass skips ahead from an unresolved light.
    pub coarse_stride: usize,
    /// Number of leading passes that use the coarse stride.
    pub coarse_pass_limit: u32,
    /// Total pass budget for a run.
    pub max_passes: u32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            camera_warm_up: Duration::from_millis(2000),
            min_sample_interval: Duration::from_millis(100),
            stability_check_interval: Duration::from_millis(1000),
            stability_window: 5,
            similarity_threshold_px: 5.0,
            outline_outlier_std_devs: 2.5,
            outline_margin_px: 10.0,
            start_index: 20,
            outline_color: 0x7d1a16,
            marker_color: 0xff0000,
            settle_time: Duration::from_millis(100),
            max_time_per_led: Duration::from_millis(250),
            min_samples_per_led: 3,
            coarse_stride: 5,
            coarse_pass_limit: 2,
            max_passes: 4,
        }
    }
}

/// Human-readable phase status of a calibration run.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStatus {
    Idle,
    FindingOutline,
    OutlineUnstable,
    OutlineFound(Rect),
    LocatingLeds,
    Complete { resolved: usize, total: usize },
}

impl fmt::Display for CalibrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationStatus::Idle => write!(f, "idle"),
            CalibrationStatus::FindingOutline => write!(f, "finding outline"),
            CalibrationStatus::OutlineUnstable => write!(f, "outline was not stable, retrying"),
            CalibrationStatus::OutlineFound(_) => write!(f, "outline found"),
            CalibrationStatus::LocatingLeds => write!(f, "locating lights"),
            CalibrationStatus::Complete { resolved, total } => {
                write!(f, "calibration complete with {resolved}/{total} lights resolved")
            }
        }
    }
}

/// Hard failures that abort a run. Everything recoverable (noise, unstable
/// windows, unresolved lights) is handled inside the state machines and
/// surfaces as status, not as an error.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// The detector feed closed before an outline stabilized.
    #[error("detector feed ended before the outline stabilized")]
    DetectorClosed,
    /// The hardware collaborator reports a strand with no lights.
    #[error("light sink reports zero addressable leds")]
    NoLeds,
    /// The light collaborator became unavailable mid-run.
    #[error("light collaborator failed: {0}")]
    Sink(#[from] anyhow::Error),
    /// The persistence collaborator rejected the finalized map.
    #[error("layout store failed: {0}")]
    Store(#[source] anyhow::Error),
}

/// Persistence hook handed the finalized map. The storage format is the
/// implementer's business.
pub trait LayoutStore {
    fn store(&mut self, map: &LedLocationMap) -> anyhow::Result<()>;
}

/// The product of a full calibration run.
#[derive(Debug, Clone)]
pub struct CalibrationOutcome {
    pub outline: Rect,
    pub locations: LedLocationMap,
}

/// The main, top-level struct for the calibration engine.
///
/// Owns the light sink for the duration of a run and consumes detector events
/// from an `mpsc` channel; dropping the sender aborts the run.
pub struct CalibrationPipeline<S: LightSink, C: Clock = SystemClock> {
    config: CalibrationConfig,
    sink: S,
    clock: C,
    status: CalibrationStatus,
    on_status: Option<Box<dyn FnMut(&CalibrationStatus) + Send>>,
}

impl<S: LightSink> CalibrationPipeline<S, SystemClock> {
    pub fn new(config: CalibrationConfig, sink: S) -> Self {
        Self::with_clock(config, sink, SystemClock)
    }
}

impl<S: LightSink, C: Clock> CalibrationPipeline<S, C> {
    /// Builds a pipeline around an injected time source. Production code uses
    /// `new`; tests replay recorded timelines through this.
    pub fn with_clock(config: CalibrationConfig, sink: S, clock: C) -> Self {
        Self {
            config,
            sink,
            clock,
            status: CalibrationStatus::Idle,
            on_status: None,
        }
    }

    /// Registers an observer notified on every phase-status change.
    pub fn set_status_observer<F>(&mut self, observer: F)
    where
        F: FnMut(&CalibrationStatus) + Send + 'static,
    {
        self.on_status = Some(Box::new(observer));
    }

    pub fn status(&self) -> &CalibrationStatus {
        &self.status
    }

    /// Gives the sink back once the pipeline is no longer needed.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Runs the full calibration: outline stabilization, then light location,
    /// then the optional persistence hook.
    pub async fn run(
        &mut self,
        samples: &mut mpsc::Receiver<RectSample>,
        store: Option<&mut dyn LayoutStore>,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        let outline = self.run_outline_calibration(samples).await?;
        let locations = self.run_led_calibration(outline, samples).await?;
        if let Some(store) = store {
            store.store(&locations).map_err(CalibrationError::Store)?;
        }
        Ok(CalibrationOutcome { outline, locations })
    }

    /// Fills the strand so the whole silhouette is visible, then consumes
    /// detector events until the object outline stabilizes.
    ///
    /// Retries indefinitely on unstable windows; the only failure is the feed
    /// closing, which is also how a caller aborts this phase.
    pub async fn run_outline_calibration(
        &mut self,
        samples: &mut mpsc::Receiver<RectSample>,
    ) -> Result<Rect, CalibrationError> {
        self.set_status(CalibrationStatus::FindingOutline);
        self.sink.fill(self.config.outline_color)?;
        let mut stabilizer = OutlineStabilizer::new();
        while let Some(sample) = samples.recv().await {
            let now = self.clock.now();
            match stabilizer.on_sample(&self.config, &sample, now) {
                OutlineProgress::Accumulating => {}
                OutlineProgress::Unstable => {
                    self.set_status(CalibrationStatus::OutlineUnstable);
                }
                OutlineProgress::Found(outline) => {
                    self.set_status(CalibrationStatus::OutlineFound(outline));
                    return Ok(outline);
                }
            }
        }
        Err(CalibrationError::DetectorClosed)
    }

    /// Strobes each light in turn and consumes detector events until the pass
    /// budget is spent or the feed closes.
    ///
    /// A closed feed is an abort: the strand is darkened and whatever was
    /// resolved so far is returned. Partial maps are a valid outcome either
    /// way; unresolved lights are reported through `LedLocationMap::missing`.
    pub async fn run_led_calibration(
        &mut self,
        outline: Rect,
        samples: &mut mpsc::Receiver<RectSample>,
    ) -> Result<LedLocationMap, CalibrationError> {
        let num_leds = self.sink.num_leds();
        if num_leds == 0 {
            return Err(CalibrationError::NoLeds);
        }

        self.set_status(CalibrationStatus::LocatingLeds);
        let mut locator = LedLocator::new(outline, num_leds);
        locator.start(&self.config, &mut self.sink, self.clock.now())?;

        while let Some(sample) = samples.recv().await {
            let now = self.clock.now();
            if locator.on_sample(&self.config, &mut self.sink, &sample, now)?
                == LocatorProgress::Done
            {
                break;
            }
        }
        if !locator.is_done() {
            log::info!(
                "detector feed closed mid-run, keeping {} resolved locations",
                locator.locations().resolved_count()
            );
            self.sink.clear()?;
        }

        let map = locator.into_locations();
        self.set_status(CalibrationStatus::Complete {
            resolved: map.resolved_count(),
            total: map.num_leds(),
        });
        Ok(map)
    }

    fn set_status(&mut self, status: CalibrationStatus) {
        log::info!("{status}");
        if let Some(observer) = self.on_status.as_mut() {
            observer(&status);
        }
        self.status = status;
    }
}
