// End-to-end coverage of the calibration engine. The deterministic tests
// replay fabricated timelines straight through the synchronous handlers, so a
// whole multi-pass run executes in microseconds; the async tests exercise the
// pipeline's channel plumbing with thresholds collapsed to zero.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strandmap::{
    CalibrationConfig, CalibrationError, CalibrationPipeline, CalibrationStatus, Clock, Color,
    LedLocator, LightSink, LocatorProgress, OutlineProgress, OutlineStabilizer, Rect, RectSample,
};
use tokio::sync::mpsc;

/// Sink whose lit light is visible to the scripted detector. Fill colors are
/// recorded so tests can check the strand was lit for the outline phase.
#[derive(Clone)]
struct SharedStrand {
    num_leds: usize,
    lit: Arc<Mutex<Option<usize>>>,
    fills: Arc<Mutex<Vec<Color>>>,
}

impl SharedStrand {
    fn new(num_leds: usize) -> Self {
        Self {
            num_leds,
            lit: Arc::new(Mutex::new(None)),
            fills: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl LightSink for SharedStrand {
    fn num_leds(&self) -> usize {
        self.num_leds
    }
    fn fill(&mut self, color: Color) -> anyhow::Result<()> {
        self.fills.lock().unwrap().push(color);
        *self.lit.lock().unwrap() = None;
        Ok(())
    }
    fn set_led(&mut self, index: usize, _color: Color) -> anyhow::Result<()> {
        *self.lit.lock().unwrap() = Some(index);
        Ok(())
    }
    fn clear(&mut self) -> anyhow::Result<()> {
        *self.lit.lock().unwrap() = None;
        Ok(())
    }
}

/// Clock that advances by a fixed step on every read. Channel-driven runs see
/// one tick per detector event and play out in virtual time, so the default
/// warm-up and dwell thresholds work without any real waiting.
struct StepClock {
    now: Mutex<Instant>,
    step: Duration,
}

impl StepClock {
    fn new(step: Duration) -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            step,
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> Instant {
        let mut now = self.now.lock().unwrap();
        let current = *now;
        *now += self.step;
        current
    }
}

/// The position the synthetic detector reports for a given light index.
fn rect_at(index: usize) -> Rect {
    Rect::new(8.0 + 6.0 * index as f64, 5.0 + 8.0 * index as f64, 2.0, 2.0)
}

#[test]
fn full_run_replayed_through_the_synchronous_handlers() {
    let config = CalibrationConfig::default();
    let mut now = Instant::now();

    // Phase one: the whole strand is bright and the detector reports a steady
    // cluster, so the outline stabilizes on its union.
    let cluster = vec![
        Rect::new(20.0, 10.0, 30.0, 30.0),
        Rect::new(15.0, 45.0, 50.0, 40.0),
    ];
    let mut stabilizer = OutlineStabilizer::new();
    let mut outline = None;
    stabilizer.on_sample(&config, &RectSample::from(cluster.clone()), now);
    for _ in 0..40 {
        now += Duration::from_millis(101);
        if let OutlineProgress::Found(found) =
            stabilizer.on_sample(&config, &RectSample::from(cluster.clone()), now)
        {
            outline = Some(found);
            break;
        }
    }
    let outline = outline.expect("outline never stabilized");
    // Union of the cluster is (15, 10) to (65, 85), expanded by 10 and
    // clamped at the origin.
    assert_eq!(outline, Rect::new(5.0, 0.0, 70.0, 95.0));

    // Phase two: strobe through all ten lights against the same timeline.
    let mut sink = SharedStrand::new(10);
    let mut locator = LedLocator::new(outline, 10);
    locator.start(&config, &mut sink, now).unwrap();
    for _ in 0..20_000 {
        now += Duration::from_millis(60);
        let lit = sink.lit.lock().unwrap().expect("a light should be lit");
        let sample = RectSample::from(vec![rect_at(lit)]);
        if locator.on_sample(&config, &mut sink, &sample, now).unwrap() == LocatorProgress::Done {
            break;
        }
    }

    assert!(locator.is_done());
    let map = locator.into_locations();
    assert!(map.is_fully_resolved());
    for i in 0..10 {
        let rect = map.get(i).unwrap();
        let expected = rect_at(i);
        assert!((rect.x - expected.x).abs() <= 1.0);
        assert!((rect.y - expected.y).abs() <= 1.0);
    }
}

#[test]
fn locator_matches_synthetic_offsets_in_fixed_outline() {
    // The outline is already known; the detector echoes one rectangle at an
    // offset proportional to the lit index for every dwell.
    let config = CalibrationConfig::default();
    let outline = Rect::new(0.0, 0.0, 100.0, 100.0);
    let mut sink = SharedStrand::new(10);
    let mut locator = LedLocator::new(outline, 10);

    let mut now = Instant::now();
    locator.start(&config, &mut sink, now).unwrap();
    while !locator.is_done() {
        now += Duration::from_millis(60);
        let lit = sink.lit.lock().unwrap().expect("a light should be lit");
        let sample = RectSample::from(vec![rect_at(lit)]);
        locator.on_sample(&config, &mut sink, &sample, now).unwrap();
    }

    let map = locator.into_locations();
    assert_eq!(map.resolved_count(), 10);
    assert!(map.missing().is_empty());
    for i in 0..10 {
        let rect = map.get(i).unwrap();
        let expected = rect_at(i);
        assert!((rect.x - expected.x).abs() <= 1.0);
        assert!((rect.y - expected.y).abs() <= 1.0);
    }
}

/// Thresholds collapsed to zero for the error-path and abort tests, none of
/// which accumulate outline samples. A zero stability-check interval starves
/// the stability window, so full runs use `StepClock` with real thresholds.
fn instant_config() -> CalibrationConfig {
    CalibrationConfig {
        camera_warm_up: Duration::ZERO,
        min_sample_interval: Duration::ZERO,
        stability_check_interval: Duration::ZERO,
        settle_time: Duration::ZERO,
        max_time_per_led: Duration::ZERO,
        min_samples_per_led: 0,
        start_index: 0,
        ..CalibrationConfig::default()
    }
}

#[tokio::test]
async fn pipeline_completes_against_scripted_feed() {
    let sink = SharedStrand::new(10);
    let lit = Arc::clone(&sink.lit);
    let fills = Arc::clone(&sink.fills);
    let (tx, mut rx) = mpsc::channel(1);

    // The feed budget is generous but finite: a pipeline that stops making
    // progress runs out of events and fails instead of hanging the test.
    let feed = tokio::spawn(async move {
        for _ in 0..5_000 {
            let sample = match *lit.lock().unwrap() {
                None => RectSample::from(vec![Rect::new(10.0, 10.0, 60.0, 70.0)]),
                Some(index) => RectSample::from(vec![rect_at(index)]),
            };
            if tx.send(sample).await.is_err() {
                break;
            }
        }
    });

    // One 101ms virtual tick per event clears the sample throttle; warm-up,
    // stability checking and dwell advancement all run on the default config.
    let config = CalibrationConfig::default();
    let outline_color = config.outline_color;
    let mut pipeline =
        CalibrationPipeline::with_clock(config, sink, StepClock::new(Duration::from_millis(101)));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&statuses);
    pipeline.set_status_observer(move |status| seen.lock().unwrap().push(status.clone()));

    let outcome = pipeline.run(&mut rx, None).await.unwrap();
    drop(rx);
    feed.await.unwrap();

    assert_eq!(outcome.outline, Rect::new(0.0, 0.0, 80.0, 90.0));
    assert_eq!(outcome.locations.num_leds(), 10);
    assert!(matches!(
        pipeline.status(),
        CalibrationStatus::Complete {
            resolved: 10,
            total: 10
        }
    ));
    let statuses = statuses.lock().unwrap();
    assert!(statuses.contains(&CalibrationStatus::FindingOutline));
    assert!(statuses.contains(&CalibrationStatus::LocatingLeds));
    // The strand was filled exactly once for the outline phase and is dark
    // again after the run.
    assert_eq!(*fills.lock().unwrap(), vec![outline_color]);
    let strand = pipeline.into_sink();
    assert_eq!(*strand.lit.lock().unwrap(), None);
}

#[tokio::test]
async fn closed_feed_during_outline_phase_is_an_error() {
    let (tx, mut rx) = mpsc::channel::<RectSample>(1);
    drop(tx);
    let mut pipeline = CalibrationPipeline::new(instant_config(), SharedStrand::new(10));
    let result = pipeline.run_outline_calibration(&mut rx).await;
    assert!(matches!(result, Err(CalibrationError::DetectorClosed)));
}

#[tokio::test]
async fn closed_feed_during_led_phase_yields_partial_map() {
    let sink = SharedStrand::new(50);
    let lit = Arc::clone(&sink.lit);
    let (tx, mut rx) = mpsc::channel(1);

    // A handful of events, then the feed dies mid-run.
    tokio::spawn(async move {
        for _ in 0..10 {
            let sample = match *lit.lock().unwrap() {
                None => RectSample::default(),
                Some(index) => RectSample::from(vec![rect_at(index % 10)]),
            };
            if tx.send(sample).await.is_err() {
                break;
            }
        }
    });

    let mut pipeline = CalibrationPipeline::new(instant_config(), sink);
    let outline = Rect::new(0.0, 0.0, 100.0, 100.0);
    let map = pipeline.run_led_calibration(outline, &mut rx).await.unwrap();

    // Far fewer events than lights: the run was aborted, the partial map is
    // still intact and the strand is dark.
    assert!(map.resolved_count() <= 10);
    let strand = pipeline.into_sink();
    assert_eq!(*strand.lit.lock().unwrap(), None);
}

#[tokio::test]
async fn zero_led_sink_is_rejected_before_any_strobe() {
    let (_tx, mut rx) = mpsc::channel::<RectSample>(1);
    let mut pipeline = CalibrationPipeline::new(instant_config(), SharedStrand::new(0));
    let outline = Rect::new(0.0, 0.0, 100.0, 100.0);
    let result = pipeline.run_led_calibration(outline, &mut rx).await;
    assert!(matches!(result, Err(CalibrationError::NoLeds)));
}
