// Demo runner for the `strandmap` library: calibrates a simulated strand of
// ten lights against a scripted detector feed and stores the resulting layout
// as json. Swap `DemoStrand` for a real driver and the channel for a real
// tracker subscription to calibrate actual hardware.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use strandmap::{
    CalibrationConfig, CalibrationPipeline, Color, LayoutStore, LedLocationMap, LightSink, Rect,
    RectSample,
};
use tokio::sync::mpsc;

/// Simulated strand: remembers which single light is currently lit so the
/// scripted detector can "see" it.
struct DemoStrand {
    num_leds: usize,
    lit: Arc<Mutex<Option<usize>>>,
}

impl LightSink for DemoStrand {
    fn num_leds(&self) -> usize {
        self.num_leds
    }

    fn fill(&mut self, _color: Color) -> anyhow::Result<()> {
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

/// Stores the finalized layout as pretty-printed json.
struct JsonFileStore {
    path: String,
}

impl LayoutStore for JsonFileStore {
    fn store(&mut self, map: &LedLocationMap) -> anyhow::Result<()> {
        let file = std::fs::File::create(&self.path)?;
        serde_json::to_writer_pretty(file, map)?;
        log::info!("layout written to {}", self.path);
        Ok(())
    }
}

/// What the scripted camera reports: with no single light strobed (the whole
/// strand is filled during the outline phase), a stable cluster of bright
/// regions; with one light strobed, a single small region at a position
/// derived from its index.
fn scripted_sample(lit: Option<usize>) -> RectSample {
    match lit {
        None => RectSample::from(vec![
            Rect::new(140.0, 80.0, 40.0, 60.0),
            Rect::new(120.0, 140.0, 80.0, 90.0),
            Rect::new(100.0, 230.0, 120.0, 90.0),
        ]),
        Some(index) => RectSample::from(vec![Rect::new(
            110.0 + 8.0 * index as f64,
            95.0 + 20.0 * index as f64,
            4.0,
            4.0,
        )]),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _logger = flexi_logger::Logger::try_with_env_or_str("info")?.start()?;

    let lit = Arc::new(Mutex::new(None));
    let sink = DemoStrand {
        num_leds: 10,
        lit: Arc::clone(&lit),
    };

    let (tx, mut rx) = mpsc::channel(16);
    let feed = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(Duration::from_millis(30));
        loop {
            ticks.tick().await;
            let sample = scripted_sample(*lit.lock().unwrap());
            if tx.send(sample).await.is_err() {
                break;
            }
        }
    });

    let mut pipeline = CalibrationPipeline::new(CalibrationConfig::default(), sink);
    pipeline.set_status_observer(|status| println!("[status] {status}"));

    let mut store = JsonFileStore {
        path: "strand-layout.json".to_string(),
    };
    let outcome = pipeline.run(&mut rx, Some(&mut store)).await?;

    drop(rx);
    feed.await?;

    println!(
        "outline at ({:.0}, {:.0}) {:.0}x{:.0}",
        outcome.outline.x, outcome.outline.y, outcome.outline.width, outcome.outline.height
    );
    let mut entries: Vec<(usize, &Rect)> = outcome.locations.iter().collect();
    entries.sort_by_key(|(index, _)| *index);
    for (index, rect) in entries {
        println!("led {index:>3} -> ({:.0}, {:.0})", rect.center().0, rect.center().1);
    }
    if !outcome.locations.is_fully_resolved() {
        println!("unresolved: {:?}", outcome.locations.missing());
    }
    Ok(())
}
