// THEORY:
// This file is the main entry point for the `strandmap` library crate. It
// defines the public API exposed to external consumers (UI screens, layout
// renderers, lighting effects): the `CalibrationPipeline` plus the data types
// that cross its boundary. The engine internals live in `core_modules` and
// stay behind this surface.

pub mod core_modules;
pub mod pipeline;

pub use crate::core_modules::clock::{Clock, SystemClock};
pub use crate::core_modules::geometry::{Rect, RectSample};
pub use crate::core_modules::led_locator::{LedLocationMap, LedLocator, LocatorProgress};
pub use crate::core_modules::light_sink::{Color, LightSink};
pub use crate::core_modules::outline_stabilizer::{OutlineProgress, OutlineStabilizer};
pub use crate::pipeline::{
    CalibrationConfig, CalibrationError, CalibrationOutcome, CalibrationPipeline,
    CalibrationStatus, LayoutStore,
};
