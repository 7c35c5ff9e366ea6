// THEORY:
// The `light_sink` module is the seam between the calibration engine and the
// LED hardware collaborator. The engine never talks to a driver directly; it
// only needs three operations, so they are expressed as a trait and the run is
// generic over it. Drivers are free to be asynchronous internally as long as a
// strobe becomes visible to the camera within the configured settle window.
//
// Transport failures (driver gone, serial port unplugged) are the one class of
// error the engine treats as fatal: they surface through `anyhow::Result` and
// abort the run rather than being retried.

/// A packed RGB color, `0xRRGGBB`.
pub type Color = u32;

/// Control surface of the addressable LED strand.
pub trait LightSink {
    /// Number of individually addressable lights on the strand.
    fn num_leds(&self) -> usize;

    /// Lights the entire strand at `color`. The outline phase runs with the
    /// strand filled so the camera sees the whole silhouette at once.
    fn fill(&mut self, color: Color) -> anyhow::Result<()>;

    /// Lights exactly one index at `color` and blanks every other light.
    /// Indexes outside `[0, num_leds)` are a caller bug.
    fn set_led(&mut self, index: usize, color: Color) -> anyhow::Result<()>;

    /// Turns every light off.
    fn clear(&mut self) -> anyhow::Result<()>;
}
