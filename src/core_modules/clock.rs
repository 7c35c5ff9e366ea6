// THEORY:
// Both calibration state machines are timing-sensitive: warm-up offsets,
// sample-rate throttling, dwell windows. Reading the wall clock inside the
// machines would make every transition untestable without real delays, so the
// current time is injected instead. The pipeline stamps each detector event
// with `Clock::now` before handing it to the synchronous handlers; tests hand
// in fabricated `Instant`s and replay whole runs instantly.

use std::time::Instant;

/// Source of the current time for the calibration run.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// The production clock: plain monotonic wall time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
