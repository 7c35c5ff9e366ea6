pub mod clock;
pub mod geometry;
pub mod led_locator;
pub mod light_sink;
pub mod outline_stabilizer;
