//! The `spectrometer` module is the application served over the broker.
//!
//! - `composition`: per-grade element ranges and where they come from.
//! - `reading`: the randomized reading generator.
//! - `device`: the `Spectrometer` state and its control handling.

pub mod composition;
pub mod device;
pub mod reading;

pub use composition::{CompositionRange, CompositionSource, StaticCompositionSource};
pub use device::{Spectrometer, SpectrometerConfig};
pub use reading::{Reading, ReadingGenerator};
