// IR/visible fusion pipeline core
//
// Fuses a low-resolution infrared frame with a high-resolution visible
// frame into a single image emphasizing hot/bright targets against the
// visible background. This crate is the hard-engineering core only:
// capture (UDP IR reception, RTSP/H.264 visible decode), display, and
// argument parsing are out of scope and live in the caller.
pub mod background;
pub mod bezier;
pub mod clahe;
pub mod compositor;
pub mod config;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod pixel;
pub mod quadtree;
pub mod registration;

pub use config::{FusionStyle, Options, QuadtreeThresholds, RawFormat, Resolution};
pub use error::FusionError;
pub use pipeline::{FusionPipeline, RegistrationCache};
