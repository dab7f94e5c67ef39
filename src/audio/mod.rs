//! Audio analysis: polling activity detection over media streams.

pub mod activity;

pub use activity::{ActivityEvent, AudioActivityDetector};
