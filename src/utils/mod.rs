//! Shared types and helpers

pub mod helpers;
pub mod types;

pub use helpers::{Clock, ManualClock, SystemClock};
