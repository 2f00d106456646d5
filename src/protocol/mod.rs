//! Stove protocol handling.
//!
//! Parsing of the comma-delimited reply frames and the settings paths used
//! for writes. Transport of the frames is left to a [`crate::StoveTransport`].

pub mod commands;
pub mod frames;

pub use commands::StoveCommand;
pub use frames::{FrameLayout, NetworkInfo, StatusFrame};
