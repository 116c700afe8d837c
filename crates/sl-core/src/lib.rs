//! sl-core: Shared types for the Syncline transport engine
//!
//! This crate provides the foundational types used across all Syncline
//! crates: frame-domain time, SMPTE timecode, and the common error type.

mod error;
mod time;
mod timecode;

pub use error::*;
pub use time::*;
pub use timecode::*;
