//! callcore Types
//!
//! Signaling schemas exchanged with the host's messaging layer, plus the
//! identifiers shared by every callcore crate.

pub mod signaling;
pub mod error;

pub use signaling::*;
pub use error::*;
