//! MPEG-DASH manifest handling.
//!
//! Only the parts of a manifest needed to address segments are kept: representations
//! using `SegmentTemplate`, optionally with a `SegmentTimeline` describing the live window.

mod manifest;
mod representation;
pub mod template;
mod url;

pub use manifest::*;
pub use representation::*;

#[cfg(test)]
pub(crate) use representation::tests;
