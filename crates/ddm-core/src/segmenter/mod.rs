//! Range math and segment planning.
//!
//! Splits a download into N segments and computes HTTP Range header bounds.
//! Per-segment completion is tracked by `part::PartInfo` against the actual
//! on-disk part file size, not a separate bitmap.

mod range;

pub use range::{plan_segments, Segment};
