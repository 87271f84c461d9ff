//! Minimal ISOBMFF helpers for concatenating live fMP4 fragments.

pub mod box_utils;
pub mod strip;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use box_utils::{BoxIter, BoxView, FourCC, box_at, top_level_boxes};
pub use strip::{FTYP, SIDX, boxes_to_strip, strip_boxes};
