//! Removal of top-level boxes from fragment payloads.
//!
//! Fragments of a live fMP4 stream are appended back to back into one file.
//! Some boxes are only valid once per file (`ftyp`) or describe byte offsets
//! that stop being true after concatenation (`sidx`), so they are cut out of
//! the payload before it is written.

use std::borrow::Cow;

use tracing::trace;

use crate::box_utils::{FourCC, fourcc_to_string, top_level_boxes};

/// Segment index box.
pub const SIDX: FourCC = *b"sidx";
/// File type box.
pub const FTYP: FourCC = *b"ftyp";

/// Remove every top-level box whose type is in `names`.
///
/// Boxes are only recognised while the top-level layout parses cleanly. Any
/// trailing bytes that do not form a valid box are kept verbatim. When nothing
/// matches, the input is returned borrowed.
pub fn strip_boxes<'a>(data: &'a [u8], names: &[FourCC]) -> Cow<'a, [u8]> {
    if names.is_empty() {
        return Cow::Borrowed(data);
    }

    let mut removed = Vec::new();
    for view in top_level_boxes(data) {
        if names.contains(&view.fourcc) {
            trace!(
                fourcc = %fourcc_to_string(&view.fourcc),
                offset = view.start,
                size = view.size(),
                "Stripping box"
            );
            removed.push(view.start..view.end);
        }
    }

    if removed.is_empty() {
        return Cow::Borrowed(data);
    }

    let cut: usize = removed.iter().map(|r| r.len()).sum();
    let mut out = Vec::with_capacity(data.len() - cut);
    let mut cursor = 0;
    for range in removed {
        out.extend_from_slice(&data[cursor..range.start]);
        cursor = range.end;
    }
    out.extend_from_slice(&data[cursor..]);

    Cow::Owned(out)
}

/// Boxes to strip from a fragment before appending it to a concatenated file.
///
/// The first fragment written keeps its `ftyp`; every fragment loses `sidx`.
pub fn boxes_to_strip(is_first_fragment: bool) -> &'static [FourCC] {
    if is_first_fragment {
        &[SIDX]
    } else {
        &[SIDX, FTYP]
    }
}
