//! Shared fMP4 test builders.
//!
//! This module is available for local mp4 tests and optionally for downstream
//! crate tests when the `test-utils` feature is enabled.

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

/// A live fragment as served by fragmented DASH origins:
/// `ftyp`, `sidx`, `moof`, `mdat`, with `payload` as the mdat body.
pub fn make_media_fragment(payload: &[u8]) -> Vec<u8> {
    let mut out = make_box(b"ftyp", b"dashiso6");
    out.extend_from_slice(&make_box(b"sidx", &[0u8; 24]));
    out.extend_from_slice(&make_box(b"moof", &make_box(b"mfhd", &[0u8; 8])));
    out.extend_from_slice(&make_box(b"mdat", payload));
    out
}
