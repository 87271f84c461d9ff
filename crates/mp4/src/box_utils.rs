/// A four character box type code, e.g. `*b"sidx"`.
pub type FourCC = [u8; 4];

/// Parsed view over a single ISOBMFF box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxView {
    pub start: usize,
    pub end: usize,
    pub header_size: usize,
    pub fourcc: FourCC,
}

impl BoxView {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    #[cfg(test)]
    pub(crate) fn body(&self) -> std::ops::Range<usize> {
        self.start + self.header_size..self.end
    }
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`),
/// and box-extends-to-EOF (`size == 0`).
pub(crate) fn read_box_header(data: &[u8]) -> Option<(u64, FourCC, usize)> {
    if data.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: FourCC = [data[4], data[5], data[6], data[7]];

    match size {
        1 => {
            if data.len() < 16 {
                return None;
            }
            let ext_size = u64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]);
            Some((ext_size, fourcc, 16))
        }
        0 => Some((data.len() as u64, fourcc, 8)),
        _ => Some((size, fourcc, 8)),
    }
}

/// Parse a single box located at `offset` within `[0..end)`.
///
/// Returns `None` when the header is truncated or the declared size does not
/// fit inside the parent range.
pub fn box_at(data: &[u8], offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end || end > data.len() {
        return None;
    }

    let (size, fourcc, header_size) = read_box_header(&data[offset..end])?;
    let size = usize::try_from(size).ok()?;

    if size < header_size || size > end - offset {
        return None;
    }

    Some(BoxView {
        start: offset,
        end: offset + size,
        header_size,
        fourcc,
    })
}

/// Iterator over the boxes laid out back to back in a byte range.
///
/// Iteration stops at the first box that cannot be parsed; [`BoxIter::tail`]
/// then reports where the unparseable remainder starts.
#[derive(Debug, Clone)]
pub struct BoxIter<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
    stopped: bool,
}

impl<'a> BoxIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            end: data.len(),
            stopped: false,
        }
    }

    /// Offset of the first byte not covered by a parsed box.
    pub fn tail(&self) -> usize {
        self.offset
    }
}

impl Iterator for BoxIter<'_> {
    type Item = BoxView;

    fn next(&mut self) -> Option<BoxView> {
        if self.stopped {
            return None;
        }

        match box_at(self.data, self.offset, self.end) {
            Some(view) => {
                self.offset = view.end;
                Some(view)
            }
            None => {
                self.stopped = true;
                None
            }
        }
    }
}

/// Iterate over the top-level boxes of `data`.
pub fn top_level_boxes(data: &[u8]) -> BoxIter<'_> {
    BoxIter::new(data)
}

#[cfg(test)]
fn find_first_box(data: &[u8], target: FourCC) -> Option<BoxView> {
    top_level_boxes(data).find(|b| b.fourcc == target)
}

pub fn fourcc_to_string(fourcc: &FourCC) -> String {
    String::from_utf8_lossy(fourcc).into_owned()
}
