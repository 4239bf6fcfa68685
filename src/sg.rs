//! Scatter-gather array types used by the I/O path.

/// One DMA-mapped extent of an upper-layer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgElem {
    /// Bus address of the extent
    pub ioa: u64,
    /// Length in bytes
    pub len: u32,
}

/// A position inside an SG array: element index plus byte offset within
/// that element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgPosition {
    pub elem: usize,
    pub offset: u32,
}

/// Total byte length covered by an SG array.
pub fn data_len(sg: &[SgElem]) -> u64 {
    sg.iter().map(|e| e.len as u64).sum()
}

/// Locate the element/offset pair `byte_offset` bytes into the array.
///
/// Returns `None` when the offset lies beyond the array. An offset exactly
/// at the end of element `i` resolves to the start of element `i + 1`, so
/// split resumption always lands at offset 0 of an element.
pub fn find_position(sg: &[SgElem], byte_offset: u64) -> Option<SgPosition> {
    let mut remaining = byte_offset;
    for (i, elem) in sg.iter().enumerate() {
        if remaining < elem.len as u64 {
            return Some(SgPosition {
                elem: i,
                offset: remaining as u32,
            });
        }
        remaining -= elem.len as u64;
    }
    None
}
