//! # Physical-segment tables
//!
//! Every buffer, whatever backend produced it, is described by an ordered
//! list of `(device address, length)` segments. Physically adjacent runs are
//! always coalesced while the table is built, so `segment_count() == 1` is
//! the contiguity test that mapping and cache setup rely on.
//!
//! ```text
//! pages:     F     F+1   F+3
//!          +-----+-----+     +-----+
//!          |     |     |     |     |
//!          +-----+-----+     +-----+
//! table:   [ {F, 2 pages}  ] [ {F+3, 1 page} ]
//! ```
//!
//! Only the first segment may start inside a page (imports of unaligned user
//! buffers); only the last may end inside one.

use crate::error::{Result, VidMemError};
use crate::translate::AddressTranslation;
use alloc::vec::Vec;
use npu_memory_addresses::{
    DeviceAddress, PAGE_SIZE, PageFrameNumber, PhysicalAddress, Size4K, align_up, fits_dma32,
    pages_for,
};

/// One physically contiguous run.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub address: DeviceAddress,
    pub len: u64,
}

impl Segment {
    #[must_use]
    pub const fn new(address: DeviceAddress, len: u64) -> Self {
        Self { address, len }
    }

    /// One past the last byte.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.address.as_u64() + self.len
    }
}

/// Ordered, coalesced segments of one buffer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalSegmentTable {
    segments: Vec<Segment>,
}

impl PhysicalSegmentTable {
    /// A one-segment table, as produced by the contiguous backends.
    #[must_use]
    pub fn single(address: DeviceAddress, len: u64) -> Self {
        Self {
            segments: alloc::vec![Segment::new(address, len)],
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    #[must_use]
    pub fn is_contiguous(&self) -> bool {
        self.segments.len() == 1
    }

    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// In-page offset of the first byte.
    #[must_use]
    pub fn first_page_offset(&self) -> u64 {
        self.segments
            .first()
            .map_or(0, |s| s.address.page_offset::<Size4K>())
    }

    /// Bytes covered once the first and last segment are widened to whole
    /// pages.
    #[must_use]
    pub fn mapped_len(&self) -> u64 {
        let total = self.first_page_offset() + self.total_len();
        align_up(total, PAGE_SIZE).unwrap_or(total)
    }

    /// CPU-physical address of every page the buffer touches, in order.
    #[must_use]
    pub fn cpu_pages(&self, translation: &AddressTranslation) -> Vec<PhysicalAddress> {
        let mut pages = Vec::new();
        for seg in &self.segments {
            let mut page = seg.address.align_down::<Size4K>().as_u64();
            while page < seg.end() {
                pages.push(translation.to_cpu(DeviceAddress::new(page)));
                page += PAGE_SIZE;
            }
        }
        pages
    }

    /// CPU-physical ranges, one per segment.
    #[must_use]
    pub fn cpu_ranges(&self, translation: &AddressTranslation) -> Vec<(PhysicalAddress, u64)> {
        self.segments
            .iter()
            .map(|s| (translation.to_cpu(s.address), s.len))
            .collect()
    }

    /// `true` if every byte lies below 4 GiB in the device domain.
    #[must_use]
    pub fn fits_dma32(&self) -> bool {
        self.segments
            .iter()
            .all(|s| fits_dma32(s.address.as_u64(), s.len))
    }

    pub(crate) fn clear(&mut self) {
        self.segments.clear();
    }
}

/// Builds a [`PhysicalSegmentTable`] in a single pass, merging each page or
/// range into the previous segment when it continues it.
#[derive(Debug, Default)]
pub struct SegmentTableBuilder {
    segments: Vec<Segment>,
}

impl SegmentTableBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            segments: Vec::with_capacity(n),
        }
    }

    /// Build from per-page device addresses.
    ///
    /// `first_offset` is the in-page offset of the buffer's first byte and
    /// `total_len` its length; the last segment is trimmed to fit. A page
    /// extends the current segment only if its frame directly follows the
    /// previous page's frame.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] if the page list is empty, a page is
    /// unaligned, or the page count does not cover `first_offset + total_len`
    /// exactly.
    pub fn from_pages(
        pages: &[DeviceAddress],
        first_offset: u64,
        total_len: u64,
    ) -> Result<PhysicalSegmentTable> {
        if pages.is_empty() || total_len == 0 {
            return Err(VidMemError::InvalidArgument("empty page list"));
        }
        if first_offset >= PAGE_SIZE {
            return Err(VidMemError::InvalidArgument("first offset exceeds a page"));
        }
        let needed = first_offset
            .checked_add(total_len)
            .and_then(pages_for)
            .ok_or(VidMemError::InvalidArgument("buffer length overflows"))?;
        if needed != pages.len() as u64 {
            return Err(VidMemError::InvalidArgument(
                "page count does not match buffer length",
            ));
        }

        let mut builder = Self::with_capacity(1);
        let mut prev: Option<PageFrameNumber<Size4K>> = None;
        let mut remaining = total_len;
        for (i, page) in pages.iter().enumerate() {
            if !page.is_aligned::<Size4K>() {
                return Err(VidMemError::InvalidArgument("page address is not aligned"));
            }
            let frame = page.frame::<Size4K>();
            let skip = if i == 0 { first_offset } else { 0 };
            let len = (PAGE_SIZE - skip).min(remaining);
            let continues = prev.is_some_and(|p| frame.follows(p));
            match builder.segments.last_mut() {
                Some(last) if continues => last.len += len,
                _ => builder.segments.push(Segment::new(*page + skip, len)),
            }
            prev = Some(frame);
            remaining -= len;
        }
        Ok(builder.finish())
    }

    /// Build from caller-provided ranges.
    ///
    /// Every boundary between two ranges must fall on a page boundary: the
    /// first range may start mid-page and the last may end mid-page, nothing
    /// else may.
    ///
    /// # Errors
    /// [`VidMemError::InvalidArgument`] for an empty list, a zero-length or
    /// overflowing range, or an inner boundary inside a page.
    pub fn from_ranges(ranges: &[(DeviceAddress, u64)]) -> Result<PhysicalSegmentTable> {
        if ranges.is_empty() {
            return Err(VidMemError::InvalidArgument("empty range list"));
        }
        let last = ranges.len() - 1;
        let mut builder = Self::with_capacity(ranges.len());
        for (i, &(address, len)) in ranges.iter().enumerate() {
            if len == 0 {
                return Err(VidMemError::InvalidArgument("zero-length range"));
            }
            let end = address
                .end(len)
                .ok_or(VidMemError::InvalidArgument("range overflows"))?;
            if i > 0 && !address.is_aligned::<Size4K>() {
                return Err(VidMemError::InvalidArgument(
                    "inner range does not start on a page boundary",
                ));
            }
            if i < last && !end.is_aligned::<Size4K>() {
                return Err(VidMemError::InvalidArgument(
                    "inner range does not end on a page boundary",
                ));
            }
            builder.push(address, len);
        }
        Ok(builder.finish())
    }

    /// Append a run, coalescing with the previous segment when adjacent.
    pub fn push(&mut self, address: DeviceAddress, len: u64) {
        if let Some(prev) = self.segments.last_mut()
            && prev.end() == address.as_u64()
        {
            prev.len += len;
            return;
        }
        self.segments.push(Segment::new(address, len));
    }

    #[must_use]
    pub fn finish(self) -> PhysicalSegmentTable {
        PhysicalSegmentTable {
            segments: self.segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: u64 = 0x8_0000;

    fn da(frame: u64) -> DeviceAddress {
        DeviceAddress::new(frame * PAGE_SIZE)
    }

    fn build(pages: &[DeviceAddress], offset: u64, len: u64) -> Result<PhysicalSegmentTable> {
        SegmentTableBuilder::from_pages(pages, offset, len)
    }

    #[test]
    fn gap_splits_runs() {
        let pages = [da(F), da(F + 1), da(F + 3)];
        let t = build(&pages, 0, 3 * PAGE_SIZE).unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::new(da(F), 2 * PAGE_SIZE),
                Segment::new(da(F + 3), PAGE_SIZE)
            ]
        );
        assert!(!t.is_contiguous());
        assert_eq!(t.total_len(), 3 * PAGE_SIZE);
    }

    #[test]
    fn adjacent_pages_collapse_to_one_segment() {
        let pages: Vec<_> = (0..16).map(|i| da(F + i)).collect();
        let t = build(&pages, 0, 16 * PAGE_SIZE).unwrap();
        assert!(t.is_contiguous());
        assert_eq!(t.segments()[0], Segment::new(da(F), 16 * PAGE_SIZE));
    }

    #[test]
    fn descending_frames_do_not_coalesce() {
        let t = build(&[da(F + 1), da(F)], 0, 2 * PAGE_SIZE).unwrap();
        assert_eq!(t.segment_count(), 2);
        let repeated = build(&[da(F), da(F)], 0, 2 * PAGE_SIZE).unwrap();
        assert_eq!(repeated.segment_count(), 2);
    }

    #[test]
    fn last_frame_does_not_wrap_into_frame_zero() {
        let top = DeviceAddress::new(u64::MAX - (PAGE_SIZE - 1));
        let t = build(&[top, da(0)], 0, 2 * PAGE_SIZE).unwrap();
        assert_eq!(
            t.segments(),
            &[Segment::new(top, PAGE_SIZE), Segment::new(da(0), PAGE_SIZE)]
        );
    }

    #[test]
    fn first_offset_applies_only_to_first_segment() {
        let t = build(&[da(F), da(F + 2)], 0x100, PAGE_SIZE).unwrap();
        assert_eq!(
            t.segments(),
            &[
                Segment::new(da(F) + 0x100, PAGE_SIZE - 0x100),
                Segment::new(da(F + 2), 0x100)
            ]
        );
        assert_eq!(t.first_page_offset(), 0x100);
        assert_eq!(t.total_len(), PAGE_SIZE);
        assert_eq!(t.mapped_len(), 2 * PAGE_SIZE);
        assert_eq!(t.cpu_pages(&AddressTranslation::Identity).len(), 2);
    }

    #[test]
    fn last_segment_may_be_short() {
        let t = build(&[da(F), da(F + 1)], 0, PAGE_SIZE + 10).unwrap();
        assert_eq!(t.segments(), &[Segment::new(da(F), PAGE_SIZE + 10)]);
        assert_eq!(t.mapped_len(), 2 * PAGE_SIZE);
    }

    #[test]
    fn page_count_must_match_length() {
        assert!(build(&[da(F)], 0, 2 * PAGE_SIZE).is_err());
        assert!(build(&[da(F), da(F + 1)], 0, PAGE_SIZE).is_err());
        assert!(build(&[], 0, PAGE_SIZE).is_err());
        assert!(build(&[da(F)], PAGE_SIZE, 1).is_err());
        assert!(build(&[DeviceAddress::new(0x1010)], 0, 16).is_err());
    }

    #[test]
    fn ranges_coalesce_and_check_inner_boundaries() {
        let t = SegmentTableBuilder::from_ranges(&[
            (da(F) + 0x80, PAGE_SIZE - 0x80),
            (da(F + 1), PAGE_SIZE),
            (da(F + 7), 0x10),
        ])
        .unwrap();
        assert_eq!(t.segment_count(), 2);
        assert_eq!(
            t.segments()[0],
            Segment::new(da(F) + 0x80, 2 * PAGE_SIZE - 0x80)
        );

        let bad_end = SegmentTableBuilder::from_ranges(&[(da(F), 0x800), (da(F + 4), PAGE_SIZE)]);
        assert!(matches!(bad_end, Err(VidMemError::InvalidArgument(_))));
        let bad_start =
            SegmentTableBuilder::from_ranges(&[(da(F), PAGE_SIZE), (da(F + 4) + 8, PAGE_SIZE)]);
        assert!(matches!(bad_start, Err(VidMemError::InvalidArgument(_))));
        assert!(SegmentTableBuilder::from_ranges(&[(da(F), 0)]).is_err());
    }

    #[test]
    fn dma32_check_uses_segment_ends() {
        let low = PhysicalSegmentTable::single(DeviceAddress::new(0xFFFF_0000), 0x1_0000);
        let high = PhysicalSegmentTable::single(DeviceAddress::new(0xFFFF_0000), 0x1_1000);
        assert!(low.fits_dma32());
        assert!(!high.fits_dma32());
    }
}
