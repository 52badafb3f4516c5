//! Changed-block-tracking bitmaps.
//!
//! A CBT bitmap has one bit per 64 KiB block of a virtual disk, MSB-first
//! within each byte, in increasing offset order. A set bit means the block
//! changed between the two snapshots the bitmap was computed over.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{Error, Result};

/// Granularity of one bitmap bit, in bytes.
pub const BLOCK_SIZE: u64 = 64 * 1024;

/// A byte range of a virtual disk, aligned to [`BLOCK_SIZE`] in both offset
/// and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    /// Offset one past the end of this extent.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Sizes derived from a bitmap: the disk it covers and how much of it
/// changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapStats {
    /// Total size covered by the bitmap in bytes.
    pub disk_size: u64,
    /// Total size of the changed blocks in bytes.
    pub changed_bytes: u64,
}

/// A decoded CBT bitmap, as returned (base64-encoded) by
/// `VDI.list_changed_blocks`.
#[derive(Debug, Clone)]
pub struct CbtBitmap {
    bits: Vec<u8>,
}

impl CbtBitmap {
    /// Decode a base64-encoded bitmap.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bits = BASE64
            .decode(encoded.trim())
            .map_err(|err| Error::Api(format!("invalid CBT bitmap: {err}")))?;
        Ok(Self { bits })
    }

    /// Wrap already-decoded bitmap bytes.
    pub fn from_bytes(bits: Vec<u8>) -> Self {
        Self { bits }
    }

    /// Number of bits (blocks) the bitmap covers.
    pub fn bit_count(&self) -> u64 {
        self.bits.len() as u64 * 8
    }

    /// The increasingly ordered, non-overlapping extents corresponding to
    /// the set bits. The scan emits maximal runs, so `merge_adjacent` only
    /// matters for externally concatenated extent streams; it is accepted
    /// here for parity with the sibling combinator.
    pub fn extents(&self, merge: bool) -> MergeAdjacent<Extents<'_>> {
        merge_adjacent_if(
            Extents {
                bits: &self.bits,
                index: 0,
                run_start: None,
            },
            merge,
        )
    }

    /// Disk size and changed-byte totals for this bitmap.
    pub fn statistics(&self) -> BitmapStats {
        let set: u64 = self.bits.iter().map(|b| b.count_ones() as u64).sum();
        BitmapStats {
            disk_size: self.bit_count() * BLOCK_SIZE,
            changed_bytes: set * BLOCK_SIZE,
        }
    }
}

/// Iterator over the maximal runs of set bits, as byte extents.
pub struct Extents<'a> {
    bits: &'a [u8],
    /// Next bit index to examine.
    index: u64,
    /// Start bit of the run currently being scanned.
    run_start: Option<u64>,
}

impl Extents<'_> {
    fn bit(&self, index: u64) -> bool {
        let byte = self.bits[(index / 8) as usize];
        // MSB first within each byte
        byte & (0x80 >> (index % 8)) != 0
    }
}

impl Iterator for Extents<'_> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        let total = self.bits.len() as u64 * 8;
        while self.index < total {
            let set = self.bit(self.index);
            self.index += 1;
            match (set, self.run_start) {
                (true, None) => self.run_start = Some(self.index - 1),
                (false, Some(start)) => {
                    self.run_start = None;
                    return Some(Extent {
                        offset: start * BLOCK_SIZE,
                        length: (self.index - 1 - start) * BLOCK_SIZE,
                    });
                }
                _ => {}
            }
        }
        // a run still open at end-of-bitmap
        self.run_start.take().map(|start| Extent {
            offset: start * BLOCK_SIZE,
            length: (total - start) * BLOCK_SIZE,
        })
    }
}

/// Coalesce consecutive extents where one ends exactly where the next
/// begins. Input must be increasingly ordered and non-overlapping.
pub fn merge_adjacent<I>(extents: I) -> MergeAdjacent<I::IntoIter>
where
    I: IntoIterator<Item = Extent>,
{
    merge_adjacent_if(extents.into_iter(), true)
}

fn merge_adjacent_if<I: Iterator<Item = Extent>>(inner: I, enabled: bool) -> MergeAdjacent<I> {
    MergeAdjacent {
        inner,
        pending: None,
        enabled,
    }
}

/// Iterator adapter produced by [`merge_adjacent`].
pub struct MergeAdjacent<I> {
    inner: I,
    pending: Option<Extent>,
    enabled: bool,
}

impl<I: Iterator<Item = Extent>> Iterator for MergeAdjacent<I> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        if !self.enabled {
            return self.inner.next();
        }
        let mut current = match self.pending.take().or_else(|| self.inner.next()) {
            Some(extent) => extent,
            None => return None,
        };
        for extent in self.inner.by_ref() {
            if extent.offset == current.end() {
                current.length += extent.length;
            } else {
                self.pending = Some(extent);
                break;
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(offset: u64, length: u64) -> Extent {
        Extent { offset, length }
    }

    #[test]
    fn bitmap_to_extents() {
        // 0b10110000 0b00000000: bits 0, 2 and 3 are set
        let bitmap = CbtBitmap::from_bytes(vec![0b1011_0000, 0b0000_0000]);
        let extents: Vec<_> = bitmap.extents(false).collect();
        assert_eq!(extents, vec![extent(0, 65536), extent(131072, 131072)]);
        // the scan already emits maximal runs, so merging changes nothing
        let merged: Vec<_> = bitmap.extents(true).collect();
        assert_eq!(merged, extents);
    }

    #[test]
    fn bitmap_statistics() {
        let bitmap = CbtBitmap::from_bytes(vec![0b1011_0000, 0b0000_0000]);
        let stats = bitmap.statistics();
        assert_eq!(stats.disk_size, 16 * 65536);
        assert_eq!(stats.changed_bytes, 3 * 65536);
    }

    #[test]
    fn run_reaching_end_of_bitmap() {
        let bitmap = CbtBitmap::from_bytes(vec![0b0000_0011]);
        let extents: Vec<_> = bitmap.extents(false).collect();
        assert_eq!(extents, vec![extent(6 * 65536, 2 * 65536)]);
    }

    #[test]
    fn run_spanning_byte_boundary() {
        let bitmap = CbtBitmap::from_bytes(vec![0b0000_0001, 0b1000_0000]);
        let extents: Vec<_> = bitmap.extents(false).collect();
        assert_eq!(extents, vec![extent(7 * 65536, 2 * 65536)]);
    }

    #[test]
    fn empty_and_full_bitmaps() {
        assert_eq!(
            CbtBitmap::from_bytes(vec![0u8; 4]).extents(false).count(),
            0
        );
        let full = CbtBitmap::from_bytes(vec![0xff; 2]);
        let extents: Vec<_> = full.extents(false).collect();
        assert_eq!(extents, vec![extent(0, 16 * 65536)]);
    }

    #[test]
    fn extents_are_aligned_ordered_and_disjoint() {
        let bitmap = CbtBitmap::from_bytes(vec![0b1010_1010, 0b0101_0101, 0xff, 0x00, 0x01]);
        let extents: Vec<_> = bitmap.extents(false).collect();
        let mut covered = 0u64;
        let mut last_end = 0u64;
        for (i, e) in extents.iter().enumerate() {
            assert_eq!(e.offset % BLOCK_SIZE, 0);
            assert_eq!(e.length % BLOCK_SIZE, 0);
            assert!(e.length > 0);
            if i > 0 {
                assert!(e.offset > last_end, "extents must be strictly increasing");
            }
            last_end = e.end();
            covered += e.length / BLOCK_SIZE;
        }
        let set_bits = bitmap.statistics().changed_bytes / BLOCK_SIZE;
        assert_eq!(covered, set_bits);
    }

    #[test]
    fn merge_adjacent_coalesces_touching_extents() {
        let merged: Vec<_> =
            merge_adjacent(vec![extent(0, 1), extent(1, 3), extent(4, 5)]).collect();
        assert_eq!(merged, vec![extent(0, 9)]);

        let merged: Vec<_> = merge_adjacent(vec![extent(0, 1), extent(4, 5)]).collect();
        assert_eq!(merged, vec![extent(0, 1), extent(4, 5)]);

        let merged: Vec<_> = merge_adjacent(Vec::<Extent>::new()).collect();
        assert!(merged.is_empty());

        let merged: Vec<_> = merge_adjacent(vec![extent(5, 6)]).collect();
        assert_eq!(merged, vec![extent(5, 6)]);
    }

    #[test]
    fn merged_output_has_no_touching_neighbors() {
        let bitmap = CbtBitmap::from_bytes(vec![0b1101_1011, 0b1111_0000]);
        let extents: Vec<_> = merge_adjacent(bitmap.extents(false)).collect();
        for pair in extents.windows(2) {
            assert!(pair[0].end() < pair[1].offset);
        }
    }

    #[test]
    fn decodes_base64() {
        // 0xb0 0x00
        let bitmap = CbtBitmap::from_base64("sAA=").unwrap();
        let extents: Vec<_> = bitmap.extents(true).collect();
        assert_eq!(extents, vec![extent(0, 65536), extent(131072, 131072)]);
    }

    #[test]
    fn rejects_invalid_base64() {
        assert!(matches!(
            CbtBitmap::from_base64("not base64!!!"),
            Err(Error::Api(_))
        ));
    }
}
