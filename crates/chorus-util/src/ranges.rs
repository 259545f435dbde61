//! Chunk-range splitting for sharded file uploads.
//!
//! Splits `[start, end)` into `num_ranges` contiguous pieces whose lengths
//! differ by at most one, with the *first* `remainder` ranges getting the
//! extra element rather than the last.

/// A half-open `[start, end)` interval over chunk indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The `"start-end"` wire representation used as a map key
    /// (`range_key` elsewhere in this crate).
    pub fn key(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }

    pub fn parse_key(key: &str) -> Option<ChunkRange> {
        let (start, end) = key.split_once('-')?;
        Some(ChunkRange {
            start: start.parse().ok()?,
            end: end.parse().ok()?,
        })
    }

    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Chunk indices this range has in common with `[start, end)`.
    pub fn intersect(&self, start: u64, end: u64) -> Option<ChunkRange> {
        let s = self.start.max(start);
        let e = self.end.min(end);
        if s < e {
            Some(ChunkRange { start: s, end: e })
        } else {
            None
        }
    }
}

/// Splits `[0, total)` into `num_ranges` contiguous, non-overlapping ranges
/// whose lengths differ by at most one. The first `total % num_ranges`
/// ranges receive the extra chunk.
pub fn split_into_ranges(total: u64, num_ranges: u64) -> Vec<ChunkRange> {
    if num_ranges == 0 || total == 0 {
        return vec![];
    }

    let base = total / num_ranges;
    let remainder = total % num_ranges;

    let mut out = Vec::with_capacity(num_ranges as usize);
    let mut cursor = 0u64;
    for i in 0..num_ranges {
        let len = if i < remainder { base + 1 } else { base };
        if len == 0 {
            continue;
        }
        out.push(ChunkRange {
            start: cursor,
            end: cursor + len,
        });
        cursor += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_evenly() {
        let ranges = split_into_ranges(8, 4);
        assert_eq!(
            ranges,
            vec![
                ChunkRange { start: 0, end: 2 },
                ChunkRange { start: 2, end: 4 },
                ChunkRange { start: 4, end: 6 },
                ChunkRange { start: 6, end: 8 },
            ]
        );
    }

    #[test]
    fn spreads_remainder_across_leading_ranges() {
        // 5 chunks into 4 ranges: first range gets the extra chunk.
        let ranges = split_into_ranges(5, 4);
        assert_eq!(
            ranges,
            vec![
                ChunkRange { start: 0, end: 2 },
                ChunkRange { start: 2, end: 3 },
                ChunkRange { start: 3, end: 4 },
                ChunkRange { start: 4, end: 5 },
            ]
        );
        let total: u64 = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(total, 5);
    }

    #[test]
    fn fewer_chunks_than_ranges_drops_empty_ranges() {
        let ranges = split_into_ranges(2, 4);
        let total: u64 = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(total, 2);
        assert!(ranges.len() <= 4);
    }

    #[test]
    fn key_round_trips() {
        let r = ChunkRange { start: 3, end: 7 };
        assert_eq!(r.key(), "3-7");
        assert_eq!(ChunkRange::parse_key("3-7"), Some(r));
    }
}
