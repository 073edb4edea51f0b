//! Range Arithmetic
//!
//! Partitioning of contiguous id ranges, used both for shard splits and for
//! chunked export/import/count.

use crate::domain::entities::ShardRange;
use crate::error::{Error, Result};

/// Split `[min, max]` into `pieces` contiguous, gap-free sub-ranges.
///
/// Sizes are as even as possible with the remainder distributed to the
/// earliest pieces. When the range holds fewer ids than `pieces`, fewer
/// sub-ranges come back (one per id).
pub fn partition_range(min: u64, max: u64, pieces: usize) -> Result<Vec<ShardRange>> {
    if min > max {
        return Err(Error::Precondition(format!(
            "invalid range: min {} exceeds max {}",
            min, max
        )));
    }
    if pieces == 0 {
        return Err(Error::Precondition("cannot partition into 0 pieces".to_string()));
    }

    let span = max - min + 1;
    let pieces = (pieces as u64).min(span);
    let base = span / pieces;
    let remainder = span % pieces;

    let mut ranges = Vec::with_capacity(pieces as usize);
    let mut cursor = min;
    for i in 0..pieces {
        let size = base + if i < remainder { 1 } else { 0 };
        ranges.push(ShardRange::new(cursor, cursor + size - 1));
        cursor += size;
    }
    Ok(ranges)
}

/// Verify `ranges` exactly cover `[min, max]` with no gaps or overlaps.
pub fn ranges_cover(min: u64, max: u64, ranges: &[ShardRange]) -> bool {
    if ranges.is_empty() {
        return false;
    }
    if ranges[0].min_id != min || ranges[ranges.len() - 1].max_id != max {
        return false;
    }
    ranges
        .windows(2)
        .all(|pair| pair[0].max_id + 1 == pair[1].min_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split_with_remainder() {
        // [1, 100] into 3: 34/33/33, remainder to the earliest piece.
        let ranges = partition_range(1, 100, 3).unwrap();
        assert_eq!(
            ranges,
            vec![
                ShardRange::new(1, 34),
                ShardRange::new(35, 67),
                ShardRange::new(68, 100),
            ]
        );
    }

    #[test]
    fn test_exact_split() {
        let ranges = partition_range(0, 99, 4).unwrap();
        assert_eq!(ranges.len(), 4);
        for r in &ranges {
            assert_eq!(r.span(), 25);
        }
        assert!(ranges_cover(0, 99, &ranges));
    }

    #[test]
    fn test_range_smaller_than_pieces() {
        let ranges = partition_range(10, 12, 5).unwrap();
        assert_eq!(ranges.len(), 3);
        assert!(ranges_cover(10, 12, &ranges));
    }

    #[test]
    fn test_single_piece() {
        let ranges = partition_range(5, 500, 1).unwrap();
        assert_eq!(ranges, vec![ShardRange::new(5, 500)]);
    }

    #[test]
    fn test_single_id() {
        let ranges = partition_range(7, 7, 3).unwrap();
        assert_eq!(ranges, vec![ShardRange::new(7, 7)]);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(partition_range(10, 9, 2).is_err());
        assert!(partition_range(1, 10, 0).is_err());
    }

    #[test]
    fn test_partition_property_holds_across_inputs() {
        for (min, max, k) in [(0u64, 0u64, 1usize), (1, 1_000_000, 7), (500, 501, 9), (3, 47, 13)] {
            let ranges = partition_range(min, max, k).unwrap();
            assert!(ranges.len() <= k);
            assert!(ranges_cover(min, max, &ranges), "min={} max={} k={}", min, max, k);
            // Remainder goes to the earliest pieces: sizes never increase.
            let spans: Vec<u64> = ranges.iter().map(|r| r.span()).collect();
            assert!(spans.windows(2).all(|w| w[0] >= w[1]));
        }
    }

    #[test]
    fn test_ranges_cover_detects_gap_and_overlap() {
        let gap = vec![ShardRange::new(1, 10), ShardRange::new(12, 20)];
        assert!(!ranges_cover(1, 20, &gap));
        let overlap = vec![ShardRange::new(1, 10), ShardRange::new(10, 20)];
        assert!(!ranges_cover(1, 20, &overlap));
        assert!(!ranges_cover(1, 20, &[]));
    }
}
