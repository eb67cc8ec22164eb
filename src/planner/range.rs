//! Contiguous index ranges assigned to shards.

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// A half-open slice `[start, end)` of the workload assigned to one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardRange {
    /// Zero-based shard index.
    pub index: u64,
    /// First item index (inclusive).
    pub start: u64,
    /// Last item index (exclusive).
    pub end: u64,
}

impl ShardRange {
    /// Number of items covered by this range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Always false for ranges produced by [`shard_ranges`].
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

impl std::fmt::Display for ShardRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {} [{}, {})", self.index, self.start, self.end)
    }
}

/// Splits `[0, total_items)` into `shard_count` contiguous ranges.
///
/// Every shard gets `total_items / shard_count` items; the last shard also
/// takes the remainder, so its range may be longer than the others.
///
/// # Errors
///
/// Returns `PlanError::InvalidShardConfig` if `shard_count` is zero or
/// `total_items < shard_count`, since that would leave a shard empty.
pub fn shard_ranges(total_items: u64, shard_count: u64) -> Result<Vec<ShardRange>, PlanError> {
    if shard_count == 0 || total_items < shard_count {
        return Err(PlanError::InvalidShardConfig {
            total_items,
            shard_count,
        });
    }

    let base = total_items / shard_count;
    let ranges = (0..shard_count)
        .map(|index| {
            let start = index * base;
            let end = if index + 1 == shard_count {
                total_items
            } else {
                (index + 1) * base
            };
            ShardRange { index, start, end }
        })
        .collect();

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(ranges: &[ShardRange]) -> Vec<(u64, u64)> {
        ranges.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn test_even_split() {
        let ranges = shard_ranges(1000, 4).expect("valid config");
        assert_eq!(
            bounds(&ranges),
            vec![(0, 250), (250, 500), (500, 750), (750, 1000)]
        );
    }

    #[test]
    fn test_remainder_lands_in_last_shard() {
        let ranges = shard_ranges(1001, 4).expect("valid config");
        assert_eq!(
            bounds(&ranges),
            vec![(0, 250), (250, 500), (500, 750), (750, 1001)]
        );

        let ranges = shard_ranges(10, 3).expect("valid config");
        assert_eq!(bounds(&ranges), vec![(0, 3), (3, 6), (6, 10)]);
    }

    #[test]
    fn test_zero_shards_rejected() {
        let err = shard_ranges(10, 0).unwrap_err();
        assert!(matches!(
            err,
            PlanError::InvalidShardConfig {
                total_items: 10,
                shard_count: 0
            }
        ));
    }

    #[test]
    fn test_fewer_items_than_shards_rejected() {
        let err = shard_ranges(3, 5).unwrap_err();
        assert!(matches!(err, PlanError::InvalidShardConfig { .. }));
        assert!(shard_ranges(0, 1).is_err());
    }

    #[test]
    fn test_one_item_per_shard() {
        let ranges = shard_ranges(5, 5).expect("valid config");
        assert!(ranges.iter().all(|r| r.len() == 1));
        assert_eq!(ranges.last().map(|r| r.end), Some(5));
    }

    #[test]
    fn test_ranges_partition_interval() {
        for total in 1..=64u64 {
            for count in 1..=total.min(16) {
                let ranges = shard_ranges(total, count).expect("valid config");
                assert_eq!(ranges.len() as u64, count);
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges[ranges.len() - 1].end, total);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start, "gap or overlap at {}", pair[0]);
                }
                for (i, range) in ranges.iter().enumerate() {
                    assert_eq!(range.index, i as u64);
                    assert!(!range.is_empty());
                }
                let covered: u64 = ranges.iter().map(ShardRange::len).sum();
                assert_eq!(covered, total);
            }
        }
    }

    #[test]
    fn test_display() {
        let range = ShardRange {
            index: 2,
            start: 500,
            end: 750,
        };
        assert_eq!(range.to_string(), "shard 2 [500, 750)");
    }
}
