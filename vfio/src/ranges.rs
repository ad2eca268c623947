// Copyright © 2025 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ops::Range;

use itertools::Itertools;

/// Reduce `ranges` to at most `target` ranges.
///
/// Ranges are sorted and overlapping or touching ranges are merged first.
/// While too many ranges remain, the two neighbours separated by the
/// smallest gap are merged into their bounding range, so the IOVA space
/// added to the set is kept minimal. With `target == 1` the result is the
/// bounding range of the whole set. Empty ranges are dropped.
pub fn combine_iova_ranges(ranges: &mut Vec<Range<u64>>, target: usize) {
    ranges.retain(|r| r.start < r.end);
    ranges.sort_unstable_by_key(|r| r.start);

    let mut merged: Vec<Range<u64>> = ranges
        .drain(..)
        .coalesce(|prev, curr| {
            if curr.start <= prev.end {
                Ok(prev.start..prev.end.max(curr.end))
            } else {
                Err((prev, curr))
            }
        })
        .collect();

    let target = target.max(1);
    while merged.len() > target {
        let Some(idx) = (0..merged.len() - 1).min_by_key(|&i| merged[i + 1].start - merged[i].end)
        else {
            break;
        };

        let next = merged.remove(idx + 1);
        merged[idx].end = next.end;
    }

    *ranges = merged;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_to_bounding_range() {
        let mut ranges = vec![8192..12288, 0..4096];
        combine_iova_ranges(&mut ranges, 1);
        assert_eq!(ranges, vec![0..12288]);
    }

    #[test]
    fn test_combine_closes_smallest_gaps_first() {
        let mut ranges = vec![0..0x1000, 0x2000..0x3000, 0x10_0000..0x10_1000, 0x3800..0x4000];
        combine_iova_ranges(&mut ranges, 2);
        assert_eq!(ranges, vec![0..0x4000, 0x10_0000..0x10_1000]);
    }

    #[test]
    fn test_combine_merges_overlaps_and_drops_empty() {
        let mut ranges = vec![0x1000..0x3000, 0x2000..0x4000, 0x4000..0x5000, 0x9000..0x9000];
        combine_iova_ranges(&mut ranges, 4);
        assert_eq!(ranges, vec![0x1000..0x5000]);
    }

    #[test]
    fn test_combine_empty_and_under_target() {
        let mut ranges: Vec<Range<u64>> = Vec::new();
        combine_iova_ranges(&mut ranges, 1);
        assert!(ranges.is_empty());

        let mut ranges = vec![0x5000..0x6000, 0x1000..0x2000];
        combine_iova_ranges(&mut ranges, 3);
        assert_eq!(ranges, vec![0x1000..0x2000, 0x5000..0x6000]);
    }
}
