//! Byte-range math: splitting a file into per-worker inclusive ranges.

use crate::error::{DownloadError, DownloadResult};

/// One worker's byte range, inclusive on both ends.
///
/// A pair on its own always covers at least one byte: `[0, 0]` is the first
/// byte of the file. Plans for a zero-length file reuse `[0, 0]` as a
/// placeholder; whether a plan is empty is decided by the file's total
/// length, never by an individual pair (workers in an empty plan are sized 0
/// by their owner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePosition {
    /// First byte offset (inclusive).
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl RangePosition {
    /// The all-zero pair used as the empty-file placeholder.
    pub fn zero() -> Self {
        Self { start: 0, end: 0 }
    }

    /// True for a `[0, 0]` pair. Only meaningful as the empty-file
    /// placeholder when the plan's total length is zero; in any other plan
    /// `[0, 0]` is a real single-byte range.
    pub fn is_zero(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    /// Number of bytes covered: `end - start + 1`.
    pub fn range_size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Range` header value: `bytes=start-end`.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }

    /// Header value for a request starting `offset` bytes into this range
    /// (used when resuming a partially downloaded range).
    pub fn header_value_from(&self, offset: u64) -> String {
        format!("bytes={}-{}", self.start + offset, self.end)
    }
}

/// Splits `total_size` bytes into `thread_count` contiguous inclusive ranges.
///
/// Each range gets `total_size / thread_count` bytes; the division remainder
/// goes to the last range. Files shorter than the requested count get one
/// range per byte so no range is degenerate. A zero `total_size` yields
/// all-zero placeholder pairs, one per worker.
pub fn plan_ranges(total_size: u64, thread_count: u8) -> Vec<RangePosition> {
    let n = thread_count.max(1) as u64;
    if total_size == 0 {
        return vec![RangePosition::zero(); n as usize];
    }
    let n = n.min(total_size);

    let each = total_size / n;
    let remainder = total_size % n;
    let mut out = Vec::with_capacity(n as usize);
    for i in 0..n {
        let start = i * each;
        let mut end = start + each - 1;
        if i == n - 1 {
            end += remainder;
        }
        out.push(RangePosition { start, end });
    }
    out
}

/// Checks that `ranges` are monotonic, non-overlapping and cover
/// `[0, total_size - 1]` exactly (or are all-zero pairs for an empty file).
pub fn validate_ranges(ranges: &[RangePosition], total_size: u64) -> DownloadResult<()> {
    if ranges.is_empty() {
        return Err(DownloadError::argument("no byte ranges"));
    }
    if total_size == 0 {
        if ranges.iter().all(RangePosition::is_zero) {
            return Ok(());
        }
        return Err(DownloadError::argument(
            "zero-length file requires all-zero ranges",
        ));
    }

    let mut expected_start = 0u64;
    for (i, range) in ranges.iter().enumerate() {
        if range.start != expected_start {
            return Err(DownloadError::argument(format!(
                "range {i} starts at {} but {} was expected",
                range.start, expected_start
            )));
        }
        if range.end < range.start {
            return Err(DownloadError::argument(format!(
                "range {i} is inverted: [{}, {}]",
                range.start, range.end
            )));
        }
        expected_start = range.end + 1;
    }
    if expected_start != total_size {
        return Err(DownloadError::argument(format!(
            "ranges cover {expected_start} bytes of {total_size}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_even_split() {
        let ranges = plan_ranges(1000, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], RangePosition { start: 0, end: 249 });
        assert_eq!(ranges[1], RangePosition { start: 250, end: 499 });
        assert_eq!(ranges[2], RangePosition { start: 500, end: 749 });
        assert_eq!(ranges[3], RangePosition { start: 750, end: 999 });
        validate_ranges(&ranges, 1000).unwrap();
    }

    #[test]
    fn plan_remainder_goes_to_last_range() {
        let ranges = plan_ranges(10, 4);
        // 10 / 4 -> each 2, remainder 2 appended to the last range.
        assert_eq!(ranges[0], RangePosition { start: 0, end: 1 });
        assert_eq!(ranges[1], RangePosition { start: 2, end: 3 });
        assert_eq!(ranges[2], RangePosition { start: 4, end: 5 });
        assert_eq!(ranges[3], RangePosition { start: 6, end: 9 });
        validate_ranges(&ranges, 10).unwrap();
    }

    #[test]
    fn plan_single_thread_covers_everything() {
        let ranges = plan_ranges(4096, 1);
        assert_eq!(ranges, vec![RangePosition { start: 0, end: 4095 }]);
        assert_eq!(ranges[0].range_size(), 4096);
    }

    #[test]
    fn plan_zero_size_yields_placeholder_pairs() {
        let ranges = plan_ranges(0, 4);
        assert_eq!(ranges.len(), 4);
        for r in &ranges {
            assert!(r.is_zero());
        }
        validate_ranges(&ranges, 0).unwrap();
    }

    #[test]
    fn plan_short_file_gets_one_byte_per_range() {
        // Fewer bytes than requested workers: one single-byte range each.
        let ranges = plan_ranges(2, 4);
        assert_eq!(
            ranges,
            vec![
                RangePosition { start: 0, end: 0 },
                RangePosition { start: 1, end: 1 },
            ]
        );
        assert_eq!(ranges[0].range_size(), 1);
        assert_eq!(ranges[1].range_size(), 1);
        validate_ranges(&ranges, 2).unwrap();
    }

    #[test]
    fn first_byte_range_is_one_byte_not_empty() {
        let r = RangePosition { start: 0, end: 0 };
        assert_eq!(r.range_size(), 1);
        assert_eq!(r.header_value(), "bytes=0-0");
    }

    #[test]
    fn eight_threads_over_64_mib() {
        let total = 64 * 1024 * 1024u64;
        let ranges = plan_ranges(total, 8);
        for r in &ranges {
            assert_eq!(r.range_size(), 8 * 1024 * 1024);
        }
        validate_ranges(&ranges, total).unwrap();
    }

    #[test]
    fn header_values() {
        let r = RangePosition { start: 100, end: 199 };
        assert_eq!(r.header_value(), "bytes=100-199");
        assert_eq!(r.header_value_from(50), "bytes=150-199");
    }

    #[test]
    fn validate_rejects_gap_and_overlap() {
        let gap = [
            RangePosition { start: 0, end: 4 },
            RangePosition { start: 6, end: 9 },
        ];
        assert!(validate_ranges(&gap, 10).is_err());

        let overlap = [
            RangePosition { start: 0, end: 5 },
            RangePosition { start: 5, end: 9 },
        ];
        assert!(validate_ranges(&overlap, 10).is_err());
    }

    #[test]
    fn validate_rejects_short_coverage() {
        let short = [RangePosition { start: 0, end: 8 }];
        assert!(validate_ranges(&short, 10).is_err());
    }
}
