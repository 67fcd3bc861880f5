//! Per-task download parameters, resolved once before scheduling.

use std::path::{Path, PathBuf};

use crate::error::{DownloadError, DownloadErrorCode, DownloadResult};
use crate::naming;
use crate::pool::ClientPool;
use crate::probe;
use crate::ranges::{self, RangePosition};

/// Upper bound on workers per task.
pub const MAX_THREADS_PER_TASK: u8 = 255;

/// Immutable parameters of one download task: where the bytes come from,
/// where they land, and how the file is split across workers.
///
/// `total_size` is the probed resource length; the range plan is validated
/// against it, never derived from it, so a plan of single-byte ranges cannot
/// be mistaken for an empty file.
#[derive(Debug, Clone)]
pub struct HttpDownloadContext {
    target_path: PathBuf,
    url: String,
    thread_count: u8,
    total_size: u64,
    range_positions: Vec<RangePosition>,
}

impl HttpDownloadContext {
    /// Builds a context from already-resolved parts, validating the range
    /// plan against `total_size`. Most callers should use
    /// [`get_download_context`] instead.
    pub fn new(
        target_path: PathBuf,
        url: String,
        thread_count: u8,
        total_size: u64,
        range_positions: Vec<RangePosition>,
    ) -> DownloadResult<Self> {
        let context = Self {
            target_path,
            url,
            thread_count,
            total_size,
            range_positions,
        };
        context.is_properties_valid()?;
        Ok(context)
    }

    /// Validates every construction-time property. Used again by tasks as a
    /// pre-flight check.
    pub fn is_properties_valid(&self) -> DownloadResult<()> {
        if self.thread_count == 0 {
            return Err(DownloadError::argument("thread count must be at least 1"));
        }
        if self.url.is_empty() {
            return Err(DownloadError::invalid_url("empty url"));
        }
        if self.range_positions.len() != self.thread_count as usize {
            return Err(DownloadError::argument(format!(
                "{} ranges for {} threads",
                self.range_positions.len(),
                self.thread_count
            )));
        }
        match self.target_path.parent() {
            Some(dir) if dir.as_os_str().is_empty() || dir.is_dir() => {}
            Some(dir) => {
                return Err(DownloadError::new(
                    DownloadErrorCode::PathNotFound,
                    format!("target directory {} does not exist", dir.display()),
                ))
            }
            None => {
                return Err(DownloadError::new(
                    DownloadErrorCode::PathNotFound,
                    "target path has no parent directory",
                ))
            }
        }
        ranges::validate_ranges(&self.range_positions, self.total_size)
    }

    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn thread_count(&self) -> u8 {
        self.thread_count
    }

    pub fn range_positions(&self) -> &[RangePosition] {
        &self.range_positions
    }

    /// Probed resource length in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes the worker for `index` is responsible for: 0 for every worker
    /// of an empty file, else its range's size.
    pub fn range_size_of(&self, index: u8) -> u64 {
        if self.total_size == 0 {
            return 0;
        }
        self.range_positions
            .get(index as usize)
            .map(RangePosition::range_size)
            .unwrap_or(0)
    }
}

/// Resolves a download context for `url`: probes the size, derives a unique
/// target path under `saved_path`'s directory, and plans per-worker ranges.
///
/// `max_threads` is an upper bound; files smaller than the requested worker
/// count get one worker per byte so no range is degenerate. A server that
/// reports no content length cannot be split into ranges and is rejected.
pub fn get_download_context(
    pool: &ClientPool,
    max_threads: u8,
    saved_path: &Path,
    url: &str,
) -> DownloadResult<HttpDownloadContext> {
    if max_threads == 0 {
        return Err(DownloadError::argument("max_threads must be at least 1"));
    }

    let head = probe::probe(pool, url)
        .map_err(|e| DownloadError::invalid_url(format!("probe failed: {e}")))?;
    let total_size = head.content_length.ok_or_else(|| {
        DownloadError::invalid_url(format!("HEAD {url} reported no content length"))
    })?;

    let file_name = naming::derive_file_name(
        saved_path,
        url,
        head.content_disposition_name.as_deref(),
    );
    let dir = saved_path.parent().unwrap_or_else(|| Path::new(""));
    let target_path = naming::unique_target_path(dir, &file_name);

    let thread_count = if total_size == 0 {
        max_threads
    } else {
        total_size.min(max_threads as u64) as u8
    };
    let range_positions = ranges::plan_ranges(total_size, thread_count);

    HttpDownloadContext::new(
        target_path,
        url.to_string(),
        thread_count,
        total_size,
        range_positions,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &Path, total: u64, threads: u8) -> HttpDownloadContext {
        HttpDownloadContext::new(
            dir.join("file.bin"),
            "http://example.com/file.bin".to_string(),
            threads,
            total,
            ranges::plan_ranges(total, threads),
        )
        .unwrap()
    }

    #[test]
    fn valid_context_reports_total_size() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path(), 1000, 4);
        assert_eq!(c.total_size(), 1000);
        assert_eq!(c.thread_count(), 4);
        assert_eq!(c.range_size_of(0), 250);
        c.is_properties_valid().unwrap();
    }

    #[test]
    fn zero_length_context_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path(), 0, 4);
        assert_eq!(c.total_size(), 0);
        assert_eq!(c.range_positions().len(), 4);
        for i in 0..4 {
            assert_eq!(c.range_size_of(i), 0);
        }
    }

    #[test]
    fn two_byte_file_splits_into_single_byte_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let c = HttpDownloadContext::new(
            dir.path().join("tiny.bin"),
            "http://example.com/tiny.bin".into(),
            2,
            2,
            ranges::plan_ranges(2, 2),
        )
        .unwrap();
        assert_eq!(c.total_size(), 2);
        assert_eq!(c.range_positions()[0], RangePosition { start: 0, end: 0 });
        assert_eq!(c.range_positions()[1], RangePosition { start: 1, end: 1 });
        assert_eq!(c.range_size_of(0), 1);
        assert_eq!(c.range_size_of(1), 1);
    }

    #[test]
    fn one_byte_file_is_a_valid_single_range() {
        let dir = tempfile::tempdir().unwrap();
        let c = HttpDownloadContext::new(
            dir.path().join("one.bin"),
            "http://example.com/one.bin".into(),
            1,
            1,
            ranges::plan_ranges(1, 1),
        )
        .unwrap();
        assert_eq!(c.total_size(), 1);
        assert_eq!(c.range_size_of(0), 1);
    }

    #[test]
    fn rejects_total_and_plan_disagreement() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpDownloadContext::new(
            dir.path().join("f.bin"),
            "http://example.com/f.bin".into(),
            2,
            11,
            ranges::plan_ranges(10, 2),
        )
        .unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::ArgumentOutOfRange);
    }

    #[test]
    fn rejects_zero_threads() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpDownloadContext::new(
            dir.path().join("f"),
            "http://example.com/f".into(),
            0,
            0,
            vec![],
        )
        .unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::ArgumentOutOfRange);
    }

    #[test]
    fn rejects_range_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpDownloadContext::new(
            dir.path().join("f"),
            "http://example.com/f".into(),
            3,
            100,
            ranges::plan_ranges(100, 2),
        )
        .unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::ArgumentOutOfRange);
    }

    #[test]
    fn rejects_missing_target_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = HttpDownloadContext::new(
            dir.path().join("nope").join("f.bin"),
            "http://example.com/f".into(),
            1,
            10,
            ranges::plan_ranges(10, 1),
        )
        .unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::PathNotFound);
    }

    #[test]
    fn factory_rejects_bad_urls_without_queueing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ClientPool::new();
        let err = get_download_context(&pool, 4, &dir.path().join("x.bin"), "::not-a-url::")
            .unwrap_err();
        assert_eq!(err.code, DownloadErrorCode::InvalidUrl);
    }
}
