//! HTTP transport for download tasks: ranged GET streams with retry, the
//! worker read/write loop, and post-download segment merging.

pub(crate) mod merge;

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RangeResponsePolicy;
use crate::context::HttpDownloadContext;
use crate::error::{all_succeeded, DownloadError, DownloadErrorCode, DownloadResult};
use crate::pool::ClientPool;
use crate::ranges::RangePosition;
use crate::state::DownloadState;
use crate::task::range_loop;
use crate::task::thread::DownloadThread;
use crate::task::DownloadTask;

/// A worker's input: the response body of a ranged GET.
pub type ByteStream = Box<dyn Read + Send>;

/// A worker's output: its segment file (or the final output at finalize).
pub type SegmentSink = Box<dyn Write + Send>;

/// Attempts per ranged GET.
pub const MAX_REQUEST_RETRIES: u32 = 3;

/// Wait between ranged GET attempts.
pub const REQUEST_RETRY_WAIT: Duration = Duration::from_millis(5000);

/// Protocol-facing operations a task needs. HTTP is the provided
/// implementation; other protocols plug in behind this trait.
pub trait DownloadService: Send + Sync {
    /// Opens one input stream per range of `context`, in thread-id order.
    /// Any failure fails the whole call.
    fn get_streams(&self, context: &HttpDownloadContext) -> DownloadResult<Vec<ByteStream>>;

    /// Like [`get_streams`](Self::get_streams) but each entry of `offsets`
    /// names a worker and how many bytes of its range are already on disk;
    /// streams begin at that offset. Used by resume.
    fn get_streams_from(
        &self,
        context: &HttpDownloadContext,
        offsets: &[(u8, u64)],
    ) -> DownloadResult<Vec<ByteStream>>;

    /// Runs one worker's range loop over its streams.
    fn download_file(
        &self,
        input: ByteStream,
        output: SegmentSink,
        thread: &Arc<DownloadThread>,
    ) -> DownloadResult<()>;

    /// Merges the task's segments into `final_output` once every worker
    /// completed; cleans up and fails otherwise.
    fn post_download_processing(
        &self,
        final_output: SegmentSink,
        task: &DownloadTask,
    ) -> DownloadResult<()>;
}

/// HTTP implementation over the shared client pool.
pub struct HttpDownloadService {
    pool: ClientPool,
    policy: RangeResponsePolicy,
}

impl HttpDownloadService {
    pub fn new(pool: ClientPool, policy: RangeResponsePolicy) -> Self {
        Self { pool, policy }
    }

    /// Issues one ranged GET, retrying transient failures up to
    /// [`MAX_REQUEST_RETRIES`] times.
    fn open_range_stream(
        &self,
        url: &str,
        range: &RangePosition,
        offset: u64,
        total_size: u64,
    ) -> DownloadResult<ByteStream> {
        if offset >= range.range_size() {
            // Already fully downloaded (resume); the worker observes
            // end-of-stream at once.
            return Ok(Box::new(std::io::empty()));
        }

        let header = range.header_value_from(offset);
        let mut last: Option<DownloadError> = None;
        for attempt in 1..=MAX_REQUEST_RETRIES {
            match self.send_ranged_get(url, &header, range, offset, total_size) {
                Ok(stream) => return Ok(stream),
                Err(RequestFailure::Fatal(e)) => return Err(e),
                Err(RequestFailure::Transient(e)) => {
                    tracing::debug!(attempt, url, error = %e, "ranged GET failed");
                    last = Some(e);
                    if attempt < MAX_REQUEST_RETRIES {
                        std::thread::sleep(REQUEST_RETRY_WAIT);
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| DownloadError::http("ranged GET failed")))
    }

    fn send_ranged_get(
        &self,
        url: &str,
        range_header: &str,
        range: &RangePosition,
        offset: u64,
        total_size: u64,
    ) -> Result<ByteStream, RequestFailure> {
        let client = self
            .pool
            .acquire()
            .map_err(RequestFailure::Fatal)?;
        let response = client
            .get(url)
            .header(reqwest::header::RANGE, range_header)
            .send()
            .map_err(|e| {
                RequestFailure::Transient(DownloadError::http(format!("GET {url}: {e}")))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            return Ok(Box::new(response));
        }
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(RequestFailure::Fatal(DownloadError::new(
                DownloadErrorCode::RangeNotSatisfiable,
                format!("GET {url} rejected range {range_header}"),
            )));
        }
        if status.is_success() {
            // 200: the server ignored the range and is sending the full
            // body. Only correct when this stream was asked for the whole
            // file from byte zero.
            let whole_file = range.start + offset == 0 && range.end + 1 == total_size;
            if whole_file || self.policy == RangeResponsePolicy::AcceptFullBody {
                return Ok(Box::new(response));
            }
            return Err(RequestFailure::Fatal(DownloadError::new(
                DownloadErrorCode::RangeNotSatisfiable,
                format!("GET {url} answered 200 to range {range_header}"),
            )));
        }
        let e = DownloadError::http(format!("GET {url} returned HTTP {}", status.as_u16()));
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(RequestFailure::Transient(e))
        } else {
            Err(RequestFailure::Fatal(e))
        }
    }
}

enum RequestFailure {
    Transient(DownloadError),
    Fatal(DownloadError),
}

impl DownloadService for HttpDownloadService {
    fn get_streams(&self, context: &HttpDownloadContext) -> DownloadResult<Vec<ByteStream>> {
        let total = context.total_size();
        if total == 0 {
            // An empty resource has nothing to request; every worker gets an
            // immediate end-of-stream.
            return Ok((0..context.thread_count())
                .map(|_| Box::new(std::io::empty()) as ByteStream)
                .collect());
        }
        all_succeeded(
            context
                .range_positions()
                .iter()
                .map(|range| self.open_range_stream(context.url(), range, 0, total)),
        )
        .map_err(|e| DownloadError::http(format!("stream acquisition failed: {e}")))
    }

    fn get_streams_from(
        &self,
        context: &HttpDownloadContext,
        offsets: &[(u8, u64)],
    ) -> DownloadResult<Vec<ByteStream>> {
        let total = context.total_size();
        if total == 0 {
            return Ok(offsets
                .iter()
                .map(|_| Box::new(std::io::empty()) as ByteStream)
                .collect());
        }
        let ranges = context.range_positions();
        all_succeeded(offsets.iter().map(|(id, offset)| {
            let range = ranges.get(*id as usize).ok_or_else(|| {
                DownloadError::not_found(format!("worker {id} has no range"))
            })?;
            self.open_range_stream(context.url(), range, *offset, total)
        }))
        .map_err(|e| DownloadError::http(format!("stream acquisition failed: {e}")))
    }

    fn download_file(
        &self,
        input: ByteStream,
        output: SegmentSink,
        thread: &Arc<DownloadThread>,
    ) -> DownloadResult<()> {
        range_loop::run(input, output, thread)
    }

    fn post_download_processing(
        &self,
        mut final_output: SegmentSink,
        task: &DownloadTask,
    ) -> DownloadResult<()> {
        let threads = task.thread_manager().get_threads();
        let segment_paths: Vec<PathBuf> = threads
            .iter()
            .map(|t| t.segment_path().to_path_buf())
            .collect();

        let completed = threads
            .iter()
            .filter(|t| t.state() == DownloadState::Completed)
            .count();
        if completed != threads.len() || threads.is_empty() {
            merge::cleanup(Some(final_output), Some(&segment_paths));
            return Err(DownloadError::unexpected(format!(
                "finalize with {completed} of {} workers completed",
                threads.len()
            )));
        }

        merge::combine_segments(&segment_paths, &mut final_output)?;
        final_output
            .flush()
            .map_err(|e| {
                DownloadError::from_io(
                    &e,
                    DownloadErrorCode::DiskOperationFailed,
                    "flush final output",
                )
            })?;
        Ok(())
    }
}
