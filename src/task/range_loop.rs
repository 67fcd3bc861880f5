//! The per-worker read/write loop: pulls a byte range from an input stream
//! into a segment file with bounded retries and exact accounting.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{DownloadError, DownloadErrorCode, DownloadResult};
use crate::service::{ByteStream, SegmentSink};
use crate::state::DownloadState;

use super::thread::DownloadThread;

/// Read/write chunk size.
pub const BUFFER_SIZE: usize = 4096;

/// Cumulative retry budget per range pass (read and write failures share it;
/// it resets after any fully accounted chunk).
pub const MAX_TOTAL_RETRIES: u32 = 5;

/// Sleep between retries.
pub const RETRY_WAIT: Duration = Duration::from_millis(2000);

enum LoopEnd {
    /// Range exhausted or the input reached end-of-stream.
    Complete,
    /// The worker left the `Downloading` state (pause or cancel).
    Stopped,
}

/// Runs the range loop to completion, closing both streams on every exit
/// path. The segment file is deleted on failure and on cancellation; pause
/// keeps it for resume.
pub(crate) fn run(
    mut input: ByteStream,
    mut output: SegmentSink,
    thread: &Arc<DownloadThread>,
) -> DownloadResult<()> {
    let end = drive(&mut input, &mut output, thread);
    let flushed = output.flush();
    drop(output);
    drop(input);

    match end {
        Ok(LoopEnd::Complete) => {
            if let Err(e) = flushed {
                remove_segment(thread);
                return Err(DownloadError::from_io(
                    &e,
                    DownloadErrorCode::DiskOperationFailed,
                    "flush segment",
                ));
            }
            Ok(())
        }
        Ok(LoopEnd::Stopped) => {
            if thread.state() == DownloadState::Cancelled {
                remove_segment(thread);
            }
            Ok(())
        }
        Err(e) => {
            remove_segment(thread);
            Err(e)
        }
    }
}

fn drive(
    input: &mut ByteStream,
    output: &mut SegmentSink,
    thread: &Arc<DownloadThread>,
) -> DownloadResult<LoopEnd> {
    let range_size = thread.range_size();
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut retries: u32 = 0;

    while thread.state() == DownloadState::Downloading {
        let completed = thread.completed_bytes();
        if completed > range_size {
            return Err(over_read_error(completed, range_size));
        }
        let remaining = range_size - completed;
        if remaining == 0 {
            return Ok(LoopEnd::Complete);
        }

        // Right-size the final read so we never pull past the range end.
        let cap = remaining.min(BUFFER_SIZE as u64) as usize;
        let n = match input.read(&mut buf[..cap]) {
            Ok(n) => n,
            Err(e) => {
                retries += 1;
                if retries < MAX_TOTAL_RETRIES {
                    std::thread::sleep(RETRY_WAIT);
                    continue;
                }
                return Err(DownloadError::http(format!(
                    "read failed after {retries} retries: {e}"
                )));
            }
        };
        if n == 0 {
            return Ok(LoopEnd::Complete);
        }

        loop {
            match output.write_all(&buf[..n]) {
                Ok(()) => break,
                Err(e) => {
                    retries += 1;
                    if retries >= MAX_TOTAL_RETRIES {
                        return Err(DownloadError::from_io(
                            &e,
                            DownloadErrorCode::DiskOperationFailed,
                            "write segment",
                        ));
                    }
                    std::thread::sleep(RETRY_WAIT);
                    if thread.state() != DownloadState::Downloading {
                        return Ok(LoopEnd::Stopped);
                    }
                }
            }
        }

        thread.add_completed_bytes(n as u64);
        retries = 0;

        let done = thread.completed_bytes();
        if done > range_size {
            return Err(over_read_error(done, range_size));
        }
        let percent = (done * 100 / range_size) as i32;
        thread.set_progress(percent)?;
    }

    Ok(LoopEnd::Stopped)
}

fn over_read_error(completed: u64, range_size: u64) -> DownloadError {
    DownloadError::argument(format!(
        "completed {completed} bytes of a {range_size}-byte range"
    ))
}

fn remove_segment(thread: &Arc<DownloadThread>) {
    match std::fs::remove_file(thread.segment_path()) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(
                segment = %thread.segment_path().display(),
                "could not delete segment file: {e}"
            );
        }
    }
}
