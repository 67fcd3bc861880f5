//! Stream provisioning for tasks: ranged input streams from the service,
//! segment output files on disk, and the finalize hand-off.

use std::fs::OpenOptions;
use std::sync::Arc;

use crate::context::HttpDownloadContext;
use crate::error::{all_succeeded, DownloadError, DownloadErrorCode, DownloadResult};
use crate::service::{DownloadService, SegmentSink};
use crate::state::DownloadState;
use crate::task::DownloadTask;

/// Opens a task's streams and invokes its phases. Split from the service so
/// stream provisioning can be replaced in tests or for other storage.
pub trait WorkProvider: Send + Sync {
    /// Acquires input and segment-output streams for every worker of `task`
    /// and starts them. `task` must be downloading.
    fn execute_main_work(
        &self,
        service: &Arc<dyn DownloadService>,
        task: &Arc<DownloadTask>,
    ) -> DownloadResult<()>;

    /// Re-opens streams for the unfinished workers of a resumed task, inputs
    /// offset to each worker's current byte count and outputs appending.
    fn execute_resume_work(
        &self,
        service: &Arc<dyn DownloadService>,
        task: &Arc<DownloadTask>,
    ) -> DownloadResult<()>;

    /// Opens the final output stream at the context's target path. The file
    /// must not exist yet; finalize is the only writer.
    fn get_task_final_stream(&self, context: &HttpDownloadContext)
        -> DownloadResult<SegmentSink>;

    /// Runs the post-download phase on the service.
    fn execute_finalize_work(
        &self,
        final_output: SegmentSink,
        service: &Arc<dyn DownloadService>,
        task: &DownloadTask,
    ) -> DownloadResult<()>;
}

/// Filesystem-backed provider used by the HTTP pipeline.
pub struct HttpWorkProvider;

impl HttpWorkProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HttpWorkProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkProvider for HttpWorkProvider {
    fn execute_main_work(
        &self,
        service: &Arc<dyn DownloadService>,
        task: &Arc<DownloadTask>,
    ) -> DownloadResult<()> {
        if task.state() != DownloadState::Downloading {
            return Err(DownloadError::invalid_state(format!(
                "task {} is {}, not downloading",
                task.id(),
                task.state()
            )));
        }

        let inputs = service.get_streams(task.context())?;
        let outputs = open_segment_sinks(task)?;
        task.thread_manager().start(inputs, outputs)
    }

    fn execute_resume_work(
        &self,
        service: &Arc<dyn DownloadService>,
        task: &Arc<DownloadTask>,
    ) -> DownloadResult<()> {
        if task.state() != DownloadState::Downloading {
            return Err(DownloadError::invalid_state(format!(
                "task {} is {}, not downloading",
                task.id(),
                task.state()
            )));
        }

        let paused: Vec<_> = task
            .thread_manager()
            .get_threads()
            .into_iter()
            .filter(|t| t.state() == DownloadState::Paused)
            .collect();
        let offsets: Vec<(u8, u64)> = paused
            .iter()
            .map(|t| (t.id(), t.completed_bytes()))
            .collect();

        let inputs = service.get_streams_from(task.context(), &offsets)?;
        let outputs = all_succeeded(paused.iter().map(|t| {
            OpenOptions::new()
                .append(true)
                .open(t.segment_path())
                .map(|f| Box::new(f) as SegmentSink)
                .map_err(|e| {
                    DownloadError::from_io(
                        &e,
                        DownloadErrorCode::DiskOperationFailed,
                        &format!("reopen segment {}", t.segment_path().display()),
                    )
                })
        }))?;
        let ids: Vec<u8> = paused.iter().map(|t| t.id()).collect();
        task.thread_manager().resume(&ids, inputs, outputs)
    }

    fn get_task_final_stream(
        &self,
        context: &HttpDownloadContext,
    ) -> DownloadResult<SegmentSink> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(context.target_path())
            .map_err(|e| {
                DownloadError::from_io(
                    &e,
                    DownloadErrorCode::DiskOperationFailed,
                    &format!("create {}", context.target_path().display()),
                )
            })?;
        Ok(Box::new(file))
    }

    fn execute_finalize_work(
        &self,
        final_output: SegmentSink,
        service: &Arc<dyn DownloadService>,
        task: &DownloadTask,
    ) -> DownloadResult<()> {
        service.post_download_processing(final_output, task)
    }
}

/// Creates one segment file per worker, truncating stale leftovers from a
/// crashed run. Permission failures surface as `PermissionDenied`.
fn open_segment_sinks(task: &DownloadTask) -> DownloadResult<Vec<SegmentSink>> {
    all_succeeded(task.thread_manager().get_threads().iter().map(|t| {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(t.segment_path())
            .map(|f| Box::new(f) as SegmentSink)
            .map_err(|e| {
                DownloadError::from_io(
                    &e,
                    DownloadErrorCode::DiskOperationFailed,
                    &format!("create segment {}", t.segment_path().display()),
                )
            })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges;

    #[test]
    fn final_stream_is_create_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let context = HttpDownloadContext::new(
            dir.path().join("final.bin"),
            "http://example.com/final.bin".to_string(),
            1,
            10,
            ranges::plan_ranges(10, 1),
        )
        .unwrap();
        let provider = HttpWorkProvider::new();

        let stream = provider.get_task_final_stream(&context).unwrap();
        drop(stream);
        assert!(context.target_path().exists());

        // A second open must fail instead of truncating a racing task's file.
        let err = match provider.get_task_final_stream(&context) {
            Err(err) => err,
            Ok(_) => panic!("expected second open of final stream to fail"),
        };
        assert_eq!(err.code, DownloadErrorCode::FileAlreadyExists);
    }
}
