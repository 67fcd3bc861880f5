//! One download worker: owns a byte range and its segment file for the
//! duration of a run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{DownloadError, DownloadErrorCode, DownloadResult};
use crate::logging::ScopedLogger;
use crate::ranges::RangePosition;
use crate::service::{ByteStream, SegmentSink};
use crate::speed::DownloadSpeedTracker;
use crate::state::DownloadState;

/// The work a worker runs over its streams; bound to the download service by
/// the owning task.
pub type MainWork =
    dyn Fn(ByteStream, SegmentSink, &Arc<DownloadThread>) -> DownloadResult<()> + Send + Sync;

/// Receives a worker's progress values and applies the manager's completion
/// rules. Implemented by the thread manager; workers hold it as a trait
/// object so they never own their owner.
pub(crate) trait ProgressReporter: Send + Sync {
    /// `value` must lie in `[-1, 100]`: a percentage, or -1 to signal
    /// failure/cancellation.
    fn report(&self, thread_id: u8, value: i32) -> DownloadResult<()>;
}

/// A single range worker.
///
/// `completed_bytes` is written only by the owning worker thread; everyone
/// else reads the atomic and accepts eventual consistency.
pub struct DownloadThread {
    id: u8,
    task_id: u64,
    range: RangePosition,
    range_size: u64,
    segment_path: PathBuf,
    state: Mutex<DownloadState>,
    completed_bytes: AtomicU64,
    percent: AtomicU8,
    cancel_requested: AtomicBool,
    alive: AtomicBool,
    completed_fired: AtomicBool,
    error: Mutex<Option<DownloadError>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    reporter: Arc<dyn ProgressReporter>,
    tracker: Option<Arc<DownloadSpeedTracker>>,
    log: ScopedLogger,
}

impl DownloadThread {
    pub(crate) fn new(
        id: u8,
        task_id: u64,
        range: RangePosition,
        range_size: u64,
        segment_path: PathBuf,
        reporter: Arc<dyn ProgressReporter>,
        tracker: Option<Arc<DownloadSpeedTracker>>,
        log: ScopedLogger,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            task_id,
            range,
            range_size,
            segment_path,
            state: Mutex::new(DownloadState::Waiting),
            completed_bytes: AtomicU64::new(0),
            percent: AtomicU8::new(0),
            cancel_requested: AtomicBool::new(false),
            alive: AtomicBool::new(false),
            completed_fired: AtomicBool::new(false),
            error: Mutex::new(None),
            handle: Mutex::new(None),
            reporter,
            tracker,
            log: log.for_thread(id),
        })
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn range(&self) -> RangePosition {
        self.range
    }

    /// Bytes this worker is responsible for. Assigned by the owning manager
    /// from the task's plan: 0 for every worker of an empty file.
    pub fn range_size(&self) -> u64 {
        self.range_size
    }

    pub fn segment_path(&self) -> &Path {
        &self.segment_path
    }

    pub fn state(&self) -> DownloadState {
        *self.state.lock().unwrap()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed_bytes.load(Ordering::Acquire)
    }

    /// Last reported percentage, in `[0, 100]`.
    pub fn percent(&self) -> u8 {
        self.percent.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    /// Accounts `n` freshly written bytes, feeding the shared speed tracker.
    pub fn add_completed_bytes(&self, n: u64) {
        self.completed_bytes.fetch_add(n, Ordering::AcqRel);
        if let Some(tracker) = &self.tracker {
            tracker.report_bytes(n);
        }
    }

    /// Forwards a progress value to the owning manager's reporter.
    pub fn set_progress(&self, value: i32) -> DownloadResult<()> {
        self.reporter.report(self.id, value)
    }

    pub(crate) fn store_percent(&self, value: u8) {
        self.percent.store(value, Ordering::Release);
    }

    /// Applies `next` if the transition is legal; returns whether it was.
    pub fn set_state(&self, next: DownloadState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Requests cancellation: flips the flag and moves any non-terminal state
    /// to `Cancelled`. A running worker observes this at its next loop check.
    pub(crate) fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        self.set_state(DownloadState::Cancelled);
    }

    pub(crate) fn set_error(&self, e: DownloadError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    pub(crate) fn take_error(&self) -> Option<DownloadError> {
        self.error.lock().unwrap().take()
    }

    /// One-shot guard for the manager's `ThreadCompleted` emission. Returns
    /// true the first time only.
    pub(crate) fn mark_completed_fired(&self) -> bool {
        !self.completed_fired.swap(true, Ordering::AcqRel)
    }

    /// Spawns the worker thread over `input`/`output`. A no-op when the
    /// worker is not in a startable state (e.g. already cancelled).
    pub(crate) fn spawn_worker(
        this: &Arc<Self>,
        input: ByteStream,
        output: SegmentSink,
        work: Arc<MainWork>,
    ) -> DownloadResult<()> {
        if !this.set_state(DownloadState::Downloading) {
            // A cancel can land between segment creation and start; the file
            // has no owner then, so it is removed here.
            if this.state() == DownloadState::Cancelled {
                let _ = std::fs::remove_file(&this.segment_path);
            }
            return Ok(());
        }
        this.alive.store(true, Ordering::Release);

        let worker = Arc::clone(this);
        let handle = std::thread::Builder::new()
            .name(format!("mtdm-{}-{}", this.task_id, this.id))
            .spawn(move || {
                let result = (*work)(input, output, &worker);
                worker.alive.store(false, Ordering::Release);
                match result {
                    Ok(()) => match worker.state() {
                        // Short end-of-stream counts as success.
                        DownloadState::Downloading => {
                            let _ = worker.set_progress(100);
                        }
                        DownloadState::Cancelled => {
                            let _ = worker.set_progress(-1);
                        }
                        // Completed already reported; Paused reports nothing.
                        _ => {}
                    },
                    Err(e) => {
                        worker.log.error_with("worker failed", &e);
                        worker.set_state(DownloadState::Failed);
                        worker.set_error(e);
                        let _ = worker.set_progress(-1);
                    }
                }
            })
            .map_err(|e| {
                this.alive.store(false, Ordering::Release);
                DownloadError::new(
                    DownloadErrorCode::ThreadCreationFailed,
                    format!("spawn worker {}: {e}", this.id),
                )
            })?;

        *this.handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Waits for the current worker thread, if any.
    pub(crate) fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}
