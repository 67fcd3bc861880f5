//! Owns the workers of one task: creation, start, pause/resume, cancel, and
//! the `ThreadCompleted` aggregation that drives task finalization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::context::HttpDownloadContext;
use crate::error::{DownloadError, DownloadErrorCode, DownloadResult};
use crate::events::{EventHandlers, Handler};
use crate::logging::ScopedLogger;
use crate::naming;
use crate::service::{ByteStream, SegmentSink};
use crate::speed::DownloadSpeedTracker;
use crate::state::DownloadState;

use super::thread::{DownloadThread, MainWork, ProgressReporter};

/// Manager of one task's fixed worker set.
pub struct DownloadThreadManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    task_id: u64,
    threads: Mutex<Vec<Arc<DownloadThread>>>,
    work: Mutex<Option<Arc<MainWork>>>,
    thread_completed: EventHandlers<Arc<DownloadThread>>,
    cancel_requested: AtomicBool,
    log: ScopedLogger,
}

impl DownloadThreadManager {
    pub(crate) fn new(task_id: u64, log: ScopedLogger) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                task_id,
                threads: Mutex::new(Vec::new()),
                work: Mutex::new(None),
                thread_completed: EventHandlers::new(),
                cancel_requested: AtomicBool::new(false),
                log,
            }),
        }
    }

    /// Registers a handler fired exactly once per worker when it reaches a
    /// terminal state.
    pub fn on_thread_completed(&self, handler: Handler<Arc<DownloadThread>>) {
        self.inner.thread_completed.subscribe(handler);
    }

    /// Builds one worker per range of `context`, each bound to `work` and a
    /// private progress reporter. Rejects an existing target file, a
    /// non-empty worker list, and a worker/range count mismatch.
    pub fn create_threads(
        &self,
        context: &HttpDownloadContext,
        work: Arc<MainWork>,
        tracker: Option<Arc<DownloadSpeedTracker>>,
    ) -> DownloadResult<()> {
        if context.target_path().exists() {
            return Err(DownloadError::new(
                DownloadErrorCode::FileAlreadyExists,
                format!("{} already exists", context.target_path().display()),
            ));
        }
        let n = context.thread_count();
        if context.range_positions().len() != n as usize {
            return Err(DownloadError::argument(format!(
                "{} ranges for {} workers",
                context.range_positions().len(),
                n
            )));
        }

        let mut threads = self.inner.threads.lock().unwrap();
        if !threads.is_empty() {
            return Err(DownloadError::invalid_state(
                "workers were already created for this task",
            ));
        }

        let segment_paths =
            naming::segment_paths(context.target_path(), self.inner.task_id, n);
        for (i, (range, segment_path)) in context
            .range_positions()
            .iter()
            .zip(segment_paths)
            .enumerate()
        {
            let reporter: Arc<dyn ProgressReporter> = Arc::new(ManagerReporter {
                manager: Arc::downgrade(&self.inner),
            });
            threads.push(DownloadThread::new(
                i as u8,
                self.inner.task_id,
                *range,
                context.range_size_of(i as u8),
                segment_path,
                reporter,
                tracker.clone(),
                self.inner.log.clone(),
            ));
        }
        *self.inner.work.lock().unwrap() = Some(work);
        Ok(())
    }

    /// Starts every worker over its input/output pair. Requires one stream
    /// pair per worker, in thread-id order.
    pub fn start(
        &self,
        inputs: Vec<ByteStream>,
        outputs: Vec<SegmentSink>,
    ) -> DownloadResult<()> {
        let threads = self.get_threads();
        if threads.is_empty() {
            return Err(DownloadError::invalid_state("no workers created"));
        }
        if inputs.len() != threads.len() || outputs.len() != threads.len() {
            return Err(DownloadError::argument(format!(
                "{} inputs / {} outputs for {} workers",
                inputs.len(),
                outputs.len(),
                threads.len()
            )));
        }
        let work = self.work_handle()?;

        self.inner.log.info("starting workers");
        for ((thread, input), output) in threads.iter().zip(inputs).zip(outputs) {
            if let Err(e) = DownloadThread::spawn_worker(thread, input, output, Arc::clone(&work))
            {
                self.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Restarts the given paused workers over fresh stream pairs. Stream
    /// vectors run parallel to `ids`.
    pub fn resume(
        &self,
        ids: &[u8],
        inputs: Vec<ByteStream>,
        outputs: Vec<SegmentSink>,
    ) -> DownloadResult<()> {
        if ids.len() != inputs.len() || ids.len() != outputs.len() {
            return Err(DownloadError::argument(format!(
                "{} ids / {} inputs / {} outputs",
                ids.len(),
                inputs.len(),
                outputs.len()
            )));
        }
        let work = self.work_handle()?;
        for ((id, input), output) in ids.iter().zip(inputs).zip(outputs) {
            let thread = self
                .inner
                .thread(*id)
                .ok_or_else(|| DownloadError::not_found(format!("worker {id}")))?;
            if let Err(e) = DownloadThread::spawn_worker(&thread, input, output, Arc::clone(&work))
            {
                self.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Moves every running worker to `Paused`; each worker exits its loop at
    /// the next chunk boundary, keeping its segment file and byte count.
    pub fn pause(&self) {
        for thread in self.get_threads() {
            thread.set_state(DownloadState::Paused);
        }
    }

    /// Requests cancel on every worker. Idempotent. Workers that never ran
    /// still get their completion event here.
    pub fn cancel(&self) {
        self.inner.cancel_requested.store(true, Ordering::Release);
        self.inner.cancel_all();
    }

    /// Cancels everything and waits for worker threads to exit.
    pub fn dispose(&self) {
        self.cancel();
        for thread in self.get_threads() {
            thread.join();
        }
    }

    /// Snapshot of the workers in thread-id order.
    pub fn get_threads(&self) -> Vec<Arc<DownloadThread>> {
        self.inner.threads.lock().unwrap().clone()
    }

    /// Number of workers in a terminal state. Derived, never counted by hand.
    pub fn completed_threads_count(&self) -> usize {
        self.get_threads()
            .iter()
            .filter(|t| t.state().is_terminal())
            .count()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::Acquire)
    }

    fn work_handle(&self) -> DownloadResult<Arc<MainWork>> {
        self.inner
            .work
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| DownloadError::invalid_state("no work bound to this task"))
    }
}

impl ManagerInner {
    fn thread(&self, id: u8) -> Option<Arc<DownloadThread>> {
        self.threads
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id() == id)
            .cloned()
    }

    fn snapshot(&self) -> Vec<Arc<DownloadThread>> {
        self.threads.lock().unwrap().clone()
    }

    /// Fires `ThreadCompleted` for `thread` at most once.
    fn fire_completed(&self, thread: &Arc<DownloadThread>) {
        if thread.mark_completed_fired() {
            self.thread_completed.emit(thread);
        }
    }

    fn cancel_all(&self) {
        let threads = self.snapshot();
        for thread in &threads {
            thread.request_cancel();
        }
        // Workers that are running will report on exit; the rest would never
        // report, so their completion is raised here.
        for thread in &threads {
            if !thread.is_alive() && thread.state() == DownloadState::Cancelled {
                self.fire_completed(thread);
            }
        }
    }
}

/// Per-worker reporter: validates progress values and applies the completion
/// rules. Holds its manager weakly; a reporter outliving the manager becomes
/// inert.
struct ManagerReporter {
    manager: Weak<ManagerInner>,
}

impl ProgressReporter for ManagerReporter {
    fn report(&self, thread_id: u8, value: i32) -> DownloadResult<()> {
        if !(-1..=100).contains(&value) {
            return Err(DownloadError::argument(format!(
                "progress {value} outside [-1, 100]"
            )));
        }
        let inner = match self.manager.upgrade() {
            Some(inner) => inner,
            None => return Ok(()),
        };
        let thread = inner
            .thread(thread_id)
            .ok_or_else(|| DownloadError::not_found(format!("worker {thread_id}")))?;

        if value == -1 {
            // Failure or cancellation: stop the peers, then report this
            // worker as done.
            inner.cancel_all();
            inner.fire_completed(&thread);
            return Ok(());
        }

        thread.store_percent(value as u8);
        if value == 100 && thread.set_state(DownloadState::Completed) {
            inner.fire_completed(&thread);
        }
        Ok(())
    }
}
