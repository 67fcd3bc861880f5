//! Download tasks: lifecycle, worker orchestration and finalization.
//!
//! A task drives its thread manager through main work, decides the terminal
//! outcome when the last worker reports, and raises its completion event
//! exactly once.

pub mod manager;
pub mod range_loop;
pub mod thread;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::context::HttpDownloadContext;
use crate::error::{DownloadError, DownloadResult};
use crate::events::{CompletionEvent, Handler};
use crate::logging::ScopedLogger;
use crate::provider::WorkProvider;
use crate::service::DownloadService;
use crate::speed::DownloadSpeedTracker;
use crate::state::DownloadState;

use manager::DownloadThreadManager;
use thread::MainWork;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique task id.
pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// One download job: one URL, one final path, N workers.
pub struct DownloadTask {
    id: u64,
    context: HttpDownloadContext,
    state: Mutex<DownloadState>,
    manager: DownloadThreadManager,
    completed: CompletionEvent<u64>,
    error: Mutex<Option<DownloadError>>,
    finalize_once: AtomicBool,
    permit_held: AtomicBool,
    tracker: Option<Arc<DownloadSpeedTracker>>,
    log: ScopedLogger,
}

impl DownloadTask {
    /// Creates a task in the `Waiting` state.
    pub fn create(
        id: u64,
        context: HttpDownloadContext,
        tracker: Option<Arc<DownloadSpeedTracker>>,
    ) -> Arc<Self> {
        let log = ScopedLogger::root().for_task(id);
        Arc::new(Self {
            id,
            context,
            state: Mutex::new(DownloadState::Waiting),
            manager: DownloadThreadManager::new(id, log.clone()),
            completed: CompletionEvent::new(),
            error: Mutex::new(None),
            finalize_once: AtomicBool::new(false),
            permit_held: AtomicBool::new(false),
            tracker,
            log,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &HttpDownloadContext {
        &self.context
    }

    pub fn state(&self) -> DownloadState {
        *self.state.lock().unwrap()
    }

    pub fn thread_manager(&self) -> &DownloadThreadManager {
        &self.manager
    }

    /// The error that drove the task to `Failed`, if any. Cancellation sets
    /// none.
    pub fn error(&self) -> Option<DownloadError> {
        self.error.lock().unwrap().clone()
    }

    /// Registers a completion handler; fires once, with the task id, after
    /// the state reaches a terminal value.
    pub fn on_completed(&self, handler: Handler<u64>) {
        self.completed.subscribe(handler);
    }

    pub fn has_completed(&self) -> bool {
        self.completed.has_fired()
    }

    /// Blocks until the task completes or `timeout` elapses.
    pub fn wait_completed(&self, timeout: Duration) -> bool {
        self.completed.wait(timeout)
    }

    /// Applies `next` if legal; returns whether it was applied.
    pub fn try_transition(&self, next: DownloadState) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    /// Cancels the task. Idempotent once cancelled; an error for other
    /// terminal states. Workers observe cancellation at their next I/O and
    /// partial segment files are deleted.
    pub fn cancel(&self) -> DownloadResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                DownloadState::Cancelled => return Ok(()),
                s @ (DownloadState::Completed | DownloadState::Failed) => {
                    return Err(DownloadError::invalid_state(format!(
                        "task {} is already {s}",
                        self.id
                    )))
                }
                DownloadState::Waiting => {
                    *state = DownloadState::Cancelled;
                    drop(state);
                    self.log.info("task cancelled before start");
                    self.fire_completed();
                    return Ok(());
                }
                DownloadState::Downloading | DownloadState::Paused => {
                    *state = DownloadState::Cancelled;
                }
            }
        }
        self.log.info("task cancelled");
        self.manager.cancel();
        if self.manager.get_threads().is_empty() {
            self.fire_completed();
        }
        Ok(())
    }

    /// Pauses a downloading task; workers stop at their next chunk boundary
    /// and keep their segment files.
    pub fn pause(&self) -> DownloadResult<()> {
        if !self.try_transition(DownloadState::Paused) {
            return Err(DownloadError::invalid_state(format!(
                "task {} is not downloading",
                self.id
            )));
        }
        self.manager.pause();
        self.log.info("task paused");
        Ok(())
    }

    pub(crate) fn set_error(&self, e: DownloadError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    /// Marks the scheduler permit as held by this task.
    pub(crate) fn mark_permit_held(&self) {
        self.permit_held.store(true, Ordering::Release);
    }

    /// Consumes the permit flag; true at most once per task.
    pub(crate) fn take_permit_flag(&self) -> bool {
        self.permit_held.swap(false, Ordering::AcqRel)
    }

    fn fire_completed(&self) {
        self.completed.fire(&self.id);
    }

    /// Forces `Failed` from any non-terminal state. Validation failures land
    /// here straight from `Waiting`.
    fn force_failed(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.is_terminal() {
            *state = DownloadState::Failed;
        }
    }
}

/// Runs `task` to a terminal state: validates, transitions to `Downloading`,
/// builds workers bound to `service`, and hands stream acquisition to
/// `provider`. Worker completion drives finalization; the call itself
/// returns once the workers are running.
pub fn execute_download_task(
    task: &Arc<DownloadTask>,
    provider: &Arc<dyn WorkProvider>,
    service: &Arc<dyn DownloadService>,
) -> DownloadResult<()> {
    if let Err(e) = task.context.is_properties_valid() {
        task.log.error_with("context validation failed", &e);
        fail_task(task, e);
        return Ok(());
    }
    if !task.try_transition(DownloadState::Downloading) {
        // Cancelled while queued; completion already fired.
        return Ok(());
    }
    task.log.info("task started");

    let bound_service = Arc::clone(service);
    let work: Arc<MainWork> = Arc::new(move |input, output, thread| {
        bound_service.download_file(input, output, thread)
    });
    if let Err(e) = task
        .manager
        .create_threads(&task.context, work, task.tracker.clone())
    {
        fail_task(task, e);
        return Ok(());
    }

    let weak = Arc::downgrade(task);
    let provider_cb = Arc::clone(provider);
    let service_cb = Arc::clone(service);
    task.manager.on_thread_completed(Arc::new(move |_thread| {
        if let Some(task) = weak.upgrade() {
            finish_if_done(&task, &provider_cb, &service_cb);
        }
    }));

    if let Err(e) = provider.execute_main_work(service, task) {
        if task.state() == DownloadState::Cancelled {
            // Raced with a cancel. The workers may already have reported
            // before our handler was registered, so check for the terminal
            // outcome directly as well.
            task.manager.cancel();
            finish_if_done(task, provider, service);
        } else {
            fail_task(task, e);
        }
    }
    Ok(())
}

/// Resumes a paused task: re-opens streams at each unfinished worker's
/// current offset and restarts those workers.
pub fn resume_download_task(
    task: &Arc<DownloadTask>,
    provider: &Arc<dyn WorkProvider>,
    service: &Arc<dyn DownloadService>,
) -> DownloadResult<()> {
    if !task.try_transition(DownloadState::Downloading) {
        return Err(DownloadError::invalid_state(format!(
            "task {} is not paused",
            task.id
        )));
    }
    task.log.info("task resumed");
    if let Err(e) = provider.execute_resume_work(service, task) {
        fail_task(task, e.clone());
        return Err(e);
    }
    Ok(())
}

/// Marks the task failed, stops its workers and guarantees completion fires.
pub(crate) fn fail_task(task: &Arc<DownloadTask>, e: DownloadError) {
    task.log.error_with("task failed", &e);
    task.set_error(e);
    task.force_failed();
    task.manager.cancel();
    if task.manager.get_threads().is_empty() {
        task.fire_completed();
    }
}

/// Terminal-outcome decision, run on every worker completion. Once all N
/// workers are terminal: all completed -> finalize and `Completed`; any
/// failed -> `Failed`; otherwise `Cancelled`. Guarded to run once.
fn finish_if_done(
    task: &Arc<DownloadTask>,
    provider: &Arc<dyn WorkProvider>,
    service: &Arc<dyn DownloadService>,
) {
    let threads = task.manager.get_threads();
    if threads.is_empty() {
        return;
    }
    let terminal = threads.iter().filter(|t| t.state().is_terminal()).count();
    if terminal < threads.len() {
        return;
    }
    if task.finalize_once.swap(true, Ordering::AcqRel) {
        return;
    }

    let segment_paths: Vec<std::path::PathBuf> = threads
        .iter()
        .map(|t| t.segment_path().to_path_buf())
        .collect();
    let all_completed = threads
        .iter()
        .all(|t| t.state() == DownloadState::Completed);
    if all_completed {
        let result = provider
            .get_task_final_stream(&task.context)
            .and_then(|out| provider.execute_finalize_work(out, service, task));
        match result {
            Ok(()) => {
                task.try_transition(DownloadState::Completed);
                task.log.info("task completed");
            }
            Err(e) => {
                task.log.error_with("finalize failed", &e);
                task.set_error(e);
                task.try_transition(DownloadState::Failed);
                crate::service::merge::cleanup(None, Some(&segment_paths));
            }
        }
    } else if threads
        .iter()
        .any(|t| t.state() == DownloadState::Failed)
    {
        if let Some(e) = threads
            .iter()
            .filter(|t| t.state() == DownloadState::Failed)
            .find_map(|t| t.take_error())
        {
            task.set_error(e);
        }
        task.try_transition(DownloadState::Failed);
        task.log.error("task failed: a worker did not complete");
        crate::service::merge::cleanup(None, Some(&segment_paths));
    } else {
        task.try_transition(DownloadState::Cancelled);
        crate::service::merge::cleanup(None, Some(&segment_paths));
    }

    task.fire_completed();
}
