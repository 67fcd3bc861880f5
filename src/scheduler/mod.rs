//! Task admission and global concurrency control.
//!
//! Tasks enter a bounded FIFO queue; a single allocator thread dequeues
//! them, takes a permit, and starts them. Permits return on task completion,
//! so at most `max_parallel_tasks` tasks download at once.

mod permits;

pub use permits::TaskPermits;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::context::HttpDownloadContext;
use crate::error::{DownloadError, DownloadResult};
use crate::events::{EventHandlers, Handler};
use crate::logging::ScopedLogger;
use crate::provider::WorkProvider;
use crate::retry::{run_with_retry, RetryPolicy};
use crate::service::DownloadService;
use crate::speed::DownloadSpeedTracker;
use crate::state::DownloadState;
use crate::task::{self, DownloadTask};

/// Admission retry attempts for scheduler-level hazards.
pub const ADMISSION_RETRIES: u32 = 5;

/// Backoff between admission retries.
pub const ADMISSION_RETRY_WAIT: Duration = Duration::from_millis(1500);

/// How long `stop` waits for the allocator to exit before giving up.
pub const STOP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default capacity of the admission queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Bounded-queue task scheduler with a single background allocator.
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
    queue_rx: Mutex<Option<Receiver<Arc<DownloadTask>>>>,
    allocator: Mutex<Option<JoinHandle<()>>>,
}

struct SchedulerInner {
    tasks: RwLock<HashMap<u64, Arc<DownloadTask>>>,
    queue_tx: Mutex<Option<SyncSender<Arc<DownloadTask>>>>,
    permits: TaskPermits,
    cancel: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    allocator_done: Mutex<bool>,
    allocator_done_cond: Condvar,
    service: Arc<dyn DownloadService>,
    provider: Arc<dyn WorkProvider>,
    tracker: Arc<DownloadSpeedTracker>,
    task_queued: EventHandlers<Arc<DownloadTask>>,
    task_completed: EventHandlers<Arc<DownloadTask>>,
    log: ScopedLogger,
}

impl TaskScheduler {
    /// Builds a scheduler allowing `max_parallel_tasks` concurrent tasks.
    /// Zero is rejected.
    pub fn new(
        max_parallel_tasks: u8,
        service: Arc<dyn DownloadService>,
        provider: Arc<dyn WorkProvider>,
    ) -> DownloadResult<Self> {
        Self::with_queue_capacity(max_parallel_tasks, DEFAULT_QUEUE_CAPACITY, service, provider)
    }

    /// Like [`new`](Self::new), taking caps from an [`EngineConfig`].
    pub fn from_config(
        config: &EngineConfig,
        service: Arc<dyn DownloadService>,
        provider: Arc<dyn WorkProvider>,
    ) -> DownloadResult<Self> {
        Self::with_queue_capacity(
            config.max_parallel_tasks,
            config.task_queue_capacity,
            service,
            provider,
        )
    }

    fn with_queue_capacity(
        max_parallel_tasks: u8,
        queue_capacity: usize,
        service: Arc<dyn DownloadService>,
        provider: Arc<dyn WorkProvider>,
    ) -> DownloadResult<Self> {
        if max_parallel_tasks == 0 {
            return Err(DownloadError::argument(
                "max_parallel_tasks must be at least 1",
            ));
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(queue_capacity.max(1));
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                tasks: RwLock::new(HashMap::new()),
                queue_tx: Mutex::new(Some(tx)),
                permits: TaskPermits::new(max_parallel_tasks as u32),
                cancel: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                allocator_done: Mutex::new(false),
                allocator_done_cond: Condvar::new(),
                service,
                provider,
                tracker: Arc::new(DownloadSpeedTracker::new()),
                task_queued: EventHandlers::new(),
                task_completed: EventHandlers::new(),
                log: ScopedLogger::root(),
            }),
            queue_rx: Mutex::new(Some(rx)),
            allocator: Mutex::new(None),
        })
    }

    /// Fired when a task is enqueued.
    pub fn on_task_queued(&self, handler: Handler<Arc<DownloadTask>>) {
        self.inner.task_queued.subscribe(handler);
    }

    /// Fired when a task reaches a terminal state.
    pub fn on_task_completed(&self, handler: Handler<Arc<DownloadTask>>) {
        self.inner.task_completed.subscribe(handler);
    }

    /// Shared speed tracker fed by every worker of every task.
    pub fn speed_tracker(&self) -> &Arc<DownloadSpeedTracker> {
        &self.inner.tracker
    }

    /// Permits currently free; equals `max_parallel_tasks` when idle.
    pub fn available_permits(&self) -> u32 {
        self.inner.permits.available()
    }

    /// Registers a task for `context` and enqueues it for admission. The
    /// returned task is observable immediately; it starts when the allocator
    /// grants it a permit.
    pub fn add_task(&self, context: HttpDownloadContext) -> DownloadResult<Arc<DownloadTask>> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(DownloadError::invalid_state("scheduler is stopped"));
        }

        let task = DownloadTask::create(
            task::next_task_id(),
            context,
            Some(Arc::clone(&self.inner.tracker)),
        );

        // Completion releases this task's permit (once) and republishes the
        // event; it runs on whichever thread completes the task.
        let weak = Arc::downgrade(&self.inner);
        task.on_completed(Arc::new(move |task_id: &u64| {
            if let Some(inner) = weak.upgrade() {
                inner.finish_task(*task_id);
            }
        }));

        self.inner
            .tasks
            .write()
            .unwrap()
            .insert(task.id(), Arc::clone(&task));

        let tx = self.inner.queue_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(Arc::clone(&task)).map_err(|_| {
                DownloadError::invalid_state("scheduler queue is closed")
            })?,
            None => return Err(DownloadError::invalid_state("scheduler queue is closed")),
        }

        self.inner.log.info(&format!("task {} queued", task.id()));
        self.inner.task_queued.emit(&task);
        Ok(task)
    }

    /// Launches the allocator. Fails when already started or stopped.
    pub fn start(&self) -> DownloadResult<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(DownloadError::invalid_state("scheduler was stopped"));
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(DownloadError::invalid_state("scheduler already started"));
        }
        let rx = self
            .queue_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| DownloadError::invalid_state("allocator queue already taken"))?;

        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("mtdm-allocator".into())
            .spawn(move || run_allocator(inner, rx))
            .map_err(|e| {
                DownloadError::new(
                    crate::error::DownloadErrorCode::ThreadCreationFailed,
                    format!("spawn allocator: {e}"),
                )
            })?;
        *self.allocator.lock().unwrap() = Some(handle);
        self.inner.log.info("scheduler started");
        Ok(())
    }

    /// Signals the allocator to stop and waits up to [`STOP_TIMEOUT`] for it
    /// to exit. In-flight tasks keep running unless cancelled individually.
    pub fn stop(&self) -> DownloadResult<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(DownloadError::invalid_state("scheduler never started"));
        }
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.cancel.store(true, Ordering::Release);
        // Closing the queue unblocks a recv-waiting allocator immediately.
        self.inner.queue_tx.lock().unwrap().take();

        if !self.wait_allocator_done(STOP_TIMEOUT) {
            return Err(DownloadError::unexpected(
                "allocator did not exit within the stop timeout",
            ));
        }
        if let Some(handle) = self.allocator.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.inner.log.info("scheduler stopped");
        Ok(())
    }

    /// Snapshot of every task ever registered, in id order.
    pub fn get_tasks(&self) -> Vec<Arc<DownloadTask>> {
        let mut tasks: Vec<Arc<DownloadTask>> =
            self.inner.tasks.read().unwrap().values().cloned().collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    /// Tasks currently in `state`.
    pub fn get_tasks_in_state(&self, state: DownloadState) -> Vec<Arc<DownloadTask>> {
        self.get_tasks()
            .into_iter()
            .filter(|t| t.state() == state)
            .collect()
    }

    /// Pauses a downloading task.
    pub fn pause_task(&self, task_id: u64) -> DownloadResult<()> {
        self.find_task(task_id)?.pause()
    }

    /// Resumes a paused task from where its workers stopped.
    pub fn resume_task(&self, task_id: u64) -> DownloadResult<()> {
        let task = self.find_task(task_id)?;
        task::resume_download_task(&task, &self.inner.provider, &self.inner.service)
    }

    /// Cancels one task.
    pub fn cancel_task(&self, task_id: u64) -> DownloadResult<()> {
        self.find_task(task_id)?.cancel()
    }

    /// Cancels every task that is not already terminal.
    pub fn cancel_tasks(&self) -> DownloadResult<()> {
        for task in self.get_tasks() {
            if !task.state().is_terminal() {
                task.cancel()?;
            }
        }
        Ok(())
    }

    /// Cancels everything, stops the allocator and releases the queue. The
    /// scheduler cannot be reused afterwards.
    pub fn dispose(&self) {
        let _ = self.cancel_tasks();
        if self.inner.started.load(Ordering::Acquire)
            && !*self.inner.allocator_done.lock().unwrap()
        {
            let _ = self.stop();
        }
        self.inner.queue_tx.lock().unwrap().take();
        self.queue_rx.lock().unwrap().take();
        self.inner.tracker.dispose();
    }

    fn find_task(&self, task_id: u64) -> DownloadResult<Arc<DownloadTask>> {
        self.inner
            .tasks
            .read()
            .unwrap()
            .get(&task_id)
            .cloned()
            .ok_or_else(|| DownloadError::not_found(format!("task {task_id}")))
    }

    fn wait_allocator_done(&self, timeout: Duration) -> bool {
        let mut done = self.inner.allocator_done.lock().unwrap();
        let deadline = Instant::now() + timeout;
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .inner
                .allocator_done_cond
                .wait_timeout(done, deadline - now)
                .unwrap();
            done = guard;
        }
        true
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl SchedulerInner {
    fn finish_task(&self, task_id: u64) {
        let task = self.tasks.read().unwrap().get(&task_id).cloned();
        if let Some(task) = task {
            if task.take_permit_flag() {
                self.permits.release();
            }
            self.log
                .info(&format!("task {} finished as {}", task.id(), task.state()));
            self.task_completed.emit(&task);
        }
    }

    fn signal_allocator_done(&self) {
        let mut done = self.allocator_done.lock().unwrap();
        *done = true;
        self.allocator_done_cond.notify_all();
    }
}

/// The allocator: consumes the queue in FIFO order, one task at a time,
/// blocking on a free permit before each start.
fn run_allocator(inner: Arc<SchedulerInner>, queue: Receiver<Arc<DownloadTask>>) {
    let policy = RetryPolicy::new(ADMISSION_RETRIES, ADMISSION_RETRY_WAIT);
    loop {
        if inner.cancel.load(Ordering::Acquire) {
            break;
        }
        let task = match queue.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if task.state().is_terminal() {
            // Cancelled while queued; nothing to start.
            continue;
        }
        if !inner.permits.acquire(&inner.cancel) {
            break;
        }
        task.mark_permit_held();

        let result = run_with_retry(&policy, || {
            task::execute_download_task(&task, &inner.provider, &inner.service)
        });
        if let Err(e) = result {
            inner
                .log
                .error_with(&format!("admission of task {} failed", task.id()), &e);
            task::fail_task(
                &task,
                DownloadError::unexpected(format!("admission failed: {e}")),
            );
        }
    }
    inner.signal_allocator_done();
}
