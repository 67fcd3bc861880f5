//! Logging init and the context-tagged logger handed to tasks and workers.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::error::DownloadError;

/// Leveled logger carrying the owning task and worker ids, so every line can
/// be traced back to the worker that produced it.
#[derive(Debug, Clone, Default)]
pub struct ScopedLogger {
    task_id: Option<u64>,
    thread_id: Option<u8>,
}

impl ScopedLogger {
    /// Logger with no scope (scheduler-level messages).
    pub fn root() -> Self {
        Self::default()
    }

    /// Narrows the scope to one task.
    pub fn for_task(&self, task_id: u64) -> Self {
        Self {
            task_id: Some(task_id),
            thread_id: self.thread_id,
        }
    }

    /// Narrows the scope to one worker of the current task.
    pub fn for_thread(&self, thread_id: u8) -> Self {
        Self {
            task_id: self.task_id,
            thread_id: Some(thread_id),
        }
    }

    pub fn info(&self, message: &str) {
        match (self.task_id, self.thread_id) {
            (Some(t), Some(w)) => tracing::info!(task_id = t, thread_id = w, "{message}"),
            (Some(t), None) => tracing::info!(task_id = t, "{message}"),
            (None, Some(w)) => tracing::info!(thread_id = w, "{message}"),
            (None, None) => tracing::info!("{message}"),
        }
    }

    pub fn error(&self, message: &str) {
        match (self.task_id, self.thread_id) {
            (Some(t), Some(w)) => tracing::error!(task_id = t, thread_id = w, "{message}"),
            (Some(t), None) => tracing::error!(task_id = t, "{message}"),
            (None, Some(w)) => tracing::error!(thread_id = w, "{message}"),
            (None, None) => tracing::error!("{message}"),
        }
    }

    pub fn error_with(&self, message: &str, err: &DownloadError) {
        match (self.task_id, self.thread_id) {
            (Some(t), Some(w)) => {
                tracing::error!(task_id = t, thread_id = w, error = %err, "{message}")
            }
            (Some(t), None) => tracing::error!(task_id = t, error = %err, "{message}"),
            (None, Some(w)) => tracing::error!(thread_id = w, error = %err, "{message}"),
            (None, None) => tracing::error!(error = %err, "{message}"),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mtdm=debug"))
}

/// Initialize structured logging to a file, appending. If a log line cannot
/// reach the file (clone failure), it falls back to stderr. Returns Err when
/// the file cannot be opened so the caller can fall back to
/// [`init_logging_stderr`].
pub fn init_logging(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;
    let file = Arc::new(file);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(move || -> Box<dyn io::Write> {
            match file.try_clone() {
                Ok(f) => Box::new(f),
                Err(_) => Box::new(io::stderr()),
            }
        })
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

    tracing::info!("mtdm logging initialized at {}", log_path.display());
    Ok(())
}

/// Initialize logging to stderr only. Use when [`init_logging`] fails or no
/// log file is wanted.
pub fn init_logging_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(io::stderr)
        .with_ansi(false)
        .try_init();
}
