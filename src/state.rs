//! Download lifecycle states and the legal transition table.

use std::fmt;

/// Lifecycle state shared by tasks and workers.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; no transition leaves
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadState {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl DownloadState {
    /// True for `Completed`, `Failed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Failed | DownloadState::Cancelled
        )
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: DownloadState) -> bool {
        use DownloadState::*;
        match self {
            Waiting => matches!(next, Downloading | Cancelled),
            Downloading => matches!(next, Completed | Failed | Cancelled | Paused),
            Paused => matches!(next, Downloading | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadState::Waiting => "waiting",
            DownloadState::Downloading => "downloading",
            DownloadState::Paused => "paused",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
            DownloadState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}
