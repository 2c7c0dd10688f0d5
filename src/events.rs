//! Typed outbound events: one ordered channel with a single consumer (the
//! operator surface). Senders never block and never fail the caller; a
//! dropped receiver just means nobody is watching.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::device::LinkState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded {
        attachment_id: Option<u64>,
        file_removed: bool,
    },
    Failed {
        error: String,
    },
}

/// Running totals across one run's uploads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub uploaded: u32,
    pub failed: u32,
    /// Observation creation plus one step per capture
    pub total_steps: u32,
    pub completed_steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InspectionEvent {
    LinkStateChanged {
        state: LinkState,
    },
    RunStarted {
        output_dir: PathBuf,
        teeth: u32,
        captures: u32,
    },
    Progress {
        index: u32,
        total: u32,
        angle_deg: f64,
    },
    CaptureSaved {
        tooth_number: u32,
        path: PathBuf,
    },
    UploadResult {
        tooth_number: u32,
        path: PathBuf,
        outcome: UploadOutcome,
        progress: UploadProgress,
    },
    RunFinished {
        output_dir: PathBuf,
        captures: u32,
    },
    RunAborted {
        index: u32,
        reason: String,
    },
}

impl fmt::Display for InspectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InspectionEvent::LinkStateChanged { state } => write!(f, "link {:?}", state),
            InspectionEvent::RunStarted {
                output_dir,
                teeth,
                captures,
            } => write!(
                f,
                "run started: {} of {} teeth -> {}",
                captures,
                teeth,
                output_dir.display()
            ),
            InspectionEvent::Progress {
                index,
                total,
                angle_deg,
            } => write!(f, "[{}/{}] {:.3} deg", index + 1, total, angle_deg),
            InspectionEvent::CaptureSaved { tooth_number, path } => {
                write!(f, "tooth {} saved to {}", tooth_number, path.display())
            }
            InspectionEvent::UploadResult {
                tooth_number,
                outcome,
                progress,
                ..
            } => {
                match outcome {
                    UploadOutcome::Uploaded { .. } => write!(f, "tooth {} uploaded", tooth_number)?,
                    UploadOutcome::Failed { error } => {
                        write!(f, "tooth {} upload failed: {}", tooth_number, error)?
                    }
                }
                write!(
                    f,
                    " ({}/{} steps, {} failed)",
                    progress.completed_steps, progress.total_steps, progress.failed
                )
            }
            InspectionEvent::RunFinished {
                output_dir,
                captures,
            } => write!(f, "run finished: {} captures in {}", captures, output_dir.display()),
            InspectionEvent::RunAborted { index, reason } => {
                write!(f, "run aborted at capture {}: {}", index, reason)
            }
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<InspectionEvent>;

#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<InspectionEvent>>,
}

impl EventSender {
    /// A sender that drops everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: InspectionEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::trace!("Event receiver gone; event dropped");
            }
        }
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx: Some(tx) }, rx)
}
