//! Worker-side types (spec component C4, §3) and the default HTTP worker.

pub mod http_worker;

use tokio::sync::mpsc;

use crate::message::{ButtonAvailability, Command, CoordinatorCommand, DetailsStatus, WorkerMessage};
use crate::segment::Segment;
use crate::types::DownloadStatus;

/// Coordinator-side handle to a spawned worker: its outbound command
/// channel plus the last segment/connection number it was assigned (spec
/// §3 "EngineChannel.workers"). The coordinator never touches the worker's
/// internal state directly — only through this handle and the messages it
/// receives back.
pub struct WorkerHandle {
    pub connection_number: u32,
    pub segment: Segment,
    pub command_tx: mpsc::Sender<CoordinatorCommand>,
}

impl WorkerHandle {
    pub async fn send(&self, command: CoordinatorCommand) {
        let command_kind = command.command.clone();
        if self.command_tx.send(command).await.is_err() {
            log::warn!(
                "[worker] connection {} command channel closed, command {:?} dropped",
                self.connection_number,
                command_kind,
            );
        }
    }
}

/// Coordinator-visible mirror of a worker's state (spec §3 "WorkerState").
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub connection_number: u32,
    pub segment: Segment,
    pub status: DownloadStatus,
    pub details_status: DetailsStatus,
    pub reset_count: u32,
    pub last_response_time_millis: u64,
    pub awaiting_reset_response: bool,
    pub button_availability: ButtonAvailability,
}

impl WorkerState {
    pub fn new(connection_number: u32, segment: Segment, now_millis: u64) -> Self {
        Self {
            connection_number,
            segment,
            status: DownloadStatus::Connecting,
            details_status: DetailsStatus::Connecting,
            reset_count: 0,
            last_response_time_millis: now_millis,
            awaiting_reset_response: false,
            button_availability: ButtonAvailability::default(),
        }
    }

    pub fn is_retryable(&self, max_retry_count: Option<u32>) -> bool {
        !matches!(
            self.details_status,
            DetailsStatus::Paused | DetailsStatus::Canceled | DetailsStatus::ConnectionComplete | DetailsStatus::Failed
        ) && max_retry_count.map(|max| self.reset_count < max).unwrap_or(true)
    }
}

/// Contract a worker implementation must satisfy. `startInitial` is always
/// the first command a worker receives; all others arrive over the
/// returned command channel after that. Implementations run in their own
/// spawned task (spec §5 "independent execution unit") and report back
/// exclusively through `message_tx`.
#[async_trait::async_trait]
pub trait Worker: Send + 'static {
    async fn run(
        self: Box<Self>,
        command_rx: mpsc::Receiver<CoordinatorCommand>,
        message_tx: mpsc::Sender<WorkerMessage>,
    );
}

pub(crate) fn is_resume_command(command: Command) -> bool {
    matches!(
        command,
        Command::RefreshSegment | Command::RefreshSegmentReuseConnection | Command::StartReuseConnection
    )
}
