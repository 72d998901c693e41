//! Wire shapes crossing the coordinator/caller and coordinator/worker
//! boundaries (spec §6). Everything here is a plain data type; behavior
//! lives in `engine::coordinator` and `worker`.

use serde::{Deserialize, Serialize};

use crate::segment::Segment;
use crate::types::{DownloadItem, DownloadSettings, DownloadStatus};

/// Commands the external caller may send for a download (spec §4.3 intake
/// list). `StartInitial`, `RefreshSegment`, `RefreshSegmentReuseConnection`,
/// `ResetConnection`, and `StartReuseConnection` also double as
/// coordinator→worker commands; the caller only ever originates `Start`,
/// `Pause`, `ResetConnection`, and `Cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    Start,
    Pause,
    ResetConnection,
    RefreshSegment,
    RefreshSegmentReuseConnection,
    StartReuseConnection,
    StartInitial,
    Cancel,
}

/// Coordinator inbound message (spec §6).
#[derive(Debug, Clone)]
pub struct CoordinatorCommand {
    pub command: Command,
    pub download_item: DownloadItem,
    pub settings: DownloadSettings,
    pub segment: Option<Segment>,
    pub connection_number: Option<u32>,
    pub previously_written_byte_length: Option<u64>,
}

impl CoordinatorCommand {
    pub fn start(download_item: DownloadItem, settings: DownloadSettings) -> Self {
        Self {
            command: Command::Start,
            download_item,
            settings,
            segment: None,
            connection_number: None,
            previously_written_byte_length: None,
        }
    }

    pub fn simple(command: Command, download_item: DownloadItem, settings: DownloadSettings) -> Self {
        Self {
            command,
            download_item,
            settings,
            segment: None,
            connection_number: None,
            previously_written_byte_length: None,
        }
    }
}

/// Per-worker detail status reported inside `DownloadProgressMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetailsStatus {
    Connecting,
    Downloading,
    Paused,
    Canceled,
    ConnectionComplete,
    /// Worker stalled and exhausted `maxConnectionRetryCount`; the
    /// connection-reset timer has given up on it (spec §7 kind 1).
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ButtonAvailability {
    pub pause: bool,
    pub start: bool,
}

/// `DownloadProgressMessage` (spec §6): periodic per-worker status report.
#[derive(Debug, Clone)]
pub struct DownloadProgressMessage {
    pub connection_number: u32,
    pub status: DownloadStatus,
    pub details_status: DetailsStatus,
    pub total_download_progress: f64,
    pub total_connection_write_progress: f64,
    pub total_received_bytes: u64,
    pub bytes_transfer_rate: f64,
    pub button_availability: ButtonAvailability,
    pub completion_signal: bool,
    pub segment: Option<Segment>,
}

/// Internal tag on `ConnectionSegmentMessage` (spec §6, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentResponseKind {
    RefreshSegmentSuccess,
    OverlappingRefreshSegment,
    RefreshSegmentRefused,
    ReuseRefreshSegmentRefused,
}

/// `ConnectionSegmentMessage` (spec §6): a worker's reply to a
/// `refreshSegment` / `refreshSegmentReuseConnection` command.
#[derive(Debug, Clone)]
pub struct ConnectionSegmentMessage {
    pub internal_message: SegmentResponseKind,
    pub requested_segment: Segment,
    pub refreshed_start_byte: Option<u64>,
    pub refreshed_end_byte: Option<u64>,
    pub valid_new_start_byte: Option<u64>,
    pub valid_new_end_byte: Option<u64>,
    pub reuse_connection: bool,
}

/// `ConnectionHandshake` (spec §6): a worker confirming it has taken up a
/// segment and is ready to be tracked.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionHandshake {
    pub new_connection_number: u32,
    pub reuse_connection: bool,
}

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub log: String,
}

/// Tagged union of everything a worker may send the coordinator (spec §9
/// "replace runtime-type dispatch with a tagged variant").
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Progress(DownloadProgressMessage),
    SegmentResponse(ConnectionSegmentMessage),
    Handshake(ConnectionHandshake),
    Log(LogMessage),
}

/// Per-worker progress entry embedded in the outbound `ProgressMessage`.
#[derive(Debug, Clone)]
pub struct ConnectionProgress {
    pub connection_number: u32,
    pub status: DownloadStatus,
    pub details_status: DetailsStatus,
    pub total_download_progress: f64,
    pub total_received_bytes: u64,
    pub bytes_transfer_rate: f64,
}

/// Coordinator outbound (progress) message (spec §6).
#[derive(Debug, Clone)]
pub struct ProgressMessage {
    pub download_item: DownloadItem,
    pub status: DownloadStatus,
    pub download_progress: f64,
    pub total_download_progress: f64,
    pub transfer_rate: String,
    pub estimated_remaining: String,
    pub button_availability: ButtonAvailability,
    pub connection_progresses: Vec<ConnectionProgress>,
    pub assemble_progress: Option<f64>,
}
