//! Per-download metadata and engine-wide configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Segments below this length are never produced by a split — neither the
/// dynamic spawn splitter nor the reuse splitter will go below it (spec §3).
pub const MINIMUM_DOWNLOAD_SEGMENT_LENGTH: u64 = 500_000;

/// Period of the dynamic-spawn timer (spec §4.3).
pub const SPAWN_TIMER_PERIOD: Duration = Duration::from_secs(2);
/// Period of the dynamic-reuse timer (spec §4.3).
pub const REUSE_TIMER_PERIOD: Duration = Duration::from_secs(2);
/// Period of the connection-reset timer (spec §4.3).
pub const RESET_TIMER_PERIOD: Duration = Duration::from_secs(4);
/// Period of the button-availability timer (spec §4.3).
pub const BUTTON_TIMER_PERIOD: Duration = Duration::from_secs(1);
/// Per-engine debounce before a button hint is allowed to flip to enabled.
pub const BUTTON_AVAILABILITY_WAIT: Duration = Duration::from_secs(2);
/// `FileInfoProbe` HEAD request timeout (spec §4.5, §6).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// A download is "near completion" when its ETA drops under this many seconds
/// (spec §4.3, `_shouldCreateNewConnections`).
pub const NEAR_COMPLETION_ETA_SECS: u64 = 5;

/// Lifecycle status of a download as seen by the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DownloadStatus {
    Connecting,
    Downloading,
    ConnectionComplete,
    Paused,
    AssembleComplete,
    AssembleFailed,
    Cancelled,
}

/// Stable metadata for one download (spec §3 "DownloadItem").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub uid: Uuid,
    pub file_name: String,
    pub file_path: PathBuf,
    pub download_url: String,
    pub content_length: u64,
    pub status: DownloadStatus,
    pub finish_date: Option<String>,
}

impl DownloadItem {
    pub fn new(file_name: String, file_path: PathBuf, download_url: String, content_length: u64) -> Self {
        Self {
            uid: Uuid::new_v4(),
            file_name,
            file_path,
            download_url,
            content_length,
            status: DownloadStatus::Connecting,
            finish_date: None,
        }
    }
}

/// Engine-wide tunables supplied by the caller (spec §6 "DownloadSettings").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    pub total_connections: usize,
    /// `-1` (represented here as `None`) means unlimited retries.
    pub max_connection_retry_count: Option<u32>,
    pub connection_retry_timeout_millis: u64,
    pub base_temp_dir: PathBuf,
    pub base_save_dir: PathBuf,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            total_connections: 8,
            max_connection_retry_count: Some(5),
            connection_retry_timeout_millis: 15_000,
            base_temp_dir: std::env::temp_dir().join("rdm"),
            base_save_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }
}

impl DownloadSettings {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_retry_timeout_millis)
    }

    pub fn temp_dir_for(&self, uid: Uuid) -> PathBuf {
        self.base_temp_dir.join(uid.to_string())
    }
}
