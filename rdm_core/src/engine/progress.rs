//! `ProgressAggregator` (spec component C7, §4.4): folds one worker's
//! `DownloadProgressMessage` into the per-download aggregate and decides
//! when assembly should run.

use crate::duration::{format_bytes, format_eta_secs};
use crate::error::EngineError;
use crate::message::{ButtonAvailability, ConnectionProgress, DetailsStatus, DownloadProgressMessage, ProgressMessage};
use crate::tempstore::TempFileStore;
use crate::types::DownloadStatus;

use super::channel::EngineChannel;

pub struct ProgressAggregator;

/// Outcome of folding one progress message: the aggregated message to emit,
/// plus an assembly result if this update triggered one (spec §4.4 step 9).
pub struct ProgressUpdate {
    pub message: ProgressMessage,
    pub assembled: Option<Result<std::path::PathBuf, EngineError>>,
}

impl ProgressAggregator {
    pub fn apply(channel: &mut EngineChannel, msg: DownloadProgressMessage, now_millis: u64) -> ProgressUpdate {
        // Step 1: replace this connection's last-known progress.
        channel.connection_progresses.insert(
            msg.connection_number,
            ConnectionProgress {
                connection_number: msg.connection_number,
                status: msg.status,
                details_status: msg.details_status,
                total_download_progress: msg.total_download_progress,
                total_received_bytes: msg.total_received_bytes,
                bytes_transfer_rate: msg.bytes_transfer_rate,
            },
        );
        if let Some(state) = channel.worker_states.get_mut(&msg.connection_number) {
            state.status = msg.status;
            state.details_status = msg.details_status;
            state.last_response_time_millis = now_millis;
            state.button_availability = msg.button_availability;
            if let Some(segment) = msg.segment {
                state.segment = segment;
            }
            // Step 2: downloading progress clears a pending reset.
            if msg.status == DownloadStatus::Downloading {
                state.awaiting_reset_response = false;
            }
        }

        // Step 8: a completion signal retires the worker into the reuse
        // queue and marks its leaf COMPLETE.
        if msg.completion_signal {
            channel.enqueue_for_reuse(msg.connection_number);
            if let Some(state) = channel.worker_states.get(&msg.connection_number) {
                if let Some(leaf) = channel.segment_tree.search(state.segment) {
                    channel
                        .segment_tree
                        .set_status(leaf, crate::tree::SegmentStatus::Complete, now_millis);
                }
            }
        }

        // Steps 3-4: aggregate rate and whole-file progress.
        let total_rate: f64 = channel.connection_progresses.values().map(|p| p.bytes_transfer_rate).sum();
        let total_progress: f64 = channel.total_progress().min(1.0);

        // Step 5: recompute ETA at most once per second.
        if total_progress >= 1.0 {
            channel.cached_eta = String::new();
        } else if now_millis.saturating_sub(channel.last_eta_recompute_millis) >= 1000 || channel.cached_eta.is_empty() {
            channel.last_eta_recompute_millis = now_millis;
            channel.cached_eta = if total_rate > 0.0 {
                let remaining_fraction = (1.0 - total_progress).max(0.0);
                let remaining_bytes = remaining_fraction * channel.download_item.content_length as f64;
                format_eta_secs((remaining_bytes / total_rate).round() as u64)
            } else {
                String::new()
            };
        }

        // Step 6: status precedence.
        let statuses: Vec<DownloadStatus> = channel.connection_progresses.values().map(|p| p.status).collect();
        let mut status = statuses.first().copied().unwrap_or(DownloadStatus::Connecting);
        if !statuses.is_empty() && statuses.iter().all(|s| *s == DownloadStatus::Connecting) {
            status = DownloadStatus::Connecting;
        }
        if total_progress >= 1.0 {
            status = DownloadStatus::ConnectionComplete;
        }
        if statuses.iter().any(|s| *s == DownloadStatus::Downloading) {
            status = DownloadStatus::Downloading;
        }

        // Step 7: button availability, debounced per engine.
        let all_pause_ready = channel
            .worker_states
            .values()
            .filter(|w| !matches!(w.details_status, DetailsStatus::ConnectionComplete | DetailsStatus::Failed))
            .all(|w| w.button_availability.pause);
        let all_start_ready = channel
            .worker_states
            .values()
            .filter(|w| !matches!(w.details_status, DetailsStatus::ConnectionComplete | DetailsStatus::Failed))
            .all(|w| w.button_availability.start);

        if channel.button_wait_started_millis.is_none() {
            channel.button_wait_started_millis = Some(now_millis);
        }
        let wait_elapsed = now_millis.saturating_sub(channel.button_wait_started_millis.unwrap_or(now_millis)) >= 2000;
        channel.button_availability = ButtonAvailability {
            pause: all_pause_ready && wait_elapsed,
            start: all_start_ready && wait_elapsed,
        };

        // Step 9: assembly trigger.
        let assembled = Self::maybe_assemble(channel, &mut status);

        let message = ProgressMessage {
            download_item: channel.download_item.clone(),
            status,
            download_progress: total_progress,
            total_download_progress: total_progress,
            transfer_rate: format!("{}/s", format_bytes(total_rate.round() as u64)),
            estimated_remaining: channel.cached_eta.clone(),
            button_availability: channel.button_availability,
            connection_progresses: channel.connection_progresses.values().cloned().collect(),
            assemble_progress: None,
        };

        ProgressUpdate { message, assembled }
    }

    /// Temp-write-completion requires every worker to have fully written
    /// its segment and report `connectionComplete`, and no missing ranges
    /// remain on disk (spec §4.4 "Temp-write-completion").
    fn maybe_assemble(
        channel: &mut EngineChannel,
        status: &mut DownloadStatus,
    ) -> Option<Result<std::path::PathBuf, EngineError>> {
        if channel.assemble_requested {
            return None;
        }
        if matches!(*status, DownloadStatus::AssembleComplete | DownloadStatus::AssembleFailed) {
            return None;
        }
        if channel.worker_states.is_empty() {
            return None;
        }

        let writes_complete = channel
            .worker_states
            .values()
            .all(|w| w.details_status == DetailsStatus::ConnectionComplete);
        if !writes_complete {
            return None;
        }

        let temp_dir = channel.settings.temp_dir_for(channel.download_item.uid);
        let missing = TempFileStore::find_missing_byte_ranges(channel.download_item.content_length, &temp_dir).unwrap_or_default();
        if !missing.is_empty() {
            return None;
        }

        channel.assemble_requested = true;
        let result = TempFileStore::assemble(&channel.download_item, &channel.settings);
        *status = match &result {
            Ok(_) => DownloadStatus::AssembleComplete,
            Err(_) => DownloadStatus::AssembleFailed,
        };
        channel.download_item.status = *status;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use crate::tree::SegmentTree;
    use crate::types::{DownloadItem, DownloadSettings, DownloadStatus};
    use crate::worker::WorkerState;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn test_channel(content_length: u64) -> EngineChannel {
        let (tree, _) = SegmentTree::build_from_missing_bytes(1, &[Segment::new(0, content_length - 1)], content_length, 0);
        let item = DownloadItem::new("f.bin".into(), PathBuf::new(), "https://x.test/f".into(), content_length);
        let temp_root = tempdir().unwrap().into_path();
        let settings = DownloadSettings {
            total_connections: 1,
            max_connection_retry_count: Some(5),
            connection_retry_timeout_millis: 15_000,
            base_temp_dir: temp_root.clone(),
            base_save_dir: temp_root,
        };
        let mut channel = EngineChannel::new(item, settings, tree, 1, 1);
        channel.worker_states.insert(0, WorkerState::new(0, Segment::new(0, content_length - 1), 0));
        channel
    }

    #[test]
    fn single_worker_progress_aggregates_to_whole_file_fraction() {
        let mut channel = test_channel(1000);
        let msg = DownloadProgressMessage {
            connection_number: 0,
            status: DownloadStatus::Downloading,
            details_status: DetailsStatus::Downloading,
            total_download_progress: 0.5,
            total_connection_write_progress: 0.5,
            total_received_bytes: 500,
            bytes_transfer_rate: 100.0,
            button_availability: ButtonAvailability { pause: true, start: false },
            completion_signal: false,
            segment: Some(Segment::new(0, 999)),
        };
        let update = ProgressAggregator::apply(&mut channel, msg, 1000);
        assert_eq!(update.message.total_download_progress, 0.5);
        assert_eq!(update.message.status, DownloadStatus::Downloading);
        assert!(update.assembled.is_none());
    }

    #[test]
    fn completion_signal_enqueues_reuse_and_marks_leaf_complete() {
        let mut channel = test_channel(1000);
        let msg = DownloadProgressMessage {
            connection_number: 0,
            status: DownloadStatus::ConnectionComplete,
            details_status: DetailsStatus::ConnectionComplete,
            total_download_progress: 1.0,
            total_connection_write_progress: 1.0,
            total_received_bytes: 1000,
            bytes_transfer_rate: 0.0,
            button_availability: ButtonAvailability { pause: false, start: false },
            completion_signal: true,
            segment: Some(Segment::new(0, 999)),
        };
        let _ = ProgressAggregator::apply(&mut channel, msg, 1000);
        assert_eq!(channel.reuse_queue.len(), 1);
        let leaf = channel.segment_tree.leaves().next().unwrap();
        assert_eq!(channel.segment_tree.node(leaf).status, crate::tree::SegmentStatus::Complete);
    }
}
