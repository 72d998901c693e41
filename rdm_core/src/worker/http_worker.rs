//! Default `Worker` implementation: a single ranged HTTP GET per segment,
//! streamed to a temp file (spec explicitly treats the byte-receive loop as
//! an out-of-scope collaborator; this is this engine's own choice of one).
//! Retry/backoff and filename handling are adapted from the segment-grabber
//! this engine's ancestor used for the same job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::clock::Clock;
use crate::message::{
    ButtonAvailability, Command, ConnectionHandshake, ConnectionSegmentMessage, CoordinatorCommand,
    DetailsStatus, DownloadProgressMessage, LogMessage, SegmentResponseKind, WorkerMessage,
};
use crate::segment::Segment;
use crate::tempstore::TempFileStore;
use crate::types::{DownloadSettings, DownloadStatus};

use super::Worker;

const MAX_RETRIES: u32 = 3;
const PROGRESS_REPORT_PERIOD: Duration = Duration::from_millis(500);

pub struct HttpWorker {
    client: Client,
    clock: Arc<dyn Clock>,
}

impl HttpWorker {
    pub fn new(client: Client, clock: Arc<dyn Clock>) -> Self {
        Self { client, clock }
    }
}

struct Session {
    connection_number: u32,
    segment: Segment,
    download_url: String,
    temp_dir: PathBuf,
    content_length: u64,
    /// Bytes already on disk for this connection number from earlier
    /// (now-COMPLETE) segments it served before being reused.
    baseline_bytes: u64,
    downloaded: u64,
    paused: bool,
    cancelled: bool,
    button_availability: ButtonAvailability,
    last_rate_sample_millis: u64,
    last_rate_sample_bytes: u64,
    ema_rate: f64,
}

#[async_trait::async_trait]
impl Worker for HttpWorker {
    async fn run(self: Box<Self>, mut command_rx: mpsc::Receiver<CoordinatorCommand>, message_tx: mpsc::Sender<WorkerMessage>) {
        let first = match command_rx.recv().await {
            Some(cmd) if cmd.command == Command::StartInitial => cmd,
            Some(other) => {
                log::error!("[http_worker] expected startInitial, got {:?}", other.command);
                return;
            }
            None => return,
        };

        let settings = first.settings.clone();
        let segment = match first.segment {
            Some(s) => s,
            None => {
                log::error!("[http_worker] startInitial missing segment");
                return;
            }
        };

        let now = self.clock.now_millis();
        let mut session = Session {
            connection_number: first.connection_number.unwrap_or(0),
            segment,
            download_url: first.download_item.download_url.clone(),
            temp_dir: settings.temp_dir_for(first.download_item.uid),
            content_length: first.download_item.content_length,
            baseline_bytes: first.previously_written_byte_length.unwrap_or(0),
            downloaded: 0,
            paused: false,
            cancelled: false,
            button_availability: ButtonAvailability { pause: true, start: false },
            last_rate_sample_millis: now,
            last_rate_sample_bytes: 0,
            ema_rate: 0.0,
        };

        if let Err(e) = tokio::fs::create_dir_all(&session.temp_dir).await {
            log::error!("[http_worker] connection {}: cannot create temp dir: {}", session.connection_number, e);
            return;
        }

        let _ = message_tx
            .send(WorkerMessage::Handshake(ConnectionHandshake {
                new_connection_number: session.connection_number,
                reuse_connection: false,
            }))
            .await;

        self.drive(&mut session, command_rx, message_tx, &settings).await;
    }
}

impl HttpWorker {
    async fn drive(
        &self,
        session: &mut Session,
        mut command_rx: mpsc::Receiver<CoordinatorCommand>,
        message_tx: mpsc::Sender<WorkerMessage>,
        settings: &DownloadSettings,
    ) {
        loop {
            if session.cancelled {
                return;
            }
            if session.paused {
                match command_rx.recv().await {
                    Some(cmd) => self.handle_command(session, cmd, &message_tx).await,
                    None => return,
                }
                continue;
            }

            tokio::select! {
                biased;
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(session, cmd, &message_tx).await,
                        None => return,
                    }
                }
                result = self.download_segment(session, &message_tx, settings) => {
                    match result {
                        Ok(()) => {
                            let _ = message_tx
                                .send(WorkerMessage::Progress(self.progress(session, true)))
                                .await;
                            // Fully served; wait idle for a reuse/cancel/pause command.
                            session.button_availability = ButtonAvailability { pause: false, start: false };
                            match command_rx.recv().await {
                                Some(cmd) => self.handle_command(session, cmd, &message_tx).await,
                                None => return,
                            }
                        }
                        Err(e) => {
                            log::warn!("[http_worker] connection {}: {}", session.connection_number, e);
                            let _ = message_tx.send(WorkerMessage::Log(LogMessage { log: e.to_string() })).await;
                        }
                    }
                }
            }
        }
    }

    async fn handle_command(&self, session: &mut Session, cmd: CoordinatorCommand, message_tx: &mpsc::Sender<WorkerMessage>) {
        match cmd.command {
            Command::Pause => {
                session.paused = true;
            }
            Command::Start => {
                session.paused = false;
            }
            Command::Cancel => {
                session.cancelled = true;
            }
            Command::ResetConnection => {
                // Nothing to reset eagerly; the next select loop iteration
                // re-issues the ranged GET from `session.downloaded`.
            }
            Command::RefreshSegment | Command::RefreshSegmentReuseConnection => {
                self.handle_refresh(session, cmd, message_tx).await;
            }
            Command::StartReuseConnection => {
                if let Some(segment) = cmd.segment {
                    session.baseline_bytes += session.segment.length();
                    session.segment = segment;
                    session.downloaded = 0;
                    session.paused = false;
                    let _ = message_tx
                        .send(WorkerMessage::Handshake(ConnectionHandshake {
                            new_connection_number: session.connection_number,
                            reuse_connection: true,
                        }))
                        .await;
                }
            }
            Command::StartInitial => {}
        }
    }

    /// Truncates this worker's segment to the coordinator's proposed
    /// boundary and reports the outcome (spec §4.3 worker response
    /// handling). Refuses if there is nothing left to hand off, or accepts
    /// with `OVERLAPPING_REFRESH_SEGMENT` if the worker already downloaded
    /// past the proposed split point.
    async fn handle_refresh(&self, session: &mut Session, cmd: CoordinatorCommand, message_tx: &mpsc::Sender<WorkerMessage>) {
        let reuse = cmd.command == Command::RefreshSegmentReuseConnection;
        let Some(proposed) = cmd.segment else { return };

        let already_past = session.segment.start + session.downloaded > proposed.end + 1;
        let exhausted = session.downloaded >= session.segment.length();

        let response = if exhausted {
            ConnectionSegmentMessage {
                internal_message: if reuse {
                    SegmentResponseKind::ReuseRefreshSegmentRefused
                } else {
                    SegmentResponseKind::RefreshSegmentRefused
                },
                requested_segment: proposed,
                refreshed_start_byte: None,
                refreshed_end_byte: None,
                valid_new_start_byte: None,
                valid_new_end_byte: None,
                reuse_connection: reuse,
            }
        } else if already_past {
            let actual_end = session.segment.start + session.downloaded - 1;
            ConnectionSegmentMessage {
                internal_message: SegmentResponseKind::OverlappingRefreshSegment,
                requested_segment: proposed,
                refreshed_start_byte: Some(session.segment.start),
                refreshed_end_byte: Some(actual_end),
                valid_new_start_byte: Some(actual_end + 1),
                valid_new_end_byte: Some(session.segment.end),
                reuse_connection: reuse,
            }
        } else {
            session.segment = proposed;
            ConnectionSegmentMessage {
                internal_message: SegmentResponseKind::RefreshSegmentSuccess,
                requested_segment: proposed,
                refreshed_start_byte: None,
                refreshed_end_byte: None,
                valid_new_start_byte: None,
                valid_new_end_byte: None,
                reuse_connection: reuse,
            }
        };

        let _ = message_tx.send(WorkerMessage::SegmentResponse(response)).await;
    }

    fn progress(&self, session: &mut Session, completion_signal: bool) -> DownloadProgressMessage {
        let segment_total = session.segment.length().max(1);
        let write_fraction = (session.downloaded as f64 / segment_total as f64).min(1.0);

        let total_received = session.baseline_bytes + session.downloaded;
        let whole_file_fraction = if session.content_length > 0 {
            (total_received as f64 / session.content_length as f64).min(1.0)
        } else {
            0.0
        };

        let now = self.clock.now_millis();
        let elapsed_millis = now.saturating_sub(session.last_rate_sample_millis);
        if elapsed_millis >= 200 {
            let delta_bytes = total_received.saturating_sub(session.last_rate_sample_bytes);
            let instantaneous = delta_bytes as f64 / (elapsed_millis as f64 / 1000.0);
            const EMA_ALPHA: f64 = 0.3;
            session.ema_rate = EMA_ALPHA * instantaneous + (1.0 - EMA_ALPHA) * session.ema_rate;
            session.last_rate_sample_millis = now;
            session.last_rate_sample_bytes = total_received;
        }

        DownloadProgressMessage {
            connection_number: session.connection_number,
            status: if completion_signal { DownloadStatus::ConnectionComplete } else { DownloadStatus::Downloading },
            details_status: if completion_signal { DetailsStatus::ConnectionComplete } else { DetailsStatus::Downloading },
            total_download_progress: whole_file_fraction,
            total_connection_write_progress: write_fraction,
            total_received_bytes: total_received,
            bytes_transfer_rate: if completion_signal { 0.0 } else { session.ema_rate },
            button_availability: session.button_availability,
            completion_signal,
            segment: Some(session.segment),
        }
    }

    /// Streams one ranged GET for `session.segment`, resuming from
    /// `session.downloaded`, with exponential-backoff retry on transient
    /// network errors (grounded in the ancestor segment downloader).
    async fn download_segment(
        &self,
        session: &mut Session,
        message_tx: &mpsc::Sender<WorkerMessage>,
        _settings: &DownloadSettings,
    ) -> Result<(), reqwest::Error> {
        let mut retries = 0u32;
        let mut report_tick = interval(PROGRESS_REPORT_PERIOD);

        loop {
            if session.downloaded >= session.segment.length() {
                return Ok(());
            }

            let start = session.segment.start + session.downloaded;
            let end = session.segment.end;
            let response = self
                .client
                .get(&session.download_url)
                .header("Range", format!("bytes={start}-{end}"))
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(100 * (1u64 << retries.min(5)))).await;
                    continue;
                }
            };

            let file_name = TempFileStore::temp_file_name(session.segment);
            let path = session.temp_dir.join(&file_name);
            let file = if session.downloaded > 0 {
                tokio::fs::OpenOptions::new().append(true).open(&path).await
            } else {
                tokio::fs::File::create(&path).await
            };
            let file = match file {
                Ok(f) => f,
                Err(e) => {
                    log::error!("[http_worker] connection {}: temp file error: {}", session.connection_number, e);
                    return Ok(());
                }
            };
            let mut writer = tokio::io::BufWriter::with_capacity(256 * 1024, file);
            let remaining = session.segment.length() - session.downloaded;
            let mut written_this_attempt = 0u64;
            let mut stream = response.bytes_stream();
            let mut stream_error = false;

            loop {
                tokio::select! {
                    _ = report_tick.tick() => {
                        let _ = message_tx.send(WorkerMessage::Progress(self.progress(session, false))).await;
                    }
                    chunk = stream.next() => {
                        match chunk {
                            Some(Ok(chunk)) => {
                                let left = remaining - written_this_attempt;
                                let usable = (chunk.len() as u64).min(left) as usize;
                                if usable == 0 {
                                    break;
                                }
                                if writer.write_all(&chunk[..usable]).await.is_err() {
                                    stream_error = true;
                                    break;
                                }
                                written_this_attempt += usable as u64;
                                session.downloaded += usable as u64;
                                if written_this_attempt >= remaining {
                                    break;
                                }
                            }
                            Some(Err(_)) => {
                                stream_error = true;
                                break;
                            }
                            None => break,
                        }
                    }
                }
            }

            let _ = writer.flush().await;

            if stream_error {
                retries += 1;
                if retries >= MAX_RETRIES {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(100 * (1u64 << retries.min(5)))).await;
                continue;
            }

            if session.downloaded >= session.segment.length() {
                return Ok(());
            }
        }
    }
}
