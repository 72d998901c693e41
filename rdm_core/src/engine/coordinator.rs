//! The coordinator state machine (spec component C6, §4.3): command intake,
//! the four periodic timers, worker message dispatch, and the assembly
//! trigger. This is the largest and most load-bearing piece of the engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::message::{
    ButtonAvailability, Command, ConnectionHandshake, ConnectionSegmentMessage, CoordinatorCommand, DetailsStatus,
    DownloadProgressMessage, LogMessage, ProgressMessage, SegmentResponseKind, WorkerMessage,
};
use crate::segment::Segment;
use crate::tempstore::TempFileStore;
use crate::tree::{SegmentStatus, SegmentTree};
use crate::types::{
    DownloadSettings, NEAR_COMPLETION_ETA_SECS, RESET_TIMER_PERIOD, REUSE_TIMER_PERIOD, SPAWN_TIMER_PERIOD,
};
use crate::worker::http_worker::HttpWorker;
use crate::worker::{Worker, WorkerHandle, WorkerState};

use super::channel::EngineChannel;
use super::registry::EngineRegistry;

/// A worker message tagged with the download it came from — workers only
/// know their own connection number, not which download they belong to.
struct WorkerEnvelope {
    uid: Uuid,
    message: WorkerMessage,
}

/// Produces the `Worker` a freshly spawned leaf runs. Exists so tests can
/// substitute a fake worker without touching the network.
pub trait WorkerFactory: Send + Sync {
    fn create(&self) -> Box<dyn Worker>;
}

pub struct HttpWorkerFactory {
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl HttpWorkerFactory {
    pub fn new(client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        Self { client, clock }
    }
}

impl WorkerFactory for HttpWorkerFactory {
    fn create(&self) -> Box<dyn Worker> {
        Box::new(HttpWorker::new(self.client.clone(), self.clock.clone()))
    }
}

pub struct Coordinator {
    registry: EngineRegistry,
    clock: Arc<dyn Clock>,
    worker_factory: Arc<dyn WorkerFactory>,
}

impl Coordinator {
    pub fn new(clock: Arc<dyn Clock>, worker_factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            registry: EngineRegistry::new(),
            clock,
            worker_factory,
        }
    }

    /// Drives the coordinator until `command_rx` closes. Aggregated progress
    /// is emitted on `event_tx`.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<CoordinatorCommand>, event_tx: mpsc::Sender<ProgressMessage>) {
        let (envelope_tx, mut envelope_rx) = mpsc::channel::<WorkerEnvelope>(1024);

        let mut spawn_timer = interval(SPAWN_TIMER_PERIOD);
        let mut reuse_timer = interval(REUSE_TIMER_PERIOD);
        let mut reset_timer = interval(RESET_TIMER_PERIOD);
        let mut button_timer = interval(crate::types::BUTTON_TIMER_PERIOD);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd, &envelope_tx, &event_tx).await,
                        None => return,
                    }
                }
                envelope = envelope_rx.recv() => {
                    if let Some(envelope) = envelope {
                        self.handle_worker_message(envelope, &envelope_tx, &event_tx).await;
                    }
                }
                _ = spawn_timer.tick() => self.dynamic_spawn_tick(&envelope_tx).await,
                _ = reuse_timer.tick() => self.dynamic_reuse_tick().await,
                _ = reset_timer.tick() => self.connection_reset_tick(&event_tx).await,
                _ = button_timer.tick() => self.button_availability_tick(&event_tx).await,
            }
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    // ---- command intake -------------------------------------------------

    async fn handle_command(&mut self, cmd: CoordinatorCommand, envelope_tx: &mpsc::Sender<WorkerEnvelope>, event_tx: &mpsc::Sender<ProgressMessage>) {
        match cmd.command {
            Command::Start => self.handle_start(cmd, envelope_tx, event_tx).await,
            Command::Pause => self.handle_pause(cmd).await,
            Command::Cancel => self.handle_cancel(cmd).await,
            Command::ResetConnection
            | Command::RefreshSegment
            | Command::RefreshSegmentReuseConnection
            | Command::StartReuseConnection
            | Command::StartInitial => self.forward_to_worker(cmd).await,
        }
    }

    /// Spec §4.3 "On start for a download not yet present", steps 1-6.
    async fn handle_start(&mut self, cmd: CoordinatorCommand, envelope_tx: &mpsc::Sender<WorkerEnvelope>, event_tx: &mpsc::Sender<ProgressMessage>) {
        let uid = cmd.download_item.uid;
        let now = self.now();

        if self.registry.contains(&uid) {
            // Re-entry: broadcast to all existing workers with their own
            // connection number filled in.
            if let Some(channel) = self.registry.get(&uid) {
                let handles: Vec<(u32, DownloadSettings)> = channel.workers.keys().map(|c| (*c, channel.settings.clone())).collect();
                let item = channel.download_item.clone();
                for (conn, settings) in handles {
                    self.send_to_worker(&uid, conn, CoordinatorCommand {
                        command: Command::Start,
                        download_item: item.clone(),
                        settings,
                        segment: None,
                        connection_number: Some(conn),
                        previously_written_byte_length: None,
                    }).await;
                }
            }
            return;
        }

        let settings = cmd.settings;
        let item = cmd.download_item;
        let temp_dir = settings.temp_dir_for(item.uid);
        let destination = settings.base_save_dir.join(&item.file_name);

        if let Ok(meta) = std::fs::metadata(&destination) {
            if meta.len() != item.content_length {
                let _ = std::fs::remove_file(&destination);
            } else {
                // Already fully assembled from a prior run; re-starting is a
                // no-op (spec §8 "re-calling start on assembleComplete").
                let mut item = item;
                item.status = crate::types::DownloadStatus::AssembleComplete;
                let _ = event_tx
                    .send(ProgressMessage {
                        download_item: item.clone(),
                        status: item.status,
                        download_progress: 1.0,
                        total_download_progress: 1.0,
                        transfer_rate: "0 B/s".into(),
                        estimated_remaining: String::new(),
                        button_availability: ButtonAvailability::default(),
                        connection_progresses: Vec::new(),
                        assemble_progress: Some(1.0),
                    })
                    .await;
                return;
            }
        }

        let _ = TempFileStore::validate_integrity(&item, &temp_dir, true, false);
        let missing = TempFileStore::find_missing_byte_ranges(item.content_length, &temp_dir).unwrap_or_default();

        if missing.is_empty() {
            let assembled = TempFileStore::assemble(&item, &settings);
            let mut item = item;
            item.status = match &assembled {
                Ok(_) => crate::types::DownloadStatus::AssembleComplete,
                Err(_) => crate::types::DownloadStatus::AssembleFailed,
            };
            let _ = event_tx
                .send(ProgressMessage {
                    download_item: item.clone(),
                    status: item.status,
                    download_progress: 1.0,
                    total_download_progress: 1.0,
                    transfer_rate: "0 B/s".into(),
                    estimated_remaining: String::new(),
                    button_availability: ButtonAvailability::default(),
                    connection_progresses: Vec::new(),
                    assemble_progress: Some(1.0),
                })
                .await;
            return;
        }

        let (tree, recovery) = SegmentTree::build_from_missing_bytes(settings.total_connections, &missing, item.content_length, now);
        let created_connections = if recovery { settings.total_connections as u32 } else { tree.connections_allocated() };

        let mut channel = EngineChannel::new(item.clone(), settings.clone(), tree, settings.total_connections as u32, created_connections);

        let initial_leaves: Vec<(crate::tree::NodeId, u32, Segment)> = channel
            .segment_tree
            .leaves_with_status(SegmentStatus::Initial)
            .map(|id| {
                let node = channel.segment_tree.node(id);
                (id, node.connection_number.unwrap_or(0), node.segment)
            })
            .collect();

        self.registry.insert(uid, channel);

        for (leaf, conn, segment) in initial_leaves {
            self.spawn_leaf_worker(uid, leaf, conn, segment, 0, false, envelope_tx).await;
        }
    }

    async fn handle_pause(&mut self, cmd: CoordinatorCommand) {
        let uid = cmd.download_item.uid;
        let Some(channel) = self.registry.get_mut(&uid) else { return };
        channel.paused = true;
        channel.spawn_ignored = true;
        if !channel.pending_handshakes.is_empty() {
            channel.pause_on_final_handshake = true;
        }
        let conns: Vec<u32> = channel.workers.keys().copied().collect();
        let item = channel.download_item.clone();
        let settings = channel.settings.clone();
        for conn in conns {
            self.send_to_worker(&uid, conn, CoordinatorCommand::simple(Command::Pause, item.clone(), settings.clone())).await;
        }
    }

    async fn handle_cancel(&mut self, cmd: CoordinatorCommand) {
        let uid = cmd.download_item.uid;
        if let Some(channel) = self.registry.get(&uid) {
            let conns: Vec<u32> = channel.workers.keys().copied().collect();
            let item = channel.download_item.clone();
            let settings = channel.settings.clone();
            for conn in conns {
                self.send_to_worker(&uid, conn, CoordinatorCommand::simple(Command::Cancel, item.clone(), settings.clone())).await;
            }
        }
        self.registry.remove(&uid);
    }

    /// Passes a command through to a specific worker; used for
    /// caller-originated `resetConnection` and for commands the timers
    /// issue through the same intake shape.
    async fn forward_to_worker(&mut self, cmd: CoordinatorCommand) {
        let uid = cmd.download_item.uid;
        if let Some(conn) = cmd.connection_number {
            self.send_to_worker(&uid, conn, cmd).await;
        }
    }

    async fn send_to_worker(&self, uid: &Uuid, connection_number: u32, cmd: CoordinatorCommand) {
        if let Some(channel) = self.registry.get(uid) {
            if let Some(handle) = channel.workers.get(&connection_number) {
                handle.send(cmd).await;
            }
        }
    }

    // ---- worker spawning --------------------------------------------------

    /// Spawns a fresh worker for `segment` and registers its handshake, or
    /// (when `reuse` is true and a handle already exists for
    /// `connection_number`) re-tasks the existing idle worker via
    /// `startReuseConnection` instead of spawning a new one.
    async fn spawn_leaf_worker(
        &mut self,
        uid: Uuid,
        leaf: crate::tree::NodeId,
        connection_number: u32,
        segment: Segment,
        previously_written_byte_length: u64,
        reuse: bool,
        envelope_tx: &mpsc::Sender<WorkerEnvelope>,
    ) {
        let now = self.now();
        let Some(channel) = self.registry.get_mut(&uid) else { return };

        if reuse {
            if let Some(handle) = channel.workers.get_mut(&connection_number) {
                handle.segment = segment;
                channel.segment_tree.set_status(leaf, SegmentStatus::ReuseRequested, now);
                channel.pending_handshakes.insert(connection_number);
                let item = channel.download_item.clone();
                let settings = channel.settings.clone();
                handle
                    .send(CoordinatorCommand {
                        command: Command::StartReuseConnection,
                        download_item: item,
                        settings,
                        segment: Some(segment),
                        connection_number: Some(connection_number),
                        previously_written_byte_length: Some(previously_written_byte_length),
                    })
                    .await;
                return;
            }
        }

        let item = channel.download_item.clone();
        let settings = channel.settings.clone();
        let worker = self.worker_factory.create();
        let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(32);
        let (msg_tx, mut msg_rx) = mpsc::channel::<WorkerMessage>(64);
        let forward_tx = envelope_tx.clone();

        tokio::spawn(async move {
            worker.run(cmd_rx, msg_tx).await;
        });
        tokio::spawn(async move {
            while let Some(message) = msg_rx.recv().await {
                if forward_tx.send(WorkerEnvelope { uid, message }).await.is_err() {
                    break;
                }
            }
        });

        channel.workers.insert(
            connection_number,
            WorkerHandle { connection_number, segment, command_tx: cmd_tx.clone() },
        );
        channel
            .worker_states
            .insert(connection_number, WorkerState::new(connection_number, segment, now));
        channel.pending_handshakes.insert(connection_number);
        channel.segment_tree.set_status(leaf, SegmentStatus::InUse, now);

        let _ = cmd_tx
            .send(CoordinatorCommand {
                command: Command::StartInitial,
                download_item: item,
                settings,
                segment: Some(segment),
                connection_number: Some(connection_number),
                previously_written_byte_length: Some(previously_written_byte_length),
            })
            .await;
    }

    // ---- timers -------------------------------------------------------

    /// Spec §4.3 "Dynamic spawn timer".
    async fn dynamic_spawn_tick(&mut self, envelope_tx: &mpsc::Sender<WorkerEnvelope>) {
        let now = self.now();
        let uids = self.registry.uids();
        for uid in uids {
            let should_spawn = {
                let Some(channel) = self.registry.get(&uid) else { continue };
                self.should_create_new_connections(channel, now)
            };
            if !should_spawn {
                continue;
            }

            let split_result = {
                let Some(channel) = self.registry.get_mut(&uid) else { continue };
                channel.segment_tree.split(now)
            };
            let Ok((left, right)) = split_result else { continue };

            {
                let Some(channel) = self.registry.get_mut(&uid) else { continue };
                channel.created_connections += 1;
            }

            let (donor_conn, left_segment, right_segment, right_conn) = {
                let Some(channel) = self.registry.get(&uid) else { continue };
                let left_node = channel.segment_tree.node(left);
                let right_node = channel.segment_tree.node(right);
                (
                    left_node.connection_number.unwrap_or(0),
                    left_node.segment,
                    right_node.segment,
                    right_node.connection_number.unwrap_or(0),
                )
            };

            self.send_to_worker(
                &uid,
                donor_conn,
                CoordinatorCommand {
                    command: Command::RefreshSegment,
                    download_item: self.registry.get(&uid).unwrap().download_item.clone(),
                    settings: self.registry.get(&uid).unwrap().settings.clone(),
                    segment: Some(left_segment),
                    connection_number: Some(donor_conn),
                    previously_written_byte_length: None,
                },
            )
            .await;

            // The right child's worker is spawned only once the donor
            // confirms the split (REFRESH_SEGMENT_SUCCESS) — see
            // `handle_segment_response`. Stash the pending right segment by
            // leaving it as an INITIAL leaf; nothing more to do here.
            let _ = (right_segment, right_conn, envelope_tx);
        }
    }

    fn should_create_new_connections(&self, channel: &EngineChannel, now: u64) -> bool {
        let no_leaf_refreshing = channel
            .segment_tree
            .leaves_with_status(SegmentStatus::RefreshRequested)
            .next()
            .is_none();
        let under_progress_cap = (channel.connection_progresses.len() as u32) < channel.total_connections;
        let under_created_cap = channel.created_connections < channel.total_connections;
        let not_ignored = !channel.spawn_ignored;
        let not_near_completion = !self.is_near_completion(channel, now);

        no_leaf_refreshing && under_progress_cap && under_created_cap && not_ignored && not_near_completion
    }

    fn is_near_completion(&self, channel: &EngineChannel, _now: u64) -> bool {
        let total_rate: f64 = channel.connection_progresses.values().map(|p| p.bytes_transfer_rate).sum();
        if total_rate <= 0.0 {
            return false;
        }
        let total_progress = channel.total_progress().min(1.0);
        let remaining_bytes = (1.0 - total_progress).max(0.0) * channel.download_item.content_length as f64;
        let eta_secs = (remaining_bytes / total_rate).round() as u64;
        eta_secs < NEAR_COMPLETION_ETA_SECS
    }

    /// Spec §4.3 "Dynamic reuse timer".
    async fn dynamic_reuse_tick(&mut self) {
        let now = self.now();
        let uids = self.registry.uids();
        for uid in uids {
            let reuser_conn = {
                let Some(channel) = self.registry.get(&uid) else { continue };
                let no_spawn_pending = !self.should_create_new_connections(channel, now);
                let no_reset_pending = channel.worker_states.values().all(|w| !w.awaiting_reset_response);
                let under_total = channel.total_progress() < 1.0;
                if channel.reuse_queue.is_empty() || !no_spawn_pending || !no_reset_pending || !under_total {
                    continue;
                }
                channel.reuse_queue.front().copied()
            };
            let Some(reuser_conn) = reuser_conn else { continue };

            let target = {
                let Some(channel) = self.registry.get(&uid) else { continue };
                let reuser_segment = channel.worker_states.get(&reuser_conn).map(|w| w.segment);
                channel
                    .segment_tree
                    .in_queue_leaves()
                    .chain(channel.segment_tree.in_use_leaves())
                    .filter(|&id| Some(channel.segment_tree.node(id).segment) != reuser_segment)
                    .min_by_key(|&id| channel.segment_tree.node(id).last_update_millis)
            };
            let Some(target) = target else { continue };

            let split_result = {
                let Some(channel) = self.registry.get_mut(&uid) else { continue };
                channel.segment_tree.split_segment_node(target, false, now)
            };
            let Ok((left, right)) = split_result else {
                log::warn!("[coordinator] reuse split refused for {uid}");
                continue;
            };

            let (donor_conn, left_segment) = {
                let Some(channel) = self.registry.get_mut(&uid) else { continue };
                channel.reuse_queue.pop_front();
                channel.segment_tree.set_connection_number(right, reuser_conn);
                let left_node = channel.segment_tree.node(left);
                (left_node.connection_number.unwrap_or(0), left_node.segment)
            };

            self.send_to_worker(
                &uid,
                donor_conn,
                CoordinatorCommand {
                    command: Command::RefreshSegmentReuseConnection,
                    download_item: self.registry.get(&uid).unwrap().download_item.clone(),
                    settings: self.registry.get(&uid).unwrap().settings.clone(),
                    segment: Some(left_segment),
                    connection_number: Some(donor_conn),
                    previously_written_byte_length: None,
                },
            )
            .await;
        }
    }

    /// Spec §4.3 "Connection-reset timer". A stalled worker that still has
    /// retries left gets a `resetConnection`; one that has exhausted
    /// `maxConnectionRetryCount` is surfaced as failed instead (spec §7
    /// kind 1: "only after maxConnectionRetryCount exhaustion").
    async fn connection_reset_tick(&mut self, event_tx: &mpsc::Sender<ProgressMessage>) {
        let now = self.now();
        let uids = self.registry.uids();
        for uid in uids {
            let (stalled, exhausted): (Vec<u32>, Vec<u32>) = {
                let Some(channel) = self.registry.get(&uid) else { continue };
                if channel.paused {
                    continue;
                }
                let timed_out: Vec<&WorkerState> = channel
                    .worker_states
                    .values()
                    .filter(|w| matches!(w.details_status, DetailsStatus::Connecting | DetailsStatus::Downloading))
                    .filter(|w| now.saturating_sub(w.last_response_time_millis) > channel.settings.connection_retry_timeout_millis)
                    .collect();
                let stalled = timed_out
                    .iter()
                    .filter(|w| w.is_retryable(channel.settings.max_connection_retry_count))
                    .map(|w| w.connection_number)
                    .collect();
                let exhausted = timed_out
                    .iter()
                    .filter(|w| !w.is_retryable(channel.settings.max_connection_retry_count))
                    .map(|w| w.connection_number)
                    .collect();
                (stalled, exhausted)
            };

            for conn in exhausted {
                let Some(channel) = self.registry.get_mut(&uid) else { continue };
                if let Some(state) = channel.worker_states.get_mut(&conn) {
                    state.details_status = DetailsStatus::Failed;
                }
                if let Some(progress) = channel.connection_progresses.get_mut(&conn) {
                    progress.details_status = DetailsStatus::Failed;
                }
                log::error!("[{uid}] {}", EngineError::MaxRetryExceeded(conn));
                let _ = event_tx
                    .send(ProgressMessage {
                        download_item: channel.download_item.clone(),
                        status: channel.download_item.status,
                        download_progress: channel.total_progress().min(1.0),
                        total_download_progress: channel.total_progress().min(1.0),
                        transfer_rate: "0 B/s".into(),
                        estimated_remaining: String::new(),
                        button_availability: channel.button_availability,
                        connection_progresses: channel.connection_progresses.values().cloned().collect(),
                        assemble_progress: None,
                    })
                    .await;
            }

            for conn in stalled {
                let Some(channel) = self.registry.get_mut(&uid) else { continue };
                if let Some(state) = channel.worker_states.get_mut(&conn) {
                    state.awaiting_reset_response = true;
                    state.reset_count += 1;
                }
                let item = channel.download_item.clone();
                let settings = channel.settings.clone();
                self.send_to_worker(&uid, conn, CoordinatorCommand::simple(Command::ResetConnection, item, settings)).await;
            }
        }
    }

    /// Spec §4.3 "Button-availability timer": nudges paused downloads so
    /// the caller's UI unblocks even without fresh worker traffic.
    async fn button_availability_tick(&mut self, event_tx: &mpsc::Sender<ProgressMessage>) {
        let now = self.now();
        let uids = self.registry.uids();
        for uid in uids {
            let Some(channel) = self.registry.get_mut(&uid) else { continue };
            if !channel.paused {
                continue;
            }
            if channel.button_wait_started_millis.is_none() {
                channel.button_wait_started_millis = Some(now);
            }
            let wait_complete = now.saturating_sub(channel.button_wait_started_millis.unwrap_or(now)) >= crate::types::BUTTON_AVAILABILITY_WAIT.as_millis() as u64;
            channel.button_availability = ButtonAvailability { pause: false, start: wait_complete };

            let _ = event_tx
                .send(ProgressMessage {
                    download_item: channel.download_item.clone(),
                    status: crate::types::DownloadStatus::Paused,
                    download_progress: channel.total_progress().min(1.0),
                    total_download_progress: channel.total_progress().min(1.0),
                    transfer_rate: "0 B/s".into(),
                    estimated_remaining: String::new(),
                    button_availability: channel.button_availability,
                    connection_progresses: channel.connection_progresses.values().cloned().collect(),
                    assemble_progress: None,
                })
                .await;
        }
    }

    // ---- worker message dispatch ---------------------------------------

    async fn handle_worker_message(&mut self, envelope: WorkerEnvelope, envelope_tx: &mpsc::Sender<WorkerEnvelope>, event_tx: &mpsc::Sender<ProgressMessage>) {
        let uid = envelope.uid;
        match envelope.message {
            WorkerMessage::Progress(msg) => self.handle_progress(uid, msg, event_tx).await,
            WorkerMessage::SegmentResponse(msg) => self.handle_segment_response(uid, msg, envelope_tx).await,
            WorkerMessage::Handshake(msg) => self.handle_handshake(uid, msg).await,
            WorkerMessage::Log(LogMessage { log }) => {
                log::info!("[{uid}] {log}");
                if let Some(channel) = self.registry.get_mut(&uid) {
                    channel.push_log(log);
                }
            }
        }
    }

    async fn handle_progress(&mut self, uid: Uuid, msg: DownloadProgressMessage, event_tx: &mpsc::Sender<ProgressMessage>) {
        let now = self.now();
        let Some(channel) = self.registry.get_mut(&uid) else { return };
        let update = super::progress::ProgressAggregator::apply(channel, msg, now);
        let _ = event_tx.send(update.message).await;
        if let Some(Ok(_)) = update.assembled {
            self.registry.remove(&uid);
        }
    }

    async fn handle_handshake(&mut self, uid: Uuid, msg: ConnectionHandshake) {
        let now = self.now();
        let Some(channel) = self.registry.get_mut(&uid) else { return };
        channel.pending_handshakes.remove(&msg.new_connection_number);

        if let Some(state) = channel.worker_states.get(&msg.new_connection_number) {
            if let Some(leaf) = channel.segment_tree.search(state.segment) {
                channel.segment_tree.set_status(leaf, SegmentStatus::InUse, now);
            }
        }

        if channel.pending_handshakes.is_empty() && channel.pause_on_final_handshake {
            channel.pause_on_final_handshake = false;
            let conns: Vec<u32> = channel.workers.keys().copied().collect();
            let item = channel.download_item.clone();
            let settings = channel.settings.clone();
            for conn in conns {
                self.send_to_worker(&uid, conn, CoordinatorCommand::simple(Command::Pause, item.clone(), settings.clone())).await;
            }
        }
    }

    /// Spec §4.3 worker response handling for `ConnectionSegmentMessage`.
    async fn handle_segment_response(&mut self, uid: Uuid, msg: ConnectionSegmentMessage, envelope_tx: &mpsc::Sender<WorkerEnvelope>) {
        let now = self.now();

        match msg.internal_message {
            SegmentResponseKind::RefreshSegmentRefused | SegmentResponseKind::ReuseRefreshSegmentRefused => {
                let reuse = msg.internal_message == SegmentResponseKind::ReuseRefreshSegmentRefused;
                let Some(channel) = self.registry.get_mut(&uid) else { return };
                let Some(left) = channel.segment_tree.search(msg.requested_segment) else { return };

                // Capture the would-be reuser's connection number (the
                // right sibling) before collapsing removes it from the tree.
                let reuser_conn = channel.segment_tree.node(left).parent.and_then(|parent| {
                    let right = channel.segment_tree.node(parent).right?;
                    channel.segment_tree.node(right).connection_number
                });

                match channel.segment_tree.collapse(left, now) {
                    Ok(_) => {
                        if reuse {
                            if let Some(conn) = reuser_conn {
                                channel.enqueue_for_reuse(conn);
                            }
                        }
                    }
                    Err(e) => log::error!("[coordinator] collapse failed for {uid}: {e}"),
                }
                return;
            }
            SegmentResponseKind::OverlappingRefreshSegment | SegmentResponseKind::RefreshSegmentSuccess => {}
        }

        // The leaf we're about to confirm was already split into a
        // left/right pair by whichever timer issued the refresh; locate
        // that pair via the left child's (still-original) segment.
        let Some(channel) = self.registry.get_mut(&uid) else { return };
        let Some(left) = channel.segment_tree.search(msg.requested_segment) else { return };
        let Some(parent) = channel.segment_tree.node(left).parent else { return };
        let Some(right) = channel.segment_tree.node(parent).right else { return };

        if msg.internal_message == SegmentResponseKind::OverlappingRefreshSegment {
            // The worker had already downloaded past the proposed split
            // point; accept its corrected boundaries for both children
            // instead of re-downloading any bytes.
            if let (Some(rs), Some(re)) = (msg.refreshed_start_byte, msg.refreshed_end_byte) {
                channel.segment_tree.set_segment(left, Segment::new(rs, re));
            }
            if let (Some(vs), Some(ve)) = (msg.valid_new_start_byte, msg.valid_new_end_byte) {
                channel.segment_tree.set_segment(right, Segment::new(vs, ve));
            }
        }

        channel.segment_tree.set_status(left, SegmentStatus::InUse, now);
        let left_conn = channel.segment_tree.node(left).connection_number.unwrap_or(0);
        if let Some(handle) = channel.workers.get_mut(&left_conn) {
            handle.segment = channel.segment_tree.node(left).segment;
        }

        let right_node = channel.segment_tree.node(right);
        let right_conn = right_node.connection_number.unwrap_or(0);
        let right_segment = right_node.segment;

        self.spawn_leaf_worker(uid, right, right_conn, right_segment, 0, msg.reuse_connection, envelope_tx)
            .await;
    }
}
