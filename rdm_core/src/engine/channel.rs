//! Per-download coordinator state (spec component C5, §3 "EngineChannel").

use std::collections::{HashMap, HashSet, VecDeque};

use crate::message::{ButtonAvailability, ConnectionProgress};
use crate::tree::SegmentTree;
use crate::types::{DownloadItem, DownloadSettings};
use crate::worker::{WorkerHandle, WorkerState};

const LOG_BUFFER_CAPACITY: usize = 200;

pub struct EngineChannel {
    pub download_item: DownloadItem,
    pub settings: DownloadSettings,
    pub segment_tree: SegmentTree,
    pub workers: HashMap<u32, WorkerHandle>,
    pub worker_states: HashMap<u32, WorkerState>,
    pub connection_progresses: HashMap<u32, ConnectionProgress>,
    pub pending_handshakes: HashSet<u32>,
    pub reuse_queue: VecDeque<u32>,
    pub created_connections: u32,
    pub total_connections: u32,
    pub paused: bool,
    pub pause_on_final_handshake: bool,
    pub assemble_requested: bool,
    pub spawn_ignored: bool,
    pub log_buffer: VecDeque<String>,
    pub last_eta_recompute_millis: u64,
    pub cached_eta: String,
    pub button_availability: ButtonAvailability,
    pub button_wait_started_millis: Option<u64>,
}

impl EngineChannel {
    pub fn new(
        download_item: DownloadItem,
        settings: DownloadSettings,
        segment_tree: SegmentTree,
        total_connections: u32,
        created_connections: u32,
    ) -> Self {
        Self {
            download_item,
            settings,
            segment_tree,
            workers: HashMap::new(),
            worker_states: HashMap::new(),
            connection_progresses: HashMap::new(),
            pending_handshakes: HashSet::new(),
            reuse_queue: VecDeque::new(),
            created_connections,
            total_connections,
            paused: false,
            pause_on_final_handshake: false,
            assemble_requested: false,
            spawn_ignored: false,
            log_buffer: VecDeque::new(),
            last_eta_recompute_millis: 0,
            cached_eta: String::new(),
            button_availability: ButtonAvailability::default(),
            button_wait_started_millis: None,
        }
    }

    pub fn push_log(&mut self, line: String) {
        if self.log_buffer.len() >= LOG_BUFFER_CAPACITY {
            self.log_buffer.pop_front();
        }
        self.log_buffer.push_back(line);
    }

    pub fn enqueue_for_reuse(&mut self, connection_number: u32) {
        if !self.reuse_queue.contains(&connection_number) {
            self.reuse_queue.push_back(connection_number);
        }
    }

    pub fn total_progress(&self) -> f64 {
        self.connection_progresses
            .values()
            .map(|p| p.total_download_progress)
            .sum()
    }
}
