//! `Engine`: the single owned value callers construct, per spec §9's design
//! note to encapsulate the coordinator's timers and registry instead of
//! exposing hidden static state. `Engine::spawn` drives the coordinator on
//! its own task and hands back a handle plus the caller's event stream.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::message::{Command, CoordinatorCommand, ProgressMessage};
use crate::types::{DownloadItem, DownloadSettings};

use super::coordinator::{Coordinator, HttpWorkerFactory, WorkerFactory};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Caller-facing download engine. Cloning shares the same coordinator task.
#[derive(Clone)]
pub struct Engine {
    command_tx: mpsc::Sender<CoordinatorCommand>,
}

impl Engine {
    /// Spawns the coordinator on its own task and returns a handle to it
    /// alongside the `ProgressMessage` stream it emits.
    pub fn spawn(client: reqwest::Client) -> (Self, mpsc::Receiver<ProgressMessage>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let worker_factory: Arc<dyn WorkerFactory> = Arc::new(HttpWorkerFactory::new(client, clock.clone()));
        Self::spawn_with(clock, worker_factory)
    }

    /// Same as [`Engine::spawn`] but with an injected clock and worker
    /// factory, so tests can run the coordinator against a fake worker on a
    /// clock they control.
    pub fn spawn_with(clock: Arc<dyn Clock>, worker_factory: Arc<dyn WorkerFactory>) -> (Self, mpsc::Receiver<ProgressMessage>) {
        let coordinator = Coordinator::new(clock, worker_factory);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(coordinator.run(command_rx, event_tx));
        (Self { command_tx }, event_rx)
    }

    pub async fn start(&self, download_item: DownloadItem, settings: DownloadSettings) {
        self.send(CoordinatorCommand::start(download_item, settings)).await;
    }

    pub async fn pause(&self, download_item: DownloadItem, settings: DownloadSettings) {
        self.send(CoordinatorCommand::simple(Command::Pause, download_item, settings)).await;
    }

    pub async fn cancel(&self, download_item: DownloadItem, settings: DownloadSettings) {
        self.send(CoordinatorCommand::simple(Command::Cancel, download_item, settings)).await;
    }

    /// Resets a single stalled connection by number, bypassing the
    /// coordinator's own stall detection (spec §4.3 caller-originated reset).
    pub async fn reset_connection(&self, download_item: DownloadItem, settings: DownloadSettings, connection_number: u32) {
        self.send(CoordinatorCommand {
            command: Command::ResetConnection,
            download_item,
            settings,
            segment: None,
            connection_number: Some(connection_number),
            previously_written_byte_length: None,
        })
        .await;
    }

    async fn send(&self, command: CoordinatorCommand) {
        if self.command_tx.send(command).await.is_err() {
            log::warn!("[engine] coordinator task is gone, command dropped");
        }
    }
}
