//! rdm_core: a multi-connection HTTP download engine.
//!
//! The public surface is [`engine::Engine`] — spawn one, send it
//! [`message::CoordinatorCommand`]s (or use its typed `start`/`pause`/
//! `cancel`/`reset_connection` helpers), and read [`message::ProgressMessage`]
//! back off the channel `Engine::spawn` returns.

pub mod clock;
pub mod duration;
pub mod engine;
pub mod error;
pub mod message;
pub mod probe;
pub mod segment;
pub mod tempstore;
pub mod tree;
pub mod types;
pub mod worker;

pub use clock::{Clock, SystemClock};
pub use engine::{Engine, HttpWorkerFactory, WorkerFactory};
pub use error::EngineError;
pub use message::{Command, CoordinatorCommand, ProgressMessage};
pub use probe::{FileInfo, FileInfoProbe};
pub use segment::Segment;
pub use types::{DownloadItem, DownloadSettings, DownloadStatus};
pub use worker::Worker;
