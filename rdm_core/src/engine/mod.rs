//! The engine: per-download state (`channel`), the registry of active
//! downloads (`registry`), progress aggregation (`progress`), the
//! coordinator state machine (`coordinator`), and the handle callers use to
//! talk to all of it (`handle`). See spec component C5-C7, §9.

mod channel;
mod coordinator;
mod handle;
mod progress;
mod registry;

pub use coordinator::{Coordinator, HttpWorkerFactory, WorkerFactory};
pub use handle::Engine;
