//! Staged event-driven TCP server engine: paged buffers, sink-based output
//! streams, readiness pollers, per-stage schedulers, and the pipeline that
//! owns every connection.

pub mod buffer;
pub mod conn;
pub mod error;
pub mod lock;
pub mod pipeline;
pub mod poller;
pub mod sched;
pub mod server;
pub mod stage;
pub mod stages;
pub mod stream;

pub use buffer::{Buffer, PAGE_SIZE};
pub use conn::{Connection, Protocol, Streams};
pub use error::EngineError;
pub use lock::{ConnLock, QuiesceLock};
pub use pipeline::Pipeline;
pub use poller::{EventHandler, Poller, PollerEvents, PollerRegistry};
pub use sched::{QueueScheduler, Scheduler};
pub use server::{Listener, Server};
pub use stage::{start_stage_thread, Stage};
pub use stages::{PollInStage, RecycleStage, WriteBackStage};
pub use stream::{FileRange, InputStream, OutputStream};
