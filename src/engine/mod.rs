//! Engine subsystem: one UCI subprocess behind a process-wide FIFO queue.
//!
//! - **types**: shared request/response types, constants, `EngineError`
//! - **uci**: process spawning and UCI line I/O and parsing
//! - **process**: the engine handle owning one subprocess
//! - **queue**: the serialising actor, metrics and health reporting

pub mod process;
pub mod queue;
pub mod types;
pub mod uci;

pub use process::EngineHandle;
pub use queue::{
    AnalysisBackend, AnalysisTicket, EngineQueue, QueueConfig, QueueHealth,
    QueueMetricsSnapshot,
};
pub use types::{
    Budget, EngineError, EngineRequest, EngineResult, EngineState, ScoredLine,
};
pub use uci::{parse_scored_line, UciCommunicator};
