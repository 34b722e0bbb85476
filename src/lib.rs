//! Confidence search core.
//!
//! A server-side engine room for chess coaching products: given a
//! position and a target confidence, it builds a bounded variation tree
//! whose every leaf carries an engine-certified confidence score, with
//! all UCI engine access serialised through a single process-wide queue
//! and every returned node annotated with deterministic theme and tag
//! analysis.
//!
//! The crate speaks only in positions, moves, scores and trees; rendering,
//! persistence and conversation belong to the embedding server.

pub mod analysis;
pub mod engine;
pub mod error;
pub mod position;
pub mod search;

pub use analysis::{analyze, BySide, PositionReport, Tag, Theme};
pub use engine::{
    Budget, EngineError, EngineQueue, EngineRequest, QueueConfig, QueueHealth,
    QueueMetricsSnapshot, ScoredLine,
};
pub use error::SearchError;
pub use position::{GamePhase, Move, Position, RepetitionTable, TerminalKind};
pub use search::{
    ConfidenceSearch, NodeArena, NodeId, PvClass, SearchBudget, SearchOutcome, SearchParams,
    SearchStats, SearchTree, StopReason,
};
