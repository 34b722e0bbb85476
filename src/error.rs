//! Crate-level error taxonomy.
//!
//! Engine-layer failures live in [`crate::engine::EngineError`] and are
//! absorbed by the request queue; what remains here is the small set of
//! errors a caller can see before a search produces a tree.

use crate::position::{MoveParseError, PositionParseError};

/// Errors surfaced to callers of the search API.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The root position failed validation; the search refuses to run.
    #[error("invalid position: {0}")]
    InvalidPosition(#[from] PositionParseError),

    /// A move string could not be resolved against its position.
    #[error("invalid move: {0}")]
    InvalidMove(#[from] MoveParseError),
}
