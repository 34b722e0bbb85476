use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::position::Move;

// =============================================================================
// Constants
// =============================================================================

/// Timeout for the `uci` handshake on engine startup.
pub const ENGINE_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for `readyok` after `isready`.
pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period past the requested budget before a search counts as hung
/// and the engine as dead.
pub const ENGINE_SEARCH_GRACE: Duration = Duration::from_secs(5);

/// Upper bound assumed for a depth-limited search when computing the
/// watchdog deadline. Depth budgets have no wall-clock bound of their own.
pub const DEPTH_SEARCH_CEILING: Duration = Duration::from_secs(120);

// =============================================================================
// Error types
// =============================================================================

/// Errors from the engine layer. Fatal variants mark the process dead and
/// make the queue respawn it.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine initialization timeout")]
    InitTimeout,

    #[error("engine closed during initialization")]
    InitFailed,

    #[error("engine search exceeded budget grace period")]
    SearchTimeout,

    #[error("no stdin handle available")]
    NoStdin,

    #[error("no stdout handle available")]
    NoStdout,

    #[error("broken pipe")]
    BrokenPipe,

    #[error("engine returned no scored line")]
    NoLine,

    #[error("engine process crashed")]
    Crashed,

    #[error("engine unavailable")]
    EngineUnavailable,

    #[error("request queue closed")]
    QueueClosed,

    #[error("engine busy: {0}")]
    InvalidState(&'static str),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl EngineError {
    /// Whether the error implies the engine process can no longer be
    /// trusted to answer further requests.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Io(_)
                | EngineError::InitTimeout
                | EngineError::InitFailed
                | EngineError::SearchTimeout
                | EngineError::BrokenPipe
                | EngineError::Crashed
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Core engine types
// =============================================================================

/// Engine process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Spawning,
    Ready,
    Busy,
    Dead,
}

/// Search budget for one engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "c")]
pub enum Budget {
    /// Search to a fixed depth.
    Depth(u32),
    /// Search for a fixed time in milliseconds.
    Time(u32),
}

impl Budget {
    /// Wall-clock deadline for the watchdog around this budget.
    pub fn deadline(&self) -> Duration {
        match self {
            Budget::Depth(_) => DEPTH_SEARCH_CEILING + ENGINE_SEARCH_GRACE,
            Budget::Time(ms) => Duration::from_millis(*ms as u64) + ENGINE_SEARCH_GRACE,
        }
    }
}

/// One analysis request as it travels through the queue.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    /// Position to analyse, as a FEN.
    pub fen: String,
    pub budget: Budget,
    pub multipv: u8,
}

impl EngineRequest {
    pub fn new(fen: String, budget: Budget, multipv: u8) -> EngineRequest {
        EngineRequest { fen, budget, multipv: multipv.max(1) }
    }
}

/// One scored line out of a multipv analysis.
///
/// `score_cp` and `mate_in` are from the perspective of the side to move
/// in the analysed position, as UCI engines report them.
#[derive(Debug, Clone)]
pub struct ScoredLine {
    pub moves: Vec<Move>,
    pub score_cp: i32,
    pub mate_in: Option<i32>,
    pub depth_reached: u32,
    pub multipv: u16,
}

impl ScoredLine {
    pub fn first_move(&self) -> Option<&Move> {
        self.moves.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(EngineError::BrokenPipe.is_fatal());
        assert!(EngineError::SearchTimeout.is_fatal());
        assert!(!EngineError::NoLine.is_fatal());
        assert!(!EngineError::QueueClosed.is_fatal());
    }

    #[test]
    fn time_budget_deadline_includes_grace() {
        let d = Budget::Time(2_000).deadline();
        assert_eq!(d, Duration::from_millis(2_000) + ENGINE_SEARCH_GRACE);
    }

    #[test]
    fn multipv_floor_is_one() {
        let req = EngineRequest::new("8/8/8/8/8/8/8/8 w - - 0 1".into(), Budget::Depth(10), 0);
        assert_eq!(req.multipv, 1);
    }
}
