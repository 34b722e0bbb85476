//! Confidence search subsystem.
//!
//! - **confidence**: the engine-score → confidence mapping
//! - **node**: the arena-backed variation tree
//! - **driver**: the search itself (spine construction, iterative
//!   extension, propagation, recolouring)
//! - **tree**: the serialisable projection handed to callers

pub mod confidence;
pub mod driver;
pub mod node;
pub mod tree;

use serde::Serialize;

pub use confidence::{confidence_from_cp, confidence_from_line, terminal_confidence, CONFIDENCE_K};
pub use driver::{ConfidenceSearch, SearchOutcome};
pub use node::{Node, NodeArena, NodeId, PvClass};
pub use tree::{NodeColor, SearchTree, TreeNodeRecord};

/// Tuning knobs for one search.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Lines requested while laying the initial spine. Only the best
    /// line is followed regardless.
    pub spine_multipv: u8,
    /// Lines requested when extending a weak node; clamped to [2, 5].
    pub branch_multipv: u8,
    pub spine_depth: u32,
    pub branch_depth: u32,
    /// Plies a below-target branch is continued along its own engine
    /// line before it is sealed off.
    pub extension_depth: u16,
}

impl Default for SearchParams {
    fn default() -> SearchParams {
        SearchParams {
            spine_multipv: 1,
            branch_multipv: 3,
            spine_depth: 16,
            branch_depth: 12,
            extension_depth: 6,
        }
    }
}

/// Hard limits for one search. Hitting any of them is a normal
/// termination, not a failure.
#[derive(Debug, Clone)]
pub struct SearchBudget {
    pub max_nodes: u32,
    pub max_engine_calls: u32,
    pub wall_clock_ms: u64,
}

impl Default for SearchBudget {
    fn default() -> SearchBudget {
        SearchBudget {
            max_nodes: 256,
            max_engine_calls: 64,
            wall_clock_ms: 120_000,
        }
    }
}

/// Why the search returned its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TargetReached,
    NodesExhausted,
    CallsExhausted,
    TimeExhausted,
    Stalled,
    EngineUnavailable,
}

/// Run accounting returned alongside the tree.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchStats {
    pub engine_calls: u32,
    pub nodes_created: u32,
    pub iterations: u32,
    pub elapsed_ms: u64,
    pub min_spine_confidence: u8,
}
