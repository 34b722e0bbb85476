//! The confidence search engine.
//!
//! Builds the principal spine, then repeatedly extends the weakest
//! eligible node with engine alternatives until every spine node clears
//! the target confidence or a budget runs out. All engine work goes
//! through the request queue; the arena is owned by the running task and
//! mutated synchronously between engine calls.
//!
//! Confidence values are held from the holder's perspective — the root's
//! side to move — so propagation is a plain min/max over children: the
//! holder picks the best reply on their own turns and must answer the
//! opponent's best try on the others.

use std::time::Instant;

use log::{debug, info, warn};
use shakmaty::Color;

use crate::engine::{Budget, EngineError, EngineQueue, EngineRequest, ScoredLine};
use crate::error::SearchError;
use crate::position::{Position, TerminalKind};

use super::confidence::{confidence_from_cp, confidence_from_line, terminal_confidence};
use super::node::{NodeArena, NodeId, PvClass};
use super::tree::{project, SearchTree};
use super::{SearchBudget, SearchParams, SearchStats, StopReason};

/// Maximum ply the initial spine may reach: the root plus seventeen
/// replies.
const SPINE_PLY_LIMIT: u16 = 18;

/// Iterations without improvement of the spine minimum before the
/// search gives up on the position.
const STALL_LIMIT: u32 = 3;

/// A configured confidence search, reusable across requests. Cheap to
/// clone; every concurrent run shares the same engine queue.
#[derive(Clone)]
pub struct ConfidenceSearch {
    queue: EngineQueue,
    params: SearchParams,
    budget: SearchBudget,
}

impl ConfidenceSearch {
    pub fn new(queue: EngineQueue) -> ConfidenceSearch {
        ConfidenceSearch {
            queue,
            params: SearchParams::default(),
            budget: SearchBudget::default(),
        }
    }

    pub fn with_params(mut self, params: SearchParams) -> ConfidenceSearch {
        self.params = params;
        self
    }

    pub fn with_budget(mut self, budget: SearchBudget) -> ConfidenceSearch {
        self.budget = budget;
        self
    }

    /// Run a search from an already validated position. Never fails:
    /// whatever happens, the tree built so far comes back with a reason
    /// code.
    pub async fn run(&self, root: Position, target: u8) -> SearchOutcome {
        let target = target.min(100);
        let mut driver = Driver {
            arena: NodeArena::new(),
            queue: self.queue.clone(),
            params: self.params.clone(),
            budget: self.budget.clone(),
            target,
            holder: root.side_to_move(),
            spine: Vec::new(),
            engine_calls: 0,
            iterations: 0,
            started: Instant::now(),
            engine_unavailable: false,
        };
        let root_id = driver.arena.add_root(root);
        driver.spine.push(root_id);

        info!(
            "Confidence search started: target={} holder={:?}",
            target, driver.holder
        );
        let reason = driver.drive().await;
        driver.recolour();

        let stats = SearchStats {
            engine_calls: driver.engine_calls,
            nodes_created: driver.arena.len() as u32,
            iterations: driver.iterations,
            elapsed_ms: driver.started.elapsed().as_millis() as u64,
            min_spine_confidence: driver.min_spine_confidence(),
        };
        info!(
            "Confidence search finished: reason={:?} nodes={} calls={} min_spine={}",
            reason, stats.nodes_created, stats.engine_calls, stats.min_spine_confidence
        );

        SearchOutcome {
            arena: driver.arena,
            target,
            reason,
            engine_unavailable: driver.engine_unavailable,
            stats,
        }
    }

    /// Validate a FEN and run. The only error a caller can see before a
    /// tree exists.
    pub async fn run_fen(&self, fen: &str, target: u8) -> Result<SearchOutcome, SearchError> {
        let root = Position::from_fen(fen)?;
        Ok(self.run(root, target).await)
    }
}

/// A finished search: the arena plus the terminal reason. The arena
/// remains available for direct inspection; [`SearchOutcome::tree`]
/// yields the serialisable projection.
pub struct SearchOutcome {
    pub arena: NodeArena,
    pub target: u8,
    pub reason: StopReason,
    pub engine_unavailable: bool,
    pub stats: SearchStats,
}

impl SearchOutcome {
    /// Project into the external tree shape, attaching theme/tag reports
    /// to every node on the way out.
    pub fn tree(&mut self) -> SearchTree {
        project(
            &mut self.arena,
            self.target,
            self.reason,
            self.engine_unavailable,
            self.stats.clone(),
        )
    }
}

struct Driver {
    arena: NodeArena,
    queue: EngineQueue,
    params: SearchParams,
    budget: SearchBudget,
    target: u8,
    holder: Color,
    spine: Vec<NodeId>,
    engine_calls: u32,
    iterations: u32,
    started: Instant,
    engine_unavailable: bool,
}

impl Driver {
    const ROOT: NodeId = NodeId(0);

    async fn drive(&mut self) -> StopReason {
        if let Some(kind) = self.arena.get(Self::ROOT).position.terminal(None) {
            self.assign_terminal_outcome(Self::ROOT, kind);
            return if self.arena.get(Self::ROOT).confidence >= self.target {
                StopReason::TargetReached
            } else {
                StopReason::Stalled
            };
        }
        if let Some(reason) = self.build_spine().await {
            return reason;
        }
        self.extend_loop().await
    }

    // ------------------------------------------------------------------
    // Phase 1: principal spine
    // ------------------------------------------------------------------

    async fn build_spine(&mut self) -> Option<StopReason> {
        let mut tip = Self::ROOT;
        loop {
            if let Some(kind) = self.arena.get(tip).position.terminal(None) {
                self.assign_terminal_outcome(tip, kind);
                // A terminal ply certifies every position above it.
                self.propagate_to_root(tip);
                return None;
            }
            if let Some(reason) = self.budget_reason() {
                return Some(reason);
            }

            let position = self.arena.get(tip).position.clone();
            let multipv = self.params.spine_multipv.max(1);
            let lines = match self
                .call_engine(&position, self.params.spine_depth, multipv)
                .await
            {
                Ok(lines) => lines,
                Err(EngineError::EngineUnavailable) | Err(EngineError::QueueClosed) => {
                    self.engine_unavailable = true;
                    return Some(StopReason::EngineUnavailable);
                }
                Err(e) => {
                    debug!("Spine construction stopped at {}: {}", tip, e);
                    return None;
                }
            };

            self.assign_measured(tip, &lines[0]);

            if self.arena.get(tip).ply_from_root + 1 >= SPINE_PLY_LIMIT {
                return None;
            }
            let mv = match lines[0].first_move() {
                Some(&m) => m,
                None => return None,
            };
            let child = match self.arena.add_child(tip, mv, PvClass::OnSpine) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Engine line was not playable at {}: {}", tip, e);
                    return None;
                }
            };
            self.spine.push(child);
            tip = child;
        }
    }

    // ------------------------------------------------------------------
    // Phase 2: iterative extension
    // ------------------------------------------------------------------

    async fn extend_loop(&mut self) -> StopReason {
        let mut last_min = self.min_spine_confidence();
        let mut stall = 0u32;
        loop {
            if self.min_spine_confidence() >= self.target {
                return StopReason::TargetReached;
            }
            if let Some(reason) = self.budget_reason() {
                return reason;
            }
            let selected = match self.select() {
                Some(id) => id,
                None => return StopReason::Stalled,
            };
            self.iterations += 1;

            if let Err(reason) = self.extend(selected).await {
                return reason;
            }

            let min = self.min_spine_confidence();
            if min > last_min {
                stall = 0;
                last_min = min;
            } else {
                stall += 1;
                if stall >= STALL_LIMIT {
                    debug!("No spine improvement for {} iterations", stall);
                    return StopReason::Stalled;
                }
            }
        }
    }

    /// Pick the weakest eligible node: spine nodes not yet extended plus
    /// extended nodes still flagged insufficient. Ties break to the
    /// shallowest ply, then the oldest id.
    fn select(&self) -> Option<NodeId> {
        self.arena
            .iter()
            .filter(|n| {
                !n.frozen
                    && n.confidence < self.target
                    && n.pv_class != PvClass::BranchTerminal
                    && (n.pv_class == PvClass::OnSpine || n.has_branches)
                    && (!n.has_branches || n.insufficient_confidence)
                    && n.position.terminal(None).is_none()
            })
            .min_by_key(|n| (n.confidence, n.ply_from_root, n.id))
            .map(|n| n.id)
    }

    async fn extend(&mut self, selected: NodeId) -> Result<(), StopReason> {
        let position = self.arena.get(selected).position.clone();
        let stm = self.arena.get(selected).side_to_move;
        let multipv = self.params.branch_multipv.clamp(2, 5);
        debug!(
            "Extending {} at ply {} (confidence {})",
            selected,
            self.arena.get(selected).ply_from_root,
            self.arena.get(selected).confidence
        );

        let lines = match self
            .call_engine(&position, self.params.branch_depth, multipv)
            .await
        {
            Ok(lines) => lines,
            Err(EngineError::EngineUnavailable) | Err(EngineError::QueueClosed) => {
                self.engine_unavailable = true;
                self.arena.get_mut(selected).insufficient_confidence = true;
                return Err(StopReason::EngineUnavailable);
            }
            Err(e) => {
                // Recoverable: the node keeps its values and stays red.
                warn!("Extension of {} failed: {}", selected, e);
                self.arena.get_mut(selected).insufficient_confidence = true;
                return Ok(());
            }
        };

        self.assign_measured(selected, &lines[0]);

        let mut created = false;
        let mut best_child = None;
        for line in &lines {
            let first = match line.first_move() {
                Some(&m) => m,
                None => continue,
            };
            let existing = self.arena.child_by_move(selected, &first);
            let child = match existing {
                Some(c) => c,
                None => {
                    if self.arena.len() >= self.budget.max_nodes as usize {
                        break;
                    }
                    match self.arena.add_child(selected, first, PvClass::Branch) {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("Engine alternative was not playable: {}", e);
                            continue;
                        }
                    }
                }
            };
            if best_child.is_none() {
                best_child = Some(child);
            }
            if existing.is_none() {
                created = true;
                let holder_conf = self.holder_view(stm, line);
                debug!(
                    "{} alternative {} scored {}",
                    selected,
                    position.san(&first),
                    holder_conf
                );
                self.seed_branch(child, line, holder_conf);
            }
        }
        if let Some(best) = best_child {
            self.arena.promote_child_first(selected, best);
        }

        self.arena.get_mut(selected).has_branches = true;
        if !created {
            // Every returned line was already covered; nothing to do.
            debug!("Extension of {} was a no-op", selected);
        }

        self.recompute_subtree(selected);
        self.propagate_to_root(selected);

        let node = self.arena.get_mut(selected);
        if node.confidence >= self.target {
            node.frozen = true;
            node.insufficient_confidence = false;
            debug!("{} reached target and froze at {}", selected, node.confidence);
        } else {
            node.insufficient_confidence = true;
            debug!("{} still below target at {}", selected, node.confidence);
        }
        Ok(())
    }

    /// Continue a freshly created branch child along the engine's own
    /// line while it stays below target, then seal the chain.
    fn seed_branch(&mut self, child: NodeId, line: &ScoredLine, holder_conf: u8) {
        if let Some(kind) = self.arena.get(child).position.terminal(None) {
            self.assign_terminal_outcome(child, kind);
            return;
        }
        self.arena.get_mut(child).set_terminal_confidence(holder_conf);
        if holder_conf >= self.target {
            return;
        }

        let mut cursor = child;
        let mut added: u16 = 0;
        for mv in line.moves.iter().skip(1) {
            if added >= self.params.extension_depth {
                break;
            }
            if self.arena.len() >= self.budget.max_nodes as usize {
                break;
            }
            let next = match self.arena.add_child(cursor, *mv, PvClass::Branch) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Engine continuation was not playable: {}", e);
                    break;
                }
            };
            added += 1;
            cursor = next;
            if let Some(kind) = self.arena.get(next).position.terminal(None) {
                self.assign_terminal_outcome(next, kind);
                break;
            }
            self.arena.get_mut(next).set_terminal_confidence(holder_conf);
        }
        self.arena.get_mut(cursor).pv_class = PvClass::BranchTerminal;
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    /// Min/max of the children from the holder's perspective: max when
    /// the holder moves at this node, min when the opponent does.
    fn combine(&self, id: NodeId) -> u8 {
        let node = self.arena.get(id);
        let confidences = node.children.iter().map(|&c| self.arena.get(c).confidence);
        let combined = if node.side_to_move == self.holder {
            confidences.max()
        } else {
            confidences.min()
        };
        combined.unwrap_or(node.confidence)
    }

    fn recompute_subtree(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.arena.get(id).children.to_vec();
        if children.is_empty() {
            return;
        }
        for child in &children {
            self.recompute_subtree(*child);
        }
        let transferred = self.combine(id);
        self.arena.get_mut(id).set_transferred_confidence(transferred);
    }

    fn propagate_to_root(&mut self, from: NodeId) {
        let mut cursor = self.arena.get(from).parent;
        while let Some(id) = cursor {
            if !self.arena.get(id).children.is_empty() {
                let transferred = self.combine(id);
                self.arena.get_mut(id).set_transferred_confidence(transferred);
            }
            cursor = self.arena.get(id).parent;
        }
    }

    // ------------------------------------------------------------------
    // Phase 3: freeze and recolour
    // ------------------------------------------------------------------

    fn recolour(&mut self) {
        for idx in 0..self.arena.len() {
            let id = NodeId(idx as u32);
            let node = self.arena.get_mut(id);
            if node.transferred_confidence.map_or(false, |t| t >= self.target) {
                if !node.frozen {
                    debug!("{} recoloured green (transferred {:?})", id, node.transferred_confidence);
                }
                node.frozen = true;
                node.insufficient_confidence = false;
            } else if node.has_branches && node.confidence < self.target {
                if !node.insufficient_confidence {
                    debug!("{} recoloured red (confidence {})", id, node.confidence);
                }
                node.insufficient_confidence = true;
            }
        }
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    async fn call_engine(
        &mut self,
        position: &Position,
        depth: u32,
        multipv: u8,
    ) -> Result<Vec<ScoredLine>, EngineError> {
        self.engine_calls += 1;
        self.queue
            .analyse(EngineRequest::new(
                position.fen(),
                Budget::Depth(depth),
                multipv,
            ))
            .await
    }

    fn budget_reason(&self) -> Option<StopReason> {
        if self.engine_calls >= self.budget.max_engine_calls {
            Some(StopReason::CallsExhausted)
        } else if self.arena.len() >= self.budget.max_nodes as usize {
            Some(StopReason::NodesExhausted)
        } else if self.started.elapsed().as_millis() as u64 >= self.budget.wall_clock_ms {
            Some(StopReason::TimeExhausted)
        } else {
            None
        }
    }

    fn min_spine_confidence(&self) -> u8 {
        self.spine
            .iter()
            .map(|&id| self.arena.get(id).confidence)
            .min()
            .unwrap_or(0)
    }

    /// Record a direct engine measurement of `id`'s own position.
    fn assign_measured(&mut self, id: NodeId, line: &ScoredLine) {
        let stm = self.arena.get(id).side_to_move;
        let conf = self.holder_view(stm, line);
        let node = self.arena.get_mut(id);
        node.engine_cp = Some(line.score_cp);
        node.set_terminal_confidence(conf);
    }

    /// Holder-perspective confidence of a line scored from `stm`'s view:
    /// the plain mapping when the holder is to move, its mirror image
    /// when the opponent is.
    fn holder_view(&self, stm: Color, line: &ScoredLine) -> u8 {
        if stm == self.holder {
            confidence_from_line(line)
        } else {
            match line.mate_in {
                Some(n) if n > 0 => 0,
                Some(_) => 100,
                None => confidence_from_cp(-line.score_cp),
            }
        }
    }

    /// Holder-perspective confidence of a terminal position.
    fn assign_terminal_outcome(&mut self, id: NodeId, kind: TerminalKind) {
        let stm = self.arena.get(id).side_to_move;
        let base = terminal_confidence(kind);
        let conf = if stm == self.holder { base } else { 100 - base };
        self.arena.get_mut(id).set_terminal_confidence(conf);
    }
}
