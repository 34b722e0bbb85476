//! Node store for the variation tree.
//!
//! An append-only arena of nodes addressed by stable handles. Ids are
//! never reused and nodes are never deleted; the tree only grows. All
//! confidence bookkeeping that must hold invariants (the initial-value
//! lock, the frozen floor) lives here so the search cannot get it wrong.

use serde::Serialize;
use shakmaty::Color;
use smallvec::SmallVec;

use crate::analysis::PositionReport;
use crate::position::{Move, MoveParseError, Position};

/// Stable handle into the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a node sits relative to the principal line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PvClass {
    /// On the root's current principal main line.
    OnSpine,
    /// An alternate ply reached by exploring a weak node.
    Branch,
    /// Depth-limited leaf of a branch; never extended again this run.
    BranchTerminal,
}

/// One node of the variation tree. Confidence values are stored from the
/// holder's perspective (the root's side to move).
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    /// None iff root.
    pub move_from_parent: Option<Move>,
    pub position: Position,
    pub ply_from_root: u16,
    pub side_to_move: Color,
    pub pv_class: PvClass,
    /// Last directly measured evaluation, side-to-move centipawns.
    pub engine_cp: Option<i32>,
    /// Locked to the first confidence ever computed for this node.
    pub initial_confidence: Option<u8>,
    /// Confidence from a direct engine view of this position.
    pub terminal_confidence: Option<u8>,
    /// Confidence carried up from children.
    pub transferred_confidence: Option<u8>,
    /// Currently displayed value.
    pub confidence: u8,
    pub has_branches: bool,
    pub insufficient_confidence: bool,
    pub frozen: bool,
    /// Theme/tag report, attached lazily at export time.
    pub report: Option<PositionReport>,
    /// Index 0 is the main continuation, the rest in descending engine
    /// preference.
    pub children: SmallVec<[NodeId; 4]>,
}

impl Node {
    /// Record a directly measured confidence. Locks the initial value on
    /// first assignment and never lowers a frozen node's display.
    pub fn set_terminal_confidence(&mut self, confidence: u8) {
        self.terminal_confidence = Some(confidence);
        if self.initial_confidence.is_none() {
            self.initial_confidence = Some(confidence);
        }
        if self.transferred_confidence.is_none() {
            self.refresh_displayed(confidence);
        }
    }

    /// Record a confidence carried up from children. Same locking and
    /// frozen-floor rules as the terminal case.
    pub fn set_transferred_confidence(&mut self, confidence: u8) {
        let floored = if self.frozen {
            confidence.max(self.confidence)
        } else {
            confidence
        };
        self.transferred_confidence = Some(floored);
        if self.initial_confidence.is_none() {
            self.initial_confidence = Some(floored);
        }
        self.refresh_displayed(floored);
    }

    fn refresh_displayed(&mut self, candidate: u8) {
        self.confidence = if self.frozen {
            self.confidence.max(candidate)
        } else {
            candidate
        };
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Append-only node arena.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> NodeArena {
        NodeArena::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Create the root node. Panics if the arena already has one.
    pub fn add_root(&mut self, position: Position) -> NodeId {
        assert!(self.nodes.is_empty(), "arena already has a root");
        let id = NodeId(0);
        let side_to_move = position.side_to_move();
        self.nodes.push(Node {
            id,
            parent: None,
            move_from_parent: None,
            position,
            ply_from_root: 0,
            side_to_move,
            pv_class: PvClass::OnSpine,
            engine_cp: None,
            initial_confidence: None,
            terminal_confidence: None,
            transferred_confidence: None,
            confidence: 0,
            has_branches: false,
            insufficient_confidence: false,
            frozen: false,
            report: None,
            children: SmallVec::new(),
        });
        id
    }

    /// Append a child reached by playing `mv` from `parent`. The child
    /// position is derived (and thereby validated) from the parent's, and
    /// the ply arithmetic is fixed here.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        mv: Move,
        pv_class: PvClass,
    ) -> Result<NodeId, MoveParseError> {
        let (position, ply) = {
            let p = self.get(parent);
            (p.position.apply(&mv)?, p.ply_from_root + 1)
        };
        let id = NodeId(self.nodes.len() as u32);
        let side_to_move = position.side_to_move();
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            move_from_parent: Some(mv),
            position,
            ply_from_root: ply,
            side_to_move,
            pv_class,
            engine_cp: None,
            initial_confidence: None,
            terminal_confidence: None,
            transferred_confidence: None,
            confidence: 0,
            has_branches: false,
            insufficient_confidence: false,
            frozen: false,
            report: None,
            children: SmallVec::new(),
        });
        self.get_mut(parent).children.push(id);
        Ok(id)
    }

    /// Find an existing child of `parent` reached by `mv`.
    pub fn child_by_move(&self, parent: NodeId, mv: &Move) -> Option<NodeId> {
        self.get(parent)
            .children
            .iter()
            .copied()
            .find(|&c| self.get(c).move_from_parent.as_ref() == Some(mv))
    }

    /// Move `child` to the front of `parent`'s child list, keeping the
    /// relative order of the others.
    pub fn promote_child_first(&mut self, parent: NodeId, child: NodeId) {
        let children = &mut self.get_mut(parent).children;
        if let Some(idx) = children.iter().position(|&c| c == child) {
            if idx != 0 {
                let c = children.remove(idx);
                children.insert(0, c);
            }
        }
    }

    /// Fill the node's theme/tag report if it is not there yet.
    pub fn ensure_report(&mut self, id: NodeId) {
        if self.get(id).report.is_none() {
            let report = crate::analysis::analyze(&self.get(id).position);
            self.get_mut(id).report = Some(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with_root() -> (NodeArena, NodeId) {
        let mut arena = NodeArena::new();
        let root = arena.add_root(Position::start());
        (arena, root)
    }

    fn mv(arena: &NodeArena, id: NodeId, uci: &str) -> Move {
        Move::parse(uci, &arena.get(id).position).unwrap()
    }

    #[test]
    fn child_linkage_and_ply() {
        let (mut arena, root) = arena_with_root();
        let e4 = mv(&arena, root, "e2e4");
        let child = arena.add_child(root, e4, PvClass::OnSpine).unwrap();

        let c = arena.get(child);
        assert_eq!(c.parent, Some(root));
        assert_eq!(c.ply_from_root, 1);
        assert_eq!(c.move_from_parent, Some(e4));
        assert_eq!(c.position, arena.get(root).position.apply(&e4).unwrap());
        assert_eq!(arena.get(root).children.as_slice(), &[child]);
    }

    #[test]
    fn illegal_child_rejected() {
        let (mut arena, root) = arena_with_root();
        let bad = Move {
            from: shakmaty::Square::E2,
            to: shakmaty::Square::E5,
            promotion: None,
        };
        assert!(arena.add_child(root, bad, PvClass::Branch).is_err());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn ids_are_stable_and_never_reused() {
        let (mut arena, root) = arena_with_root();
        let a = arena.add_child(root, mv(&arena, root, "e2e4"), PvClass::Branch).unwrap();
        let b = arena.add_child(root, mv(&arena, root, "d2d4"), PvClass::Branch).unwrap();
        assert_eq!(a, NodeId(1));
        assert_eq!(b, NodeId(2));
        assert_eq!(arena.get(a).move_from_parent.unwrap().uci(), "e2e4");
    }

    #[test]
    fn initial_confidence_locks_once() {
        let (mut arena, root) = arena_with_root();
        let node = arena.get_mut(root);
        node.set_terminal_confidence(60);
        assert_eq!(node.initial_confidence, Some(60));
        node.set_terminal_confidence(80);
        assert_eq!(node.initial_confidence, Some(60));
        node.set_transferred_confidence(90);
        assert_eq!(node.initial_confidence, Some(60));
        assert_eq!(node.confidence, 90);
    }

    #[test]
    fn transferred_takes_precedence_over_terminal() {
        let (mut arena, root) = arena_with_root();
        let node = arena.get_mut(root);
        node.set_transferred_confidence(70);
        node.set_terminal_confidence(40);
        // A fresh direct measurement does not displace the child-derived
        // view on an inner node.
        assert_eq!(node.confidence, 70);
        assert_eq!(node.terminal_confidence, Some(40));
    }

    #[test]
    fn frozen_floor_holds() {
        let (mut arena, root) = arena_with_root();
        let node = arena.get_mut(root);
        node.set_transferred_confidence(85);
        node.frozen = true;
        node.set_transferred_confidence(40);
        assert_eq!(node.confidence, 85);
        assert_eq!(node.transferred_confidence, Some(85));
    }

    #[test]
    fn child_by_move_finds_duplicates() {
        let (mut arena, root) = arena_with_root();
        let e4 = mv(&arena, root, "e2e4");
        let child = arena.add_child(root, e4, PvClass::OnSpine).unwrap();
        assert_eq!(arena.child_by_move(root, &e4), Some(child));
        let d4 = mv(&arena, root, "d2d4");
        assert_eq!(arena.child_by_move(root, &d4), None);
    }

    #[test]
    fn promote_child_first_reorders() {
        let (mut arena, root) = arena_with_root();
        let a = arena.add_child(root, mv(&arena, root, "e2e4"), PvClass::Branch).unwrap();
        let b = arena.add_child(root, mv(&arena, root, "d2d4"), PvClass::Branch).unwrap();
        let c = arena.add_child(root, mv(&arena, root, "g1f3"), PvClass::Branch).unwrap();
        arena.promote_child_first(root, b);
        assert_eq!(arena.get(root).children.as_slice(), &[b, a, c]);
    }

    #[test]
    fn ensure_report_is_cached() {
        let (mut arena, root) = arena_with_root();
        arena.ensure_report(root);
        assert!(arena.get(root).report.is_some());
        let first = arena.get(root).report.clone();
        arena.ensure_report(root);
        assert_eq!(arena.get(root).report, first);
    }
}
