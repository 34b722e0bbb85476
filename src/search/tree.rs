//! Public projection of a finished search.
//!
//! The arena is the working representation; external consumers get a
//! flat, serde-friendly list of node records plus the stop reason and
//! run statistics.

use std::collections::BTreeMap;

use serde::Serialize;
use shakmaty::Color;

use crate::analysis::{BySide, Theme};

use super::node::{NodeArena, NodeId, PvClass};
use super::{SearchStats, StopReason};

/// One node as external consumers see it.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNodeRecord {
    pub id: u32,
    pub parent_id: Option<u32>,
    pub ply_from_root: u16,
    /// UCI form; `None` for the root.
    pub move_from_parent: Option<String>,
    /// For external rendering only.
    pub position_fen: String,
    pub confidence: u8,
    pub initial_confidence: Option<u8>,
    pub transferred_confidence: Option<u8>,
    pub terminal_confidence: Option<u8>,
    pub has_branches: bool,
    pub insufficient_confidence: bool,
    pub frozen: bool,
    pub pv_class: PvClass,
    pub engine_cp: Option<i32>,
    pub tags: BySide<Vec<String>>,
    pub theme_scores: BySide<BTreeMap<Theme, f32>>,
    pub material_balance_cp: BySide<i32>,
}

/// Visual class derived for the outer UI; not part of the search logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeColor {
    Green,
    RedTriangle,
    RedCircle,
}

/// The finished tree handed to callers.
#[derive(Debug, Clone, Serialize)]
pub struct SearchTree {
    pub target: u8,
    pub reason: StopReason,
    pub engine_unavailable: bool,
    pub stats: SearchStats,
    pub nodes: Vec<TreeNodeRecord>,
}

impl SearchTree {
    /// Derive the display class of one record against the target.
    pub fn color_of(&self, record: &TreeNodeRecord) -> NodeColor {
        if record.confidence >= self.target {
            NodeColor::Green
        } else if record.has_branches {
            NodeColor::RedTriangle
        } else {
            NodeColor::RedCircle
        }
    }

    pub fn root(&self) -> Option<&TreeNodeRecord> {
        self.nodes.first()
    }
}

fn tag_ids(arena: &NodeArena, id: NodeId, color: Color) -> Vec<String> {
    arena
        .get(id)
        .report
        .as_ref()
        .map(|r| r.tags.get(color).iter().map(|t| t.id().to_string()).collect())
        .unwrap_or_default()
}

fn visible_themes(arena: &NodeArena, id: NodeId, color: Color) -> BTreeMap<Theme, f32> {
    arena
        .get(id)
        .report
        .as_ref()
        .map(|r| r.visible_themes(color))
        .unwrap_or_default()
}

/// Project the arena into the external record list. Reports are attached
/// lazily here: this is the first moment a node is known to be returned.
pub(crate) fn project(
    arena: &mut NodeArena,
    target: u8,
    reason: StopReason,
    engine_unavailable: bool,
    stats: SearchStats,
) -> SearchTree {
    let ids: Vec<NodeId> = arena.iter().map(|n| n.id).collect();
    let mut nodes = Vec::with_capacity(ids.len());
    for id in ids {
        arena.ensure_report(id);
        let node = arena.get(id);
        let balance = node
            .report
            .as_ref()
            .map(|r| r.material_balance_cp.clone())
            .unwrap_or(BySide::new(0, 0));
        nodes.push(TreeNodeRecord {
            id: node.id.0,
            parent_id: node.parent.map(|p| p.0),
            ply_from_root: node.ply_from_root,
            move_from_parent: node.move_from_parent.as_ref().map(|m| m.uci()),
            position_fen: node.position.fen(),
            confidence: node.confidence,
            initial_confidence: node.initial_confidence,
            transferred_confidence: node.transferred_confidence,
            terminal_confidence: node.terminal_confidence,
            has_branches: node.has_branches,
            insufficient_confidence: node.insufficient_confidence,
            frozen: node.frozen,
            pv_class: node.pv_class,
            engine_cp: node.engine_cp,
            tags: BySide::new(
                tag_ids(arena, id, Color::White),
                tag_ids(arena, id, Color::Black),
            ),
            theme_scores: BySide::new(
                visible_themes(arena, id, Color::White),
                visible_themes(arena, id, Color::Black),
            ),
            material_balance_cp: balance,
        });
    }

    SearchTree { target, reason, engine_unavailable, stats, nodes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::{Move, Position};
    use crate::search::node::PvClass;

    #[test]
    fn projection_round_trips_to_json() {
        let mut arena = NodeArena::new();
        let root = arena.add_root(Position::start());
        let e4 = Move::parse("e2e4", &arena.get(root).position).unwrap();
        let child = arena.add_child(root, e4, PvClass::OnSpine).unwrap();
        arena.get_mut(root).set_terminal_confidence(55);
        arena.get_mut(child).set_terminal_confidence(60);

        let tree = project(
            &mut arena,
            80,
            StopReason::Stalled,
            false,
            SearchStats::default(),
        );
        assert_eq!(tree.nodes.len(), 2);
        assert_eq!(tree.nodes[0].parent_id, None);
        assert_eq!(tree.nodes[1].parent_id, Some(0));
        assert_eq!(tree.nodes[1].move_from_parent.as_deref(), Some("e2e4"));

        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["target"], 80);
        assert_eq!(json["reason"], "stalled");
        assert_eq!(json["nodes"][0]["confidence"], 55);
        // Tag ids keep their dotted namespaces in the wire form.
        assert!(json["nodes"][0]["tags"]["white"].is_array());
    }

    #[test]
    fn colors_derive_from_flags() {
        let mut arena = NodeArena::new();
        let root = arena.add_root(Position::start());
        arena.get_mut(root).set_terminal_confidence(90);
        let tree = project(
            &mut arena,
            80,
            StopReason::TargetReached,
            false,
            SearchStats::default(),
        );
        assert_eq!(tree.color_of(&tree.nodes[0]), NodeColor::Green);

        let mut low = tree.nodes[0].clone();
        low.confidence = 40;
        low.has_branches = true;
        assert_eq!(tree.color_of(&low), NodeColor::RedTriangle);
        low.has_branches = false;
        assert_eq!(tree.color_of(&low), NodeColor::RedCircle);
    }
}
