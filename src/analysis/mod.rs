//! Theme/tag analyzer.
//!
//! A pure, deterministic function of a position: material balance, theme
//! scores and tag sets for both sides. The search never consults this to
//! pick moves; it exists so downstream consumers get a side-aware,
//! score-justified vocabulary for every node they are handed.

pub mod tags;
pub mod themes;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use shakmaty::Color;

use crate::position::Position;

pub use tags::Tag;
pub use themes::{Theme, THEME_SUPPRESSION};

/// A white/black pair, indexable by [`Color`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BySide<T> {
    pub white: T,
    pub black: T,
}

impl<T> BySide<T> {
    pub fn new(white: T, black: T) -> BySide<T> {
        BySide { white, black }
    }

    pub fn get(&self, color: Color) -> &T {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    pub fn get_mut(&mut self, color: Color) -> &mut T {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }
}

/// Everything the analyzer knows about one position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionReport {
    /// Own-minus-opponent material in centipawns, per side; the two
    /// values negate each other.
    pub material_balance_cp: BySide<i32>,
    pub theme_scores: BySide<BTreeMap<Theme, f32>>,
    pub tags: BySide<BTreeSet<Tag>>,
}

impl PositionReport {
    /// Theme scores with near-zero entries suppressed, as external
    /// consumers see them.
    pub fn visible_themes(&self, color: Color) -> BTreeMap<Theme, f32> {
        self.theme_scores
            .get(color)
            .iter()
            .filter(|(_, v)| v.abs() >= THEME_SUPPRESSION)
            .map(|(k, v)| (*k, *v))
            .collect()
    }
}

/// Analyze a position. Pure and deterministic: the same position always
/// yields the same report.
pub fn analyze(position: &Position) -> PositionReport {
    let pos = position.inner();
    let tags = tags::detect(pos);
    let white_material = themes::material_cp(pos, Color::White);
    let black_material = themes::material_cp(pos, Color::Black);

    PositionReport {
        material_balance_cp: BySide::new(
            white_material - black_material,
            black_material - white_material,
        ),
        theme_scores: BySide::new(
            themes::score(pos, Color::White, tags.get(Color::White)),
            themes::score(pos, Color::Black, tags.get(Color::Black)),
        ),
        tags,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(fen: &str) -> PositionReport {
        analyze(&Position::from_fen(fen).unwrap())
    }

    #[test]
    fn analysis_is_idempotent() {
        let position =
            Position::from_fen("r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4")
                .unwrap();
        let a = analyze(&position);
        let b = analyze(&position);
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.material_balance_cp, b.material_balance_cp);
        for color in [Color::White, Color::Black] {
            for (theme, v) in a.theme_scores.get(color) {
                let w = b.theme_scores.get(color)[theme];
                assert!((v - w).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn material_balances_negate() {
        let r = report("4k3/8/8/8/8/8/8/R3K3 w - - 0 1");
        assert_eq!(r.material_balance_cp.white, 500);
        assert_eq!(r.material_balance_cp.black, -500);
    }

    #[test]
    fn near_zero_themes_are_suppressed() {
        let r = report("4k3/8/8/8/8/8/8/4K3 w - - 0 1");
        let visible = r.visible_themes(Color::White);
        for (theme, v) in &visible {
            assert!(v.abs() >= THEME_SUPPRESSION, "{:?} = {}", theme, v);
        }
        // Bare kings have no promotion or break story to tell.
        assert!(!visible.contains_key(&Theme::Promotion));
        assert!(!visible.contains_key(&Theme::Breaks));
    }

    #[test]
    fn start_position_balance_is_zero() {
        let r = analyze(&Position::start());
        assert_eq!(r.material_balance_cp.white, 0);
        assert_eq!(r.material_balance_cp.black, 0);
    }
}
