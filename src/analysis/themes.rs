//! Per-side theme scores.
//!
//! Fourteen fixed themes, each scored deterministically from the board.
//! Scores are rough [0, 1] intensities; values below the suppression
//! threshold are hidden from the public projection.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Serializer};
use shakmaty::{attacks, Bitboard, Chess, Color, File, Position as _, Rank, Role, Square};

use super::tags::{attackers, piece_cp, rel_rank, Tag};

/// Theme entries with |value| below this are suppressed externally.
pub const THEME_SUPPRESSION: f32 = 0.01;

/// The fixed theme vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Theme {
    CenterSpace,
    PawnStructure,
    KingSafety,
    PieceActivity,
    Development,
    Threats,
    Tactics,
    Trades,
    Prophylaxis,
    Complexity,
    Lanes,
    LocalPressure,
    Promotion,
    Breaks,
}

impl Theme {
    pub fn id(&self) -> &'static str {
        match self {
            Theme::CenterSpace => "center_space",
            Theme::PawnStructure => "pawn_structure",
            Theme::KingSafety => "king_safety",
            Theme::PieceActivity => "piece_activity",
            Theme::Development => "development",
            Theme::Threats => "threats",
            Theme::Tactics => "tactics",
            Theme::Trades => "trades",
            Theme::Prophylaxis => "prophylaxis",
            Theme::Complexity => "complexity",
            Theme::Lanes => "lanes",
            Theme::LocalPressure => "local_pressure",
            Theme::Promotion => "promotion",
            Theme::Breaks => "breaks",
        }
    }
}

impl Serialize for Theme {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

fn side(pos: &Chess, color: Color, role: Role) -> Bitboard {
    pos.board().by_color(color) & pos.board().by_role(role)
}

fn file_mask(file: u32) -> Bitboard {
    Rank::ALL
        .iter()
        .map(|&r| Square::from_coords(File::new(file), r))
        .collect()
}

/// Pseudo-mobility of the non-pawn, non-king pieces.
fn mobility(pos: &Chess, color: Color) -> u32 {
    let board = pos.board();
    let occupied = board.occupied();
    let own = board.by_color(color);
    let mut total = 0u32;
    for role in [Role::Knight, Role::Bishop, Role::Rook, Role::Queen] {
        for sq in side(pos, color, role) {
            let piece = shakmaty::Piece { color, role };
            total += (attacks::attacks(sq, piece, occupied) & !own).count() as u32;
        }
    }
    total
}

/// Enemy pieces attacked by `color` and left undefended.
fn loose_targets(pos: &Chess, color: Color) -> u32 {
    let board = pos.board();
    let mut n = 0;
    for sq in board.by_color(!color) & !board.by_role(Role::King) {
        if !attackers(pos, sq, color).is_empty() && attackers(pos, sq, !color).is_empty() {
            n += 1;
        }
    }
    n
}

/// Score every theme for `color`. Tag detection feeds the tactics theme
/// so the two views never disagree about what is on the board.
pub(crate) fn score(pos: &Chess, color: Color, tags: &BTreeSet<Tag>) -> BTreeMap<Theme, f32> {
    let board = pos.board();
    let mut out = BTreeMap::new();
    let pawns = side(pos, color, Role::Pawn);
    let their_pawns = side(pos, !color, Role::Pawn);

    // Center space: control plus pawn presence on the four core squares.
    let center = [Square::D4, Square::E4, Square::D5, Square::E5];
    let control: u32 = center
        .iter()
        .map(|&sq| attackers(pos, sq, color).count() as u32 + u32::from(pawns.contains(sq)))
        .sum();
    out.insert(Theme::CenterSpace, clamp01(control as f32 / 8.0));

    // Pawn structure: penalties for doubled and isolated pawns and for
    // extra pawn islands.
    let mut doubled = 0u32;
    let mut isolated = 0u32;
    let mut islands = 0u32;
    let mut prev_occupied = false;
    for f in 0..8u32 {
        let here = (pawns & file_mask(f)).count() as u32;
        if here >= 2 {
            doubled += here - 1;
        }
        if here > 0 {
            if !prev_occupied {
                islands += 1;
            }
            let neighbours = [f.checked_sub(1), f.checked_add(1).filter(|&n| n < 8)]
                .into_iter()
                .flatten()
                .map(|n| (pawns & file_mask(n)).count())
                .sum::<usize>();
            if neighbours == 0 {
                isolated += here;
            }
        }
        prev_occupied = here > 0;
    }
    out.insert(
        Theme::PawnStructure,
        clamp01(1.0 - 0.15 * doubled as f32 - 0.15 * isolated as f32
            - 0.1 * islands.saturating_sub(1) as f32),
    );

    // King safety: shield pawns near the king against ring pressure.
    let king_safety = match board.king_of(color) {
        Some(king) => {
            let zone = attacks::king_attacks(king);
            let shield = (zone & pawns).count() as f32;
            let mut pressure = Bitboard::EMPTY;
            for sq in zone {
                pressure |= attackers(pos, sq, !color);
            }
            clamp01(shield / 3.0 * 0.7 + (1.0 - pressure.count() as f32 / 4.0).max(0.0) * 0.3)
        }
        None => 0.0,
    };
    out.insert(Theme::KingSafety, king_safety);

    let own_mobility = mobility(pos, color);
    out.insert(Theme::PieceActivity, clamp01(own_mobility as f32 / 40.0));

    // Development: minors off their home squares plus a castled king.
    let home: Bitboard = match color {
        Color::White => [Square::B1, Square::G1, Square::C1, Square::F1],
        Color::Black => [Square::B8, Square::G8, Square::C8, Square::F8],
    }
    .into_iter()
    .collect();
    let minors = side(pos, color, Role::Knight) | side(pos, color, Role::Bishop);
    let developed = minors.count().saturating_sub((minors & home).count()) as f32;
    let castled = board.king_of(color).map_or(false, |k| {
        rel_rank(color, k) == 0 && {
            let f = u32::from(k.file());
            f <= 2 || f >= 6
        }
    });
    out.insert(
        Theme::Development,
        clamp01(developed / 4.0 * 0.75 + if castled { 0.25 } else { 0.0 }),
    );

    let threats = loose_targets(pos, color);
    out.insert(Theme::Threats, clamp01(threats as f32 / 3.0));

    let tactic_tags = tags
        .iter()
        .filter(|t| t.id().starts_with("tag.tactic."))
        .count();
    out.insert(Theme::Tactics, clamp01(tactic_tags as f32 * 0.3));

    // Trades: defended enemy pieces we attack, i.e. offers on the board.
    let mut offers = 0u32;
    for sq in board.by_color(!color) & !board.by_role(Role::King) {
        if !attackers(pos, sq, color).is_empty() && !attackers(pos, sq, !color).is_empty() {
            offers += 1;
        }
    }
    out.insert(Theme::Trades, clamp01(offers as f32 / 4.0));

    // Prophylaxis as restriction: how little the opponent threatens back.
    let counter_threats = loose_targets(pos, !color);
    out.insert(Theme::Prophylaxis, clamp01(1.0 - counter_threats as f32 / 4.0));

    out.insert(
        Theme::Complexity,
        clamp01((own_mobility + mobility(pos, !color) + offers * 4) as f32 / 80.0),
    );

    // Lanes: heavies on open or semi-open files plus long-diagonal bishops.
    let mut lanes = 0u32;
    for sq in side(pos, color, Role::Rook) | side(pos, color, Role::Queen) {
        if (file_mask(u32::from(sq.file())) & pawns).is_empty() {
            lanes += 1;
        }
    }
    if tags.contains(&Tag::LongDiagonal) {
        lanes += 1;
    }
    out.insert(Theme::Lanes, clamp01(lanes as f32 / 4.0));

    // Local pressure: the heaviest pile-up on one enemy-occupied square.
    let max_attackers = (board.by_color(!color))
        .into_iter()
        .map(|sq| attackers(pos, sq, color).count())
        .max()
        .unwrap_or(0);
    out.insert(Theme::LocalPressure, clamp01(max_attackers as f32 / 4.0));

    // Promotion: progress of the most advanced passed pawn.
    let best_passer = pawns
        .into_iter()
        .filter(|&sq| {
            tags.contains(&Tag::PassedPawn) && passed_here(pos, color, sq)
        })
        .map(|sq| rel_rank(color, sq))
        .max();
    out.insert(
        Theme::Promotion,
        best_passer.map_or(0.0, |r| clamp01(r as f32 / 7.0)),
    );

    // Breaks: pawn pushes that land with an attack on the enemy chain.
    let mut breaks = 0u32;
    let dir: i32 = match color {
        Color::White => 8,
        Color::Black => -8,
    };
    for pawn in pawns {
        if let Some(push) = pawn.offset(dir) {
            if board.piece_at(push).is_none()
                && !(attacks::pawn_attacks(color, push) & their_pawns).is_empty()
            {
                breaks += 1;
            }
        }
    }
    out.insert(Theme::Breaks, clamp01(breaks as f32 / 3.0));

    out
}

fn passed_here(pos: &Chess, color: Color, sq: Square) -> bool {
    let enemy_pawns = side(pos, !color, Role::Pawn);
    let f = u32::from(sq.file());
    let r = rel_rank(color, sq);
    for df in [-1i32, 0, 1] {
        let nf = f as i32 + df;
        if !(0..8).contains(&nf) {
            continue;
        }
        for target in enemy_pawns & file_mask(nf as u32) {
            if rel_rank(color, target) > r {
                return false;
            }
        }
    }
    true
}

/// Material sum for one side at the fixed piece values.
pub(crate) fn material_cp(pos: &Chess, color: Color) -> i32 {
    let counts = pos.board().material().get(color).clone();
    counts.pawn as i32 * piece_cp(Role::Pawn)
        + counts.knight as i32 * piece_cp(Role::Knight)
        + counts.bishop as i32 * piece_cp(Role::Bishop)
        + counts.rook as i32 * piece_cp(Role::Rook)
        + counts.queen as i32 * piece_cp(Role::Queen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tags::detect;
    use shakmaty::fen::Fen;
    use shakmaty::CastlingMode;

    fn pos(fen: &str) -> Chess {
        let fen: Fen = fen.parse().unwrap();
        fen.into_position(CastlingMode::Chess960).unwrap()
    }

    fn themes(fen: &str, color: Color) -> BTreeMap<Theme, f32> {
        let p = pos(fen);
        let tags = detect(&p);
        score(&p, color, tags.get(color))
    }

    #[test]
    fn start_position_is_symmetric() {
        let p = Chess::default();
        let tags = detect(&p);
        let white = score(&p, Color::White, tags.get(Color::White));
        let black = score(&p, Color::Black, tags.get(Color::Black));
        for (theme, w) in &white {
            let b = black.get(theme).copied().unwrap_or(f32::NAN);
            assert!((w - b).abs() < 1e-6, "{:?}: {} vs {}", theme, w, b);
        }
    }

    #[test]
    fn scores_stay_in_unit_range() {
        let t = themes(
            "r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
            Color::White,
        );
        for (theme, v) in t {
            assert!((0.0..=1.0).contains(&v), "{:?} = {}", theme, v);
        }
    }

    #[test]
    fn advanced_passer_raises_promotion() {
        let far = themes("4k3/8/8/8/8/8/2p5/4K3 b - - 0 1", Color::Black);
        let near = themes("4k3/2p5/8/8/8/8/8/4K3 b - - 0 1", Color::Black);
        assert!(far[&Theme::Promotion] > near[&Theme::Promotion]);
    }

    #[test]
    fn development_grows_with_developed_minors() {
        let before = themes(
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            Color::White,
        );
        let after = themes(
            "rnbqkb1r/pppppppp/5n2/8/8/2N2N2/PPPPPPPP/R1BQKB1R w KQkq - 4 3",
            Color::White,
        );
        assert!(after[&Theme::Development] > before[&Theme::Development]);
    }

    #[test]
    fn material_values_are_fixed() {
        let p = Chess::default();
        assert_eq!(material_cp(&p, Color::White), 8 * 100 + 2 * 300 + 2 * 300 + 2 * 500 + 900);
        assert_eq!(material_cp(&p, Color::White), material_cp(&p, Color::Black));
    }
}
