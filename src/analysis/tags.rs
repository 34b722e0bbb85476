//! Closed tag catalogue and per-side tag detection.
//!
//! Tags are board facts with stable dotted string ids for external
//! consumers; internal code uses the enumeration. Conventions per
//! detector: structural assets and tactical motifs attach to the side
//! that can exploit them, king weaknesses and trapped pieces attach to
//! the side that suffers them.

use std::collections::BTreeSet;

use serde::{Serialize, Serializer};
use shakmaty::{
    attacks, Bitboard, CastlingSide, Chess, Color, File, Position as _, Rank, Role, Square,
};

use super::BySide;

/// The closed tag catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    SemiOpenFile,
    SeventhRankPair,
    LongDiagonal,
    KnightOutpost,
    BishopOutpost,
    KingZoneHole,
    CenterControl,
    KingShieldBroken,
    KingRingAttackers,
    KingCenterExposed,
    PassedPawn,
    PawnLever,
    RookOpenFile,
    RookSeventh,
    BishopPair,
    Fork,
    Pin,
    Skewer,
    DiscoveredAttack,
    BackRank,
    TrappedPiece,
}

impl Tag {
    /// Stable external identifier.
    pub fn id(&self) -> &'static str {
        match self {
            Tag::SemiOpenFile => "tag.files.semi_open",
            Tag::SeventhRankPair => "tag.ranks.seventh",
            Tag::LongDiagonal => "tag.diagonals.long",
            Tag::KnightOutpost => "tag.outposts.knight",
            Tag::BishopOutpost => "tag.outposts.bishop",
            Tag::KingZoneHole => "tag.holes.king_zone",
            Tag::CenterControl => "tag.center.control",
            Tag::KingShieldBroken => "tag.king.shield.broken",
            Tag::KingRingAttackers => "tag.king.attackers.ring",
            Tag::KingCenterExposed => "tag.king.center_exposed",
            Tag::PassedPawn => "tag.pawns.passed",
            Tag::PawnLever => "tag.pawns.lever",
            Tag::RookOpenFile => "tag.rook.open_file",
            Tag::RookSeventh => "tag.rook.rank7",
            Tag::BishopPair => "tag.bishop.pair",
            Tag::Fork => "tag.tactic.fork",
            Tag::Pin => "tag.tactic.pin",
            Tag::Skewer => "tag.tactic.skewer",
            Tag::DiscoveredAttack => "tag.tactic.discovered",
            Tag::BackRank => "tag.tactic.backrank",
            Tag::TrappedPiece => "tag.piece.trapped",
        }
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.id())
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

pub(crate) fn piece_cp(role: Role) -> i32 {
    match role {
        Role::Pawn => 100,
        Role::Knight => 300,
        Role::Bishop => 300,
        Role::Rook => 500,
        Role::Queen => 900,
        Role::King => 0,
    }
}

/// Rank index from `color`'s point of view (0 = own back rank).
pub(crate) fn rel_rank(color: Color, sq: Square) -> u32 {
    let r = u32::from(sq.rank());
    match color {
        Color::White => r,
        Color::Black => 7 - r,
    }
}

fn file_mask(file: u32) -> Bitboard {
    Rank::ALL
        .iter()
        .map(|&r| Square::from_coords(File::new(file), r))
        .collect()
}

fn rel_rank_mask(color: Color, rel: u32) -> Bitboard {
    let rank = match color {
        Color::White => Rank::new(rel),
        Color::Black => Rank::new(7 - rel),
    };
    File::ALL
        .iter()
        .map(|&f| Square::from_coords(f, rank))
        .collect()
}

fn center_squares() -> [Square; 4] {
    [Square::D4, Square::E4, Square::D5, Square::E5]
}

pub(crate) fn attackers(pos: &Chess, sq: Square, by: Color) -> Bitboard {
    let board = pos.board();
    board.attacks_to(sq, by, board.occupied())
}

fn pieces(pos: &Chess, color: Color, role: Role) -> Bitboard {
    pos.board().by_color(color) & pos.board().by_role(role)
}

/// True when a pawn of `color` attacks `sq` now, or could after one
/// legal push (including the double push from its start rank).
fn pawn_can_guard(pos: &Chess, color: Color, sq: Square) -> bool {
    let board = pos.board();
    let pawns = pieces(pos, color, Role::Pawn);
    for pawn in pawns {
        if attacks::pawn_attacks(color, pawn).contains(sq) {
            return true;
        }
        let dir: i32 = match color {
            Color::White => 8,
            Color::Black => -8,
        };
        if let Some(one) = pawn.offset(dir) {
            if board.piece_at(one).is_none() {
                if attacks::pawn_attacks(color, one).contains(sq) {
                    return true;
                }
                if rel_rank(color, pawn) == 1 {
                    if let Some(two) = one.offset(dir) {
                        if board.piece_at(two).is_none()
                            && attacks::pawn_attacks(color, two).contains(sq)
                        {
                            return true;
                        }
                    }
                }
            }
        }
    }
    false
}

/// True iff no enemy pawn can ever challenge `sq` from the side's view:
/// the adjacent files ahead of the square hold no enemy pawns.
fn safe_from_enemy_pawns(pos: &Chess, color: Color, sq: Square) -> bool {
    let enemy_pawns = pieces(pos, !color, Role::Pawn);
    let f = u32::from(sq.file());
    let r = rel_rank(color, sq);
    for df in [-1i32, 1] {
        let nf = f as i32 + df;
        if !(0..8).contains(&nf) {
            continue;
        }
        let ahead: Bitboard = (r + 1..8)
            .map(|rr| rel_rank_mask(color, rr) & file_mask(nf as u32))
            .fold(Bitboard::EMPTY, |acc, bb| acc | bb);
        if !(ahead & enemy_pawns).is_empty() {
            return false;
        }
    }
    true
}

fn passed_pawn(pos: &Chess, color: Color, sq: Square) -> bool {
    let enemy_pawns = pieces(pos, !color, Role::Pawn);
    let f = u32::from(sq.file());
    let r = rel_rank(color, sq);
    for df in [-1i32, 0, 1] {
        let nf = f as i32 + df;
        if !(0..8).contains(&nf) {
            continue;
        }
        let ahead: Bitboard = (r + 1..8)
            .map(|rr| rel_rank_mask(color, rr) & file_mask(nf as u32))
            .fold(Bitboard::EMPTY, |acc, bb| acc | bb);
        if !(ahead & enemy_pawns).is_empty() {
            return false;
        }
    }
    true
}

fn slider_pattern(role: Role, sq: Square) -> Option<Bitboard> {
    match role {
        Role::Bishop => Some(attacks::bishop_attacks(sq, Bitboard::EMPTY)),
        Role::Rook => Some(attacks::rook_attacks(sq, Bitboard::EMPTY)),
        Role::Queen => Some(attacks::queen_attacks(sq, Bitboard::EMPTY)),
        _ => None,
    }
}

/// Detect the full tag sets for both sides.
pub(crate) fn detect(pos: &Chess) -> BySide<BTreeSet<Tag>> {
    let mut tags = BySide::new(BTreeSet::new(), BTreeSet::new());
    for color in [Color::White, Color::Black] {
        detect_side(pos, color, tags.get_mut(color));
    }
    tags
}

fn detect_side(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    files_and_ranks(pos, us, out);
    diagonals_and_outposts(pos, us, out);
    pawns(pos, us, out);
    king_weaknesses(pos, us, out);
    king_pressure(pos, us, out);
    tactics(pos, us, out);
    trapped_pieces(pos, us, out);

    let bishops = pieces(pos, us, Role::Bishop).count();
    if bishops >= 2 && pieces(pos, !us, Role::Bishop).count() < 2 {
        out.insert(Tag::BishopPair);
    }

    let controlled = center_squares()
        .iter()
        .filter(|&&sq| {
            !attackers(pos, sq, us).is_empty()
                || pieces(pos, us, Role::Pawn).contains(sq)
        })
        .count();
    if controlled >= 3 {
        out.insert(Tag::CenterControl);
    }
}

fn files_and_ranks(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let our_pawns = pieces(pos, us, Role::Pawn);
    let their_pawns = pieces(pos, !us, Role::Pawn);
    let heavies = pieces(pos, us, Role::Rook) | pieces(pos, us, Role::Queen);

    for sq in heavies {
        let fmask = file_mask(u32::from(sq.file()));
        let ours_here = !(fmask & our_pawns).is_empty();
        let theirs_here = !(fmask & their_pawns).is_empty();
        if !ours_here && theirs_here {
            out.insert(Tag::SemiOpenFile);
        }
        if !ours_here && !theirs_here && pieces(pos, us, Role::Rook).contains(sq) {
            out.insert(Tag::RookOpenFile);
        }
    }

    let seventh = rel_rank_mask(us, 6);
    let rooks_on_seventh = pieces(pos, us, Role::Rook) & seventh;
    if !rooks_on_seventh.is_empty() {
        out.insert(Tag::RookSeventh);
    }
    if (heavies & seventh).count() >= 2 {
        out.insert(Tag::SeventhRankPair);
    }
}

fn diagonals_and_outposts(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let occupied = pos.board().occupied();
    let long: Bitboard = Square::ALL
        .iter()
        .filter(|sq| {
            let f = u32::from(sq.file());
            let r = u32::from(sq.rank());
            f == r || f + r == 7
        })
        .copied()
        .collect();

    for bishop in pieces(pos, us, Role::Bishop) {
        if long.contains(bishop)
            && (attacks::bishop_attacks(bishop, occupied) & long).count() >= 3
        {
            out.insert(Tag::LongDiagonal);
        }
    }

    for (role, tag) in [(Role::Knight, Tag::KnightOutpost), (Role::Bishop, Tag::BishopOutpost)] {
        for sq in pieces(pos, us, role) {
            let r = rel_rank(us, sq);
            if (3..=5).contains(&r)
                && !(attacks::pawn_attacks(!us, sq) & pieces(pos, us, Role::Pawn)).is_empty()
                && safe_from_enemy_pawns(pos, us, sq)
            {
                out.insert(tag);
            }
        }
    }
}

fn pawns(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let our_pawns = pieces(pos, us, Role::Pawn);
    let their_pawns = pieces(pos, !us, Role::Pawn);

    for pawn in our_pawns {
        if passed_pawn(pos, us, pawn) {
            out.insert(Tag::PassedPawn);
        }
        if !(attacks::pawn_attacks(us, pawn) & their_pawns).is_empty() {
            out.insert(Tag::PawnLever);
        }
    }
}

/// King weaknesses attach to the side that owns the king.
fn king_weaknesses(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let board = pos.board();
    let king = match board.king_of(us) {
        Some(sq) => sq,
        None => return,
    };
    let kf = u32::from(king.file());

    // Holes are gated to avoid opening-phase false positives: quiet
    // starting structures must not light up the king zone.
    let our_pawns = pieces(pos, us, Role::Pawn);
    let structure_touched = (our_pawns & rel_rank_mask(us, 1)).count() < our_pawns.count().max(1)
        || board.occupied().count() < 32;
    if structure_touched {
        for sq in Square::ALL {
            if king.distance(sq) > 2 {
                continue;
            }
            let df = (u32::from(sq.file()) as i32 - kf as i32).abs();
            if df > 1 {
                continue;
            }
            if pawn_can_guard(pos, us, sq) {
                continue;
            }
            if attackers(pos, sq, !us).is_empty() {
                continue;
            }
            out.insert(Tag::KingZoneHole);
            break;
        }
    }

    // Castled king with a stripped shield.
    if rel_rank(us, king) == 0 && (kf <= 2 || kf >= 5) {
        if shield_count(pos, us, kf >= 4) <= 1 {
            out.insert(Tag::KingShieldBroken);
        }
    }

    // Uncastled king caught in the centre, own file opened up.
    if kf == 3 || kf == 4 {
        let open_file = (file_mask(kf) & our_pawns).is_empty();
        if open_file && intended_wing_shield(pos, us) <= 1 {
            out.insert(Tag::KingCenterExposed);
        }
    }
}

fn shield_count(pos: &Chess, us: Color, kingside: bool) -> u32 {
    let files: [u32; 3] = if kingside { [5, 6, 7] } else { [0, 1, 2] };
    let mask = files
        .iter()
        .map(|&f| file_mask(f))
        .fold(Bitboard::EMPTY, |acc, bb| acc | bb)
        & (rel_rank_mask(us, 1) | rel_rank_mask(us, 2));
    (pieces(pos, us, Role::Pawn) & mask).count() as u32
}

/// Shield pawns on the wing the king would castle to: a remaining
/// castling right names the wing, else the better-covered wing stands in.
fn intended_wing_shield(pos: &Chess, us: Color) -> u32 {
    let castles = pos.castles();
    let kingside = castles.has(us, CastlingSide::KingSide);
    let queenside = castles.has(us, CastlingSide::QueenSide);
    match (kingside, queenside) {
        (true, false) => shield_count(pos, us, true),
        (false, true) => shield_count(pos, us, false),
        (true, true) => shield_count(pos, us, true).max(shield_count(pos, us, false)),
        (false, false) => shield_count(pos, us, true).max(shield_count(pos, us, false)),
    }
}

/// Pressure on the enemy king ring attaches to the attacker.
fn king_pressure(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let board = pos.board();
    let their_king = match board.king_of(!us) {
        Some(sq) => sq,
        None => return,
    };
    let ring = attacks::king_attacks(their_king);
    let mut ring_attackers = Bitboard::EMPTY;
    for sq in ring {
        ring_attackers |= attackers(pos, sq, us);
    }
    if ring_attackers.count() >= 2 {
        out.insert(Tag::KingRingAttackers);
    }

    // Back-rank motif: no luft and a heavy piece to exploit it.
    if rel_rank(!us, their_king) == 0 {
        let their_pieces = board.by_color(!us);
        let front = attacks::king_attacks(their_king) & rel_rank_mask(!us, 1);
        let no_luft = !front.is_empty() && front.into_iter().all(|sq| their_pieces.contains(sq));
        let has_heavy =
            !(pieces(pos, us, Role::Rook) | pieces(pos, us, Role::Queen)).is_empty();
        if no_luft && has_heavy {
            out.insert(Tag::BackRank);
        }
    }
}

fn tactics(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let board = pos.board();
    let occupied = board.occupied();
    let them = !us;
    let their_king = board.king_of(them);
    let their_queens = pieces(pos, them, Role::Queen);

    // Forks: a knight or pawn hitting two heavy targets at once.
    let heavy_targets: Bitboard = pieces(pos, them, Role::Rook)
        | their_queens
        | their_king.map(Bitboard::from).unwrap_or(Bitboard::EMPTY);
    for knight in pieces(pos, us, Role::Knight) {
        if (attacks::knight_attacks(knight) & heavy_targets).count() >= 2 {
            out.insert(Tag::Fork);
        }
    }
    let their_pieces_no_pawns = board.by_color(them) & !board.by_role(Role::Pawn);
    for pawn in pieces(pos, us, Role::Pawn) {
        if (attacks::pawn_attacks(us, pawn) & their_pieces_no_pawns).count() >= 2 {
            out.insert(Tag::Fork);
        }
    }

    // Pins, skewers, discovered attacks along slider rays.
    let valuable: Vec<Square> = their_king.into_iter().chain(their_queens).collect();
    for role in [Role::Bishop, Role::Rook, Role::Queen] {
        for slider in pieces(pos, us, role) {
            let pattern = match slider_pattern(role, slider) {
                Some(p) => p,
                None => continue,
            };

            for &target in &valuable {
                if target == slider || !pattern.contains(target) {
                    continue;
                }
                let blockers = attacks::between(slider, target) & occupied;
                if blockers.count() != 1 {
                    continue;
                }
                let blocker = match blockers.into_iter().next() {
                    Some(sq) => sq,
                    None => continue,
                };
                if board.by_color(them).contains(blocker) {
                    out.insert(Tag::Pin);
                } else if board.by_color(us).contains(blocker)
                    && !pieces(pos, us, Role::Pawn).contains(blocker)
                {
                    out.insert(Tag::DiscoveredAttack);
                }
            }

            // Skewer: a directly attacked heavy piece shields a cheaper one.
            let direct = attacks::attacks(
                slider,
                shakmaty::Piece { color: us, role },
                occupied,
            ) & board.by_color(them);
            for front in direct {
                let front_value = board
                    .piece_at(front)
                    .map(|p| if p.role == Role::King { 10_000 } else { piece_cp(p.role) })
                    .unwrap_or(0);
                if front_value < 500 {
                    continue;
                }
                for back in attacks::ray(slider, front) & board.by_color(them) {
                    if back == front || !attacks::between(slider, back).contains(front) {
                        continue;
                    }
                    if !(attacks::between(front, back) & occupied).is_empty() {
                        continue;
                    }
                    let back_value = board.piece_at(back).map(|p| piece_cp(p.role)).unwrap_or(0);
                    if back_value < front_value {
                        out.insert(Tag::Skewer);
                    }
                }
            }
        }
    }
}

/// A piece with no safe square, attached to its owner.
fn trapped_pieces(pos: &Chess, us: Color, out: &mut BTreeSet<Tag>) {
    let board = pos.board();
    let occupied = board.occupied();
    for role in [Role::Knight, Role::Bishop, Role::Rook, Role::Queen] {
        for sq in pieces(pos, us, role) {
            let own_value = piece_cp(role);
            let cheaper_attacker = attackers(pos, sq, !us).into_iter().any(|a| {
                board.piece_at(a).map_or(false, |p| piece_cp(p.role) < own_value)
            });
            if !cheaper_attacker {
                continue;
            }
            let escapes = attacks::attacks(sq, shakmaty::Piece { color: us, role }, occupied)
                & !board.by_color(us);
            let all_unsafe = escapes.into_iter().all(|dest| {
                attackers(pos, dest, !us).into_iter().any(|a| {
                    board
                        .piece_at(a)
                        .map_or(false, |p| piece_cp(p.role) < own_value || p.role == Role::Pawn)
                })
            });
            if all_unsafe {
                out.insert(Tag::TrappedPiece);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shakmaty::fen::Fen;
    use shakmaty::CastlingMode;

    fn pos(fen: &str) -> Chess {
        let fen: Fen = fen.parse().unwrap();
        fen.into_position(CastlingMode::Chess960).unwrap()
    }

    fn tags_for(fen: &str, color: Color) -> BTreeSet<Tag> {
        let p = pos(fen);
        detect(&p).get(color).clone()
    }

    #[test]
    fn start_position_is_quiet() {
        let tags = detect(&Chess::default());
        for color in [Color::White, Color::Black] {
            let t = tags.get(color);
            assert!(!t.contains(&Tag::KingZoneHole));
            assert!(!t.contains(&Tag::KingCenterExposed));
            assert!(!t.contains(&Tag::PassedPawn));
            assert!(!t.contains(&Tag::RookOpenFile));
            assert!(!t.contains(&Tag::Pin));
        }
    }

    #[test]
    fn rook_on_open_file() {
        let t = tags_for("4k3/8/8/8/8/8/8/3RK3 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::RookOpenFile));
    }

    #[test]
    fn rook_on_seventh() {
        let t = tags_for("4k3/R7/8/8/8/8/8/4K3 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::RookSeventh));
    }

    #[test]
    fn passed_pawn_detected() {
        let t = tags_for("4k3/8/8/3P4/8/8/8/4K3 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::PassedPawn));
    }

    #[test]
    fn blockaded_pawn_is_not_passed() {
        let t = tags_for("4k3/3p4/8/3P4/8/8/8/4K3 w - - 0 1", Color::White);
        assert!(!t.contains(&Tag::PassedPawn));
    }

    #[test]
    fn bishop_pair_only_for_the_side_that_has_it() {
        let t = tags_for("4k3/8/8/8/8/8/8/2B1KB2 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::BishopPair));
        let t = tags_for("4k3/8/8/8/8/8/8/2B1KB2 w - - 0 1", Color::Black);
        assert!(!t.contains(&Tag::BishopPair));
    }

    #[test]
    fn knight_fork_on_heavy_targets() {
        // Knight on e6 forks the queen on d8 and the rook on f8.
        let t = tags_for("3q1r2/4k3/4N3/8/8/8/8/4K3 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::Fork));
    }

    #[test]
    fn pin_against_the_king() {
        // Bishop pins the d7 knight to the e8 king.
        let t = tags_for("4k3/3n4/8/1B6/8/8/8/4K3 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::Pin));
    }

    #[test]
    fn skewer_and_pin_are_distinguished() {
        // Rook attacks the queen directly; the rook behind her hangs.
        let t = tags_for("4k3/8/3q4/8/3r4/8/8/3RK3 b - - 0 1", Color::White);
        assert!(t.contains(&Tag::Pin));
        assert!(!t.contains(&Tag::Skewer));
        // Bishop attacks the queen on the long diagonal with the rook
        // behind her: a skewer for White.
        let t = tags_for("4k2r/8/8/8/3q4/8/1B6/4K3 b - - 0 1", Color::White);
        assert!(t.contains(&Tag::Skewer));
    }

    #[test]
    fn back_rank_weakness_needs_heavy_piece() {
        let t = tags_for("6k1/5ppp/8/8/8/8/8/R3K3 w - - 0 1", Color::White);
        assert!(t.contains(&Tag::BackRank));
        let t = tags_for("6k1/5ppp/8/8/8/8/8/4K3 w - - 0 1", Color::White);
        assert!(!t.contains(&Tag::BackRank));
    }

    #[test]
    fn detection_is_deterministic() {
        let p = pos("r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4");
        let a = detect(&p);
        let b = detect(&p);
        assert_eq!(a.get(Color::White), b.get(Color::White));
        assert_eq!(a.get(Color::Black), b.get(Color::Black));
    }
}
