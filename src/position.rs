//! Immutable chess position model.
//!
//! Thin wrapper over `shakmaty` that fixes the conventions the rest of the
//! crate relies on: positions are parsed with Chess960 castling detection
//! and the extra-material fallback, moves are identified by
//! (from, to, promotion) only, and hashing for transposition purposes goes
//! through the clock-independent zobrist key.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use shakmaty::fen::Fen;
use shakmaty::san::SanPlus;
use shakmaty::uci::UciMove;
use shakmaty::zobrist::{Zobrist64, ZobristHash};
use shakmaty::{
    CastlingMode, Chess, Color, EnPassantMode, Position as _, Role, Square,
};

/// Errors raised while parsing a FEN into a [`Position`].
#[derive(Debug, thiserror::Error)]
pub enum PositionParseError {
    #[error("FEN parsing error: {0}")]
    Fen(#[from] shakmaty::fen::ParseFenError),

    #[error("position setup error: {0}")]
    Setup(#[from] shakmaty::PositionError<Chess>),
}

/// Errors raised while resolving a move string against a position.
#[derive(Debug, thiserror::Error)]
pub enum MoveParseError {
    #[error("unparseable move `{0}`")]
    Syntax(String),

    #[error("illegal move `{mv}` in {fen}")]
    Illegal { mv: String, fen: String },
}

/// A move identified by origin, destination and optional promotion piece.
///
/// SAN is a display concern only; two moves are equal iff their
/// (from, to, promotion) triples are equal. Castling uses the king's UCI
/// destination square, matching what engines emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Move {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<Role>,
}

impl Move {
    /// Parse a move string, accepting UCI first and SAN as a fallback.
    /// The internal representation is always UCI.
    pub fn parse(s: &str, position: &Position) -> Result<Move, MoveParseError> {
        if let Ok(uci) = UciMove::from_ascii(s.as_bytes()) {
            if let Ok(m) = uci.to_move(&position.inner) {
                return Ok(Move::from_shakmaty(&m, position));
            }
        }
        if let Ok(san) = SanPlus::from_ascii(s.as_bytes()) {
            return match san.san.to_move(&position.inner) {
                Ok(m) => Ok(Move::from_shakmaty(&m, position)),
                Err(_) => Err(MoveParseError::Illegal {
                    mv: s.to_string(),
                    fen: position.fen(),
                }),
            };
        }
        Err(MoveParseError::Syntax(s.to_string()))
    }

    /// UCI rendering, e.g. `e2e4` or `e7e8q`.
    pub fn uci(&self) -> String {
        self.to_string()
    }

    fn from_shakmaty(m: &shakmaty::Move, position: &Position) -> Move {
        match m.to_uci(position.inner.castles().mode()) {
            UciMove::Normal { from, to, promotion } => Move { from, to, promotion },
            // Null and Put never come out of legal move generation.
            _ => Move { from: Square::A1, to: Square::A1, promotion: None },
        }
    }

    fn to_uci(self) -> UciMove {
        UciMove::Normal {
            from: self.from,
            to: self.to,
            promotion: self.promotion,
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_uci())
    }
}

/// Why a position admits no further play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    FiftyMove,
    Repetition,
}

/// Coarse game phase, derived from remaining material and development.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    Opening,
    Middlegame,
    Endgame,
}

/// An immutable chess position.
#[derive(Debug, Clone)]
pub struct Position {
    inner: Chess,
}

impl Position {
    /// The standard initial position.
    pub fn start() -> Position {
        Position { inner: Chess::default() }
    }

    /// Parse a FEN, preferring standard castling semantics (so engine
    /// PVs render castling as `e1g1`) with a Chess960 fallback, and
    /// tolerating positions with extra material the way engine GUIs do.
    pub fn from_fen(fen: &str) -> Result<Position, PositionParseError> {
        let parsed: Fen = fen.parse()?;
        let inner: Chess = match parsed.clone().into_position(CastlingMode::Standard) {
            Ok(p) => p,
            Err(_) => match parsed.into_position(CastlingMode::Chess960) {
                Ok(p) => p,
                Err(e) => e.ignore_too_much_material()?,
            },
        };
        Ok(Position { inner })
    }

    pub(crate) fn inner(&self) -> &Chess {
        &self.inner
    }

    pub fn side_to_move(&self) -> Color {
        self.inner.turn()
    }

    pub fn is_check(&self) -> bool {
        self.inner.is_check()
    }

    /// All legal moves in the crate's (from, to, promotion) representation.
    pub fn legal_moves(&self) -> Vec<Move> {
        self.inner
            .legal_moves()
            .iter()
            .map(|m| Move::from_shakmaty(m, self))
            .collect()
    }

    /// Play a move, producing the successor position. The move is checked
    /// for legality; the original position is untouched.
    pub fn apply(&self, mv: &Move) -> Result<Position, MoveParseError> {
        let m = mv
            .to_uci()
            .to_move(&self.inner)
            .map_err(|_| MoveParseError::Illegal {
                mv: mv.uci(),
                fen: self.fen(),
            })?;
        let mut next = self.inner.clone();
        next.play_unchecked(&m);
        Ok(Position { inner: next })
    }

    /// Terminal outcome of this position, if any.
    ///
    /// Repetition draws are recognised only when the caller supplies the
    /// repetition table it maintained along the game; without one, only
    /// move-derived terminals are reported.
    pub fn terminal(&self, repetitions: Option<&RepetitionTable>) -> Option<TerminalKind> {
        if self.inner.is_checkmate() {
            Some(TerminalKind::Checkmate)
        } else if self.inner.is_stalemate() {
            Some(TerminalKind::Stalemate)
        } else if self.inner.is_insufficient_material() {
            Some(TerminalKind::InsufficientMaterial)
        } else if self.inner.halfmoves() >= 100 {
            Some(TerminalKind::FiftyMove)
        } else if repetitions.map_or(false, |t| t.count(self.zobrist()) >= 3) {
            Some(TerminalKind::Repetition)
        } else {
            None
        }
    }

    /// Clock-independent transposition key.
    pub fn zobrist(&self) -> u64 {
        let z: Zobrist64 = self.inner.zobrist_hash(EnPassantMode::Legal);
        z.0
    }

    /// Game phase from remaining material and development.
    ///
    /// Let `npm` be the summed non-pawn material of both sides
    /// (N/B = 300, R = 500, Q = 900) and `developed` the number of minor
    /// pieces off their home squares. Opening iff `npm >= 5400` and
    /// `developed < 5`; endgame iff `npm <= 2400`; middlegame otherwise.
    pub fn phase(&self) -> GamePhase {
        let material = self.inner.board().material();
        let npm: i32 = [Color::White, Color::Black]
            .iter()
            .map(|&c| {
                let side = material.get(c);
                side.knight as i32 * 300
                    + side.bishop as i32 * 300
                    + side.rook as i32 * 500
                    + side.queen as i32 * 900
            })
            .sum();

        let board = self.inner.board();
        let home = [
            (Square::B1, Role::Knight, Color::White),
            (Square::G1, Role::Knight, Color::White),
            (Square::C1, Role::Bishop, Color::White),
            (Square::F1, Role::Bishop, Color::White),
            (Square::B8, Role::Knight, Color::Black),
            (Square::G8, Role::Knight, Color::Black),
            (Square::C8, Role::Bishop, Color::Black),
            (Square::F8, Role::Bishop, Color::Black),
        ];
        let at_home = home
            .iter()
            .filter(|(sq, role, color)| {
                board
                    .piece_at(*sq)
                    .map_or(false, |p| p.role == *role && p.color == *color)
            })
            .count() as i32;
        let minors = (material.white.knight
            + material.white.bishop
            + material.black.knight
            + material.black.bishop) as i32;
        let developed = (minors - at_home).max(0);

        if npm <= 2400 {
            GamePhase::Endgame
        } else if npm >= 5400 && developed < 5 {
            GamePhase::Opening
        } else {
            GamePhase::Middlegame
        }
    }

    /// FEN rendering, for external consumers only.
    pub fn fen(&self) -> String {
        Fen::from_position(self.inner.clone(), EnPassantMode::Legal).to_string()
    }

    /// SAN rendering of a legal move, for log lines.
    pub fn san(&self, mv: &Move) -> String {
        match mv.to_uci().to_move(&self.inner) {
            Ok(m) => {
                let mut scratch = self.inner.clone();
                SanPlus::from_move_and_play_unchecked(&mut scratch, &m).to_string()
            }
            Err(_) => mv.uci(),
        }
    }
}

impl PartialEq for Position {
    /// Full-value equality, clocks included. Transposition-style equality
    /// is what [`Position::zobrist`] is for.
    fn eq(&self, other: &Position) -> bool {
        self.zobrist() == other.zobrist()
            && self.inner.halfmoves() == other.inner.halfmoves()
            && self.inner.fullmoves() == other.inner.fullmoves()
    }
}

impl Eq for Position {}

/// Zobrist-keyed repetition counter, maintained by whoever walks a game.
#[derive(Debug, Default, Clone)]
pub struct RepetitionTable {
    counts: HashMap<u64, u32>,
}

impl RepetitionTable {
    pub fn new() -> RepetitionTable {
        RepetitionTable::default()
    }

    /// Record a visit; returns the updated count for the key.
    pub fn push(&mut self, key: u64) -> u32 {
        let entry = self.counts.entry(key).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Undo the most recent visit of `key`.
    pub fn pop(&mut self, key: u64) {
        if let Some(entry) = self.counts.get_mut(&key) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                self.counts.remove(&key);
            }
        }
    }

    pub fn count(&self, key: u64) -> u32 {
        self.counts.get(&key).copied().unwrap_or(0)
    }
}
