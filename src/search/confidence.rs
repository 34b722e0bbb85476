//! Confidence mapping.
//!
//! The only sanctioned mapping from engine output to a confidence
//! percentage: the logistic win-probability curve over centipawns, with
//! mates and terminal outcomes pinned to the extremes. Pure arithmetic,
//! so a given engine score always maps to the same confidence.

use crate::engine::ScoredLine;
use crate::position::TerminalKind;

/// Steepness of the logistic curve.
pub const CONFIDENCE_K: f64 = 0.4;

/// Map a centipawn score (side to move's perspective) to [0, 100].
pub fn confidence_from_cp(cp: i32) -> u8 {
    let v = 100.0 / (1.0 + (-CONFIDENCE_K * cp as f64 / 100.0).exp());
    v.round().clamp(0.0, 100.0) as u8
}

/// Map a scored line, preferring the mate announcement when present:
/// a forced mate for the side to move is certainty either way.
pub fn confidence_from_line(line: &ScoredLine) -> u8 {
    match line.mate_in {
        Some(n) if n > 0 => 100,
        Some(_) => 0,
        None => confidence_from_cp(line.score_cp),
    }
}

/// Confidence of a terminal position for its side to move: checkmate
/// means the mover lost, every draw kind is an even 50.
pub fn terminal_confidence(kind: TerminalKind) -> u8 {
    match kind {
        TerminalKind::Checkmate => 0,
        TerminalKind::Stalemate
        | TerminalKind::InsufficientMaterial
        | TerminalKind::FiftyMove
        | TerminalKind::Repetition => 50,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Move;
    use shakmaty::Square;

    fn line(cp: i32, mate: Option<i32>) -> ScoredLine {
        ScoredLine {
            moves: vec![Move { from: Square::E2, to: Square::E4, promotion: None }],
            score_cp: cp,
            mate_in: mate,
            depth_reached: 10,
            multipv: 1,
        }
    }

    #[test]
    fn balanced_is_fifty() {
        assert_eq!(confidence_from_cp(0), 50);
    }

    #[test]
    fn monotone_non_decreasing() {
        let mut last = 0;
        for cp in (-2_000..=2_000).step_by(10) {
            let c = confidence_from_cp(cp);
            assert!(c >= last, "confidence dropped at {} cp", cp);
            last = c;
        }
    }

    #[test]
    fn extremes_clamp() {
        assert_eq!(confidence_from_cp(i32::MAX / 2), 100);
        assert_eq!(confidence_from_cp(i32::MIN / 2), 0);
        assert_eq!(confidence_from_cp(32_000), 100);
        assert_eq!(confidence_from_cp(-32_000), 0);
    }

    #[test]
    fn known_curve_points() {
        // 100 cp at k = 0.4 is just shy of 60%.
        assert_eq!(confidence_from_cp(100), 60);
        assert_eq!(confidence_from_cp(-100), 40);
    }

    #[test]
    fn mate_overrides_cp() {
        assert_eq!(confidence_from_line(&line(-50, Some(3))), 100);
        assert_eq!(confidence_from_line(&line(50, Some(-3))), 0);
        assert_eq!(confidence_from_line(&line(50, None)), confidence_from_cp(50));
    }

    #[test]
    fn terminal_mapping() {
        assert_eq!(terminal_confidence(TerminalKind::Checkmate), 0);
        assert_eq!(terminal_confidence(TerminalKind::Stalemate), 50);
        assert_eq!(terminal_confidence(TerminalKind::InsufficientMaterial), 50);
        assert_eq!(terminal_confidence(TerminalKind::FiftyMove), 50);
        assert_eq!(terminal_confidence(TerminalKind::Repetition), 50);
    }
}
