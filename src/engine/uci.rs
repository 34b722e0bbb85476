//! UCI protocol plumbing for engine subprocesses.
//!
//! Spawning with piped stdio, line-based async I/O, and conversion of
//! `info` attribute lists into [`ScoredLine`] values validated against the
//! analysed position.

use std::path::Path;
use std::process::Stdio;

use log::{error, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use vampirc_uci::UciInfoAttribute;

use crate::position::{Move, Position};

use super::types::{EngineError, EngineResult, ScoredLine};

#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Async communicator for a running UCI engine process.
pub struct UciCommunicator {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout_lines: Lines<BufReader<ChildStdout>>,
}

impl UciCommunicator {
    /// Spawn a new UCI engine process and set up async I/O.
    pub async fn spawn(path: &Path) -> EngineResult<Self> {
        let mut command = Command::new(path);
        command.current_dir(path.parent().unwrap_or_else(|| Path::new(".")));
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("TERM", "dumb");

        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn()?;
        info!("Starting engine process: {:?}", path);
        let stdin = child.stdin.take().ok_or(EngineError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(EngineError::NoStdout)?;
        let stdout_lines = BufReader::new(stdout).lines();

        // Drain stderr to avoid deadlocks when the buffer fills up.
        let stderr = child.stderr.take();
        tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    error!("[engine-stderr] {}", line);
                }
            }
        });

        Ok(Self { child, stdin, stdout_lines })
    }

    /// Write a line to the engine's stdin.
    pub async fn write_line(&mut self, line: &str) -> EngineResult<()> {
        log::trace!("[engine-stdin] {}", line.trim_end());
        if let Err(e) = self.stdin.write_all(line.as_bytes()).await {
            return Err(classify_io(e));
        }
        if let Err(e) = self.stdin.flush().await {
            return Err(classify_io(e));
        }
        Ok(())
    }
}

/// Map pipe-level I/O failures onto the engine error taxonomy.
pub fn classify_io(e: std::io::Error) -> EngineError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::UnexpectedEof => EngineError::BrokenPipe,
        _ if e.raw_os_error() == Some(32) => EngineError::BrokenPipe,
        _ => EngineError::Io(e),
    }
}

/// Parse UCI `info` attributes into a [`ScoredLine`] for `position`.
///
/// The PV is validated by playing it out from the analysed position; an
/// illegal continuation truncates the line there. Scores stay in the
/// side-to-move perspective the engine reports.
pub fn parse_scored_line(
    attrs: Vec<UciInfoAttribute>,
    position: &Position,
) -> EngineResult<ScoredLine> {
    let mut line = ScoredLine {
        moves: Vec::new(),
        score_cp: 0,
        mate_in: None,
        depth_reached: 0,
        multipv: 1,
    };

    for attr in attrs {
        match attr {
            UciInfoAttribute::Pv(pv) => {
                let mut cursor = position.clone();
                for mv in pv {
                    let parsed = match Move::parse(&mv.to_string(), &cursor) {
                        Ok(m) => m,
                        Err(_) => break,
                    };
                    cursor = match cursor.apply(&parsed) {
                        Ok(next) => next,
                        Err(_) => break,
                    };
                    line.moves.push(parsed);
                }
            }
            UciInfoAttribute::Depth(depth) => {
                line.depth_reached = depth as u32;
            }
            UciInfoAttribute::MultiPv(multipv) => {
                line.multipv = multipv;
            }
            UciInfoAttribute::Score { cp, mate, .. } => {
                if let Some(cp) = cp {
                    line.score_cp = cp;
                }
                if let Some(mate) = mate {
                    line.mate_in = Some(mate as i32);
                    line.score_cp = if mate >= 0 { 32_000 } else { -32_000 };
                }
            }
            _ => (),
        }
    }

    if line.moves.is_empty() {
        return Err(EngineError::NoLine);
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vampirc_uci::{parse_one, UciMessage};

    fn attrs_of(line: &str) -> Vec<UciInfoAttribute> {
        match parse_one(line) {
            UciMessage::Info(attrs) => attrs,
            other => panic!("expected info, got {:?}", other),
        }
    }

    #[test]
    fn parses_a_plain_info_line() {
        let position = Position::start();
        let attrs = attrs_of("info depth 12 multipv 1 score cp 31 pv e2e4 e7e5 g1f3");
        let line = parse_scored_line(attrs, &position).unwrap();
        assert_eq!(line.depth_reached, 12);
        assert_eq!(line.multipv, 1);
        assert_eq!(line.score_cp, 31);
        assert_eq!(line.mate_in, None);
        assert_eq!(line.moves.len(), 3);
        assert_eq!(line.moves[0].uci(), "e2e4");
    }

    #[test]
    fn mate_score_is_kept_separate() {
        let position = Position::from_fen("7k/6Q1/5K2/8/8/8/8/8 w - - 0 1").unwrap();
        let attrs = attrs_of("info depth 5 multipv 1 score mate 1 pv g7h7");
        let line = parse_scored_line(attrs, &position).unwrap();
        assert_eq!(line.mate_in, Some(1));
        assert!(line.score_cp > 10_000);
    }

    #[test]
    fn illegal_pv_tail_is_truncated() {
        let position = Position::start();
        let attrs = attrs_of("info depth 8 multipv 1 score cp 10 pv e2e4 e2e4");
        let line = parse_scored_line(attrs, &position).unwrap();
        assert_eq!(line.moves.len(), 1);
    }

    #[test]
    fn empty_pv_is_no_line() {
        let position = Position::start();
        let attrs = attrs_of("info depth 8 score cp 10");
        assert!(matches!(
            parse_scored_line(attrs, &position),
            Err(EngineError::NoLine)
        ));
    }
}
