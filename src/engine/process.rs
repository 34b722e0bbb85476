//! UCI engine process handle.
//!
//! One [`EngineHandle`] owns one engine subprocess for its whole life:
//! spawn and handshake, one `analyse` call at a time, graceful shutdown,
//! and replacement of a dead process. Serialisation of callers is the
//! queue's job; the handle only enforces that it is never re-entered.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use log::{debug, info, warn};
use tokio::time::timeout;
use vampirc_uci::{parse_one, UciMessage};

use crate::position::Position;

use super::types::{
    Budget, EngineError, EngineRequest, EngineResult, EngineState, ScoredLine,
    ENGINE_INIT_TIMEOUT, ENGINE_READY_TIMEOUT,
};
use super::uci::{classify_io, parse_scored_line, UciCommunicator};

/// A running UCI engine process.
pub struct EngineHandle {
    path: PathBuf,
    comm: UciCommunicator,
    state: EngineState,
    current_multipv: u8,
}

impl EngineHandle {
    /// Spawn the engine binary and run the `uci`/`isready` handshake.
    pub async fn spawn(path: PathBuf) -> EngineResult<EngineHandle> {
        let comm = Self::boot(&path).await?;
        info!("Engine initialized: {:?}", path);
        Ok(EngineHandle {
            path,
            comm,
            state: EngineState::Ready,
            current_multipv: 1,
        })
    }

    async fn boot(path: &PathBuf) -> EngineResult<UciCommunicator> {
        let mut comm = UciCommunicator::spawn(path).await?;

        comm.write_line("uci\n").await?;
        let uciok = timeout(ENGINE_INIT_TIMEOUT, async {
            while let Some(line) = comm.stdout_lines.next_line().await? {
                if line == "uciok" {
                    return Ok::<_, EngineError>(true);
                }
            }
            Ok(false)
        })
        .await;
        match uciok {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => return Err(EngineError::InitFailed),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(EngineError::InitTimeout),
        }

        comm.write_line("isready\n").await?;
        let readyok = timeout(ENGINE_READY_TIMEOUT, async {
            while let Some(line) = comm.stdout_lines.next_line().await? {
                if line == "readyok" {
                    return Ok::<_, EngineError>(true);
                }
            }
            Ok(false)
        })
        .await;
        match readyok {
            Ok(Ok(true)) => Ok(comm),
            Ok(Ok(false)) => Err(EngineError::InitFailed),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::InitTimeout),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, EngineState::Dead)
    }

    /// Run one analysis to completion and return the scored lines, best
    /// first. Returns between 1 and `multipv` lines; a search that yields
    /// none is [`EngineError::NoLine`]. Fatal failures leave the handle
    /// in the `Dead` state.
    pub async fn analyse(&mut self, req: &EngineRequest) -> EngineResult<Vec<ScoredLine>> {
        match self.state {
            EngineState::Ready => {}
            EngineState::Busy => return Err(EngineError::InvalidState("analysis in progress")),
            _ => return Err(EngineError::EngineUnavailable),
        }

        let position = Position::from_fen(&req.fen)
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        if let Some(kind) = position.terminal(None) {
            return Err(EngineError::InvalidRequest(format!(
                "terminal position ({:?}) cannot be analysed",
                kind
            )));
        }

        // Clamp multipv to the number of legal moves; engines silently
        // return fewer lines otherwise and the slot accounting drifts.
        let effective = (req.multipv as usize).min(position.legal_moves().len()).max(1) as u8;

        self.state = EngineState::Busy;
        let result = self.drive(req, &position, effective).await;
        match &result {
            Ok(_) => self.state = EngineState::Ready,
            Err(e) if e.is_fatal() => {
                warn!("Engine fatal error, marking dead: {}", e);
                self.state = EngineState::Dead;
            }
            Err(_) => self.state = EngineState::Ready,
        }
        result
    }

    async fn drive(
        &mut self,
        req: &EngineRequest,
        position: &Position,
        effective: u8,
    ) -> EngineResult<Vec<ScoredLine>> {
        if effective != self.current_multipv {
            self.comm
                .write_line(&format!("setoption name MultiPV value {}\n", effective))
                .await?;
            self.current_multipv = effective;
        }

        self.comm
            .write_line(&format!("position fen {}\n", req.fen))
            .await?;
        let go = match req.budget {
            Budget::Depth(depth) => format!("go depth {}\n", depth),
            Budget::Time(ms) => format!("go movetime {}\n", ms),
        };
        self.comm.write_line(&go).await?;

        let start = Instant::now();
        let deadline = req.budget.deadline();
        // Deepest line seen per multipv slot; engines re-announce every
        // slot per completed depth so later entries supersede earlier.
        let mut slots: BTreeMap<u16, ScoredLine> = BTreeMap::new();

        loop {
            let remaining = match deadline.checked_sub(start.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => return Err(EngineError::SearchTimeout),
            };
            let line = match timeout(remaining, self.comm.stdout_lines.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => return Err(EngineError::BrokenPipe),
                Ok(Err(e)) => return Err(classify_io(e)),
                Err(_) => return Err(EngineError::SearchTimeout),
            };

            match parse_one(&line) {
                UciMessage::Info(attrs) => {
                    if let Ok(scored) = parse_scored_line(attrs, position) {
                        let keep = slots
                            .get(&scored.multipv)
                            .map_or(true, |prev| scored.depth_reached >= prev.depth_reached);
                        if keep {
                            slots.insert(scored.multipv, scored);
                        }
                    }
                }
                UciMessage::BestMove { .. } => break,
                _ => {}
            }
        }

        debug!(
            "Analysis finished: fen={} multipv={} lines={} elapsed={:?}",
            req.fen,
            effective,
            slots.len(),
            start.elapsed()
        );

        let lines: Vec<ScoredLine> = slots.into_values().collect();
        if lines.is_empty() {
            return Err(EngineError::NoLine);
        }
        Ok(lines)
    }

    /// Kill the current process and boot a replacement from the same path.
    pub async fn respawn(&mut self) -> EngineResult<()> {
        info!("Respawning engine: {:?}", self.path);
        self.kill().await;
        self.state = EngineState::Spawning;
        match Self::boot(&self.path).await {
            Ok(comm) => {
                self.comm = comm;
                self.current_multipv = 1;
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = EngineState::Dead;
                Err(e)
            }
        }
    }

    /// Terminate the process: `quit` first, force-kill as fallback.
    pub async fn kill(&mut self) {
        if self.comm.write_line("quit\n").await.is_err() {
            debug!("Engine already unreachable on quit");
        }
        let wait = timeout(
            std::time::Duration::from_secs(2),
            self.comm.child.wait(),
        )
        .await;
        match wait {
            Ok(Ok(status)) => info!("Engine exited gracefully: {:?}", status),
            _ => {
                warn!("Engine did not exit gracefully, force-killing");
                let _ = self.comm.child.kill().await;
                let _ = self.comm.child.wait().await;
            }
        }
        self.state = EngineState::Dead;
    }
}
