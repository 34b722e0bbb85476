//! Engine request queue.
//!
//! The single serialisation point for all engine access in the process.
//! Submitters enqueue [`EngineRequest`]s and suspend on a ticket; one
//! background worker drains the queue FIFO and drives the backend one
//! request at a time, so two UCI commands can never overlap. The worker
//! also decides when the engine is dead and respawns it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::process::EngineHandle;
use super::types::{EngineError, EngineRequest, EngineResult, ScoredLine};

/// What the queue worker drives. [`EngineHandle`] is the production
/// implementation; tests substitute scripted backends.
#[async_trait]
pub trait AnalysisBackend: Send {
    async fn analyse(&mut self, req: &EngineRequest) -> EngineResult<Vec<ScoredLine>>;

    /// Replace a dead engine process. Called only after a fatal error.
    async fn respawn(&mut self) -> EngineResult<()>;
}

#[async_trait]
impl AnalysisBackend for EngineHandle {
    async fn analyse(&mut self, req: &EngineRequest) -> EngineResult<Vec<ScoredLine>> {
        EngineHandle::analyse(self, req).await
    }

    async fn respawn(&mut self) -> EngineResult<()> {
        EngineHandle::respawn(self).await
    }
}

/// Queue tuning knobs.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Respawn attempts per dead-engine incident before the queue gives
    /// up and starts failing requests with `EngineUnavailable`.
    pub max_respawn_attempts: u32,
    /// Pause between respawn attempts.
    pub respawn_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            max_respawn_attempts: 2,
            respawn_backoff: Duration::from_millis(250),
        }
    }
}

/// JSON-serialisable view of the queue counters.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetricsSnapshot {
    pub queue_depth: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_wait_ms: f32,
    pub avg_processing_ms: f32,
    pub success_rate: f32,
    pub engine_alive: bool,
    pub engine_last_seen_at: Option<DateTime<Utc>>,
}

/// Liveness view of the engine behind the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub alive: bool,
    pub last_response_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
struct Counters {
    queue_depth: AtomicU32,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    wait_ms_total: AtomicU64,
    processing_ms_total: AtomicU64,
    consecutive_failures: AtomicU32,
    engine_alive: AtomicBool,
    // Epoch millis; 0 = never heard from the engine.
    last_response_ms: AtomicI64,
}

impl Counters {
    fn record_success(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_response_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn last_seen(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_response_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            Utc.timestamp_millis_opt(ms).single()
        }
    }
}

struct QueuedRequest {
    req: EngineRequest,
    reply: oneshot::Sender<EngineResult<Vec<ScoredLine>>>,
    submitted_at: Instant,
}

/// A pending analysis: resolves when the worker answers.
pub struct AnalysisTicket {
    rx: oneshot::Receiver<EngineResult<Vec<ScoredLine>>>,
}

impl Future for AnalysisTicket {
    type Output = EngineResult<Vec<ScoredLine>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| match r {
            Ok(result) => result,
            Err(_) => Err(EngineError::QueueClosed),
        })
    }
}

/// Cloneable handle to the process-wide engine queue.
#[derive(Clone)]
pub struct EngineQueue {
    tx: mpsc::UnboundedSender<QueuedRequest>,
    counters: Arc<Counters>,
}

impl EngineQueue {
    /// Start a queue over an already-built backend.
    pub fn spawn(backend: Box<dyn AnalysisBackend>, config: QueueConfig) -> EngineQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        counters.engine_alive.store(true, Ordering::Relaxed);
        tokio::spawn(worker(rx, backend, counters.clone(), config));
        EngineQueue { tx, counters }
    }

    /// Spawn a UCI engine binary and start a queue over it.
    pub async fn spawn_uci(
        path: std::path::PathBuf,
        config: QueueConfig,
    ) -> EngineResult<EngineQueue> {
        let handle = EngineHandle::spawn(path).await?;
        Ok(EngineQueue::spawn(Box::new(handle), config))
    }

    /// Enqueue a request. Non-blocking; the returned ticket resolves when
    /// the worker has an answer. Dropping the ticket before dispatch
    /// cancels the request; once dispatched it runs to completion.
    pub fn submit(&self, req: EngineRequest) -> AnalysisTicket {
        let (reply, rx) = oneshot::channel();
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);
        self.counters.queue_depth.fetch_add(1, Ordering::Relaxed);
        let item = QueuedRequest { req, reply, submitted_at: Instant::now() };
        if self.tx.send(item).is_err() {
            // Worker gone; the dropped reply sender resolves the ticket
            // with QueueClosed.
            self.counters.queue_depth.fetch_sub(1, Ordering::Relaxed);
        }
        AnalysisTicket { rx }
    }

    /// Submit and await in one step.
    pub async fn analyse(&self, req: EngineRequest) -> EngineResult<Vec<ScoredLine>> {
        self.submit(req).await
    }

    pub fn metrics(&self) -> QueueMetricsSnapshot {
        let c = &self.counters;
        let dispatched = c.dispatched.load(Ordering::Relaxed);
        let completed = c.completed.load(Ordering::Relaxed);
        let failed = c.failed_requests.load(Ordering::Relaxed);
        let avg = |total_ms: u64, n: u64| {
            if n == 0 {
                0.0
            } else {
                total_ms as f32 / n as f32
            }
        };
        QueueMetricsSnapshot {
            queue_depth: c.queue_depth.load(Ordering::Relaxed),
            total_requests: c.total_requests.load(Ordering::Relaxed),
            failed_requests: failed,
            avg_wait_ms: avg(c.wait_ms_total.load(Ordering::Relaxed), dispatched),
            avg_processing_ms: avg(c.processing_ms_total.load(Ordering::Relaxed), completed),
            success_rate: if completed == 0 {
                1.0
            } else {
                (completed - failed) as f32 / completed as f32
            },
            engine_alive: c.engine_alive.load(Ordering::Relaxed),
            engine_last_seen_at: c.last_seen(),
        }
    }

    pub fn health(&self) -> QueueHealth {
        QueueHealth {
            alive: self.counters.engine_alive.load(Ordering::Relaxed),
            last_response_at: self.counters.last_seen(),
            consecutive_failures: self.counters.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    mut backend: Box<dyn AnalysisBackend>,
    counters: Arc<Counters>,
    config: QueueConfig,
) {
    info!("Engine queue worker started");
    let mut available = true;

    while let Some(item) = rx.recv().await {
        counters.queue_depth.fetch_sub(1, Ordering::Relaxed);

        // Submitter lost interest before dispatch; skip entirely. Once
        // dispatched, a request always runs to completion so the engine
        // is never left mid-search.
        if item.reply.is_closed() {
            debug!("Dropping cancelled request for {}", item.req.fen);
            continue;
        }

        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        counters
            .wait_ms_total
            .fetch_add(item.submitted_at.elapsed().as_millis() as u64, Ordering::Relaxed);

        if !available {
            counters.record_failure();
            let _ = item.reply.send(Err(EngineError::EngineUnavailable));
            continue;
        }

        let started = Instant::now();
        let result = backend.analyse(&item.req).await;
        counters
            .processing_ms_total
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

        match &result {
            Ok(lines) => {
                debug!("Request served: fen={} lines={}", item.req.fen, lines.len());
                counters.record_success();
            }
            Err(e) => {
                warn!("Request failed: fen={} error={}", item.req.fen, e);
                counters.record_failure();
                if e.is_fatal() {
                    available = revive(&mut backend, &config).await;
                    counters.engine_alive.store(available, Ordering::Relaxed);
                }
            }
        }

        // The failing request itself is never retried; the caller decides.
        let _ = item.reply.send(result);
    }
    info!("Engine queue worker stopped");
}

async fn revive(backend: &mut Box<dyn AnalysisBackend>, config: &QueueConfig) -> bool {
    for attempt in 1..=config.max_respawn_attempts {
        info!(
            "Respawning engine (attempt {}/{})",
            attempt, config.max_respawn_attempts
        );
        match backend.respawn().await {
            Ok(()) => {
                info!("Engine respawned");
                return true;
            }
            Err(e) => {
                warn!("Respawn attempt {} failed: {}", attempt, e);
                tokio::time::sleep(config.respawn_backoff).await;
            }
        }
    }
    error!("Engine could not be respawned; queue will fail requests");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Budget;
    use crate::position::Position;
    use std::sync::Mutex;

    fn line_for(fen: &str, cp: i32, depth: u32) -> Vec<ScoredLine> {
        let position = Position::from_fen(fen).unwrap();
        let mv = position.legal_moves()[0];
        vec![ScoredLine {
            moves: vec![mv],
            score_cp: cp,
            mate_in: None,
            depth_reached: depth,
            multipv: 1,
        }]
    }

    /// Backend that answers from a closure and logs the order of fens.
    struct Scripted<F> {
        served: Arc<Mutex<Vec<String>>>,
        respawns: Arc<AtomicU32>,
        respawn_ok: bool,
        gate: Option<Arc<tokio::sync::Semaphore>>,
        respond: F,
    }

    #[async_trait]
    impl<F> AnalysisBackend for Scripted<F>
    where
        F: FnMut(&EngineRequest) -> EngineResult<Vec<ScoredLine>> + Send,
    {
        async fn analyse(&mut self, req: &EngineRequest) -> EngineResult<Vec<ScoredLine>> {
            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
            }
            self.served.lock().unwrap().push(req.fen.clone());
            (self.respond)(req)
        }

        async fn respawn(&mut self) -> EngineResult<()> {
            self.respawns.fetch_add(1, Ordering::Relaxed);
            if self.respawn_ok {
                Ok(())
            } else {
                Err(EngineError::InitTimeout)
            }
        }
    }

    fn scripted<F>(respond: F) -> (Scripted<F>, Arc<Mutex<Vec<String>>>, Arc<AtomicU32>)
    where
        F: FnMut(&EngineRequest) -> EngineResult<Vec<ScoredLine>> + Send,
    {
        let served = Arc::new(Mutex::new(Vec::new()));
        let respawns = Arc::new(AtomicU32::new(0));
        (
            Scripted {
                served: served.clone(),
                respawns: respawns.clone(),
                respawn_ok: true,
                gate: None,
                respond,
            },
            served,
            respawns,
        )
    }

    fn quick_config() -> QueueConfig {
        QueueConfig {
            max_respawn_attempts: 2,
            respawn_backoff: Duration::from_millis(1),
        }
    }

    const START: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

    #[tokio::test]
    async fn serves_fifo_in_submission_order() {
        let (backend, served, _) =
            scripted(|req| Ok(line_for(&req.fen, 20, match req.budget {
                Budget::Depth(d) => d,
                Budget::Time(_) => 0,
            })));
        let queue = EngineQueue::spawn(Box::new(backend), quick_config());

        let a = queue.submit(EngineRequest::new(START.into(), Budget::Depth(8), 1));
        let b = queue.submit(EngineRequest::new(START.into(), Budget::Depth(12), 1));
        let ra = a.await.unwrap();
        let rb = b.await.unwrap();

        // Replies carry the depth each request asked for, in order.
        assert_eq!(ra[0].depth_reached, 8);
        assert_eq!(rb[0].depth_reached, 12);
        assert_eq!(served.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn fatal_error_triggers_respawn_without_retrying_request() {
        let mut first = true;
        let (backend, served, respawns) = scripted(move |req| {
            if std::mem::take(&mut first) {
                Err(EngineError::BrokenPipe)
            } else {
                Ok(line_for(&req.fen, 0, 10))
            }
        });
        let queue = EngineQueue::spawn(Box::new(backend), quick_config());

        let failed = queue
            .analyse(EngineRequest::new(START.into(), Budget::Depth(10), 1))
            .await;
        assert!(matches!(failed, Err(EngineError::BrokenPipe)));

        // The next request is served by the respawned engine.
        let ok = queue
            .analyse(EngineRequest::new(START.into(), Budget::Depth(10), 1))
            .await;
        assert!(ok.is_ok());
        assert_eq!(respawns.load(Ordering::Relaxed), 1);
        assert_eq!(served.lock().unwrap().len(), 2);
        assert!(queue.health().alive);
        assert_eq!(queue.health().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhausted_respawns_mark_engine_unavailable() {
        let (mut backend, _, _) = scripted(|_| Err(EngineError::Crashed));
        backend.respawn_ok = false;
        let queue = EngineQueue::spawn(Box::new(backend), quick_config());

        let first = queue
            .analyse(EngineRequest::new(START.into(), Budget::Depth(10), 1))
            .await;
        assert!(matches!(first, Err(EngineError::Crashed)));

        let second = queue
            .analyse(EngineRequest::new(START.into(), Budget::Depth(10), 1))
            .await;
        assert!(matches!(second, Err(EngineError::EngineUnavailable)));
        assert!(!queue.health().alive);
        assert!(!queue.metrics().engine_alive);
    }

    #[tokio::test]
    async fn ticket_dropped_before_dispatch_is_skipped() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let (mut backend, served, _) = scripted(|req| Ok(line_for(&req.fen, 0, 6)));
        backend.gate = Some(gate.clone());
        let queue = EngineQueue::spawn(Box::new(backend), quick_config());

        // First request occupies the worker at the gate.
        let first = queue.submit(EngineRequest::new(START.into(), Budget::Depth(6), 1));
        // Second is cancelled while still queued.
        let second = queue.submit(EngineRequest::new(
            "7k/5Q2/5K2/8/8/8/8/8 b - - 0 1".into(),
            Budget::Depth(6),
            1,
        ));
        drop(second);
        let third = queue.submit(EngineRequest::new(START.into(), Budget::Depth(6), 1));

        gate.add_permits(2);
        first.await.unwrap();
        third.await.unwrap();

        let fens = served.lock().unwrap().clone();
        assert_eq!(fens.len(), 2);
        assert!(fens.iter().all(|f| f == START));
    }

    #[tokio::test]
    async fn metrics_account_for_failures() {
        let mut n = 0u32;
        let (backend, _, _) = scripted(move |req| {
            n += 1;
            if n % 2 == 0 {
                Err(EngineError::NoLine)
            } else {
                Ok(line_for(&req.fen, 0, 4))
            }
        });
        let queue = EngineQueue::spawn(Box::new(backend), quick_config());

        for _ in 0..4 {
            let _ = queue
                .analyse(EngineRequest::new(START.into(), Budget::Depth(4), 1))
                .await;
        }

        let m = queue.metrics();
        assert_eq!(m.total_requests, 4);
        assert_eq!(m.failed_requests, 2);
        assert!((m.success_rate - 0.5).abs() < f32::EPSILON);
        assert_eq!(m.queue_depth, 0);
        // NoLine is not fatal, so the engine stays alive.
        assert!(m.engine_alive);
        assert!(m.engine_last_seen_at.is_some());
    }
}
