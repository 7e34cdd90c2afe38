//! Per-device worker
//!
//! Each worker owns one connection and one priority queue and runs as its
//! own task. Requests are enqueued synchronously through the shared
//! queue (so capacity rejection never blocks a submitter) and the worker
//! is woken through a notifier. While a request is in flight the worker
//! keeps listening: a higher-priority enqueue preempts an interruptible
//! request by closing the socket, which abandons the pending reply.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{AcqSrvError, ErrorKind, Result};
use crate::point::{
    Point, QueuedRequest, ReadResult, Request, RequestKind, RequestPriority, WriteResult,
};
use crate::protocols::modbus::connection::{ExecResponse, ModbusConnection};
use crate::utils::now_ms;

use super::queue::PriorityQueue;

/// Lower bound of the adaptive poll interval.
pub const MIN_POLL_INTERVAL_MS: u64 = 1000;
/// Upper bound of the adaptive poll interval.
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;
/// Default base poll interval.
pub const DEFAULT_BASE_POLL_MS: u64 = 2000;
/// Default keep-alive heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
/// Reconnection attempts before the backoff plateaus at one minute.
pub const MAX_RECONNECTION_ATTEMPTS: u32 = 3;

const HEALTH_ALPHA: f64 = 0.2;
const COOLDOWN_HEALTH_THRESHOLD: f64 = 0.3;
const BACKOFF_PLATEAU_MS: u64 = 60_000;

/// Worker lifecycle phase, readable across tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerPhase {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl WorkerPhase {
    pub fn from_u8(v: u8) -> WorkerPhase {
        match v {
            1 => WorkerPhase::Starting,
            2 => WorkerPhase::Running,
            3 => WorkerPhase::Stopping,
            _ => WorkerPhase::Idle,
        }
    }
}

/// Per-worker statistics. Mutated only by the worker task; snapshots are
/// taken under a short-lived lock so counters never tear.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub interrupted_requests: u64,
    pub high_priority_requests: u64,
    pub avg_response_ms: f64,
    pub last_activity_ms: i64,
    pub connected: bool,
}

impl WorkerStats {
    fn record(&mut self, success: bool, response_ms: f64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        // Running average over all completed requests.
        let n = self.total_requests as f64;
        self.avg_response_ms = (self.avg_response_ms * (n - 1.0) + response_ms) / n;
        self.last_activity_ms = now_ms();
    }
}

/// Control commands delivered over the worker's command channel.
#[derive(Debug)]
pub enum WorkerCommand {
    AddPoint(Point),
    RemovePoint(String),
    ClearPoints,
    SetPollingEnabled(bool),
    SetBasePoll(u64),
    ResetStats,
    Stop,
}

/// Events flowing upward from workers to the registry and service.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    ReadCompleted {
        device_key: String,
        request_id: u64,
        result: ReadResult,
    },
    WriteCompleted {
        device_key: String,
        request_id: u64,
        result: WriteResult,
    },
    ConnectionStateChanged {
        device_key: String,
        connected: bool,
    },
    Error {
        device_key: String,
        message: String,
        consecutive_failures: u32,
    },
    ClassifiedError {
        device_key: String,
        kind: ErrorKind,
        message: String,
    },
    RequestInterrupted {
        device_key: String,
        request_id: u64,
        reason: String,
    },
    StatsUpdated {
        device_key: String,
        stats: WorkerStats,
    },
    Started {
        device_key: String,
    },
    Stopped {
        device_key: String,
    },
}

/// Worker construction parameters.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub base_poll_ms: u64,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub queue_capacity: usize,
}

impl WorkerConfig {
    pub fn device_key(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.unit_id)
    }
}

/// Shared state handed to the registry when a worker is spawned.
///
/// Everything here is either atomic or behind a short mutex, so public
/// calls only enqueue or snapshot and never touch the socket.
pub struct WorkerShared {
    pub device_key: String,
    pub queue: Arc<Mutex<PriorityQueue>>,
    pub kick: Arc<Notify>,
    pub next_request_id: Arc<AtomicU64>,
    pub stats: Arc<Mutex<WorkerStats>>,
    pub connected: Arc<AtomicBool>,
    pub phase: Arc<AtomicU8>,
    pub base_poll_ms: Arc<AtomicU64>,
}

impl WorkerShared {
    /// Enqueue a request. O(log n) under a short lock; rejects with
    /// `QueueFull` synchronously instead of ever blocking the submitter.
    pub fn enqueue(
        &self,
        request: Request,
        priority: RequestPriority,
        interruptible: bool,
    ) -> Result<u64> {
        request.validate()?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedRequest {
            request,
            priority,
            request_id,
            enqueue_time_ms: now_ms(),
            interruptible,
        };
        self.queue.lock().enqueue(queued)?;
        self.kick.notify_one();
        Ok(request_id)
    }

    pub fn stats_snapshot(&self) -> WorkerStats {
        self.stats.lock().clone()
    }

    pub fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

/// One per-device worker. Constructed by the registry, consumed by
/// [`DeviceWorker::run`] on its own task.
pub struct DeviceWorker {
    config: WorkerConfig,
    device_key: String,

    connection: ModbusConnection,
    queue: Arc<Mutex<PriorityQueue>>,
    kick: Arc<Notify>,

    cmd_rx: mpsc::Receiver<WorkerCommand>,
    event_tx: mpsc::Sender<WorkerEvent>,

    stats: Arc<Mutex<WorkerStats>>,
    connected_flag: Arc<AtomicBool>,
    phase: Arc<AtomicU8>,
    next_request_id: Arc<AtomicU64>,
    base_poll_ms: Arc<AtomicU64>,

    admission: Arc<Semaphore>,

    // Adaptive polling and connection health
    adaptive_poll_ms: u64,
    consecutive_successes: u32,
    consecutive_failures: u32,
    health: f64,
    connection_attempts: u32,
    last_connection_attempt_ms: i64,

    // Owned points and poll bookkeeping
    points: Vec<Point>,
    last_poll: HashMap<String, i64>,
    polling_enabled: bool,
    last_request_sent_ms: i64,

    reported_connected: bool,
    stop_requested: bool,
}

impl DeviceWorker {
    /// Build a worker plus the shared handles the registry keeps.
    pub fn new(
        config: WorkerConfig,
        cmd_rx: mpsc::Receiver<WorkerCommand>,
        event_tx: mpsc::Sender<WorkerEvent>,
        admission: Arc<Semaphore>,
    ) -> (Self, WorkerShared) {
        let device_key = config.device_key();
        let queue = Arc::new(Mutex::new(PriorityQueue::new(config.queue_capacity)));
        let kick = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let connected = Arc::new(AtomicBool::new(false));
        let phase = Arc::new(AtomicU8::new(WorkerPhase::Idle as u8));
        let next_request_id = Arc::new(AtomicU64::new(1));
        let base_poll_ms = Arc::new(AtomicU64::new(config.base_poll_ms));

        let shared = WorkerShared {
            device_key: device_key.clone(),
            queue: Arc::clone(&queue),
            kick: Arc::clone(&kick),
            next_request_id: Arc::clone(&next_request_id),
            stats: Arc::clone(&stats),
            connected: Arc::clone(&connected),
            phase: Arc::clone(&phase),
            base_poll_ms: Arc::clone(&base_poll_ms),
        };

        let adaptive_poll_ms = config
            .base_poll_ms
            .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS);

        let worker = DeviceWorker {
            connection: ModbusConnection::new(config.host.clone(), config.port),
            device_key,
            queue,
            kick,
            cmd_rx,
            event_tx,
            stats,
            connected_flag: connected,
            phase,
            next_request_id,
            base_poll_ms,
            admission,
            adaptive_poll_ms,
            consecutive_successes: 0,
            consecutive_failures: 0,
            health: 1.0,
            connection_attempts: 0,
            last_connection_attempt_ms: 0,
            points: Vec::new(),
            last_poll: HashMap::new(),
            polling_enabled: true,
            last_request_sent_ms: 0,
            reported_connected: false,
            stop_requested: false,
            config,
        };

        (worker, shared)
    }

    pub fn adaptive_poll_ms(&self) -> u64 {
        self.adaptive_poll_ms
    }

    pub fn health_score(&self) -> f64 {
        self.health
    }

    /// Worker main loop: connect, then serve the queue and timers until
    /// stopped.
    pub async fn run(mut self) {
        self.set_phase(WorkerPhase::Starting);
        info!("Worker {} starting", self.device_key);
        self.emit(WorkerEvent::Started {
            device_key: self.device_key.clone(),
        })
        .await;

        if let Err(e) = self.attempt_connect().await {
            // The first poll tick retries; the worker still comes up.
            warn!("Worker {} initial connect failed: {}", self.device_key, e);
        }

        self.set_phase(WorkerPhase::Running);
        let mut next_poll = Instant::now() + Duration::from_millis(self.adaptive_poll_ms);

        while !self.stop_requested {
            let head = self.queue.lock().dequeue();
            if let Some(queued) = head {
                self.execute_queued(queued).await;
                continue;
            }

            tokio::select! {
                biased;
                maybe_cmd = self.cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = self.kick.notified() => {},
                _ = tokio::time::sleep_until(next_poll) => {
                    self.on_poll_tick();
                    next_poll = Instant::now() + Duration::from_millis(self.adaptive_poll_ms);
                },
            }
        }

        self.shutdown().await;
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    async fn emit(&self, event: WorkerEvent) {
        // Completions carry samples and may apply bounded backpressure;
        // everything else is best-effort.
        let completion = matches!(
            &event,
            WorkerEvent::ReadCompleted { .. } | WorkerEvent::WriteCompleted { .. }
        );
        if completion {
            if self
                .event_tx
                .send_timeout(event, Duration::from_secs(1))
                .await
                .is_err()
            {
                warn!(
                    "Worker {}: event channel saturated, completion dropped",
                    self.device_key
                );
            }
        } else {
            let _ = self.event_tx.try_send(event);
        }
    }

    fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::AddPoint(point) => {
                self.points.retain(|p| p.name != point.name);
                self.last_poll.remove(&point.name);
                self.points.push(point);
            },
            WorkerCommand::RemovePoint(name) => {
                self.points.retain(|p| p.name != name);
                self.last_poll.remove(&name);
            },
            WorkerCommand::ClearPoints => {
                self.points.clear();
                self.last_poll.clear();
            },
            WorkerCommand::SetPollingEnabled(enabled) => {
                self.polling_enabled = enabled;
            },
            WorkerCommand::SetBasePoll(interval_ms) => {
                self.base_poll_ms.store(interval_ms, Ordering::Relaxed);
                self.adaptive_poll_ms = interval_ms.min(MAX_POLL_INTERVAL_MS);
                debug!(
                    "Worker {}: base poll set to {} ms",
                    self.device_key, interval_ms
                );
            },
            WorkerCommand::ResetStats => {
                *self.stats.lock() = WorkerStats {
                    connected: self.reported_connected,
                    ..WorkerStats::default()
                };
            },
            WorkerCommand::Stop => {
                self.stop_requested = true;
            },
        }
    }

    /// Poll tick: enqueue reads for due points and, when traffic has been
    /// quiet long enough, a keep-alive heartbeat.
    fn on_poll_tick(&mut self) {
        let now = now_ms();

        if self.polling_enabled {
            let due: Vec<Point> = self
                .points
                .iter()
                .filter(|p| {
                    p.enabled
                        && now - self.last_poll.get(&p.name).copied().unwrap_or(0)
                            >= p.poll_interval_ms as i64
                })
                .cloned()
                .collect();

            for point in due {
                self.last_poll.insert(point.name.clone(), now);
                let request = Request::read_for_point(&point);
                self.enqueue_internal(request, RequestPriority::Normal, true);
            }
        }

        if self.config.heartbeat_enabled
            && now - self.last_request_sent_ms >= self.config.heartbeat_interval_ms as i64
        {
            self.send_heartbeat();
        }
    }

    /// Keep-alive: a minimal holding-register read at Low priority.
    fn send_heartbeat(&mut self) {
        let request = Request {
            kind: RequestKind::ReadHolding,
            start_address: 1,
            count: 1,
            unit_id: self.config.unit_id,
            data_type: crate::point::DataType::Reg16,
        };
        debug!("Worker {}: heartbeat", self.device_key);
        self.enqueue_internal(request, RequestPriority::Low, true);
    }

    fn enqueue_internal(
        &mut self,
        request: Request,
        priority: RequestPriority,
        interruptible: bool,
    ) {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let queued = QueuedRequest {
            request,
            priority,
            request_id,
            enqueue_time_ms: now_ms(),
            interruptible,
        };
        if let Err(e) = self.queue.lock().enqueue(queued) {
            let _ = self.event_tx.try_send(WorkerEvent::ClassifiedError {
                device_key: self.device_key.clone(),
                kind: ErrorKind::ResourceExhaustion,
                message: e.to_string(),
            });
        }
    }

    /// Execute one queued request, staying responsive to preemption.
    async fn execute_queued(&mut self, queued: QueuedRequest) {
        if !self.connection.is_connected() {
            if !self.should_attempt_reconnection() {
                // Cooldown: fail fast without touching the health score.
                self.complete_failure(&queued, AcqSrvError::NotConnected, 0.0, false)
                    .await;
                return;
            }
            if let Err(e) = self.attempt_connect().await {
                self.complete_failure(&queued, e, 0.0, false).await;
                return;
            }
        }

        if queued.priority >= RequestPriority::High {
            self.stats.lock().high_priority_requests += 1;
        }
        self.last_request_sent_ms = now_ms();

        let started = Instant::now();
        let mut deferred: Vec<WorkerCommand> = Vec::new();

        enum Outcome {
            Completed(Result<ExecResponse>),
            Preempted,
            StopRequested,
        }

        let outcome = {
            let fut = self
                .connection
                .execute(&queued.request, self.config.request_timeout);
            tokio::pin!(fut);

            loop {
                tokio::select! {
                    biased;
                    maybe_cmd = self.cmd_rx.recv() => {
                        match maybe_cmd {
                            Some(WorkerCommand::Stop) | None => break Outcome::StopRequested,
                            Some(cmd) => deferred.push(cmd),
                        }
                    },
                    _ = self.kick.notified() => {
                        if queued.interruptible
                            && self.queue.lock().has_higher_than(queued.priority)
                        {
                            break Outcome::Preempted;
                        }
                    },
                    result = &mut fut => break Outcome::Completed(result),
                }
            }
        };

        for cmd in deferred {
            self.handle_command(cmd);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Outcome::Completed(result) => {
                self.complete_request(&queued, result, elapsed_ms).await;
            },
            Outcome::Preempted => {
                // Close the socket so the abandoned reply can never
                // correlate with a later transaction.
                self.connection.force_close();
                self.sync_connection_state().await;
                self.stats.lock().interrupted_requests += 1;
                info!(
                    "Worker {}: request {} preempted by higher priority",
                    self.device_key, queued.request_id
                );
                self.emit(WorkerEvent::RequestInterrupted {
                    device_key: self.device_key.clone(),
                    request_id: queued.request_id,
                    reason: "preempted".to_string(),
                })
                .await;
                self.emit_stats().await;
            },
            Outcome::StopRequested => {
                self.stop_requested = true;
                self.connection.force_close();
                self.stats.lock().interrupted_requests += 1;
                self.emit(WorkerEvent::RequestInterrupted {
                    device_key: self.device_key.clone(),
                    request_id: queued.request_id,
                    reason: "shutdown".to_string(),
                })
                .await;
            },
        }
    }

    async fn complete_request(
        &mut self,
        queued: &QueuedRequest,
        result: Result<ExecResponse>,
        elapsed_ms: f64,
    ) {
        match result {
            Ok(ExecResponse::Read(read)) => {
                self.stats.lock().record(true, elapsed_ms);
                self.on_request_success();
                self.sync_connection_state().await;
                self.emit(WorkerEvent::ReadCompleted {
                    device_key: self.device_key.clone(),
                    request_id: queued.request_id,
                    result: read,
                })
                .await;
                self.emit_stats().await;
            },
            Ok(ExecResponse::Write(write)) => {
                self.stats.lock().record(true, elapsed_ms);
                self.on_request_success();
                self.sync_connection_state().await;
                self.emit(WorkerEvent::WriteCompleted {
                    device_key: self.device_key.clone(),
                    request_id: queued.request_id,
                    result: write,
                })
                .await;
                self.emit_stats().await;
            },
            Err(error) => {
                // Exception responses are request-local: the device
                // answered, so neither health nor the adaptive interval
                // reacts and the connection stays up.
                let decay = !matches!(error, AcqSrvError::ModbusException(_));
                self.complete_failure(queued, error, elapsed_ms, decay).await;
            },
        }
    }

    async fn complete_failure(
        &mut self,
        queued: &QueuedRequest,
        error: AcqSrvError,
        elapsed_ms: f64,
        decay: bool,
    ) {
        self.stats.lock().record(false, elapsed_ms);
        if decay {
            self.on_request_failure();
        }
        self.sync_connection_state().await;
        self.emit_classified_error(&error).await;

        let timestamp = now_ms();
        match &queued.request.kind {
            RequestKind::WriteHolding(_) | RequestKind::WriteCoils(_) => {
                self.emit(WorkerEvent::WriteCompleted {
                    device_key: self.device_key.clone(),
                    request_id: queued.request_id,
                    result: WriteResult {
                        success: false,
                        start_address: queued.request.start_address,
                        count: queued.request.count,
                        error: Some(error.to_string()),
                        timestamp_ms: timestamp,
                    },
                })
                .await;
            },
            _ => {
                self.emit(WorkerEvent::ReadCompleted {
                    device_key: self.device_key.clone(),
                    request_id: queued.request_id,
                    result: ReadResult::failed(&queued.request, error.to_string(), timestamp),
                })
                .await;
            },
        }
        self.emit_stats().await;
    }

    async fn emit_classified_error(&self, error: &AcqSrvError) {
        self.emit(WorkerEvent::Error {
            device_key: self.device_key.clone(),
            message: error.to_string(),
            consecutive_failures: self.consecutive_failures,
        })
        .await;
        self.emit(WorkerEvent::ClassifiedError {
            device_key: self.device_key.clone(),
            kind: error.classify(),
            message: error.to_string(),
        })
        .await;
    }

    async fn emit_stats(&self) {
        let stats = self.stats.lock().clone();
        self.emit(WorkerEvent::StatsUpdated {
            device_key: self.device_key.clone(),
            stats,
        })
        .await;
    }

    /// Success bookkeeping: grow health, shrink the adaptive interval
    /// after three consecutive successes.
    fn on_request_success(&mut self) {
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
        self.connection_attempts = 0;
        self.health = (1.0 - HEALTH_ALPHA) * self.health + HEALTH_ALPHA;
        self.health = self.health.min(1.0);

        if self.consecutive_successes >= 3 {
            self.adaptive_poll_ms = ((self.adaptive_poll_ms as f64 * 0.9) as u64)
                .max(MIN_POLL_INTERVAL_MS);
        }
    }

    /// Failure bookkeeping: decay health, stretch the adaptive interval.
    fn on_request_failure(&mut self) {
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
        self.health = ((1.0 - HEALTH_ALPHA) * self.health).max(0.0);
        self.adaptive_poll_ms = ((self.adaptive_poll_ms as f64 * 1.5) as u64)
            .min(MAX_POLL_INTERVAL_MS);
    }

    /// Whether a reconnect may be attempted now. A healthy link retries
    /// immediately; a worker in cooldown waits out the backoff.
    fn should_attempt_reconnection(&self) -> bool {
        if self.health >= COOLDOWN_HEALTH_THRESHOLD {
            return true;
        }
        let elapsed = now_ms() - self.last_connection_attempt_ms;
        elapsed >= self.reconnection_delay_ms() as i64
    }

    /// Exponential backoff: `min(60s, 1s * 2^attempts)` with +/-25%
    /// jitter, plateauing at 60s once the attempt cap is reached.
    fn reconnection_delay_ms(&self) -> u64 {
        let base = if self.connection_attempts >= MAX_RECONNECTION_ATTEMPTS {
            BACKOFF_PLATEAU_MS
        } else {
            (1000u64 << self.connection_attempts).min(BACKOFF_PLATEAU_MS)
        };
        let jitter_range = base as f64 * 0.25;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        ((base as f64 + jitter).max(0.0)) as u64
    }

    /// Connect under the global admission semaphore.
    async fn attempt_connect(&mut self) -> Result<()> {
        self.last_connection_attempt_ms = now_ms();

        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AcqSrvError::ResourceExhausted("admission semaphore closed".into()))?;

        let result = self.connection.connect(self.config.connect_timeout).await;
        drop(permit);

        match result {
            Ok(()) => {
                self.connection_attempts = 0;
                self.sync_connection_state().await;
                Ok(())
            },
            Err(e) => {
                self.connection_attempts += 1;
                self.consecutive_failures += 1;
                self.consecutive_successes = 0;
                self.health = ((1.0 - HEALTH_ALPHA) * self.health).max(0.0);
                self.sync_connection_state().await;
                self.emit_classified_error(&e).await;
                Err(e)
            },
        }
    }

    /// Publish the observable connection state when it flips.
    async fn sync_connection_state(&mut self) {
        let connected = self.connection.is_connected();
        self.connected_flag.store(connected, Ordering::Relaxed);
        self.stats.lock().connected = connected;
        if connected != self.reported_connected {
            self.reported_connected = connected;
            self.emit(WorkerEvent::ConnectionStateChanged {
                device_key: self.device_key.clone(),
                connected,
            })
            .await;
        }
    }

    async fn shutdown(&mut self) {
        self.set_phase(WorkerPhase::Stopping);
        info!("Worker {} stopping", self.device_key);

        let drained = self.queue.lock().clear("shutdown");
        if !drained.is_empty() {
            self.stats.lock().interrupted_requests += drained.len() as u64;
        }
        for interrupted in drained {
            self.emit(WorkerEvent::RequestInterrupted {
                device_key: self.device_key.clone(),
                request_id: interrupted.request_id,
                reason: interrupted.reason,
            })
            .await;
        }

        self.connection.force_close();
        self.sync_connection_state().await;
        self.emit(WorkerEvent::Stopped {
            device_key: self.device_key.clone(),
        })
        .await;
        self.set_phase(WorkerPhase::Idle);
    }
}
