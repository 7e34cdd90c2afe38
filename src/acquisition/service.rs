//! Acquisition service
//!
//! Owns the configured point set and the worker registry. On start the
//! point set is rewritten by the block planner and distributed to
//! per-device workers; completed reads flow back through the response
//! router and out to the telemetry sink. Public calls never touch a
//! socket; they enqueue, snapshot or reconfigure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{AcqSrvError, ErrorKind, Result};
use crate::point::{
    DataType, Point, ReadResult, RegisterCategory, Request, RequestKind, RequestPriority, Sample,
    Value,
};
use crate::protocols::modbus::codec::ModbusCodec;
use crate::sink::{SampleSink, TelegrafSink};
use crate::utils::now_ms;

use super::planner::plan_blocks;
use super::registry::{GlobalStats, WorkerRegistry};
use super::router::route_read_result;
use super::worker::{WorkerCommand, WorkerEvent};

/// Coarse fallback tick driving points that no worker owns yet.
const COARSE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Capacity of the worker event channel.
const WORKER_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Service-level statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStats {
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub samples_sent: u64,
    pub sink_errors: u64,
    pub avg_response_ms: f64,
    pub service_start_ms: i64,
}

/// Events published to service subscribers.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    SampleAcquired(Sample),
    SampleSent { point_name: String, ok: bool },
    ServiceStarted,
    ServiceStopped,
    Error(String),
    ClassifiedError {
        device_key: String,
        kind: ErrorKind,
        message: String,
    },
    ConnectionStateChanged {
        device_key: String,
        connected: bool,
    },
    RequestInterrupted {
        device_key: String,
        request_id: u64,
        reason: String,
    },
    WriteCompleted {
        request_id: u64,
        ok: bool,
        error: Option<String>,
    },
    StatisticsUpdated(GlobalStats),
}

/// The acquisition service facade.
pub struct AcquisitionService {
    config: AppConfig,
    points: Mutex<HashMap<String, Point>>,
    planned: Arc<Mutex<Vec<Point>>>,
    registry: Arc<WorkerRegistry>,
    sink: Arc<dyn SampleSink>,
    event_tx: broadcast::Sender<ServiceEvent>,
    worker_event_rx: Mutex<Option<mpsc::Receiver<WorkerEvent>>>,
    stats: Arc<Mutex<ServiceStats>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AcquisitionService {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let (worker_event_tx, worker_event_rx) = mpsc::channel(WORKER_EVENT_CHANNEL_CAPACITY);
        let registry = WorkerRegistry::new(config.registry_config(), worker_event_tx);
        let sink: Arc<dyn SampleSink> =
            Arc::new(TelegrafSink::new(config.acquisition.telegraf_socket_path.clone()));
        let (event_tx, _) = broadcast::channel(512);

        let points: HashMap<String, Point> = config
            .points
            .iter()
            .cloned()
            .map(|p| (p.name.clone(), p))
            .collect();

        Arc::new(Self {
            config,
            points: Mutex::new(points),
            planned: Arc::new(Mutex::new(Vec::new())),
            registry,
            sink,
            event_tx,
            worker_event_rx: Mutex::new(Some(worker_event_rx)),
            stats: Arc::new(Mutex::new(ServiceStats::default())),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to service events. Lagging subscribers lose the oldest
    /// events rather than blocking acquisition.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.event_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ServiceStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        let start = self.stats.lock().service_start_ms;
        *self.stats.lock() = ServiceStats {
            service_start_ms: start,
            ..ServiceStats::default()
        };
    }

    /// Enable or disable automatic polling on every worker.
    pub async fn set_polling_enabled(&self, enabled: bool) {
        for device_key in self.registry.device_keys() {
            if let Some(slot) = self.registry.get(&device_key) {
                let _ = slot
                    .cmd_tx
                    .send(WorkerCommand::SetPollingEnabled(enabled))
                    .await;
            }
        }
    }

    /// Toggle periodic load balancing across workers.
    pub fn enable_load_balancing(&self, enabled: bool) {
        self.registry.set_load_balancing(enabled);
    }

    // ------------------------------------------------------------------
    // Point management
    // ------------------------------------------------------------------

    pub fn list_points(&self) -> Vec<Point> {
        self.points.lock().values().cloned().collect()
    }

    pub async fn add_point(&self, point: Point) -> Result<()> {
        point.validate()?;
        let replaced = self
            .points
            .lock()
            .insert(point.name.clone(), point.clone())
            .is_some();
        if replaced {
            debug!("Point '{}' replaced", point.name);
        }

        if self.is_running() && point.enabled {
            self.assign_point(point).await?;
        }
        Ok(())
    }

    pub async fn remove_point(&self, name: &str) -> Result<()> {
        let point = self
            .points
            .lock()
            .remove(name)
            .ok_or_else(|| AcqSrvError::PointNotFound(name.to_string()))?;

        if self.is_running() {
            // Plain planned entries are withdrawn from their worker;
            // block membership is recomputed on the next start.
            let was_plain = {
                let mut planned = self.planned.lock();
                let before = planned.len();
                planned.retain(|p| p.name != name);
                planned.len() != before
            };
            if was_plain {
                if let Some(slot) = self.registry.get(&point.device_key()) {
                    let _ = slot
                        .cmd_tx
                        .send(WorkerCommand::RemovePoint(name.to_string()))
                        .await;
                }
            } else {
                warn!(
                    "Point '{}' is covered by a block; replanning takes effect on restart",
                    name
                );
            }
        }
        Ok(())
    }

    pub async fn update_point(&self, name: &str, point: Point) -> Result<()> {
        if !self.points.lock().contains_key(name) {
            return Err(AcqSrvError::PointNotFound(name.to_string()));
        }
        self.remove_point(name).await?;
        self.add_point(point).await
    }

    pub async fn clear_points(&self) -> Result<()> {
        self.points.lock().clear();
        self.planned.lock().clear();
        if self.is_running() {
            for device_key in self.registry.device_keys() {
                if let Some(slot) = self.registry.get(&device_key) {
                    let _ = slot.cmd_tx.send(WorkerCommand::ClearPoints).await;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Plan the point set, distribute it to workers and start the
    /// registry ticks. Fails when no points are configured.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Err(AcqSrvError::StateError("service already running".into()));
        }

        let enabled: Vec<Point> = self
            .points
            .lock()
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        if enabled.is_empty() {
            return Err(AcqSrvError::ConfigError(
                "no data points configured".into(),
            ));
        }

        let planned = plan_blocks(&enabled);
        info!(
            "Starting acquisition: {} points planned into {} entries",
            enabled.len(),
            planned.len()
        );
        *self.planned.lock() = planned.clone();
        self.stats.lock().service_start_ms = now_ms();
        self.running.store(true, Ordering::Relaxed);

        for point in planned {
            self.assign_planned(point).await;
        }

        self.registry.start();

        let mut tasks = self.tasks.lock();

        // Worker event pump.
        let service = Arc::clone(self);
        let mut event_rx = self
            .worker_event_rx
            .lock()
            .take()
            .ok_or_else(|| AcqSrvError::internal("worker event receiver already taken"))?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                service.handle_worker_event(event).await;
            }
        }));

        // Registry statistics forwarding.
        let service = Arc::clone(self);
        let mut stats_rx = self.registry.subscribe_stats();
        tasks.push(tokio::spawn(async move {
            loop {
                match stats_rx.recv().await {
                    Ok(global) => {
                        service.stats.lock().avg_response_ms = global.global_avg_response_ms;
                        service.publish(ServiceEvent::StatisticsUpdated(global));
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        // Coarse fallback tick: adopt points whose device has no worker
        // yet (added while the planner output was already distributed).
        let service = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(COARSE_POLL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                service.adopt_orphan_points().await;
            }
        }));
        drop(tasks);

        self.publish(ServiceEvent::ServiceStarted);
        Ok(())
    }

    pub async fn stop(&self) {
        if !self.is_running() {
            return;
        }
        info!("Stopping acquisition service");
        self.running.store(false, Ordering::Relaxed);

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.stop().await;
        self.planned.lock().clear();
        self.publish(ServiceEvent::ServiceStopped);
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Submit a write. Validation is synchronous; the returned id
    /// correlates with the eventual `WriteCompleted` event.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_write(
        &self,
        host: &str,
        port: u16,
        unit_id: u8,
        address: u16,
        data_type: DataType,
        value: Value,
        priority: RequestPriority,
        interruptible: bool,
    ) -> Result<u64> {
        let registers = ModbusCodec::encode_value(&value, data_type)?;
        let kind = match data_type.register_category() {
            RegisterCategory::Holding => RequestKind::WriteHolding(registers),
            RegisterCategory::Coil => {
                RequestKind::WriteCoils(registers.iter().map(|&r| r != 0).collect())
            },
            RegisterCategory::Input | RegisterCategory::Discrete => {
                return Err(AcqSrvError::InvalidParameter(format!(
                    "data type {} is read-only",
                    data_type.as_str()
                )));
            },
        };
        let count = match &kind {
            RequestKind::WriteHolding(values) => values.len() as u16,
            RequestKind::WriteCoils(values) => values.len() as u16,
            _ => unreachable!(),
        };

        let request = Request {
            kind,
            start_address: address,
            count,
            unit_id,
            data_type,
        };
        request.validate()?;

        let slot = self.registry.get_or_create(host, port, unit_id);
        slot.shared.enqueue(request, priority, interruptible)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn publish(&self, event: ServiceEvent) {
        let _ = self.event_tx.send(event);
    }

    async fn assign_planned(&self, point: Point) {
        let slot = self
            .registry
            .get_or_create(&point.host, point.port, point.unit_id);
        if slot
            .cmd_tx
            .send(WorkerCommand::AddPoint(point.clone()))
            .await
            .is_err()
        {
            warn!("Worker {} rejected point '{}'", point.device_key(), point.name);
        }
    }

    async fn assign_point(&self, point: Point) -> Result<()> {
        {
            let mut planned = self.planned.lock();
            planned.retain(|p| p.name != point.name);
            planned.push(point.clone());
        }
        self.assign_planned(point).await;
        Ok(())
    }

    async fn adopt_orphan_points(&self) {
        let orphans: Vec<Point> = {
            let points = self.points.lock();
            points
                .values()
                .filter(|p| p.enabled && self.registry.get(&p.device_key()).is_none())
                .cloned()
                .collect()
        };
        for point in orphans {
            debug!("Adopting orphan point '{}'", point.name);
            let _ = self.assign_point(point).await;
        }
    }

    /// Find the planned entry a read result belongs to.
    fn match_planned(&self, device_key: &str, result: &ReadResult) -> Option<Point> {
        self.planned
            .lock()
            .iter()
            .find(|p| {
                p.device_key() == device_key
                    && p.block_start().unwrap_or(p.address) == result.start_address
                    && p.width() == result.count
            })
            .cloned()
    }

    async fn handle_worker_event(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::ReadCompleted {
                device_key, result, ..
            } => {
                {
                    let mut stats = self.stats.lock();
                    stats.total_reads += 1;
                    if result.success {
                        stats.successful_reads += 1;
                    } else {
                        stats.failed_reads += 1;
                    }
                }

                if !result.success {
                    if let Some(error) = &result.error {
                        self.publish(ServiceEvent::Error(format!(
                            "{device_key}: read [{}..+{}) failed: {error}",
                            result.start_address, result.count
                        )));
                    }
                    return;
                }

                let Some(point) = self.match_planned(&device_key, &result) else {
                    // Heartbeats and ad-hoc reads carry no point mapping.
                    debug!(
                        "Unmatched read result from {} at {} (+{})",
                        device_key, result.start_address, result.count
                    );
                    return;
                };

                match route_read_result(&result, &point) {
                    Ok(samples) => {
                        for sample in samples {
                            self.dispatch_sample(sample).await;
                        }
                    },
                    Err(e) => {
                        self.publish(ServiceEvent::Error(format!(
                            "{device_key}: failed to route block '{}': {e}",
                            point.name
                        )));
                    },
                }
            },
            WorkerEvent::WriteCompleted {
                request_id, result, ..
            } => {
                self.publish(ServiceEvent::WriteCompleted {
                    request_id,
                    ok: result.success,
                    error: result.error,
                });
            },
            WorkerEvent::ConnectionStateChanged {
                device_key,
                connected,
            } => {
                self.publish(ServiceEvent::ConnectionStateChanged {
                    device_key,
                    connected,
                });
            },
            WorkerEvent::Error {
                device_key,
                message,
                consecutive_failures,
            } => {
                self.publish(ServiceEvent::Error(format!(
                    "{device_key}: {message} (consecutive failures: {consecutive_failures})"
                )));
            },
            WorkerEvent::ClassifiedError {
                device_key,
                kind,
                message,
            } => {
                self.publish(ServiceEvent::ClassifiedError {
                    device_key,
                    kind,
                    message,
                });
            },
            WorkerEvent::RequestInterrupted {
                device_key,
                request_id,
                reason,
            } => {
                self.publish(ServiceEvent::RequestInterrupted {
                    device_key,
                    request_id,
                    reason,
                });
            },
            WorkerEvent::StatsUpdated { .. } => {
                // Per-worker snapshots are aggregated by the registry tick.
            },
            WorkerEvent::Started { device_key } => {
                debug!("Worker {} started", device_key);
            },
            WorkerEvent::Stopped { device_key } => {
                debug!("Worker {} stopped", device_key);
            },
        }
    }

    async fn dispatch_sample(&self, sample: Sample) {
        self.publish(ServiceEvent::SampleAcquired(sample.clone()));
        if !sample.valid {
            return;
        }

        match self.sink.send_sample(&sample).await {
            Ok(()) => {
                self.stats.lock().samples_sent += 1;
                self.publish(ServiceEvent::SampleSent {
                    point_name: sample.point_name,
                    ok: true,
                });
            },
            Err(e) => {
                self.stats.lock().sink_errors += 1;
                self.publish(ServiceEvent::SampleSent {
                    point_name: sample.point_name.clone(),
                    ok: false,
                });
                self.publish(ServiceEvent::Error(format!(
                    "sink send for '{}' failed: {e}",
                    sample.point_name
                )));
            },
        }
    }
}
