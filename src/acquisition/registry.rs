//! Worker registry
//!
//! Creates and owns one worker per device key. New workers start
//! staggered and connect under a shared admission semaphore so a large
//! fleet does not stampede the network. Periodic ticks aggregate
//! per-worker statistics and, when enabled, rebalance poll intervals by
//! observed load.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AcqSrvError, Result};
use crate::utils::now_ms;

use super::worker::{
    DeviceWorker, WorkerCommand, WorkerConfig, WorkerEvent, WorkerPhase, WorkerShared,
};

/// Default cap on simultaneous connection attempts.
pub const DEFAULT_MAX_CONCURRENT_CONNECTIONS: usize = 16;
/// Default statistics aggregation period.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);
/// Default load-balancing period.
pub const DEFAULT_LOAD_BALANCE_INTERVAL: Duration = Duration::from_secs(10);
/// Bound on waiting for a stopping worker before abandoning it.
pub const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

const LOAD_HIGH_WATER: f64 = 0.8;
const LOAD_LOW_WATER: f64 = 0.3;
const POLL_SLOWDOWN_FACTOR: f64 = 1.3;
const POLL_SPEEDUP_FACTOR: f64 = 0.8;
const MIN_BALANCED_POLL_MS: u64 = 500;

/// Fleet-wide statistics summed from worker snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub active_workers: usize,
    pub connected_devices: usize,
    pub total_requests: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub total_interrupted: u64,
    pub global_avg_response_ms: f64,
    pub last_update_ms: i64,
}

/// Template applied to every worker the registry creates.
#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    pub base_poll_ms: u64,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            base_poll_ms: super::worker::DEFAULT_BASE_POLL_MS,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            heartbeat_enabled: false,
            heartbeat_interval_ms: super::worker::DEFAULT_HEARTBEAT_INTERVAL_MS,
            queue_capacity: super::queue::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Registry construction parameters.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub worker: WorkerTemplate,
    pub max_concurrent_connections: usize,
    pub stats_interval: Duration,
    pub load_balance_interval: Duration,
    pub load_balancing_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            worker: WorkerTemplate::default(),
            max_concurrent_connections: DEFAULT_MAX_CONCURRENT_CONNECTIONS,
            stats_interval: DEFAULT_STATS_INTERVAL,
            load_balance_interval: DEFAULT_LOAD_BALANCE_INTERVAL,
            load_balancing_enabled: false,
        }
    }
}

/// One registered worker: shared state plus its command channel.
pub struct WorkerSlot {
    pub shared: WorkerShared,
    pub cmd_tx: mpsc::Sender<WorkerCommand>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSlot {
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }
}

/// Registry of device workers keyed by `"{host}:{port}:{unit_id}"`.
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<WorkerSlot>>,
    admission: Arc<Semaphore>,
    event_tx: mpsc::Sender<WorkerEvent>,
    config: RegistryConfig,
    load_balancing_enabled: AtomicBool,
    stats: Mutex<GlobalStats>,
    stats_tx: broadcast::Sender<GlobalStats>,
    prev_totals: Mutex<HashMap<String, u64>>,
    tick_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerRegistry {
    pub fn new(config: RegistryConfig, event_tx: mpsc::Sender<WorkerEvent>) -> Arc<Self> {
        let (stats_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            workers: DashMap::new(),
            admission: Arc::new(Semaphore::new(config.max_concurrent_connections)),
            event_tx,
            load_balancing_enabled: AtomicBool::new(config.load_balancing_enabled),
            config,
            stats: Mutex::new(GlobalStats::default()),
            stats_tx,
            prev_totals: Mutex::new(HashMap::new()),
            tick_handles: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to aggregated statistics updates. Slow subscribers lose
    /// the oldest updates.
    pub fn subscribe_stats(&self) -> broadcast::Receiver<GlobalStats> {
        self.stats_tx.subscribe()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn connected_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|entry| entry.value().is_connected())
            .count()
    }

    pub fn device_keys(&self) -> Vec<String> {
        self.workers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get(&self, device_key: &str) -> Option<Arc<WorkerSlot>> {
        self.workers.get(device_key).map(|e| Arc::clone(e.value()))
    }

    pub fn set_load_balancing(&self, enabled: bool) {
        self.load_balancing_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Reset per-worker counters and the aggregated view.
    pub async fn reset_all_stats(&self) {
        let slots: Vec<Arc<WorkerSlot>> = self
            .workers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in slots {
            let _ = slot.cmd_tx.send(WorkerCommand::ResetStats).await;
        }
        self.prev_totals.lock().clear();
        *self.stats.lock() = GlobalStats {
            last_update_ms: now_ms(),
            ..GlobalStats::default()
        };
    }

    /// Return the worker for a device, creating and starting it when
    /// absent. The n-th new worker's start is deferred by
    /// `max(200, 100 * existing)` ms to spread connection attempts.
    pub fn get_or_create(&self, host: &str, port: u16, unit_id: u8) -> Arc<WorkerSlot> {
        let device_key = format!("{host}:{port}:{unit_id}");
        if let Some(existing) = self.workers.get(&device_key) {
            return Arc::clone(existing.value());
        }

        let existing_count = self.workers.len();
        let entry = self.workers.entry(device_key.clone()).or_insert_with(|| {
            let worker_config = WorkerConfig {
                host: host.to_string(),
                port,
                unit_id,
                base_poll_ms: self.config.worker.base_poll_ms,
                connect_timeout: self.config.worker.connect_timeout,
                request_timeout: self.config.worker.request_timeout,
                heartbeat_enabled: self.config.worker.heartbeat_enabled,
                heartbeat_interval_ms: self.config.worker.heartbeat_interval_ms,
                queue_capacity: self.config.worker.queue_capacity,
            };

            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            let (worker, shared) = DeviceWorker::new(
                worker_config,
                cmd_rx,
                self.event_tx.clone(),
                Arc::clone(&self.admission),
            );

            let startup_delay =
                Duration::from_millis((100 * existing_count as u64).max(200));
            info!(
                "Creating worker {} (startup deferred {:?})",
                device_key, startup_delay
            );
            let join = tokio::spawn(async move {
                tokio::time::sleep(startup_delay).await;
                worker.run().await;
            });

            Arc::new(WorkerSlot {
                shared,
                cmd_tx,
                join: Mutex::new(Some(join)),
            })
        });
        Arc::clone(entry.value())
    }

    /// Start the periodic aggregation and load-balancing ticks.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.tick_handles.lock();
        if !handles.is_empty() {
            return;
        }

        let registry = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.config.stats_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let stats = registry.aggregate_stats();
                let _ = registry.stats_tx.send(stats);
            }
        }));

        let registry = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.config.load_balance_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                registry.balance_load().await;
            }
        }));
    }

    /// Sum worker snapshots into the fleet view.
    pub fn aggregate_stats(&self) -> GlobalStats {
        let mut aggregated = GlobalStats {
            last_update_ms: now_ms(),
            ..GlobalStats::default()
        };

        let mut weighted_response = 0.0;
        for entry in self.workers.iter() {
            let snapshot = entry.value().shared.stats_snapshot();
            aggregated.active_workers += 1;
            if snapshot.connected {
                aggregated.connected_devices += 1;
            }
            aggregated.total_requests += snapshot.total_requests;
            aggregated.total_successful += snapshot.successful_requests;
            aggregated.total_failed += snapshot.failed_requests;
            aggregated.total_interrupted += snapshot.interrupted_requests;
            weighted_response += snapshot.avg_response_ms * snapshot.total_requests as f64;
        }
        if aggregated.total_requests > 0 {
            aggregated.global_avg_response_ms =
                weighted_response / aggregated.total_requests as f64;
        }

        *self.stats.lock() = aggregated.clone();
        aggregated
    }

    pub fn global_stats(&self) -> GlobalStats {
        self.stats.lock().clone()
    }

    /// Observed load for one worker:
    /// `0.4 * request rate + 0.4 * avg response (s) + 0.2 * failure rate`.
    fn worker_load(&self, device_key: &str, interval: Duration) -> Option<f64> {
        let slot = self.get(device_key)?;
        let snapshot = slot.shared.stats_snapshot();

        let mut prev = self.prev_totals.lock();
        let last_total = prev.insert(device_key.to_string(), snapshot.total_requests);
        let delta = snapshot
            .total_requests
            .saturating_sub(last_total.unwrap_or(0));
        let rate = delta as f64 / interval.as_secs_f64();

        let failure_rate = if snapshot.total_requests > 0 {
            snapshot.failed_requests as f64 / snapshot.total_requests as f64
        } else {
            0.0
        };

        Some(0.4 * rate + 0.4 * (snapshot.avg_response_ms / 1000.0) + 0.2 * failure_rate)
    }

    /// Rebalance base poll intervals by load. Deferred while any worker
    /// is still starting so cold-start latencies do not skew the input.
    async fn balance_load(&self) {
        if !self.load_balancing_enabled.load(Ordering::Relaxed) {
            return;
        }
        if self
            .workers
            .iter()
            .any(|e| e.value().shared.phase() == WorkerPhase::Starting)
        {
            debug!("Load balancing deferred: workers still starting");
            return;
        }

        let keys = self.device_keys();
        for device_key in keys {
            let Some(load) = self.worker_load(&device_key, self.config.load_balance_interval)
            else {
                continue;
            };
            let Some(slot) = self.get(&device_key) else {
                continue;
            };

            let base = slot.shared.base_poll_ms.load(Ordering::Relaxed);
            let adjusted = if load > LOAD_HIGH_WATER {
                (base as f64 * POLL_SLOWDOWN_FACTOR) as u64
            } else if load < LOAD_LOW_WATER {
                ((base as f64 * POLL_SPEEDUP_FACTOR) as u64).max(MIN_BALANCED_POLL_MS)
            } else {
                continue;
            };

            if adjusted != base {
                debug!(
                    "Load balancing {}: load {:.3}, base poll {} -> {} ms",
                    device_key, load, base, adjusted
                );
                let _ = slot.cmd_tx.try_send(WorkerCommand::SetBasePoll(adjusted));
            }
        }
    }

    /// Stop and remove one worker. Errors never remove workers; only
    /// this explicit call does.
    pub async fn remove(&self, device_key: &str) -> Result<()> {
        let (_, slot) = self
            .workers
            .remove(device_key)
            .ok_or_else(|| AcqSrvError::PointNotFound(format!("worker {device_key}")))?;
        self.prev_totals.lock().remove(device_key);
        Self::stop_slot(device_key, &slot).await;
        Ok(())
    }

    /// Stop all workers concurrently, then the periodic ticks.
    pub async fn stop(&self) {
        for handle in self.tick_handles.lock().drain(..) {
            handle.abort();
        }

        let mut removed = Vec::new();
        for device_key in self.device_keys() {
            if let Some((key, slot)) = self.workers.remove(&device_key) {
                removed.push((key, slot));
            }
        }
        futures::future::join_all(
            removed
                .iter()
                .map(|(key, slot)| Self::stop_slot(key, slot)),
        )
        .await;
        self.prev_totals.lock().clear();
    }

    async fn stop_slot(device_key: &str, slot: &Arc<WorkerSlot>) {
        let _ = slot.cmd_tx.send(WorkerCommand::Stop).await;
        // Wake the worker in case it is idle in its select loop.
        slot.shared.kick.notify_one();

        let join = slot.join.lock().take();
        if let Some(join) = join {
            match tokio::time::timeout(WORKER_STOP_TIMEOUT, join).await {
                Ok(_) => debug!("Worker {} stopped", device_key),
                Err(_) => {
                    warn!(
                        "Worker {} did not stop within {:?}, abandoning",
                        device_key, WORKER_STOP_TIMEOUT
                    );
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::{DataType, Request, RequestKind, RequestPriority};
    use crate::protocols::modbus::simulator::{SimulatedDevice, SimulatorBehavior};

    fn registry() -> (Arc<WorkerRegistry>, mpsc::Receiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        let config = RegistryConfig {
            worker: WorkerTemplate {
                connect_timeout: Duration::from_millis(500),
                request_timeout: Duration::from_millis(500),
                ..WorkerTemplate::default()
            },
            ..RegistryConfig::default()
        };
        (WorkerRegistry::new(config, event_tx), event_rx)
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_worker() {
        let (registry, _events) = registry();

        let a = registry.get_or_create("127.0.0.1", 502, 1);
        let b = registry.get_or_create("127.0.0.1", 502, 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.worker_count(), 1);

        // Different unit id on the same endpoint is a different device.
        let _c = registry.get_or_create("127.0.0.1", 502, 2);
        assert_eq!(registry.worker_count(), 2);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_workers() {
        let (registry, _events) = registry();
        registry.get_or_create("127.0.0.1", 11502, 1);
        registry.get_or_create("127.0.0.1", 11503, 1);
        assert_eq!(registry.worker_count(), 2);

        registry.stop().await;
        assert_eq!(registry.worker_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_worker_errors() {
        let (registry, _events) = registry();
        assert!(registry.remove("10.0.0.9:502:1").await.is_err());
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let behavior = SimulatorBehavior {
            holding_registers: vec![(0, vec![1, 2, 3, 4])],
            ..Default::default()
        };
        let device = SimulatedDevice::start(behavior).await;
        let (registry, mut events) = registry();

        let slot = registry.get_or_create("127.0.0.1", device.port(), 1);
        slot.shared
            .enqueue(
                Request {
                    kind: RequestKind::ReadHolding,
                    start_address: 0,
                    count: 2,
                    unit_id: 1,
                    data_type: DataType::Reg16,
                },
                RequestPriority::Normal,
                false,
            )
            .unwrap();

        // Wait for the completion to land.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => panic!("no completion"),
                event = events.recv() => {
                    if matches!(event, Some(WorkerEvent::ReadCompleted { .. })) {
                        break;
                    }
                }
            }
        }

        let stats = registry.aggregate_stats();
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.total_successful, 1);
        assert_eq!(stats.connected_devices, 1);

        registry.stop().await;
    }
}
