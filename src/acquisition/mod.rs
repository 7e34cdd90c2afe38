//! Acquisition runtime: per-device workers, request scheduling, block
//! planning and the service facade.

pub mod planner;
pub mod queue;
pub mod registry;
pub mod router;
pub mod service;
pub mod worker;

pub use planner::plan_blocks;
pub use queue::PriorityQueue;
pub use registry::{GlobalStats, WorkerRegistry};
pub use router::route_read_result;
pub use service::{AcquisitionService, ServiceEvent, ServiceStats};
pub use worker::{DeviceWorker, WorkerCommand, WorkerEvent, WorkerStats};
