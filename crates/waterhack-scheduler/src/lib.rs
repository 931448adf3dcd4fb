//! waterhack-scheduler: demand lifecycle and canal allocation.
//!
//! Owns every water demand from submission to completion and decides which
//! one holds the single shared canal. The scheduler:
//!
//! - Validates submissions and enforces the demand lifecycle
//! - Queues approved demands in strict FIFO order (approval time, id)
//! - Runs at most one delivery session at a time on the canal
//! - Credits telemetry flow to the running session on every tick
//! - Re-queues aborted deliveries at the tail with their delivered volume kept
//!
//! # Architecture
//!
//! ```text
//! Scheduler (async handle, run() loop)
//!   ├── TelemetryHub (latest flow reading)
//!   ├── watch channel → queue snapshots
//!   └── RwLock<Allocation>
//!       ├── DemandRegistry (lifecycle, write-through to StateStore)
//!       ├── FIFO queue of approved demands
//!       └── Canal (single DeliverySession slot)
//! ```
//!
//! # Demand lifecycle
//!
//! ```text
//! submitted → reviewing → approved → delivering → completed
//! ```
//!
//! Rejection can end a demand at any point before completion.
//! `delivering → approved` is the re-queue after an aborted delivery.

pub mod allocation;
pub mod error;
pub mod registry;
pub mod scheduler;
pub mod session;

pub use allocation::{Allocation, AllocationOptions, QueueSlot, TickReport};
pub use error::{SchedulerError, SchedulerResult};
pub use registry::{DemandRegistry, NewDemand};
pub use scheduler::{Scheduler, SessionView};
pub use session::{Canal, DeliverySession, SessionState};
