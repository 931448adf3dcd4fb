//! Scheduler: async handle over the allocation core.
//!
//! The `Scheduler` is the control loop that:
//! - Serializes every demand and canal operation through one write lock
//! - Feeds the latest telemetry flow to the running delivery each tick
//! - Starts the queue head automatically in `auto` mode
//! - Publishes a queue snapshot after every tick and every mutation

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use waterhack_core::{Clock, ControlMode};
use waterhack_core::config::SchedulerConfig;
use waterhack_state::*;
use waterhack_telemetry::TelemetryHub;

use crate::allocation::{Allocation, AllocationOptions, QueueSlot, TickReport};
use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::NewDemand;
use crate::session::DeliverySession;

/// The active session as reported to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: DeliverySession,
    pub field_id: FieldId,
    pub remaining_volume_m3: f64,
}

/// Shared scheduler handle. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<RwLock<Allocation>>,
    store: StateStore,
    telemetry: TelemetryHub,
    clock: Arc<dyn Clock>,
    queue_tx: Arc<watch::Sender<Vec<QueueSlot>>>,
    tick_interval: Duration,
}

impl Scheduler {
    /// Rebuild scheduler state from the store.
    ///
    /// Fails with `InvariantViolation` when the store holds more than one
    /// delivering demand; the daemon must not start in that case.
    pub fn recover(
        store: StateStore,
        telemetry: TelemetryHub,
        clock: Arc<dyn Clock>,
        config: &SchedulerConfig,
    ) -> SchedulerResult<Self> {
        let options = AllocationOptions {
            mode: config.control_mode,
            auto_approve: config.auto_approve,
        };
        let allocation = Allocation::recover(store.clone(), options, clock.now())?;
        let initial = allocation.queue_snapshot(telemetry.current_reading().map(|r| r.flow_rate_lps))?;
        let (tx, _rx) = watch::channel(initial);
        Ok(Self {
            core: Arc::new(RwLock::new(allocation)),
            store,
            telemetry,
            clock,
            queue_tx: Arc::new(tx),
            tick_interval: config.tick_interval(),
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Fields ─────────────────────────────────────────────────────

    /// Register a new field. The existence check and the write happen
    /// under the scheduler lock, so of two racing creates one gets
    /// `FieldExists`.
    pub async fn create_field(&self, field: &Field) -> SchedulerResult<()> {
        let mut core = self.core.write().await;
        core.create_field(field)?;
        self.publish(&core);
        Ok(())
    }

    pub async fn update_field(&self, field: &Field) -> SchedulerResult<()> {
        let mut core = self.core.write().await;
        core.update_field(field)?;
        // Field names appear in the queue view.
        self.publish(&core);
        Ok(())
    }

    /// Delete a field, withdrawing its open demands.
    pub async fn remove_field(&self, field_id: &str) -> SchedulerResult<()> {
        let mut core = self.core.write().await;
        core.remove_field(field_id, self.clock.now())?;
        self.publish(&core);
        Ok(())
    }

    // ── Demands ────────────────────────────────────────────────────

    pub async fn submit(&self, req: NewDemand) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        let demand = core.submit(req, self.clock.now())?;
        self.publish(&core);
        Ok(demand)
    }

    pub async fn review(&self, id: DemandId) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        core.review(id, self.clock.now())
    }

    pub async fn approve(&self, id: DemandId) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        let demand = core.approve(id, self.clock.now())?;
        self.publish(&core);
        Ok(demand)
    }

    pub async fn reject(&self, id: DemandId, reason: Option<String>) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        core.reject(id, reason, self.clock.now())
    }

    pub async fn transition(&self, id: DemandId, next: DemandStatus) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        let demand = core.transition(id, next, self.clock.now())?;
        self.publish(&core);
        Ok(demand)
    }

    pub async fn cancel(&self, id: DemandId) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        let demand = core.cancel(id, self.clock.now())?;
        self.publish(&core);
        Ok(demand)
    }

    pub async fn get_demand(&self, id: DemandId) -> Option<Demand> {
        self.core.read().await.registry().get(id).cloned()
    }

    /// Demands in id order, optionally filtered by status.
    pub async fn list_demands(&self, status: Option<DemandStatus>) -> Vec<Demand> {
        let core = self.core.read().await;
        let registry = core.registry();
        match status {
            Some(status) => registry.list_by_status(status),
            None => registry.iter().cloned().collect(),
        }
    }

    /// Audit records for one demand, oldest first.
    pub async fn deliveries(&self, id: DemandId) -> SchedulerResult<Vec<DeliveryRecord>> {
        let core = self.core.read().await;
        if core.registry().get(id).is_none() {
            return Err(SchedulerError::DemandNotFound(id));
        }
        Ok(self.store.list_deliveries_for_demand(id)?)
    }

    /// Seconds until `id` gets the canal at the current flow. An estimate:
    /// flow changes move it in either direction.
    pub async fn estimated_wait_seconds(&self, id: DemandId) -> SchedulerResult<Option<f64>> {
        let core = self.core.read().await;
        core.estimated_wait_seconds(id, self.current_flow())
    }

    // ── Canal ──────────────────────────────────────────────────────

    pub async fn session(&self) -> Option<SessionView> {
        let core = self.core.read().await;
        Self::session_view(&core)
    }

    /// Operator start. Works in both control modes.
    pub async fn start_next(&self) -> SchedulerResult<SessionView> {
        let mut core = self.core.write().await;
        core.start_next(self.clock.now())?;
        self.publish(&core);
        Self::session_view(&core).ok_or(SchedulerError::NoActiveSession)
    }

    /// Pause the running delivery. The flow up to now is credited first;
    /// if that finishes the delivery the returned view is `completed`.
    pub async fn pause(&self) -> SchedulerResult<SessionView> {
        let mut core = self.core.write().await;
        let session = core.pause(self.current_flow(), self.clock.now())?;
        self.publish(&core);
        Ok(Self::view_of(&core, session))
    }

    pub async fn resume(&self) -> SchedulerResult<SessionView> {
        let mut core = self.core.write().await;
        let session = core.resume(self.clock.now())?;
        Ok(Self::view_of(&core, session))
    }

    /// Abort the active delivery. Returns the demand as it stands after
    /// re-queueing or rejection.
    pub async fn abort(&self, reason: AbortReason) -> SchedulerResult<Demand> {
        let mut core = self.core.write().await;
        let demand = core.abort(reason, self.clock.now())?;
        self.publish(&core);
        Ok(demand)
    }

    pub async fn control_mode(&self) -> ControlMode {
        self.core.read().await.mode()
    }

    pub async fn set_control_mode(&self, mode: ControlMode) {
        self.core.write().await.set_mode(mode);
    }

    // ── Queue view ─────────────────────────────────────────────────

    /// The most recently published queue snapshot.
    pub fn queue(&self) -> Vec<QueueSlot> {
        self.queue_tx.borrow().clone()
    }

    pub fn subscribe_queue(&self) -> watch::Receiver<Vec<QueueSlot>> {
        self.queue_tx.subscribe()
    }

    // ── Loop ───────────────────────────────────────────────────────

    /// One scheduling tick at the current clock time. The running session
    /// is credited the latest reading (frozen if the sensor has dropped
    /// out) for its running time since it was last credited.
    pub async fn tick(&self) -> SchedulerResult<TickReport> {
        let mut core = self.core.write().await;
        let now = self.clock.now();
        let flow = self.current_flow();
        let report = core.tick(flow, now)?;
        debug!(flow_lps = ?flow, now, ?report, "scheduler tick");
        self.publish(&core);
        Ok(report)
    }

    /// Tick every `tick_interval` until `shutdown` changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.tick_interval.as_millis() as u64,
            "allocation scheduler started"
        );
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("allocation scheduler shutting down");
                    break;
                }
            }
        }
    }

    fn current_flow(&self) -> Option<f64> {
        self.telemetry.current_reading().map(|r| r.flow_rate_lps)
    }

    fn session_view(allocation: &Allocation) -> Option<SessionView> {
        let session = allocation.session()?.clone();
        Some(Self::view_of(allocation, session))
    }

    fn view_of(allocation: &Allocation, session: DeliverySession) -> SessionView {
        let field_id = allocation
            .registry()
            .get(session.demand_id)
            .map(|d| d.field_id.clone())
            .unwrap_or_default();
        SessionView {
            remaining_volume_m3: session.remaining_volume_m3(),
            field_id,
            session,
        }
    }

    fn publish(&self, allocation: &Allocation) {
        match allocation.queue_snapshot(self.current_flow()) {
            Ok(snapshot) => {
                self.queue_tx.send_replace(snapshot);
            }
            Err(e) => error!(error = %e, "failed to build queue snapshot"),
        }
    }
}
