//! Allocation: the synchronous scheduling core.
//!
//! Owns the demand registry, the FIFO wait queue and the canal slot. Every
//! method takes `&mut self`, so wrapping one `Allocation` in a lock is
//! enough to make status changes linearizable and to keep the canal
//! single-holder.
//!
//! Queue order is `(queued_at, queue_rank, id)`: approval time with the
//! lower id winning ties. A demand re-queued after an aborted delivery gets
//! the abort time as its new `queued_at` and a fresh, strictly increasing
//! `queue_rank`, which places it behind everything already waiting. The key
//! is persisted, so a restart rebuilds the same order.

use serde::Serialize;
use tracing::{debug, info, warn};

use waterhack_core::ControlMode;
use waterhack_state::*;

use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::{DemandRegistry, NewDemand};
use crate::session::{Canal, DeliverySession, SessionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
    queued_at: u64,
    rank: u64,
    demand_id: DemandId,
}

impl QueueEntry {
    fn of(demand: &Demand) -> Self {
        Self {
            queued_at: demand.queued_at.or(demand.approved_at).unwrap_or(demand.submitted_at),
            rank: demand.queue_rank,
            demand_id: demand.id,
        }
    }
}

/// One row of the published queue view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSlot {
    /// 0 is the demand holding the canal; waiting demands count from 1.
    pub position: usize,
    pub demand_id: DemandId,
    pub field_name: String,
    pub owner: String,
    pub status: DemandStatus,
    /// Estimate only: assumes the current flow rate holds. `None` when
    /// there is no usable flow reading.
    pub estimated_wait_seconds: Option<f64>,
}

/// What a scheduling tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub completed: Option<DemandId>,
    pub started: Option<DemandId>,
}

/// Scheduler options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocationOptions {
    pub mode: ControlMode,
    pub auto_approve: bool,
}

pub struct Allocation {
    registry: DemandRegistry,
    queue: Vec<QueueEntry>,
    canal: Canal,
    options: AllocationOptions,
    /// Next `queue_rank` handed to a re-queued demand.
    next_rank: u64,
}

impl Allocation {
    /// Rebuild scheduling state from the store.
    ///
    /// Approved demands re-enter the queue in their persisted order. A
    /// demand persisted as `Delivering` gets a fresh running session for
    /// its outstanding volume. More than one such demand is an invariant
    /// violation and nothing is started.
    pub fn recover(store: StateStore, options: AllocationOptions, now: u64) -> SchedulerResult<Self> {
        let registry = DemandRegistry::load(store)?;

        let delivering = registry.list_by_status(DemandStatus::Delivering);
        if delivering.len() > 1 {
            let ids: Vec<_> = delivering.iter().map(|d| d.id).collect();
            return Err(SchedulerError::InvariantViolation(format!(
                "{} demands persisted as delivering: {ids:?}",
                ids.len()
            )));
        }

        let mut queue: Vec<QueueEntry> = registry
            .list_by_status(DemandStatus::Approved)
            .iter()
            .map(QueueEntry::of)
            .collect();
        queue.sort();
        let next_rank = registry.iter().map(|d| d.queue_rank).max().unwrap_or(0) + 1;

        let mut canal = Canal::default();
        if let Some(demand) = delivering.first() {
            let seq = registry.store().list_deliveries_for_demand(demand.id)?.len() as u32;
            canal.restore(DeliverySession {
                demand_id: demand.id,
                seq,
                started_at: now,
                target_volume_m3: demand.outstanding_volume(),
                delivered_volume_m3: 0.0,
                state: SessionState::Running,
                ended_at: None,
                abort_reason: None,
                credited_until: now,
            })?;
            info!(demand_id = demand.id, "resumed interrupted delivery");
        }

        info!(queued = queue.len(), mode = ?options.mode, "allocation recovered");
        Ok(Self {
            registry,
            queue,
            canal,
            options,
            next_rank,
        })
    }

    pub fn registry(&self) -> &DemandRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        self.registry.store()
    }

    pub fn session(&self) -> Option<&DeliverySession> {
        self.canal.session()
    }

    pub fn mode(&self) -> ControlMode {
        self.options.mode
    }

    pub fn set_mode(&mut self, mode: ControlMode) {
        if self.options.mode != mode {
            info!(?mode, "control mode changed");
        }
        self.options.mode = mode;
    }

    /// Waiting demand ids, head first.
    pub fn queued_ids(&self) -> Vec<DemandId> {
        self.queue.iter().map(|e| e.demand_id).collect()
    }

    // ── Demand lifecycle ───────────────────────────────────────────

    pub fn submit(&mut self, req: NewDemand, now: u64) -> SchedulerResult<Demand> {
        let demand = self.registry.submit(req, now)?;
        if self.options.auto_approve {
            return self.approve(demand.id, now);
        }
        Ok(demand)
    }

    pub fn review(&mut self, id: DemandId, now: u64) -> SchedulerResult<Demand> {
        self.registry.transition(id, DemandStatus::Reviewing, now)
    }

    /// Approve and enqueue. A demand still in `Submitted` is reviewed first.
    pub fn approve(&mut self, id: DemandId, now: u64) -> SchedulerResult<Demand> {
        if self.registry.get(id).map(|d| d.status) == Some(DemandStatus::Submitted) {
            self.review(id, now)?;
        }
        match self.registry.get(id).map(|d| d.status) {
            Some(DemandStatus::Reviewing) => {}
            Some(from) => {
                return Err(SchedulerError::IllegalTransition {
                    id,
                    from,
                    to: DemandStatus::Approved,
                });
            }
            None => return Err(SchedulerError::DemandNotFound(id)),
        }
        let demand = self.registry.apply(
            id,
            DemandStatus::Approved,
            now,
            |d| {
                d.queued_at = Some(now);
                d.queue_rank = 0;
            },
            None,
        )?;
        self.enqueue(QueueEntry::of(&demand));
        Ok(demand)
    }

    pub fn reject(&mut self, id: DemandId, reason: Option<String>, now: u64) -> SchedulerResult<Demand> {
        if self.registry.get(id).map(|d| d.status) == Some(DemandStatus::Submitted) {
            self.review(id, now)?;
        }
        let status = self.registry.get(id).map(|d| d.status);
        if status != Some(DemandStatus::Reviewing) {
            return match status {
                Some(from) => Err(SchedulerError::IllegalTransition {
                    id,
                    from,
                    to: DemandStatus::Rejected,
                }),
                None => Err(SchedulerError::DemandNotFound(id)),
            };
        }
        self.registry
            .apply(id, DemandStatus::Rejected, now, |d| d.status_reason = reason, None)
    }

    /// Route an operator-requested status change. Delivery statuses are
    /// owned by the scheduler and cannot be requested directly.
    pub fn transition(&mut self, id: DemandId, next: DemandStatus, now: u64) -> SchedulerResult<Demand> {
        let from = self
            .registry
            .get(id)
            .map(|d| d.status)
            .ok_or(SchedulerError::DemandNotFound(id))?;
        match next {
            DemandStatus::Reviewing => self.review(id, now),
            DemandStatus::Approved if from == DemandStatus::Reviewing => self.approve(id, now),
            DemandStatus::Rejected if from == DemandStatus::Reviewing => self.reject(id, None, now),
            _ => Err(SchedulerError::IllegalTransition { id, from, to: next }),
        }
    }

    /// Withdraw a demand that is still waiting in the queue.
    pub fn cancel(&mut self, id: DemandId, now: u64) -> SchedulerResult<Demand> {
        let status = self
            .registry
            .get(id)
            .map(|d| d.status)
            .ok_or(SchedulerError::DemandNotFound(id))?;
        let Some(pos) = self.queue.iter().position(|e| e.demand_id == id) else {
            return Err(SchedulerError::NotCancellable { id, status });
        };
        let demand = self.registry.apply(
            id,
            DemandStatus::Rejected,
            now,
            |d| {
                d.queued_at = None;
                d.status_reason = Some("cancelled".to_string());
            },
            None,
        )?;
        self.queue.remove(pos);
        info!(demand_id = id, "queued demand cancelled");
        Ok(demand)
    }

    // ── Fields ─────────────────────────────────────────────────────

    /// Register a new field. Fails with `FieldExists` if the id is taken.
    pub fn create_field(&mut self, field: &Field) -> SchedulerResult<()> {
        field.validate().map_err(SchedulerError::InvalidField)?;
        if self.store().get_field(&field.id)?.is_some() {
            return Err(SchedulerError::FieldExists(field.id.clone()));
        }
        self.save_field(field)
    }

    /// Replace an existing field. Fails with `FieldNotFound` if it is absent.
    pub fn update_field(&mut self, field: &Field) -> SchedulerResult<()> {
        field.validate().map_err(SchedulerError::InvalidField)?;
        if self.store().get_field(&field.id)?.is_none() {
            return Err(SchedulerError::FieldNotFound(field.id.clone()));
        }
        self.save_field(field)
    }

    fn save_field(&mut self, field: &Field) -> SchedulerResult<()> {
        self.store().put_field(field)?;
        info!(field_id = %field.id, water_need_m3 = field.water_need(), "field saved");
        Ok(())
    }

    /// Remove a field and withdraw every open demand on it. A delivery in
    /// progress for the field is aborted as `FieldCancelled`.
    pub fn remove_field(&mut self, field_id: &str, now: u64) -> SchedulerResult<()> {
        if self.store().get_field(field_id)?.is_none() {
            return Err(SchedulerError::FieldNotFound(field_id.to_string()));
        }

        if let Some(holder) = self.canal.holder() {
            let on_field = self.registry.get(holder).is_some_and(|d| d.field_id == field_id);
            if on_field {
                self.abort(AbortReason::FieldCancelled, now)?;
            }
        }

        let open: Vec<Demand> = self
            .registry
            .iter()
            .filter(|d| d.field_id == field_id && !d.status.is_terminal())
            .cloned()
            .collect();
        for demand in open {
            match demand.status {
                DemandStatus::Approved => {
                    self.cancel(demand.id, now)?;
                }
                DemandStatus::Submitted | DemandStatus::Reviewing => {
                    self.reject(demand.id, Some("field removed".to_string()), now)?;
                }
                // Aborted above; terminal statuses were filtered out.
                DemandStatus::Delivering | DemandStatus::Rejected | DemandStatus::Completed => {}
            }
        }

        self.store().delete_field(field_id)?;
        info!(%field_id, "field removed");
        Ok(())
    }

    // ── Canal ──────────────────────────────────────────────────────

    /// Start the queue head. Fails with `ResourceBusy` while the canal is
    /// held, and with `NothingToStart` when the queue is empty or the head
    /// is not due yet.
    pub fn start_next(&mut self, now: u64) -> SchedulerResult<DemandId> {
        self.settle(now)?;
        if let Some(holder) = self.canal.holder() {
            return Err(SchedulerError::ResourceBusy(holder));
        }
        let head = *self
            .queue
            .first()
            .ok_or_else(|| SchedulerError::NothingToStart("queue is empty".to_string()))?;
        let demand = self
            .registry
            .get(head.demand_id)
            .ok_or(SchedulerError::DemandNotFound(head.demand_id))?;
        if demand.requested_start > now {
            return Err(SchedulerError::NothingToStart(format!(
                "demand {} is not due until {}",
                demand.id, demand.requested_start
            )));
        }

        let seq = self.store().list_deliveries_for_demand(head.demand_id)?.len() as u32;
        let demand = self
            .registry
            .apply(head.demand_id, DemandStatus::Delivering, now, |_| {}, None)?;
        self.queue.remove(0);
        if let Err(e) = self.canal.start(&demand, seq, now) {
            // Unreachable while settle() and the holder check above hold.
            return Err(SchedulerError::InvariantViolation(format!(
                "demand {} marked delivering but canal refused it: {e}",
                demand.id
            )));
        }
        Ok(demand.id)
    }

    /// Pause the running delivery after crediting it up to `now`. If that
    /// completes the delivery it is recorded right away and the returned
    /// session is `Completed`.
    pub fn pause(&mut self, flow_rate_lps: Option<f64>, now: u64) -> SchedulerResult<DeliverySession> {
        let session = self.canal.pause(flow_rate_lps, now)?.clone();
        if session.state.is_terminal() {
            self.settle(now)?;
        }
        Ok(session)
    }

    pub fn resume(&mut self, now: u64) -> SchedulerResult<DeliverySession> {
        self.canal.resume(now).cloned()
    }

    /// Abort the active delivery and free the canal.
    ///
    /// The delivered volume stays on the demand. The demand goes back to
    /// the tail of the queue, or is rejected when the field was cancelled.
    pub fn abort(&mut self, reason: AbortReason, now: u64) -> SchedulerResult<Demand> {
        let id = self.canal.holder().ok_or(SchedulerError::NoActiveSession)?;
        let already_aborted = self
            .canal
            .session()
            .is_some_and(|s| s.state == SessionState::Aborted);
        if !already_aborted {
            self.canal.abort(reason, now)?;
        }
        self.settle(now)?;
        self.registry
            .get(id)
            .cloned()
            .ok_or(SchedulerError::DemandNotFound(id))
    }

    /// One scheduling tick: credit flow to the running session up to `now`,
    /// record a completion, then start the next due demand when in auto
    /// mode.
    pub fn tick(&mut self, flow_rate_lps: Option<f64>, now: u64) -> SchedulerResult<TickReport> {
        let mut report = TickReport::default();

        self.canal.tick(flow_rate_lps, now);
        report.completed = self.settle(now)?;

        if self.options.mode == ControlMode::Auto && self.canal.holder().is_none() {
            match self.start_next(now) {
                Ok(id) => report.started = Some(id),
                Err(SchedulerError::NothingToStart(why)) => debug!(%why, "canal idle"),
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Record a finished session and free the canal. Returns the demand id
    /// when the session completed. A failed write leaves the session in the
    /// slot so the next call retries.
    fn settle(&mut self, now: u64) -> SchedulerResult<Option<DemandId>> {
        let Some(session) = self.canal.session() else {
            return Ok(None);
        };
        if !session.state.is_terminal() {
            return Ok(None);
        }
        let session = session.clone();
        let id = session.demand_id;
        let ended_at = session.ended_at.unwrap_or(now);
        let delivered = session.delivered_volume_m3;

        let (outcome, next) = match (&session.state, &session.abort_reason) {
            (SessionState::Completed, _) => (DeliveryOutcome::Completed, DemandStatus::Completed),
            (_, Some(AbortReason::FieldCancelled)) => (
                DeliveryOutcome::Aborted {
                    reason: AbortReason::FieldCancelled,
                },
                DemandStatus::Rejected,
            ),
            (_, reason) => (
                DeliveryOutcome::Aborted {
                    reason: reason.clone().unwrap_or(AbortReason::OperatorStop),
                },
                DemandStatus::Approved,
            ),
        };
        let record = DeliveryRecord {
            demand_id: id,
            seq: session.seq,
            started_at: session.started_at,
            ended_at,
            delivered_volume_m3: delivered,
            outcome: outcome.clone(),
        };

        let requeue = next == DemandStatus::Approved;
        let rank = self.next_rank;
        let demand = self.registry.apply(
            id,
            next,
            now,
            |d| {
                d.delivered_volume_m3 = (d.delivered_volume_m3 + delivered).min(d.requested_volume_m3);
                match &outcome {
                    DeliveryOutcome::Completed => d.status_reason = None,
                    DeliveryOutcome::Aborted { reason } => {
                        d.status_reason = Some(format!("delivery aborted: {reason}"));
                    }
                }
                d.queued_at = requeue.then_some(now);
                if requeue {
                    d.queue_rank = rank;
                }
            },
            Some(&record),
        )?;
        self.canal.release();

        match next {
            DemandStatus::Completed => {
                info!(demand_id = id, delivered_m3 = delivered, "delivery completed");
                Ok(Some(id))
            }
            DemandStatus::Approved => {
                self.next_rank += 1;
                self.enqueue(QueueEntry::of(&demand));
                warn!(demand_id = id, delivered_m3 = delivered, "aborted delivery re-queued");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn enqueue(&mut self, entry: QueueEntry) {
        let pos = self.queue.partition_point(|e| *e < entry);
        self.queue.insert(pos, entry);
        debug!(demand_id = entry.demand_id, position = pos + 1, "demand queued");
    }

    // ── Estimates ──────────────────────────────────────────────────

    /// Seconds until `id` gets the canal, assuming `flow_rate_lps` holds.
    ///
    /// This is an estimate, not a guarantee: it sums the remaining volume
    /// of the active session and of every demand queued ahead of `id` and
    /// divides by the current flow. `Some(0.0)` when `id` holds the canal;
    /// `None` when `id` is not waiting or there is no usable flow.
    pub fn estimated_wait_seconds(&self, id: DemandId, flow_rate_lps: Option<f64>) -> SchedulerResult<Option<f64>> {
        if self.registry.get(id).is_none() {
            return Err(SchedulerError::DemandNotFound(id));
        }
        if self.canal.holder() == Some(id) {
            return Ok(Some(0.0));
        }
        let Some(pos) = self.queue.iter().position(|e| e.demand_id == id) else {
            return Ok(None);
        };
        let Some(flow_m3s) = usable_flow(flow_rate_lps) else {
            return Ok(None);
        };
        let ahead: f64 = self.queue[..pos]
            .iter()
            .filter_map(|e| self.registry.get(e.demand_id))
            .map(Demand::outstanding_volume)
            .sum();
        Ok(Some((self.active_remaining() + ahead) / flow_m3s))
    }

    /// The queue as observers see it: the canal holder at position 0, then
    /// waiting demands with cumulative wait estimates.
    pub fn queue_snapshot(&self, flow_rate_lps: Option<f64>) -> SchedulerResult<Vec<QueueSlot>> {
        let flow = usable_flow(flow_rate_lps);
        let mut slots = Vec::with_capacity(self.queue.len() + 1);

        if let Some(session) = self.canal.session() {
            if let Some(demand) = self.registry.get(session.demand_id) {
                let (field_name, owner) = self.field_label(&demand.field_id)?;
                slots.push(QueueSlot {
                    position: 0,
                    demand_id: demand.id,
                    field_name,
                    owner,
                    status: demand.status,
                    estimated_wait_seconds: Some(0.0),
                });
            }
        }

        let mut ahead = self.active_remaining();
        for (i, entry) in self.queue.iter().enumerate() {
            let Some(demand) = self.registry.get(entry.demand_id) else {
                continue;
            };
            let (field_name, owner) = self.field_label(&demand.field_id)?;
            slots.push(QueueSlot {
                position: i + 1,
                demand_id: demand.id,
                field_name,
                owner,
                status: demand.status,
                estimated_wait_seconds: flow.map(|f| ahead / f),
            });
            ahead += demand.outstanding_volume();
        }
        Ok(slots)
    }

    fn active_remaining(&self) -> f64 {
        self.canal
            .session()
            .filter(|s| !s.state.is_terminal())
            .map_or(0.0, DeliverySession::remaining_volume_m3)
    }

    /// Field name and owner for the queue view. A field deleted under a
    /// still-listed demand shows its id and no owner.
    fn field_label(&self, field_id: &str) -> SchedulerResult<(String, String)> {
        Ok(self
            .store()
            .get_field(field_id)?
            .map_or_else(|| (field_id.to_string(), String::new()), |f| (f.name, f.owner)))
    }
}

/// Flow in m³/s, if positive.
fn usable_flow(flow_rate_lps: Option<f64>) -> Option<f64> {
    flow_rate_lps
        .filter(|f| f.is_finite() && *f > 0.0)
        .map(|f| f / 1000.0)
}
