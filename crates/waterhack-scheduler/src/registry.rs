//! Demand registry: holds every demand and enforces the lifecycle.
//!
//! The registry is the only writer of demand status. Each accepted change
//! is written through to the state store before it becomes visible in
//! memory, so a failed write leaves no trace.

use std::collections::BTreeMap;

use tracing::{debug, info};

use waterhack_state::*;

use crate::error::{SchedulerError, SchedulerResult};

/// A submission from a farmer.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct NewDemand {
    pub field_id: FieldId,
    /// Requested volume in m³. Defaults to the field's water need.
    #[serde(default)]
    pub requested_volume_m3: Option<f64>,
    /// Earliest start, Unix timestamp (seconds).
    pub requested_start: u64,
    #[serde(default)]
    pub notes: Option<String>,
}

/// In-memory index of demands, mirrored to the state store.
pub struct DemandRegistry {
    store: StateStore,
    demands: BTreeMap<DemandId, Demand>,
    next_id: DemandId,
}

impl DemandRegistry {
    /// Load all persisted demands.
    pub fn load(store: StateStore) -> SchedulerResult<Self> {
        let demands: BTreeMap<_, _> = store
            .list_demands()?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let next_id = demands.keys().next_back().map_or(1, |id| id + 1);
        debug!(count = demands.len(), next_id, "demand registry loaded");
        Ok(Self {
            store,
            demands,
            next_id,
        })
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Validate and record a new demand in `Submitted` status.
    pub fn submit(&mut self, req: NewDemand, now: u64) -> SchedulerResult<Demand> {
        let field = self
            .store
            .get_field(&req.field_id)?
            .ok_or_else(|| SchedulerError::InvalidDemand(format!("unknown field {}", req.field_id)))?;

        let volume = req.requested_volume_m3.unwrap_or_else(|| field.water_need());
        if !volume.is_finite() || volume <= 0.0 {
            return Err(SchedulerError::InvalidDemand(format!(
                "requested volume must be > 0 m³, got {volume}"
            )));
        }
        if req.requested_start < now {
            return Err(SchedulerError::InvalidDemand(format!(
                "requested start {} is in the past (now {now})",
                req.requested_start
            )));
        }

        let id = self.next_id;
        let demand = Demand {
            id,
            field_id: req.field_id,
            requested_volume_m3: volume,
            requested_start: req.requested_start,
            notes: req.notes.filter(|n| !n.trim().is_empty()),
            priority: id,
            status: DemandStatus::Submitted,
            submitted_at: now,
            approved_at: None,
            queued_at: None,
            queue_rank: 0,
            delivered_volume_m3: 0.0,
            status_reason: None,
            updated_at: now,
        };
        self.store.put_demand(&demand)?;
        self.next_id += 1;
        self.demands.insert(id, demand.clone());
        info!(demand_id = id, field_id = %demand.field_id, volume_m3 = volume, "demand submitted");
        Ok(demand)
    }

    /// Move a demand to `next` if the lifecycle allows it.
    pub fn transition(&mut self, id: DemandId, next: DemandStatus, now: u64) -> SchedulerResult<Demand> {
        self.apply(id, next, now, |_| {}, None)
    }

    /// Transition plus extra field updates, committed together. When a
    /// delivery record is given it is written in the same transaction.
    pub(crate) fn apply(
        &mut self,
        id: DemandId,
        next: DemandStatus,
        now: u64,
        update: impl FnOnce(&mut Demand),
        record: Option<&DeliveryRecord>,
    ) -> SchedulerResult<Demand> {
        let current = self.demands.get(&id).ok_or(SchedulerError::DemandNotFound(id))?;
        if !current.status.can_transition_to(next) {
            return Err(SchedulerError::IllegalTransition {
                id,
                from: current.status,
                to: next,
            });
        }

        let mut updated = current.clone();
        let from = updated.status;
        updated.status = next;
        updated.updated_at = now;
        if next == DemandStatus::Approved && updated.approved_at.is_none() {
            updated.approved_at = Some(now);
        }
        update(&mut updated);

        match record {
            Some(record) => self.store.finish_delivery(&updated, record)?,
            None => self.store.put_demand(&updated)?,
        }
        self.demands.insert(id, updated.clone());
        info!(demand_id = id, %from, to = %next, "demand transitioned");
        Ok(updated)
    }

    pub fn get(&self, id: DemandId) -> Option<&Demand> {
        self.demands.get(&id)
    }

    /// Demands with the given status, in insertion order.
    pub fn list_by_status(&self, status: DemandStatus) -> Vec<Demand> {
        self.demands
            .values()
            .filter(|d| d.status == status)
            .cloned()
            .collect()
    }

    /// Every demand, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Demand> {
        self.demands.values()
    }
}
