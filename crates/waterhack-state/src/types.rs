//! Domain types for the WaterHack state store.
//!
//! These types represent the persisted state of fields, water demands and
//! delivery audit records, plus the telemetry reading shared by the
//! ingestor and the scheduler. All persisted types are serializable to/from
//! JSON for storage in redb tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a field.
pub type FieldId = String;

/// Unique identifier for a demand. Assigned in submission order.
pub type DemandId = u64;

// ── Field ─────────────────────────────────────────────────────────

/// Crop grown on a field. Determines the water need per hectare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropType {
    Cotton,
    Wheat,
}

impl CropType {
    /// Seasonal water need in m³ per hectare.
    pub fn coefficient(self) -> f64 {
        match self {
            CropType::Cotton => 1000.0,
            CropType::Wheat => 900.0,
        }
    }
}

/// A farmer's field.
///
/// The water need is always derived from `size_ha` and `crop_type`; it is
/// never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Field {
    pub id: FieldId,
    pub name: String,
    /// Owning farmer, free text.
    #[serde(default)]
    pub owner: String,
    /// Area in hectares.
    pub size_ha: f64,
    pub crop_type: CropType,
    /// Distance from the canal offtake in kilometres.
    pub distance_to_canal_km: f64,
}

impl Field {
    /// Water need in m³: size × crop coefficient.
    pub fn water_need(&self) -> f64 {
        self.size_ha * self.crop_type.coefficient()
    }

    /// Check the field's inputs. Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("field id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return Err("field name must not be empty".to_string());
        }
        if !self.size_ha.is_finite() || self.size_ha <= 0.0 {
            return Err(format!("size must be > 0 ha, got {}", self.size_ha));
        }
        if !self.distance_to_canal_km.is_finite() || self.distance_to_canal_km < 0.0 {
            return Err(format!(
                "distance to canal must be >= 0 km, got {}",
                self.distance_to_canal_km
            ));
        }
        Ok(())
    }
}

// ── Demand ────────────────────────────────────────────────────────

/// Lifecycle status of a water demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandStatus {
    Submitted,
    Reviewing,
    Approved,
    Rejected,
    Delivering,
    Completed,
}

impl DemandStatus {
    /// Whether `self → next` is an edge of the demand lifecycle.
    ///
    /// Besides the forward path, three edges exist for the scheduler only:
    /// `Delivering → Approved` (re-queue after an aborted delivery),
    /// `Delivering → Rejected` (delivery aborted because the field was
    /// cancelled) and `Approved → Rejected` (queued demand cancelled).
    pub fn can_transition_to(self, next: DemandStatus) -> bool {
        use DemandStatus::*;
        match (self, next) {
            (Submitted, Reviewing) => true,
            (Reviewing, Approved) | (Reviewing, Rejected) => true,
            (Approved, Delivering) | (Approved, Rejected) => true,
            (Delivering, Completed) | (Delivering, Approved) | (Delivering, Rejected) => true,
            (Submitted, _) | (Reviewing, _) | (Approved, _) | (Delivering, _) => false,
            (Rejected, _) | (Completed, _) => false,
        }
    }

    /// Rejected and completed demands never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, DemandStatus::Rejected | DemandStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DemandStatus::Submitted => "submitted",
            DemandStatus::Reviewing => "reviewing",
            DemandStatus::Approved => "approved",
            DemandStatus::Rejected => "rejected",
            DemandStatus::Delivering => "delivering",
            DemandStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for DemandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for a volume of water to be delivered to a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Demand {
    pub id: DemandId,
    pub field_id: FieldId,
    /// Requested volume in m³.
    pub requested_volume_m3: f64,
    /// Earliest start, Unix timestamp (seconds).
    pub requested_start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Submission sequence number. Not client negotiable.
    pub priority: u64,
    pub status: DemandStatus,
    pub submitted_at: u64,
    /// Set on the first approval.
    pub approved_at: Option<u64>,
    /// Position key in the delivery queue: approval time, or the re-queue
    /// time after an aborted delivery.
    pub queued_at: Option<u64>,
    /// Tie-break within one `queued_at` second. Approvals use 0 so equal
    /// approval times fall back to id order; each re-queue after an abort
    /// takes the next rank, placing it behind every entry of that second.
    #[serde(default)]
    pub queue_rank: u64,
    /// Volume delivered across all sessions so far (m³).
    pub delivered_volume_m3: f64,
    /// Why the demand was last moved (rejection, cancellation, abort).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub updated_at: u64,
}

impl Demand {
    /// Volume still owed to the field (m³).
    pub fn outstanding_volume(&self) -> f64 {
        (self.requested_volume_m3 - self.delivered_volume_m3).max(0.0)
    }

    /// Build the key for the demands table. Zero-padded so key order is
    /// id order.
    pub fn table_key(&self) -> String {
        demand_key(self.id)
    }
}

/// Key for a demand id in the demands table.
pub fn demand_key(id: DemandId) -> String {
    format!("{id:020}")
}

// ── Delivery audit ────────────────────────────────────────────────

/// Why a delivery session was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The field owner withdrew; the demand is not re-queued.
    FieldCancelled,
    /// Operator stopped the delivery.
    OperatorStop,
    /// Canal sensors went silent or reported a fault.
    SensorFault,
    Other(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::FieldCancelled => f.write_str("field cancelled"),
            AbortReason::OperatorStop => f.write_str("operator stop"),
            AbortReason::SensorFault => f.write_str("sensor fault"),
            AbortReason::Other(s) => f.write_str(s),
        }
    }
}

/// How a delivery session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Completed,
    Aborted { reason: AbortReason },
}

/// Audit record of one finished delivery session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub demand_id: DemandId,
    /// Session number for this demand, starting at 0.
    pub seq: u32,
    pub started_at: u64,
    pub ended_at: u64,
    /// Volume delivered during this session (m³).
    pub delivered_volume_m3: f64,
    pub outcome: DeliveryOutcome,
}

impl DeliveryRecord {
    /// Build the composite key for the deliveries table.
    pub fn table_key(&self) -> String {
        format!("{}:{:06}", demand_key(self.demand_id), self.seq)
    }
}

// ── Telemetry ─────────────────────────────────────────────────────

/// A validated, smoothed snapshot of the canal sensors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TelemetryReading {
    pub timestamp: u64,
    /// Canal water level, percent of capacity.
    pub water_level_pct: f64,
    /// Flow rate into the active offtake, litres per second.
    pub flow_rate_lps: f64,
    pub pressure_bar: f64,
    pub canal_volume_m3: f64,
}

impl TelemetryReading {
    /// Flow rate in m³ per second.
    pub fn flow_rate_m3s(&self) -> f64 {
        self.flow_rate_lps / 1000.0
    }
}
