//! Delivery sessions and the canal slot.
//!
//! The canal admits one session at a time. A session moves
//! `Running ⇄ Paused` and ends `Completed` or `Aborted`; a finished session
//! stays in the slot until the scheduler has recorded it, then `release`
//! frees the canal.
//!
//! Flow is credited for running time only. `credited_until` marks how far
//! a session has been paid up; start and resume move it to the current
//! time, and pause settles the running stretch before stopping.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use waterhack_state::{AbortReason, Demand, DemandId};

use crate::error::{SchedulerError, SchedulerResult};

/// State of a delivery session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    Paused,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Completed => "completed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One demand's use of the canal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliverySession {
    pub demand_id: DemandId,
    /// Session number for this demand, counting earlier aborted attempts.
    pub seq: u32,
    pub started_at: u64,
    /// Volume this session must deliver (m³): what the demand still lacked
    /// when the session started.
    pub target_volume_m3: f64,
    /// Never decreases; never exceeds the target.
    pub delivered_volume_m3: f64,
    pub state: SessionState,
    pub ended_at: Option<u64>,
    pub abort_reason: Option<AbortReason>,
    /// Flow has been credited up to this time (Unix seconds).
    pub credited_until: u64,
}

impl DeliverySession {
    fn new(demand: &Demand, seq: u32, now: u64) -> Self {
        Self {
            demand_id: demand.id,
            seq,
            started_at: now,
            target_volume_m3: demand.outstanding_volume(),
            delivered_volume_m3: 0.0,
            state: SessionState::Running,
            ended_at: None,
            abort_reason: None,
            credited_until: now,
        }
    }

    pub fn remaining_volume_m3(&self) -> f64 {
        (self.target_volume_m3 - self.delivered_volume_m3).max(0.0)
    }

    /// Credit `flow_rate_lps` for the running time since `credited_until`.
    /// Returns true when this completes the session. Completion is detected
    /// on the call that reaches the target and the delivered volume is
    /// clamped to it.
    fn advance(&mut self, flow_rate_lps: f64, now: u64) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        let dt_secs = now.saturating_sub(self.credited_until) as f64;
        self.credited_until = self.credited_until.max(now);
        let delta = (flow_rate_lps.max(0.0) / 1000.0) * dt_secs;
        let next = self.delivered_volume_m3 + delta;
        if next >= self.target_volume_m3 {
            debug!(
                demand_id = self.demand_id,
                overshoot_m3 = next - self.target_volume_m3,
                "delivery target reached"
            );
            self.delivered_volume_m3 = self.target_volume_m3;
            self.state = SessionState::Completed;
            self.ended_at = Some(now);
            return true;
        }
        self.delivered_volume_m3 = next;
        false
    }
}

/// The single shared canal. Holds at most one session.
#[derive(Debug, Default)]
pub struct Canal {
    session: Option<DeliverySession>,
}

impl Canal {
    /// Give the canal to `demand`. Fails with `ResourceBusy` while any
    /// session (running, paused, or finished but unrecorded) holds it.
    pub fn start(&mut self, demand: &Demand, seq: u32, now: u64) -> SchedulerResult<&DeliverySession> {
        if let Some(held) = &self.session {
            return Err(SchedulerError::ResourceBusy(held.demand_id));
        }
        let session = DeliverySession::new(demand, seq, now);
        info!(
            demand_id = demand.id,
            seq,
            target_m3 = session.target_volume_m3,
            "delivery session started"
        );
        Ok(self.session.insert(session))
    }

    /// Rebuild a running session after a restart.
    pub(crate) fn restore(&mut self, session: DeliverySession) -> SchedulerResult<()> {
        if let Some(held) = &self.session {
            return Err(SchedulerError::ResourceBusy(held.demand_id));
        }
        self.session = Some(session);
        Ok(())
    }

    pub fn session(&self) -> Option<&DeliverySession> {
        self.session.as_ref()
    }

    /// Demand currently holding the canal.
    pub fn holder(&self) -> Option<DemandId> {
        self.session.as_ref().map(|s| s.demand_id)
    }

    /// Credit a running session up to `now`. Without a reading the time
    /// passes uncredited. Returns true if the session completed.
    pub fn tick(&mut self, flow_rate_lps: Option<f64>, now: u64) -> bool {
        match &mut self.session {
            Some(session) => session.advance(flow_rate_lps.unwrap_or(0.0), now),
            None => false,
        }
    }

    /// Settle the running stretch up to `now`, then pause. A session that
    /// reaches its target while settling completes instead.
    pub fn pause(&mut self, flow_rate_lps: Option<f64>, now: u64) -> SchedulerResult<&DeliverySession> {
        let session = self.session.as_mut().ok_or(SchedulerError::NoActiveSession)?;
        if session.state != SessionState::Running {
            return Err(SchedulerError::IllegalSessionState {
                state: session.state,
                action: "pause",
            });
        }
        if session.advance(flow_rate_lps.unwrap_or(0.0), now) {
            return Ok(session);
        }
        session.state = SessionState::Paused;
        info!(demand_id = session.demand_id, delivered_m3 = session.delivered_volume_m3, "delivery paused");
        Ok(session)
    }

    pub fn resume(&mut self, now: u64) -> SchedulerResult<&DeliverySession> {
        let session = self.session.as_mut().ok_or(SchedulerError::NoActiveSession)?;
        if session.state != SessionState::Paused {
            return Err(SchedulerError::IllegalSessionState {
                state: session.state,
                action: "resume",
            });
        }
        session.state = SessionState::Running;
        session.credited_until = now;
        info!(demand_id = session.demand_id, "delivery resumed");
        Ok(session)
    }

    /// Mark the held session aborted. It keeps the canal until released.
    pub fn abort(&mut self, reason: AbortReason, now: u64) -> SchedulerResult<&DeliverySession> {
        let session = self.session.as_mut().ok_or(SchedulerError::NoActiveSession)?;
        if session.state.is_terminal() {
            return Err(SchedulerError::IllegalSessionState {
                state: session.state,
                action: "abort",
            });
        }
        info!(
            demand_id = session.demand_id,
            delivered_m3 = session.delivered_volume_m3,
            %reason,
            "delivery aborted"
        );
        session.state = SessionState::Aborted;
        session.ended_at = Some(now);
        session.abort_reason = Some(reason);
        Ok(session)
    }

    /// Free the canal once its finished session has been recorded.
    pub fn release(&mut self) -> Option<DeliverySession> {
        match &self.session {
            Some(s) if s.state.is_terminal() => self.session.take(),
            _ => None,
        }
    }
}
