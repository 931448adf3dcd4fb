//! Prometheus text exposition format.
//!
//! Renders canal telemetry, demand counts and the active delivery into the
//! Prometheus text exposition format for scraping.

use std::fmt::Write;

use waterhack_scheduler::SessionView;
use waterhack_state::{Demand, DemandStatus};
use waterhack_telemetry::TelemetrySnapshot;

const STATUSES: [DemandStatus; 6] = [
    DemandStatus::Submitted,
    DemandStatus::Reviewing,
    DemandStatus::Approved,
    DemandStatus::Rejected,
    DemandStatus::Delivering,
    DemandStatus::Completed,
];

/// Everything the `/metrics` endpoint reports.
pub struct CanalMetrics {
    pub telemetry: TelemetrySnapshot,
    pub demands: Vec<Demand>,
    pub session: Option<SessionView>,
}

fn gauge(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
}

/// Render canal metrics into Prometheus text format.
///
/// Telemetry gauges are omitted until the first reading arrives.
pub fn render_prometheus(m: &CanalMetrics) -> String {
    let mut out = String::new();

    gauge(&mut out, "waterhack_sensor_active", "1 if the canal sensor is reporting.");
    let _ = writeln!(out, "waterhack_sensor_active {}", u8::from(m.telemetry.sensor_active));

    if let Some(r) = &m.telemetry.reading {
        gauge(&mut out, "waterhack_water_level_percent", "Smoothed canal water level.");
        let _ = writeln!(out, "waterhack_water_level_percent {:.2}", r.water_level_pct);
        gauge(&mut out, "waterhack_flow_rate_lps", "Smoothed flow rate in litres per second.");
        let _ = writeln!(out, "waterhack_flow_rate_lps {:.2}", r.flow_rate_lps);
        gauge(&mut out, "waterhack_pressure_bar", "Smoothed canal pressure in bar.");
        let _ = writeln!(out, "waterhack_pressure_bar {:.3}", r.pressure_bar);
        gauge(&mut out, "waterhack_canal_volume_m3", "Water held in the canal in cubic metres.");
        let _ = writeln!(out, "waterhack_canal_volume_m3 {:.1}", r.canal_volume_m3);
    }

    gauge(&mut out, "waterhack_demands", "Number of demands by status.");
    for status in STATUSES {
        let count = m.demands.iter().filter(|d| d.status == status).count();
        let _ = writeln!(out, "waterhack_demands{{status=\"{status}\"}} {count}");
    }

    gauge(
        &mut out,
        "waterhack_delivered_volume_m3",
        "Volume delivered to completed demands in cubic metres.",
    );
    let delivered: f64 = m
        .demands
        .iter()
        .filter(|d| d.status == DemandStatus::Completed)
        .map(|d| d.delivered_volume_m3)
        .sum();
    let _ = writeln!(out, "waterhack_delivered_volume_m3 {delivered:.1}");

    if let Some(s) = &m.session {
        gauge(
            &mut out,
            "waterhack_session_remaining_m3",
            "Volume still to deliver in the active session.",
        );
        let _ = writeln!(
            out,
            "waterhack_session_remaining_m3{{demand=\"{}\",state=\"{}\"}} {:.1}",
            s.session.demand_id, s.session.state, s.remaining_volume_m3
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use waterhack_scheduler::{DeliverySession, SessionState};
    use waterhack_state::TelemetryReading;

    fn demand(id: u64, status: DemandStatus, delivered: f64) -> Demand {
        Demand {
            id,
            field_id: "f1".to_string(),
            requested_volume_m3: 1000.0,
            requested_start: 0,
            notes: None,
            priority: id,
            status,
            submitted_at: 0,
            approved_at: None,
            queued_at: None,
            queue_rank: 0,
            delivered_volume_m3: delivered,
            status_reason: None,
            updated_at: 0,
        }
    }

    #[test]
    fn empty_metrics() {
        let out = render_prometheus(&CanalMetrics {
            telemetry: TelemetrySnapshot::default(),
            demands: Vec::new(),
            session: None,
        });
        assert!(out.contains("waterhack_sensor_active 0"));
        assert!(out.contains("waterhack_demands{status=\"approved\"} 0"));
        assert!(!out.contains("waterhack_flow_rate_lps"));
        assert!(!out.contains("waterhack_session_remaining_m3"));
    }

    #[test]
    fn full_metrics() {
        let out = render_prometheus(&CanalMetrics {
            telemetry: TelemetrySnapshot {
                reading: Some(TelemetryReading {
                    timestamp: 10,
                    water_level_pct: 75.0,
                    flow_rate_lps: 120.0,
                    pressure_bar: 3.5,
                    canal_volume_m3: 5000.0,
                }),
                sensor_active: true,
            },
            demands: vec![
                demand(1, DemandStatus::Completed, 1000.0),
                demand(2, DemandStatus::Delivering, 250.0),
                demand(3, DemandStatus::Approved, 0.0),
            ],
            session: Some(SessionView {
                session: DeliverySession {
                    demand_id: 2,
                    seq: 0,
                    started_at: 5,
                    target_volume_m3: 1000.0,
                    delivered_volume_m3: 250.0,
                    state: SessionState::Running,
                    ended_at: None,
                    abort_reason: None,
                    credited_until: 5,
                },
                field_id: "f1".to_string(),
                remaining_volume_m3: 750.0,
            }),
        });
        assert!(out.contains("waterhack_sensor_active 1"));
        assert!(out.contains("waterhack_flow_rate_lps 120.00"));
        assert!(out.contains("waterhack_demands{status=\"delivering\"} 1"));
        assert!(out.contains("waterhack_delivered_volume_m3 1000.0"));
        assert!(out.contains("waterhack_session_remaining_m3{demand=\"2\",state=\"running\"} 750.0"));
    }
}
