//! Alert recording.
//!
//! Denials and high-anomaly decisions produce alert rows; severity is tiered
//! by the four configured anomaly thresholds. Webhook delivery of the
//! serialized notification happens off the hot path in the proxy crate; this
//! module only owns the persistent record and the payload shape.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::config::AnomalyThresholds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Result<AlertSeverity> {
        match s {
            "low" => Ok(AlertSeverity::Low),
            "medium" => Ok(AlertSeverity::Medium),
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => bail!("unknown alert severity '{other}'"),
        }
    }
}

/// Tier a risk score against the configured thresholds. Scores below the
/// low threshold raise no alert.
pub fn severity_for(risk_score: f64, thresholds: &AnomalyThresholds) -> Option<AlertSeverity> {
    if risk_score >= thresholds.critical {
        Some(AlertSeverity::Critical)
    } else if risk_score >= thresholds.high {
        Some(AlertSeverity::High)
    } else if risk_score >= thresholds.medium {
        Some(AlertSeverity::Medium)
    } else if risk_score >= thresholds.low {
        Some(AlertSeverity::Low)
    } else {
        None
    }
}

/// A persisted alert.
#[derive(Debug, Clone)]
pub struct Alert {
    pub id: i64,
    pub timestamp: i64,
    pub severity: AlertSeverity,
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub message: String,
    pub risk_score: f64,
    pub acknowledged: bool,
}

/// Webhook payload for one alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub severity: String,
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub message: String,
    pub risk_score: f64,
    pub timestamp: i64,
}

/// Record an alert row. Returns its id and the webhook payload.
pub fn record(
    conn: &Connection,
    timestamp: i64,
    severity: AlertSeverity,
    tool: &str,
    host: &str,
    agent: &str,
    message: &str,
    risk_score: f64,
) -> Result<(i64, AlertNotification)> {
    conn.execute(
        "INSERT INTO alerts (timestamp, severity, tool, host, agent, message, risk_score, acknowledged)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        rusqlite::params![timestamp, severity.as_str(), tool, host, agent, message, risk_score],
    )
    .context("recording alert")?;
    let id = conn.last_insert_rowid();
    Ok((
        id,
        AlertNotification {
            severity: severity.as_str().to_string(),
            tool: tool.to_string(),
            host: host.to_string(),
            agent: agent.to_string(),
            message: message.to_string(),
            risk_score,
            timestamp,
        },
    ))
}

/// List the most recent alerts, newest first.
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Alert>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, severity, tool, host, agent, message, risk_score, acknowledged
         FROM alerts ORDER BY id DESC LIMIT ?1",
    )?;
    let raws = stmt
        .query_map([limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, f64>(7)?,
                row.get::<_, bool>(8)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raws.into_iter()
        .map(|(id, timestamp, severity, tool, host, agent, message, risk_score, acknowledged)| {
            Ok(Alert {
                id,
                timestamp,
                severity: AlertSeverity::parse(&severity)?,
                tool,
                host,
                agent,
                message,
                risk_score,
                acknowledged,
            })
        })
        .collect()
}

/// Mark an alert acknowledged.
pub fn acknowledge(conn: &Connection, id: i64) -> Result<bool> {
    let updated = conn.execute("UPDATE alerts SET acknowledged = 1 WHERE id = ?1", [id])?;
    Ok(updated > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn severity_tiers() {
        let t = AnomalyThresholds::default();
        assert_eq!(severity_for(10.0, &t), None);
        assert_eq!(severity_for(25.0, &t), Some(AlertSeverity::Low));
        assert_eq!(severity_for(60.0, &t), Some(AlertSeverity::Medium));
        assert_eq!(severity_for(80.0, &t), Some(AlertSeverity::High));
        assert_eq!(severity_for(95.0, &t), Some(AlertSeverity::Critical));
    }

    #[test]
    fn record_and_list_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let (id, notification) =
            record(&conn, 1000, AlertSeverity::High, "exec", "h", "a", "denied by rule", 80.0).unwrap();
        assert!(id > 0);
        assert_eq!(notification.severity, "high");

        let alerts = list_recent(&conn, 10).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
        assert_eq!(alerts[0].tool, "exec");
        assert!(!alerts[0].acknowledged);
    }

    #[test]
    fn list_is_newest_first_and_limited() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        for i in 0..5 {
            record(&conn, i, AlertSeverity::Low, "t", "h", "a", "m", 30.0).unwrap();
        }
        let alerts = list_recent(&conn, 3).unwrap();
        assert_eq!(alerts.len(), 3);
        assert!(alerts[0].id > alerts[1].id);
    }

    #[test]
    fn acknowledge_flips_flag() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let (id, _) = record(&conn, 0, AlertSeverity::Low, "t", "h", "a", "m", 30.0).unwrap();

        assert!(acknowledge(&conn, id).unwrap());
        assert!(list_recent(&conn, 1).unwrap()[0].acknowledged);
        assert!(!acknowledge(&conn, 9999).unwrap());
    }
}
