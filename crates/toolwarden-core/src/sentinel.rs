//! The sentinel orchestrator: one entry point per request.
//!
//! [`Sentinel::decide`] runs the whole decision segment -- mode load,
//! anomaly scoring, policy evaluation, write-ahead audit append, baseline
//! update, alert recording -- inside a single store transaction, so the
//! segment is atomic and serialized against concurrent requests.
//! [`Sentinel::record_response`] later fills in the downstream outcome and
//! drives the circuit breaker.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::alerts::{self, AlertNotification};
use crate::anomaly;
use crate::arguments;
use crate::audit::log as audit_log;
use crate::audit::query::{self, AuditFilter, AuditStats};
use crate::audit::verify::{self, VerifyReport};
use crate::audit::{AuditEntry, ResponseStatus};
use crate::breaker;
use crate::config::{self, Mode, Settings};
use crate::confirm;
use crate::policy::{EngineConfig, PolicyContext, PolicyEngine, PolicyVerdict};
use crate::quarantine;
use crate::ratelimit;
use crate::store::Store;

/// Orchestrator tunables.
#[derive(Debug, Clone, Copy)]
pub struct SentinelConfig {
    pub engine: EngineConfig,
    pub bucket_max_idle_ms: i64,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            bucket_max_idle_ms: 24 * 3_600_000,
        }
    }
}

impl From<&Settings> for SentinelConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            engine: EngineConfig {
                breaker_failure_threshold: settings.breaker_failure_threshold,
                breaker_cooldown_ms: (settings.breaker_cooldown_secs * 1000) as i64,
                token_ttl_ms: (settings.token_ttl_secs * 1000) as i64,
            },
            bucket_max_idle_ms: (settings.bucket_max_idle_hours * 3_600_000) as i64,
        }
    }
}

/// The outcome of one decided request.
#[derive(Debug, Clone)]
pub struct Decision {
    pub verdict: PolicyVerdict,
    /// Audit sequence number of the write-ahead entry.
    pub sequence_number: i64,
    pub mode: Mode,
    /// Webhook payload when the decision raised an alert.
    pub alert: Option<AlertNotification>,
}

/// Counts from one maintenance sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    pub stale_buckets_removed: usize,
    pub expired_tokens_removed: usize,
    pub expired_quarantines_removed: usize,
}

pub struct Sentinel {
    store: Store,
    engine: PolicyEngine,
    config: SentinelConfig,
}

impl Sentinel {
    pub fn new(store: Store, config: SentinelConfig) -> Self {
        Self { store, engine: PolicyEngine::new(config.engine), config }
    }

    /// Open the database at `path` and build a sentinel over it.
    pub fn open(path: &Path, config: SentinelConfig) -> Result<Self> {
        Ok(Self::new(Store::open(path)?, config))
    }

    /// In-memory sentinel for tests.
    pub fn in_memory(config: SentinelConfig) -> Result<Self> {
        Ok(Self::new(Store::open_in_memory()?, config))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Decide one request. The audit entry is committed before the caller
    /// acts on the verdict -- the record survives any downstream failure.
    pub fn decide(&self, ctx: &PolicyContext) -> Result<Decision> {
        self.store.with_tx(|tx| {
            let mode = config::load_mode(tx)?;
            let now_ms = ctx.timestamp.timestamp_millis();

            let (anomaly_score, observation) = anomaly::evaluate(tx, ctx)?;
            let verdict = self
                .engine
                .evaluate(tx, ctx, mode, anomaly_score.as_ref(), &[])
                .context("policy evaluation")?;

            let redacted = arguments::canonical_json(&arguments::redact(&ctx.arguments));
            let entry = audit_log::append(
                tx, now_ms, &ctx.tool, &ctx.host, &ctx.agent, &redacted, &verdict, mode,
            )?;

            // Baselines learn from every observation, after the decision.
            anomaly::record(tx, &ctx.tool, &ctx.host, &observation, now_ms)?;

            let alert = self.maybe_alert(tx, ctx, &verdict, now_ms)?;

            debug!(
                tool = %ctx.tool,
                host = %ctx.host,
                agent = %ctx.agent,
                verdict = %entry.verdict.as_str(),
                risk = verdict.risk_score,
                seq = entry.sequence_number,
                "decision recorded"
            );

            Ok(Decision { verdict, sequence_number: entry.sequence_number, mode, alert })
        })
    }

    fn maybe_alert(
        &self,
        tx: &rusqlite::Connection,
        ctx: &PolicyContext,
        verdict: &PolicyVerdict,
        now_ms: i64,
    ) -> Result<Option<AlertNotification>> {
        let thresholds = config::load_thresholds(tx)?;
        let denied = !verdict.allowed && !verdict.requires_confirmation;
        let severity = match alerts::severity_for(verdict.risk_score, &thresholds) {
            Some(severity) => severity,
            None if denied => alerts::AlertSeverity::Low,
            None => return Ok(None),
        };
        let (_, notification) = alerts::record(
            tx,
            now_ms,
            severity,
            &ctx.tool,
            &ctx.host,
            &ctx.agent,
            &verdict.reason,
            verdict.risk_score,
        )?;
        Ok(Some(notification))
    }

    /// Record the downstream outcome for a forwarded request: fills the
    /// audit entry's terminal status and drives the host's circuit breaker.
    pub fn record_response(
        &self,
        sequence_number: i64,
        host: &str,
        status: ResponseStatus,
        error_message: Option<&str>,
        now_ms: i64,
    ) -> Result<()> {
        self.store.with_tx(|tx| {
            audit_log::record_response(tx, sequence_number, status, error_message)?;
            match status {
                ResponseStatus::Success => breaker::record_success(tx, host, now_ms)?,
                ResponseStatus::Error | ResponseStatus::Timeout => breaker::record_failure(
                    tx,
                    host,
                    now_ms,
                    self.config.engine.breaker_failure_threshold,
                )?,
            }
            Ok(())
        })
    }

    /// Close out an entry the sentinel itself rejected (deny or ask). Not a
    /// downstream outcome, so the circuit breaker is untouched.
    pub fn mark_rejected(&self, sequence_number: i64, message: &str) -> Result<()> {
        self.store.with_tx(|tx| {
            audit_log::record_response(tx, sequence_number, ResponseStatus::Error, Some(message))
        })
    }

    /// Periodic cleanup: stale buckets, expired tokens, expired quarantines.
    pub fn run_maintenance(&self, now_ms: i64) -> Result<MaintenanceReport> {
        let report = self.store.with_tx(|tx| {
            Ok(MaintenanceReport {
                stale_buckets_removed: ratelimit::cleanup_stale(tx, now_ms, self.config.bucket_max_idle_ms)?,
                expired_tokens_removed: confirm::prune_expired(tx, now_ms)?,
                expired_quarantines_removed: quarantine::sweep_expired(tx, now_ms)?,
            })
        })?;
        info!(
            buckets = report.stale_buckets_removed,
            tokens = report.expired_tokens_removed,
            quarantines = report.expired_quarantines_removed,
            "maintenance sweep complete"
        );
        Ok(report)
    }

    /// Walk the audit chain and report tamper evidence.
    pub fn verify_audit(&self) -> Result<VerifyReport> {
        verify::verify(&self.store.conn())
    }

    /// Query the audit log.
    pub fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        query::query(&self.store.conn(), filter)
    }

    /// Aggregate audit statistics.
    pub fn audit_stats(&self) -> Result<AuditStats> {
        query::stats(&self.store.conn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditVerdict;
    use serde_json::json;

    fn sentinel() -> Sentinel {
        Sentinel::in_memory(SentinelConfig::default()).unwrap()
    }

    fn ctx(tool: &str) -> PolicyContext {
        PolicyContext::new(tool, "host-1", "agent-1", json!({"path": "/tmp/x"}))
    }

    #[test]
    fn decide_writes_audit_ahead_of_any_side_effect() {
        let s = sentinel();
        let decision = s.decide(&ctx("read_file")).unwrap();
        assert!(decision.verdict.allowed);
        assert_eq!(decision.sequence_number, 1);

        let entries = s.query_audit(&AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].verdict, AuditVerdict::Allowed);
        assert!(entries[0].response_status.is_none(), "terminal status is filled later");
    }

    #[test]
    fn decide_redacts_arguments_in_audit() {
        let s = sentinel();
        let context = PolicyContext::new(
            "login",
            "h",
            "a",
            json!({"user": "root", "password": "hunter2"}),
        );
        s.decide(&context).unwrap();

        let entries = s.query_audit(&AuditFilter::default()).unwrap();
        assert!(entries[0].arguments.contains("[REDACTED]"));
        assert!(!entries[0].arguments.contains("hunter2"));
    }

    #[test]
    fn responses_drive_the_circuit_breaker() {
        let s = sentinel();
        let d1 = s.decide(&ctx("exec")).unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        s.record_response(d1.sequence_number, "host-1", ResponseStatus::Error, Some("boom"), now)
            .unwrap();
        let d2 = s.decide(&ctx("exec")).unwrap();
        s.record_response(d2.sequence_number, "host-1", ResponseStatus::Timeout, None, now + 1)
            .unwrap();

        // Two failures at the default threshold: circuit is open.
        let d3 = s.decide(&ctx("exec")).unwrap();
        assert!(!d3.verdict.allowed);
        assert!(d3.verdict.reason.contains("circuit breaker open"));
    }

    #[test]
    fn rejections_do_not_touch_the_breaker() {
        let s = sentinel();
        let conn = s.store().conn();
        config::set_mode(&conn, Mode::SilentDeny).unwrap();
        drop(conn);

        for _ in 0..5 {
            let decision = s.decide(&ctx("exec")).unwrap();
            assert!(!decision.verdict.allowed);
            s.mark_rejected(decision.sequence_number, "denied").unwrap();
        }
        let conn = s.store().conn();
        assert!(breaker::load(&conn, "host-1").unwrap().is_none());
    }

    #[test]
    fn unknown_persisted_mode_fails_the_request() {
        let s = sentinel();
        config::set_value(&s.store().conn(), "mode", "wide-open").unwrap();
        assert!(s.decide(&ctx("anything")).is_err());
    }

    #[test]
    fn denied_decision_raises_an_alert() {
        let s = sentinel();
        config::set_mode(&s.store().conn(), Mode::SilentDeny).unwrap();

        let decision = s.decide(&ctx("exec")).unwrap();
        assert!(!decision.verdict.allowed);
        assert!(decision.alert.is_some());

        let alerts = alerts::list_recent(&s.store().conn(), 10).unwrap();
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn allowed_low_risk_decision_raises_no_alert() {
        let s = sentinel();
        let decision = s.decide(&ctx("read_file")).unwrap();
        assert!(decision.alert.is_none());
    }

    #[test]
    fn maintenance_sweeps_all_three_tables() {
        let s = sentinel();
        let now = chrono::Utc::now().timestamp_millis();
        {
            let conn = s.store().conn();
            confirm::mint(&conn, "t", "h", "a", "{}", now - 10_000, 1000).unwrap();
            quarantine::upsert(
                &conn,
                &crate::quarantine::QuarantineEntry {
                    scope: crate::quarantine::Scope::Host,
                    target: "old".to_string(),
                    reason: "r".to_string(),
                    created_at: 0,
                    expires_at: Some(now - 1),
                    created_by: "op".to_string(),
                },
            )
            .unwrap();
        }
        let report = s.run_maintenance(now).unwrap();
        assert_eq!(report.expired_tokens_removed, 1);
        assert_eq!(report.expired_quarantines_removed, 1);
    }

    #[test]
    fn verify_audit_over_live_decisions() {
        let s = sentinel();
        for i in 0..10 {
            s.decide(&ctx(&format!("tool_{i}"))).unwrap();
        }
        let report = s.verify_audit().unwrap();
        assert!(report.valid);
        assert_eq!(report.total_entries, 10);
    }
}
