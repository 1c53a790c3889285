//! Audit log queries and aggregate statistics.

use anyhow::{Context, Result};
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use super::{AuditEntry, AuditVerdict, ResponseStatus};
use crate::config::Mode;
use crate::policy::RuleAction;

/// Filter for audit queries. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub tool: Option<String>,
    pub host: Option<String>,
    pub agent: Option<String>,
    pub verdict: Option<AuditVerdict>,
    /// Inclusive lower bound, epoch milliseconds.
    pub start_time: Option<i64>,
    /// Inclusive upper bound, epoch milliseconds.
    pub end_time: Option<i64>,
    /// 0 means no limit.
    pub limit: usize,
    pub offset: usize,
}

/// Query entries matching the filter, newest first by sequence number.
pub fn query(conn: &Connection, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
    let mut sql = String::from(
        "SELECT sequence_number, timestamp, tool, host, agent, arguments, verdict, action,
                matched_rule_id, risk_score, risk_factors, mode, response_status, error_message,
                hash, previous_hash
         FROM audit_log WHERE 1=1",
    );
    let mut params: Vec<SqlValue> = Vec::new();

    if let Some(ref tool) = filter.tool {
        sql.push_str(" AND tool = ?");
        params.push(SqlValue::Text(tool.clone()));
    }
    if let Some(ref host) = filter.host {
        sql.push_str(" AND host = ?");
        params.push(SqlValue::Text(host.clone()));
    }
    if let Some(ref agent) = filter.agent {
        sql.push_str(" AND agent = ?");
        params.push(SqlValue::Text(agent.clone()));
    }
    if let Some(verdict) = filter.verdict {
        sql.push_str(" AND verdict = ?");
        params.push(SqlValue::Text(verdict.as_str().to_string()));
    }
    if let Some(start) = filter.start_time {
        sql.push_str(" AND timestamp >= ?");
        params.push(SqlValue::Integer(start));
    }
    if let Some(end) = filter.end_time {
        sql.push_str(" AND timestamp <= ?");
        params.push(SqlValue::Integer(end));
    }

    sql.push_str(" ORDER BY sequence_number DESC");
    if filter.limit > 0 {
        sql.push_str(" LIMIT ?");
        params.push(SqlValue::Integer(filter.limit as i64));
        if filter.offset > 0 {
            sql.push_str(" OFFSET ?");
            params.push(SqlValue::Integer(filter.offset as i64));
        }
    } else if filter.offset > 0 {
        // SQLite requires a LIMIT clause before OFFSET; -1 means unlimited.
        sql.push_str(" LIMIT -1 OFFSET ?");
        params.push(SqlValue::Integer(filter.offset as i64));
    }

    let mut stmt = conn.prepare(&sql).context("preparing audit query")?;
    let raws = stmt
        .query_map(rusqlite::params_from_iter(params), raw_from_row)?
        .collect::<rusqlite::Result<Vec<RawEntry>>>()?;
    raws.into_iter().map(entry_from_raw).collect()
}

/// Aggregate statistics over the whole log.
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
    pub total_entries: u64,
    pub allowed: u64,
    pub denied: u64,
    pub asked: u64,
    pub timeouts: u64,
    pub distinct_tools: u64,
    pub distinct_hosts: u64,
    /// Most frequently denied tools, descending, at most ten.
    pub top_denied_tools: Vec<(String, u64)>,
}

pub fn stats(conn: &Connection) -> Result<AuditStats> {
    let mut stats = AuditStats::default();

    let mut stmt = conn.prepare("SELECT verdict, COUNT(*) FROM audit_log GROUP BY verdict")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (verdict, count) in counts {
        let count = count as u64;
        stats.total_entries += count;
        match AuditVerdict::parse(&verdict)? {
            AuditVerdict::Allowed => stats.allowed = count,
            AuditVerdict::Denied => stats.denied = count,
            AuditVerdict::Asked => stats.asked = count,
        }
    }

    stats.timeouts = conn.query_row(
        "SELECT COUNT(*) FROM audit_log WHERE response_status = 'timeout'",
        [],
        |row| row.get::<_, i64>(0),
    )? as u64;
    stats.distinct_tools = conn.query_row(
        "SELECT COUNT(DISTINCT tool) FROM audit_log",
        [],
        |row| row.get::<_, i64>(0),
    )? as u64;
    stats.distinct_hosts = conn.query_row(
        "SELECT COUNT(DISTINCT host) FROM audit_log",
        [],
        |row| row.get::<_, i64>(0),
    )? as u64;

    let mut stmt = conn.prepare(
        "SELECT tool, COUNT(*) AS n FROM audit_log WHERE verdict = 'denied'
         GROUP BY tool ORDER BY n DESC LIMIT 10",
    )?;
    stats.top_denied_tools = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(stats)
}

struct RawEntry {
    sequence_number: i64,
    timestamp: i64,
    tool: String,
    host: String,
    agent: String,
    arguments: String,
    verdict: String,
    action: String,
    matched_rule_id: Option<String>,
    risk_score: f64,
    risk_factors: String,
    mode: String,
    response_status: Option<String>,
    error_message: Option<String>,
    hash: String,
    previous_hash: String,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        sequence_number: row.get(0)?,
        timestamp: row.get(1)?,
        tool: row.get(2)?,
        host: row.get(3)?,
        agent: row.get(4)?,
        arguments: row.get(5)?,
        verdict: row.get(6)?,
        action: row.get(7)?,
        matched_rule_id: row.get(8)?,
        risk_score: row.get(9)?,
        risk_factors: row.get(10)?,
        mode: row.get(11)?,
        response_status: row.get(12)?,
        error_message: row.get(13)?,
        hash: row.get(14)?,
        previous_hash: row.get(15)?,
    })
}

fn entry_from_raw(raw: RawEntry) -> Result<AuditEntry> {
    Ok(AuditEntry {
        verdict: AuditVerdict::parse(&raw.verdict)
            .with_context(|| format!("audit entry {}", raw.sequence_number))?,
        action: RuleAction::parse(&raw.action)
            .with_context(|| format!("audit entry {}", raw.sequence_number))?,
        mode: Mode::parse(&raw.mode)
            .with_context(|| format!("audit entry {}", raw.sequence_number))?,
        response_status: raw
            .response_status
            .as_deref()
            .map(ResponseStatus::parse)
            .transpose()
            .with_context(|| format!("audit entry {}", raw.sequence_number))?,
        risk_factors: serde_json::from_str(&raw.risk_factors)
            .with_context(|| format!("audit entry {}: malformed risk factors", raw.sequence_number))?,
        sequence_number: raw.sequence_number,
        timestamp: raw.timestamp,
        tool: raw.tool,
        host: raw.host,
        agent: raw.agent,
        arguments: raw.arguments,
        matched_rule_id: raw.matched_rule_id,
        risk_score: raw.risk_score,
        error_message: raw.error_message,
        hash: raw.hash,
        previous_hash: raw.previous_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::log::{append, record_response};
    use crate::policy::{PolicyVerdict, RuleAction};
    use crate::store::Store;

    const T0: i64 = 1_700_000_000_000;

    fn verdict(allowed: bool, asked: bool) -> PolicyVerdict {
        PolicyVerdict {
            allowed,
            action: if allowed { RuleAction::Allow } else { RuleAction::Deny },
            reason: "test".to_string(),
            matched_rule_id: None,
            risk_score: 10.0,
            risk_factors: Vec::new(),
            requires_confirmation: asked,
            confirmation_token: None,
            retry_after_seconds: None,
        }
    }

    fn seed(store: &Store) {
        let conn = store.conn();
        append(&conn, T0, "read", "h1", "a1", "{}", &verdict(true, false), Mode::SilentAllow).unwrap();
        append(&conn, T0 + 10, "exec", "h1", "a2", "{}", &verdict(false, false), Mode::SilentAllow).unwrap();
        append(&conn, T0 + 20, "exec", "h2", "a1", "{}", &verdict(false, false), Mode::SilentAllow).unwrap();
        append(&conn, T0 + 30, "write", "h2", "a1", "{}", &verdict(false, true), Mode::Alert).unwrap();
        append(&conn, T0 + 40, "read", "h1", "a1", "{}", &verdict(true, false), Mode::SilentAllow).unwrap();
    }

    #[test]
    fn query_orders_newest_first() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let entries = query(&store.conn(), &AuditFilter::default()).unwrap();
        assert_eq!(entries.len(), 5);
        let seqs: Vec<i64> = entries.iter().map(|e| e.sequence_number).collect();
        assert_eq!(seqs, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn query_filters_compose() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let conn = store.conn();

        let filter = AuditFilter { tool: Some("exec".to_string()), ..Default::default() };
        assert_eq!(query(&conn, &filter).unwrap().len(), 2);

        let filter = AuditFilter {
            tool: Some("exec".to_string()),
            host: Some("h1".to_string()),
            ..Default::default()
        };
        assert_eq!(query(&conn, &filter).unwrap().len(), 1);

        let filter = AuditFilter {
            verdict: Some(AuditVerdict::Asked),
            ..Default::default()
        };
        let asked = query(&conn, &filter).unwrap();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].tool, "write");
    }

    #[test]
    fn query_time_window_is_inclusive() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let filter = AuditFilter {
            start_time: Some(T0 + 10),
            end_time: Some(T0 + 30),
            ..Default::default()
        };
        assert_eq!(query(&store.conn(), &filter).unwrap().len(), 3);
    }

    #[test]
    fn query_limit_and_offset_paginate() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let conn = store.conn();

        let filter = AuditFilter { limit: 2, ..Default::default() };
        let page1 = query(&conn, &filter).unwrap();
        assert_eq!(page1.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![5, 4]);

        let filter = AuditFilter { limit: 2, offset: 2, ..Default::default() };
        let page2 = query(&conn, &filter).unwrap();
        assert_eq!(page2.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![3, 2]);
    }

    #[test]
    fn stats_aggregates() {
        let store = Store::open_in_memory().unwrap();
        seed(&store);
        let conn = store.conn();
        record_response(&conn, 1, ResponseStatus::Success, None).unwrap();
        record_response(&conn, 5, ResponseStatus::Timeout, None).unwrap();

        let stats = stats(&conn).unwrap();
        assert_eq!(stats.total_entries, 5);
        assert_eq!(stats.allowed, 2);
        assert_eq!(stats.denied, 2);
        assert_eq!(stats.asked, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.distinct_tools, 3);
        assert_eq!(stats.distinct_hosts, 2);
        assert_eq!(stats.top_denied_tools, vec![("exec".to_string(), 2)]);
    }
}
