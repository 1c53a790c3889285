//! Audit log write path: chained append and late completion.

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};

use super::{entry_hash, AuditEntry, AuditVerdict, ResponseStatus, GENESIS};
use crate::config::Mode;
use crate::policy::PolicyVerdict;

/// Append a decision to the chain. Returns the stored entry.
///
/// Reads the latest sequence number and hash, links the new entry to them,
/// and inserts with `response_status` unset. Must run inside the same
/// transaction as the rest of the decision so sequence numbers stay gapless
/// under concurrency.
pub fn append(
    conn: &Connection,
    timestamp: i64,
    tool: &str,
    host: &str,
    agent: &str,
    redacted_arguments: &str,
    verdict: &PolicyVerdict,
    mode: Mode,
) -> Result<AuditEntry> {
    let (sequence_number, previous_hash) = match latest(conn)? {
        Some((seq, hash)) => (seq + 1, hash),
        None => (1, GENESIS.to_string()),
    };

    let audit_verdict = if verdict.requires_confirmation {
        AuditVerdict::Asked
    } else if verdict.allowed {
        AuditVerdict::Allowed
    } else {
        AuditVerdict::Denied
    };

    let hash = entry_hash(sequence_number, timestamp, tool, host, agent, audit_verdict, &previous_hash);
    let risk_factors_json = serde_json::to_string(&verdict.risk_factors)?;

    conn.execute(
        "INSERT INTO audit_log
             (sequence_number, timestamp, tool, host, agent, arguments, verdict, action,
              matched_rule_id, risk_score, risk_factors, mode, response_status, error_message,
              hash, previous_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, NULL, ?13, ?14)",
        rusqlite::params![
            sequence_number,
            timestamp,
            tool,
            host,
            agent,
            redacted_arguments,
            audit_verdict.as_str(),
            verdict.action.as_str(),
            verdict.matched_rule_id,
            verdict.risk_score,
            risk_factors_json,
            mode.as_str(),
            hash,
            previous_hash,
        ],
    )
    .context("appending audit entry")?;

    Ok(AuditEntry {
        sequence_number,
        timestamp,
        tool: tool.to_string(),
        host: host.to_string(),
        agent: agent.to_string(),
        arguments: redacted_arguments.to_string(),
        verdict: audit_verdict,
        action: verdict.action,
        matched_rule_id: verdict.matched_rule_id.clone(),
        risk_score: verdict.risk_score,
        risk_factors: verdict.risk_factors.clone(),
        mode,
        response_status: None,
        error_message: None,
        hash,
        previous_hash,
    })
}

/// Fill the terminal status of an entry. The only mutation entries ever see;
/// both fields are outside the hash.
pub fn record_response(
    conn: &Connection,
    sequence_number: i64,
    status: ResponseStatus,
    error_message: Option<&str>,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE audit_log SET response_status = ?2, error_message = ?3 WHERE sequence_number = ?1",
        rusqlite::params![sequence_number, status.as_str(), error_message],
    )?;
    if updated == 0 {
        bail!("audit entry {sequence_number} not found");
    }
    Ok(())
}

/// Latest (sequence_number, hash), or None for an empty log.
pub fn latest(conn: &Connection) -> Result<Option<(i64, String)>> {
    conn.query_row(
        "SELECT sequence_number, hash FROM audit_log ORDER BY sequence_number DESC LIMIT 1",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .context("reading audit chain head")
}

/// The tool of the most recent entry for `host` strictly before `timestamp`.
/// Feeds the anomaly detector's sequence bigrams.
pub fn previous_tool_for_host(conn: &Connection, host: &str, timestamp: i64) -> Result<Option<String>> {
    conn.query_row(
        "SELECT tool FROM audit_log WHERE host = ?1 AND timestamp < ?2
         ORDER BY sequence_number DESC LIMIT 1",
        rusqlite::params![host, timestamp],
        |row| row.get(0),
    )
    .optional()
    .context("reading previous tool for host")
}

/// Count of entries for (tool, host) within the trailing window.
pub fn count_in_window(
    conn: &Connection,
    tool: &str,
    host: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM audit_log
         WHERE tool = ?1 AND host = ?2 AND timestamp > ?3 AND timestamp <= ?4",
        rusqlite::params![tool, host, start_ms, end_ms],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Count of entries for (tool, host) in the window whose downstream
/// interaction terminated in error or timeout.
pub fn error_count_in_window(
    conn: &Connection,
    tool: &str,
    host: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM audit_log
         WHERE tool = ?1 AND host = ?2 AND timestamp > ?3 AND timestamp <= ?4
           AND response_status IN ('error', 'timeout')",
        rusqlite::params![tool, host, start_ms, end_ms],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}
