//! Tamper detection: walk the chain and recompute every link.

use anyhow::{Context, Result};
use rusqlite::Connection;

use super::{entry_hash, AuditVerdict, GENESIS};

/// One detected break in the chain.
#[derive(Debug, Clone)]
pub struct ChainBreak {
    pub sequence_number: i64,
    pub expected: String,
    pub actual: String,
}

/// Result of a full chain verification.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub valid: bool,
    pub total_entries: u64,
    pub broken: Vec<ChainBreak>,
}

/// Walk all entries in sequence order and verify gaplessness, linkage, and
/// stored hashes. Every break is reported; verification never stops early.
///
/// Single pass over the table, no per-entry queries -- 10k entries verify in
/// well under the 100 ms target.
pub fn verify(conn: &Connection) -> Result<VerifyReport> {
    let mut stmt = conn
        .prepare(
            "SELECT sequence_number, timestamp, tool, host, agent, verdict, hash, previous_hash
             FROM audit_log ORDER BY sequence_number ASC",
        )
        .context("preparing chain verification scan")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut broken = Vec::new();
    let mut expected_seq: i64 = 1;
    let mut expected_prev = GENESIS.to_string();

    for (seq, ts, tool, host, agent, verdict_raw, hash, previous_hash) in &rows {
        if *seq != expected_seq {
            broken.push(ChainBreak {
                sequence_number: *seq,
                expected: format!("sequence {expected_seq}"),
                actual: format!("sequence {seq}"),
            });
            // Resynchronize so later breaks are still reported individually.
            expected_seq = *seq;
        }

        if *previous_hash != expected_prev {
            broken.push(ChainBreak {
                sequence_number: *seq,
                expected: expected_prev.clone(),
                actual: previous_hash.clone(),
            });
        }

        let verdict = AuditVerdict::parse(verdict_raw)
            .with_context(|| format!("audit entry {seq}"))?;
        let recomputed = entry_hash(*seq, *ts, tool, host, agent, verdict, previous_hash);
        if recomputed != *hash {
            broken.push(ChainBreak {
                sequence_number: *seq,
                expected: recomputed,
                actual: hash.clone(),
            });
        }

        expected_prev = hash.clone();
        expected_seq += 1;
    }

    Ok(VerifyReport {
        valid: broken.is_empty(),
        total_entries: rows.len() as u64,
        broken,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::log::append;
    use crate::config::Mode;
    use crate::policy::{PolicyVerdict, RuleAction};
    use crate::store::Store;

    const T0: i64 = 1_700_000_000_000;

    fn allow_verdict() -> PolicyVerdict {
        PolicyVerdict {
            allowed: true,
            action: RuleAction::Allow,
            reason: "ok".to_string(),
            matched_rule_id: None,
            risk_score: 0.0,
            risk_factors: Vec::new(),
            requires_confirmation: false,
            confirmation_token: None,
            retry_after_seconds: None,
        }
    }

    fn seed(store: &Store, n: i64) {
        let conn = store.conn();
        for i in 0..n {
            append(&conn, T0 + i, "tool", "host", "agent", "{}", &allow_verdict(), Mode::SilentAllow).unwrap();
        }
    }

    #[test]
    fn empty_log_is_valid() {
        let store = Store::open_in_memory().unwrap();
        let report = verify(&store.conn()).unwrap();
        assert!(report.valid);
        assert_eq!(report.total_entries, 0);
    }

    #[test]
    fn intact_chain_verifies() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 5);
        let report = verify(&store.conn()).unwrap();
        assert!(report.valid);
        assert_eq!(report.total_entries, 5);
        assert!(report.broken.is_empty());
    }

    #[test]
    fn mutated_field_breaks_that_entry() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 5);
        let conn = store.conn();
        conn.execute("UPDATE audit_log SET tool = 'tampered' WHERE sequence_number = 3", [])
            .unwrap();

        let report = verify(&conn).unwrap();
        assert!(!report.valid);
        assert!(report.broken.iter().any(|b| b.sequence_number == 3));
    }

    #[test]
    fn mutated_verdict_breaks_that_entry() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 3);
        let conn = store.conn();
        conn.execute("UPDATE audit_log SET verdict = 'denied' WHERE sequence_number = 2", [])
            .unwrap();

        let report = verify(&conn).unwrap();
        assert!(!report.valid);
        assert!(report.broken.iter().any(|b| b.sequence_number == 2));
    }

    #[test]
    fn deleted_entry_breaks_the_chain() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 5);
        let conn = store.conn();
        conn.execute("DELETE FROM audit_log WHERE sequence_number = 3", []).unwrap();

        let report = verify(&conn).unwrap();
        assert!(!report.valid);
        // Gap at 4 plus a linkage mismatch.
        assert!(report.broken.iter().any(|b| b.sequence_number == 4));
        assert_eq!(report.total_entries, 4);
    }

    #[test]
    fn deleted_head_breaks_genesis_link() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 3);
        let conn = store.conn();
        conn.execute("DELETE FROM audit_log WHERE sequence_number = 1", []).unwrap();

        let report = verify(&conn).unwrap();
        assert!(!report.valid);
        assert!(report.broken.iter().any(|b| b.sequence_number == 2));
    }

    #[test]
    fn late_status_update_does_not_break_the_chain() {
        use crate::audit::log::record_response;
        use crate::audit::ResponseStatus;

        let store = Store::open_in_memory().unwrap();
        seed(&store, 4);
        let conn = store.conn();
        record_response(&conn, 2, ResponseStatus::Error, Some("downstream error")).unwrap();
        record_response(&conn, 3, ResponseStatus::Success, None).unwrap();

        let report = verify(&conn).unwrap();
        assert!(report.valid);
    }

    #[test]
    fn rewritten_hash_still_detected_via_linkage() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 4);
        let conn = store.conn();
        // Attacker edits entry 2 and recomputes its hash, but cannot fix
        // entry 3's previous_hash without breaking it in turn.
        let prev: String = conn
            .query_row("SELECT previous_hash FROM audit_log WHERE sequence_number = 2", [], |r| r.get(0))
            .unwrap();
        let fixed = entry_hash(2, T0 + 1, "tampered", "host", "agent", AuditVerdict::Allowed, &prev);
        conn.execute(
            "UPDATE audit_log SET tool = 'tampered', hash = ?1 WHERE sequence_number = 2",
            [&fixed],
        )
        .unwrap();

        let report = verify(&conn).unwrap();
        assert!(!report.valid);
        assert!(report.broken.iter().any(|b| b.sequence_number == 3));
    }

    #[test]
    fn verify_10k_entries_under_100ms() {
        let store = Store::open_in_memory().unwrap();
        seed(&store, 10_000);
        let conn = store.conn();

        let start = std::time::Instant::now();
        let report = verify(&conn).unwrap();
        let elapsed = start.elapsed();

        assert!(report.valid);
        assert_eq!(report.total_entries, 10_000);
        // Debug builds are far slower than release; keep a relaxed bound here
        // and verify the real 100 ms target with `cargo test --release`.
        let threshold_ms = if cfg!(debug_assertions) { 2_000 } else { 100 };
        assert!(
            elapsed.as_millis() < threshold_ms,
            "verification took {}ms, exceeds {}ms target",
            elapsed.as_millis(),
            threshold_ms
        );
    }
}
