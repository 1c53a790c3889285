//! Append-only, hash-chained audit log.
//!
//! Every decision is committed here before any side effect is attempted
//! (write-ahead). Each entry's hash covers the previous entry's hash, so any
//! edit, insertion, or deletion is detectable by [`verify`]. The two
//! late-completion fields (`response_status`, `error_message`) are excluded
//! from the hash so filling them in after the downstream replies does not
//! invalidate the chain.

pub mod log;
pub mod query;
pub mod verify;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::config::Mode;
use crate::policy::{RiskFactor, RuleAction};

/// Chain sentinel for the first entry's `previous_hash`.
pub const GENESIS: &str = "GENESIS";

/// The outcome recorded for one decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditVerdict {
    Allowed,
    Denied,
    Asked,
}

impl AuditVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditVerdict::Allowed => "allowed",
            AuditVerdict::Denied => "denied",
            AuditVerdict::Asked => "asked",
        }
    }

    pub fn parse(s: &str) -> Result<AuditVerdict> {
        match s {
            "allowed" => Ok(AuditVerdict::Allowed),
            "denied" => Ok(AuditVerdict::Denied),
            "asked" => Ok(AuditVerdict::Asked),
            other => bail!("unknown audit verdict '{other}'"),
        }
    }
}

/// Terminal status of the downstream interaction, filled after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<ResponseStatus> {
        match s {
            "success" => Ok(ResponseStatus::Success),
            "error" => Ok(ResponseStatus::Error),
            "timeout" => Ok(ResponseStatus::Timeout),
            other => bail!("unknown response status '{other}'"),
        }
    }
}

/// One audit entry as persisted.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Dense, strictly increasing, starts at 1.
    pub sequence_number: i64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub tool: String,
    pub host: String,
    pub agent: String,
    /// Redacted arguments as canonical JSON.
    pub arguments: String,
    pub verdict: AuditVerdict,
    pub action: RuleAction,
    pub matched_rule_id: Option<String>,
    pub risk_score: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub mode: Mode,
    pub response_status: Option<ResponseStatus>,
    pub error_message: Option<String>,
    pub hash: String,
    pub previous_hash: String,
}

/// Compute an entry's chain hash.
///
/// The input is `seq|ts|tool|host|agent|verdict|previous_hash` with the
/// literal separator byte `|`, decimal integers, no whitespace. This is the
/// wire format of the chain: it must stay byte-identical across
/// implementations for cross-verification.
pub fn entry_hash(
    sequence_number: i64,
    timestamp: i64,
    tool: &str,
    host: &str,
    agent: &str,
    verdict: AuditVerdict,
    previous_hash: &str,
) -> String {
    let input = format!(
        "{sequence_number}|{timestamp}|{tool}|{host}|{agent}|{}|{previous_hash}",
        verdict.as_str()
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
