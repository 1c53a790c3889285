//! Policy types and the decision engine.
//!
//! The engine evaluates one [`PolicyContext`] at a time through a strict
//! gate order -- circuit breaker, quarantine, lockdown, rules, rate limit --
//! and returns a [`PolicyVerdict`]. Later gates can never override earlier
//! safety gates.

pub mod engine;
pub mod matcher;
pub mod rule;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use engine::{EngineConfig, PolicyEngine};
pub use rule::{RateLimitSpec, Rule, Schedule};

/// What a matched rule (or a mode default) does with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
    Ask,
    LogOnly,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Allow => "allow",
            RuleAction::Deny => "deny",
            RuleAction::Ask => "ask",
            RuleAction::LogOnly => "log-only",
        }
    }

    pub fn parse(s: &str) -> Result<RuleAction> {
        match s {
            "allow" => Ok(RuleAction::Allow),
            "deny" => Ok(RuleAction::Deny),
            "ask" => Ok(RuleAction::Ask),
            "log-only" => Ok(RuleAction::LogOnly),
            other => bail!("unknown rule action '{other}', expected allow/deny/ask/log-only"),
        }
    }
}

/// One contribution to a verdict's risk score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactor {
    pub factor: String,
    pub score: f64,
    pub details: String,
}

/// The 5-tuple describing one inbound tool call.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub arguments: Value,
    pub timestamp: DateTime<Utc>,
    /// Bearer token presented on a retry of a previously-asked request.
    pub confirmation_token: Option<String>,
}

impl PolicyContext {
    pub fn new(tool: impl Into<String>, host: impl Into<String>, agent: impl Into<String>, arguments: Value) -> Self {
        Self {
            tool: tool.into(),
            host: host.into(),
            agent: agent.into(),
            arguments,
            timestamp: Utc::now(),
            confirmation_token: None,
        }
    }

    pub fn with_confirmation_token(mut self, token: impl Into<String>) -> Self {
        self.confirmation_token = Some(token.into());
        self
    }
}

/// The engine's decision record for one context.
#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub allowed: bool,
    pub action: RuleAction,
    pub reason: String,
    pub matched_rule_id: Option<String>,
    pub risk_score: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub requires_confirmation: bool,
    /// Freshly minted token when the verdict defers to the operator.
    pub confirmation_token: Option<String>,
    /// Seconds until a throttled or circuit-broken request may be retried.
    pub retry_after_seconds: Option<u64>,
}

impl PolicyVerdict {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            action: RuleAction::Allow,
            reason: reason.into(),
            matched_rule_id: None,
            risk_score: 0.0,
            risk_factors: Vec::new(),
            requires_confirmation: false,
            confirmation_token: None,
            retry_after_seconds: None,
        }
    }

    fn deny(reason: impl Into<String>, risk_score: f64) -> Self {
        Self {
            allowed: false,
            action: RuleAction::Deny,
            reason: reason.into(),
            matched_rule_id: None,
            risk_score,
            risk_factors: Vec::new(),
            requires_confirmation: false,
            confirmation_token: None,
            retry_after_seconds: None,
        }
    }
}
