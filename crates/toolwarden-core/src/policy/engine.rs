//! The 7-step policy evaluation order.
//!
//! 1. circuit-breaker gate, 2. quarantine gate, 3. mode gate (lockdown),
//! 4. rule match (first match wins, confirmation tokens consumed here),
//! 5. rate limit for the matched rule, 6. anomaly fold-in, 7. mode default.
//!
//! The ordering is load-bearing: rules must never be able to override the
//! safety gates ahead of them, which is why the gates short-circuit before
//! any rule is read.

use anyhow::Result;
use rusqlite::Connection;
use tracing::debug;

use super::rule::{self, Rule};
use super::{PolicyContext, PolicyVerdict, RiskFactor, RuleAction};
use crate::anomaly::AnomalyScore;
use crate::arguments;
use crate::breaker;
use crate::config::Mode;
use crate::confirm;
use crate::quarantine::{self, Scope};
use crate::ratelimit::{self, BucketDecision, BucketKey};

/// Engine tunables, sourced from [`crate::config::Settings`] at startup.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: i64,
    pub token_ttl_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: breaker::DEFAULT_FAILURE_THRESHOLD,
            breaker_cooldown_ms: breaker::DEFAULT_COOLDOWN_MS,
            token_ttl_ms: confirm::DEFAULT_TTL_MS,
        }
    }
}

/// Evaluates one request at a time. Stateless apart from its tunables; every
/// read goes to the store so admin changes take effect on the next request.
pub struct PolicyEngine {
    config: EngineConfig,
}

impl PolicyEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Run the full evaluation order for `ctx` under `mode`.
    ///
    /// Must be called inside the caller's store transaction: token
    /// consumption, bucket updates, and the half-open breaker transition are
    /// writes that have to commit atomically with the audit entry.
    pub fn evaluate(
        &self,
        conn: &Connection,
        ctx: &PolicyContext,
        mode: Mode,
        anomaly: Option<&AnomalyScore>,
        extra_factors: &[RiskFactor],
    ) -> Result<PolicyVerdict> {
        let now_ms = ctx.timestamp.timestamp_millis();

        // Step 1: circuit-breaker gate.
        let state = breaker::effective_state(conn, &ctx.host, now_ms, self.config.breaker_cooldown_ms)?;
        if state == breaker::BreakerState::Open {
            let retry_after =
                breaker::retry_after_seconds(conn, &ctx.host, now_ms, self.config.breaker_cooldown_ms)?;
            let mut verdict = PolicyVerdict::deny(
                format!("circuit breaker open for host '{}'", ctx.host),
                100.0,
            );
            verdict.retry_after_seconds = Some(retry_after);
            return Ok(verdict);
        }

        // Step 2: quarantine gate, host then tool then agent. Exact,
        // case-sensitive matching.
        for (scope, target) in [
            (Scope::Host, ctx.host.as_str()),
            (Scope::Tool, ctx.tool.as_str()),
            (Scope::Agent, ctx.agent.as_str()),
        ] {
            if let Some(entry) = quarantine::lookup_active(conn, scope, target, now_ms)? {
                return Ok(PolicyVerdict::deny(
                    format!("{} '{target}' is quarantined: {}", scope.as_str(), entry.reason),
                    100.0,
                ));
            }
        }

        // Step 3: mode gate. Lockdown admits health/status tools only.
        if mode == Mode::Lockdown {
            if ctx.tool.contains("health") || ctx.tool.contains("status") {
                return Ok(PolicyVerdict::allow(format!(
                    "lockdown mode: health/status tool '{}' permitted",
                    ctx.tool
                )));
            }
            return Ok(PolicyVerdict::deny(
                format!("lockdown mode active: tool '{}' is not a health/status tool", ctx.tool),
                100.0,
            ));
        }

        // Step 4: rule match, priority order, first match wins.
        let canonical_args = arguments::canonical_json(&ctx.arguments);
        let rules = rule::load_enabled(conn)?;
        for matched in rules.iter().filter(|r| r.matches(ctx, &canonical_args)) {
            debug!(rule = %matched.name, action = %matched.action.as_str(), "rule matched");
            return self.finish_rule_match(conn, ctx, matched, anomaly, extra_factors, now_ms);
        }

        // Step 7: no rule matched; the mode decides.
        let verdict = match mode {
            Mode::SilentAllow => PolicyVerdict::allow("no rule matched (silent-allow mode)"),
            Mode::SilentDeny => PolicyVerdict::deny("no rule matched (silent-deny mode)", 0.0),
            Mode::Alert => self.ask_verdict(conn, ctx, None, "no rule matched: confirmation required", now_ms)?,
            // Handled at step 3.
            Mode::Lockdown => unreachable!("lockdown short-circuits at the mode gate"),
        };
        Ok(self.fold_risk(verdict, anomaly, extra_factors))
    }

    /// Steps 4b-6 once a rule has matched: token consumption, the rule's
    /// rate limit, and the anomaly fold-in.
    fn finish_rule_match(
        &self,
        conn: &Connection,
        ctx: &PolicyContext,
        matched: &Rule,
        anomaly: Option<&AnomalyScore>,
        extra_factors: &[RiskFactor],
        now_ms: i64,
    ) -> Result<PolicyVerdict> {
        // Step 5: the bucket belongs to the rule, so the rate check comes
        // after the match.
        if let Some(ref spec) = matched.rate_limit {
            let key = BucketKey {
                rule_id: &matched.id,
                tool: &ctx.tool,
                host: &ctx.host,
                agent: &ctx.agent,
            };
            if let BucketDecision::Throttled { reset_at } = ratelimit::check(conn, &key, spec, now_ms)? {
                let mut verdict = PolicyVerdict::deny(
                    format!("rate limited by rule '{}'", matched.name),
                    0.0,
                );
                verdict.matched_rule_id = Some(matched.id.clone());
                verdict.retry_after_seconds = Some(((reset_at - now_ms).max(0) as u64).div_ceil(1000));
                return Ok(self.fold_risk(verdict, anomaly, extra_factors));
            }
        }

        let verdict = match matched.action {
            RuleAction::Allow => {
                let mut v = PolicyVerdict::allow(format!("matched rule '{}'", matched.name));
                v.matched_rule_id = Some(matched.id.clone());
                v
            }
            RuleAction::Deny => {
                let mut v = PolicyVerdict::deny(format!("denied by rule '{}'", matched.name), 0.0);
                v.matched_rule_id = Some(matched.id.clone());
                v
            }
            RuleAction::LogOnly => PolicyVerdict {
                allowed: true,
                action: RuleAction::LogOnly,
                reason: format!("log-only rule '{}'", matched.name),
                matched_rule_id: Some(matched.id.clone()),
                risk_score: 0.0,
                risk_factors: Vec::new(),
                requires_confirmation: false,
                confirmation_token: None,
                retry_after_seconds: None,
            },
            RuleAction::Ask => {
                let mut v = self.ask_verdict(
                    conn,
                    ctx,
                    Some(matched),
                    &format!("confirmation required by rule '{}'", matched.name),
                    now_ms,
                )?;
                v.matched_rule_id = Some(matched.id.clone());
                v
            }
        };

        Ok(self.fold_risk(verdict, anomaly, extra_factors))
    }

    /// Build an `ask` verdict: consume a presented token if it validates,
    /// otherwise mint a fresh one.
    fn ask_verdict(
        &self,
        conn: &Connection,
        ctx: &PolicyContext,
        matched: Option<&Rule>,
        reason: &str,
        now_ms: i64,
    ) -> Result<PolicyVerdict> {
        if let Some(ref token) = ctx.confirmation_token {
            if confirm::validate_and_consume(conn, token, &ctx.tool, &ctx.host, &ctx.agent, now_ms)? {
                let mut v = PolicyVerdict::allow("confirmed via token");
                v.matched_rule_id = matched.map(|r| r.id.clone());
                return Ok(v);
            }
            debug!(tool = %ctx.tool, host = %ctx.host, "presented confirmation token did not validate");
        }

        let redacted = arguments::canonical_json(&arguments::redact(&ctx.arguments));
        let token = confirm::mint(
            conn,
            &ctx.tool,
            &ctx.host,
            &ctx.agent,
            &redacted,
            now_ms,
            self.config.token_ttl_ms,
        )?;

        Ok(PolicyVerdict {
            allowed: false,
            action: RuleAction::Ask,
            reason: reason.to_string(),
            matched_rule_id: None,
            risk_score: 0.0,
            risk_factors: Vec::new(),
            requires_confirmation: true,
            confirmation_token: Some(token),
            retry_after_seconds: None,
        })
    }

    /// Step 6: anomaly fold-in. The composite is mixed into the risk score
    /// as `0.6 * anomaly + 0.4 * mean(other factor scores)` (pure anomaly
    /// when no other factors exist). Anomaly never flips the decision.
    fn fold_risk(
        &self,
        mut verdict: PolicyVerdict,
        anomaly: Option<&AnomalyScore>,
        extra_factors: &[RiskFactor],
    ) -> PolicyVerdict {
        let mut factors: Vec<RiskFactor> = extra_factors.to_vec();

        verdict.risk_score = match anomaly {
            Some(score) => {
                factors.extend(score.risk_factors());
                if extra_factors.is_empty() {
                    score.composite
                } else {
                    let mean: f64 = extra_factors.iter().map(|f| f.score).sum::<f64>()
                        / extra_factors.len() as f64;
                    0.6 * score.composite + 0.4 * mean
                }
            }
            None if !factors.is_empty() => {
                factors.iter().map(|f| f.score).sum::<f64>() / factors.len() as f64
            }
            None => verdict.risk_score,
        };

        verdict.risk_factors = factors;
        verdict
    }
}
