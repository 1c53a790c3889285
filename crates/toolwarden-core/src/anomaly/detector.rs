//! The five-component anomaly scorer.
//!
//! [`evaluate`] is read-only: it derives the current request's statistics
//! from the audit log and scores them against the stored baseline. The
//! baseline itself is only updated afterwards via [`record`], so a request
//! is never scored against a baseline it already influenced.

use anyhow::Result;
use rusqlite::Connection;

use super::baseline::{self, Baseline};
use super::{AnomalyComponent, AnomalyScore};
use crate::arguments;
use crate::audit::log as audit_log;
use crate::policy::PolicyContext;

const HOUR_MS: i64 = 3_600_000;

const WEIGHT_FREQUENCY: f64 = 0.25;
const WEIGHT_TEMPORAL: f64 = 0.15;
const WEIGHT_ARGUMENT_NOVELTY: f64 = 0.30;
const WEIGHT_SEQUENCE: f64 = 0.15;
const WEIGHT_ERROR_RATE: f64 = 0.15;

/// The per-request statistics that feed both scoring and the subsequent
/// baseline update.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Requests for this (tool, host) in the trailing hour, this one included.
    pub rate_per_hour: f64,
    /// Hour of day (UTC) the request arrived in.
    pub hour_of_day: usize,
    /// Fingerprint of the redacted canonical arguments.
    pub fingerprint: String,
    /// "previous→current" tool transition for this host, if any.
    pub bigram: Option<String>,
    /// Fraction of this pair's trailing-hour requests that ended in error
    /// or timeout.
    pub error_rate: f64,
}

/// Gather statistics for `ctx` and score them against the baseline.
///
/// Returns `None` for the score while the baseline is absent or still
/// warming up (fewer than ten samples); the observation is always returned
/// so the caller can feed the post-decision baseline update.
pub fn evaluate(conn: &Connection, ctx: &PolicyContext) -> Result<(Option<AnomalyScore>, Observation)> {
    use chrono::Timelike;

    let now_ms = ctx.timestamp.timestamp_millis();
    let window_start = now_ms - HOUR_MS;

    let prior_ops = audit_log::count_in_window(conn, &ctx.tool, &ctx.host, window_start, now_ms)?;
    let errors = audit_log::error_count_in_window(conn, &ctx.tool, &ctx.host, window_start, now_ms)?;
    let total_ops = prior_ops + 1;
    let error_rate = if prior_ops > 0 { errors as f64 / prior_ops as f64 } else { 0.0 };

    let redacted = arguments::redact(&ctx.arguments);
    let fingerprint = arguments::fingerprint(&redacted);

    let bigram = audit_log::previous_tool_for_host(conn, &ctx.host, now_ms)?
        .map(|prev| format!("{prev}→{}", ctx.tool));

    let observation = Observation {
        rate_per_hour: total_ops as f64,
        hour_of_day: ctx.timestamp.hour() as usize,
        fingerprint,
        bigram,
        error_rate,
    };

    let Some(baseline) = baseline::load(conn, &ctx.tool, &ctx.host)? else {
        return Ok((None, observation));
    };
    if baseline.warming_up() {
        return Ok((None, observation));
    }

    let score = score_against(&baseline, &observation);
    Ok((Some(score), observation))
}

/// Score an observation against an established baseline.
pub fn score_against(baseline: &Baseline, obs: &Observation) -> AnomalyScore {
    let components = vec![
        frequency_component(baseline, obs),
        temporal_component(baseline, obs),
        novelty_component(baseline, obs),
        sequence_component(baseline, obs),
        error_rate_component(baseline, obs),
    ];
    let composite = components.iter().map(|c| c.score * c.weight).sum();
    AnomalyScore { composite, components }
}

fn frequency_component(baseline: &Baseline, obs: &Observation) -> AnomalyComponent {
    let (score, details) = zscore_scaled(
        obs.rate_per_hour,
        baseline.frequency_mean,
        baseline.frequency_stddev,
        "call rate",
        "ops/hour",
    );
    AnomalyComponent { name: "frequency", score, weight: WEIGHT_FREQUENCY, details }
}

fn temporal_component(baseline: &Baseline, obs: &Observation) -> AnomalyComponent {
    let p = baseline
        .hourly_distribution
        .get(obs.hour_of_day)
        .copied()
        .unwrap_or(0.0);
    let score = if p < 0.01 {
        100.0
    } else if p < 0.05 {
        75.0
    } else if p < 0.10 {
        50.0
    } else {
        0.0
    };
    AnomalyComponent {
        name: "temporal",
        score,
        weight: WEIGHT_TEMPORAL,
        details: format!(
            "hour {:02}:00 carries probability {:.3} in the baseline",
            obs.hour_of_day, p
        ),
    }
}

fn novelty_component(baseline: &Baseline, obs: &Observation) -> AnomalyComponent {
    let known = baseline.argument_fingerprints.iter().any(|fp| fp == &obs.fingerprint);
    AnomalyComponent {
        name: "argument_novelty",
        score: if known { 0.0 } else { 100.0 },
        weight: WEIGHT_ARGUMENT_NOVELTY,
        details: if known {
            "argument shape previously observed for this (tool, host)".to_string()
        } else {
            "argument shape never observed for this (tool, host)".to_string()
        },
    }
}

fn sequence_component(baseline: &Baseline, obs: &Observation) -> AnomalyComponent {
    let Some(ref bigram) = obs.bigram else {
        return AnomalyComponent {
            name: "sequence",
            score: 0.0,
            weight: WEIGHT_SEQUENCE,
            details: "no previous tool call for this host".to_string(),
        };
    };
    let prob = baseline.tool_bigrams.get(bigram).copied().unwrap_or(0.0);
    let score = if prob <= 0.0 {
        100.0
    } else if prob < 0.01 {
        75.0
    } else if prob < 0.05 {
        50.0
    } else {
        0.0
    };
    AnomalyComponent {
        name: "sequence",
        score,
        weight: WEIGHT_SEQUENCE,
        details: format!("transition '{bigram}' has baseline frequency {prob:.4}"),
    }
}

fn error_rate_component(baseline: &Baseline, obs: &Observation) -> AnomalyComponent {
    let (score, details) = zscore_scaled(
        obs.error_rate,
        baseline.error_rate_mean,
        baseline.error_rate_stddev,
        "error rate",
        "errors/op",
    );
    AnomalyComponent { name: "error_rate", score, weight: WEIGHT_ERROR_RATE, details }
}

/// `min(100, 100 * z / 3)` over a z-score, floored at zero; zero when the
/// baseline has no spread.
fn zscore_scaled(x: f64, mean: f64, stddev: f64, label: &str, unit: &str) -> (f64, String) {
    if stddev <= 0.0 {
        return (0.0, format!("{label} baseline has no spread ({mean:.2} {unit})"));
    }
    let z = (x - mean) / stddev;
    let score = (100.0 * z / 3.0).clamp(0.0, 100.0);
    (score, format!("{label} {x:.2} {unit} vs baseline {mean:.2}±{stddev:.2} (z={z:.1})"))
}

/// Fold the observation into the stored baseline (creating it on first
/// sight) after the decision has been made and audited.
pub fn record(conn: &Connection, tool: &str, host: &str, obs: &Observation, now_ms: i64) -> Result<()> {
    let mut baseline =
        baseline::load(conn, tool, host)?.unwrap_or_else(|| Baseline::new(tool, host));
    baseline.observe(
        obs.rate_per_hour,
        obs.hour_of_day,
        &obs.fingerprint,
        obs.bigram.as_deref(),
        obs.error_rate,
        now_ms,
    );
    baseline::save(conn, &baseline)
}
