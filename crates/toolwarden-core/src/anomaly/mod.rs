//! Statistical anomaly detection over per-(tool, host) baselines.
//!
//! Five weighted components -- call frequency, hour-of-day, argument
//! novelty, tool sequence, and error rate -- each score 0..100 and combine
//! into a composite the policy engine folds into the verdict's risk
//! annotation. Anomaly scores never change an allow/deny decision by
//! themselves; operators who want enforcement define rules for it.

pub mod baseline;
pub mod detector;

use crate::policy::RiskFactor;

pub use baseline::Baseline;
pub use detector::{evaluate, record, Observation};

/// Score threshold above which a component becomes a named risk factor.
pub const RISK_FACTOR_THRESHOLD: f64 = 30.0;

/// Per-component anomaly score.
#[derive(Debug, Clone)]
pub struct AnomalyComponent {
    pub name: &'static str,
    pub score: f64,
    pub weight: f64,
    pub details: String,
}

/// Composite anomaly score for one request.
#[derive(Debug, Clone)]
pub struct AnomalyScore {
    /// Weighted sum of the components, 0..100.
    pub composite: f64,
    pub components: Vec<AnomalyComponent>,
}

impl AnomalyScore {
    /// Convert components above the reporting threshold into risk factors.
    pub fn risk_factors(&self) -> Vec<RiskFactor> {
        self.components
            .iter()
            .filter(|c| c.score > RISK_FACTOR_THRESHOLD)
            .map(|c| RiskFactor {
                factor: c.name.to_string(),
                score: c.score,
                details: c.details.clone(),
            })
            .collect()
    }
}
