//! Per-(tool, host) behavioral baselines.
//!
//! Baselines are updated after each observation with an exponentially
//! weighted moving average (alpha = 0.1) for the rate metrics and Welford's
//! online algorithm for their variance, which stays numerically stable where
//! the naive sum-of-squares formula catastrophically cancels. Negative
//! variance from floating-point drift is clamped to zero before the square
//! root.

use std::collections::HashMap;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};

/// EWMA smoothing factor: new data gets 10% influence.
pub const EWMA_ALPHA: f64 = 0.1;

/// Bound on the argument fingerprint FIFO.
pub const MAX_FINGERPRINTS: usize = 1000;

/// Observations required before any component scores non-zero.
pub const WARMUP_SAMPLES: u64 = 10;

/// Learned behavior for one (tool, host) pair.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub tool: String,
    pub host: String,
    /// Ops per hour.
    pub frequency_mean: f64,
    pub frequency_stddev: f64,
    frequency_m2: f64,
    /// Probability of a call landing in each hour of the day; sums to <= 1.
    pub hourly_distribution: Vec<f64>,
    /// FIFO set of the most recent argument hashes, bounded.
    pub argument_fingerprints: Vec<String>,
    /// "previous→current" tool transition frequencies, EWMA-smoothed.
    pub tool_bigrams: HashMap<String, f64>,
    pub error_rate_mean: f64,
    pub error_rate_stddev: f64,
    error_rate_m2: f64,
    pub last_updated: i64,
    pub sample_count: u64,
}

impl Baseline {
    pub fn new(tool: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            host: host.into(),
            frequency_mean: 0.0,
            frequency_stddev: 0.0,
            frequency_m2: 0.0,
            hourly_distribution: vec![0.0; 24],
            argument_fingerprints: Vec::new(),
            tool_bigrams: HashMap::new(),
            error_rate_mean: 0.0,
            error_rate_stddev: 0.0,
            error_rate_m2: 0.0,
            last_updated: 0,
            sample_count: 0,
        }
    }

    /// True while the baseline has too few samples to score against.
    pub fn warming_up(&self) -> bool {
        self.sample_count < WARMUP_SAMPLES
    }

    /// Fold one observation into the baseline.
    pub fn observe(
        &mut self,
        rate_per_hour: f64,
        hour_of_day: usize,
        fingerprint: &str,
        bigram: Option<&str>,
        error_rate: f64,
        now_ms: i64,
    ) {
        let prior_count = self.sample_count;
        self.sample_count += 1;

        ewma_welford(
            &mut self.frequency_mean,
            &mut self.frequency_m2,
            &mut self.frequency_stddev,
            rate_per_hour,
            self.sample_count,
        );
        ewma_welford(
            &mut self.error_rate_mean,
            &mut self.error_rate_m2,
            &mut self.error_rate_stddev,
            error_rate,
            self.sample_count,
        );

        // Renormalize the hour histogram against the new sample count.
        let n = prior_count as f64;
        for (h, p) in self.hourly_distribution.iter_mut().enumerate() {
            let hit = if h == hour_of_day { 1.0 } else { 0.0 };
            *p = (*p * n + hit) / (n + 1.0);
        }

        if !self.argument_fingerprints.iter().any(|fp| fp == fingerprint) {
            self.argument_fingerprints.push(fingerprint.to_string());
            if self.argument_fingerprints.len() > MAX_FINGERPRINTS {
                self.argument_fingerprints.remove(0);
            }
        }

        if let Some(bigram) = bigram {
            let prior = self.tool_bigrams.get(bigram).copied().unwrap_or(0.0);
            self.tool_bigrams
                .insert(bigram.to_string(), EWMA_ALPHA + (1.0 - EWMA_ALPHA) * prior);
        }

        self.last_updated = now_ms;
    }
}

/// EWMA mean with Welford variance tracking.
fn ewma_welford(mean: &mut f64, m2: &mut f64, stddev: &mut f64, x: f64, count: u64) {
    let delta = x - *mean;
    *mean = EWMA_ALPHA * x + (1.0 - EWMA_ALPHA) * *mean;
    let delta2 = x - *mean;
    *m2 += delta * delta2;
    let variance = if count > 1 {
        (*m2 / (count as f64 - 1.0)).max(0.0)
    } else {
        0.0
    };
    *stddev = variance.sqrt();
}

/// Load a baseline by (tool, host).
pub fn load(conn: &Connection, tool: &str, host: &str) -> Result<Option<Baseline>> {
    let raw = conn
        .query_row(
            "SELECT frequency_mean, frequency_stddev, frequency_m2, hourly_distribution,
                    argument_fingerprints, tool_bigrams, error_rate_mean, error_rate_stddev,
                    error_rate_m2, last_updated, sample_count
             FROM anomaly_baselines WHERE tool = ?1 AND host = ?2",
            rusqlite::params![tool, host],
            |row| {
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            },
        )
        .optional()
        .with_context(|| format!("loading baseline for ({tool}, {host})"))?;

    let Some((
        frequency_mean,
        frequency_stddev,
        frequency_m2,
        hourly,
        fingerprints,
        bigrams,
        error_rate_mean,
        error_rate_stddev,
        error_rate_m2,
        last_updated,
        sample_count,
    )) = raw
    else {
        return Ok(None);
    };

    Ok(Some(Baseline {
        tool: tool.to_string(),
        host: host.to_string(),
        frequency_mean,
        frequency_stddev,
        frequency_m2,
        hourly_distribution: serde_json::from_str(&hourly)
            .context("malformed hourly distribution")?,
        argument_fingerprints: serde_json::from_str(&fingerprints)
            .context("malformed argument fingerprints")?,
        tool_bigrams: serde_json::from_str(&bigrams).context("malformed tool bigrams")?,
        error_rate_mean,
        error_rate_stddev,
        error_rate_m2,
        last_updated,
        sample_count: sample_count as u64,
    }))
}

/// Upsert a baseline.
pub fn save(conn: &Connection, baseline: &Baseline) -> Result<()> {
    conn.execute(
        "INSERT INTO anomaly_baselines
             (tool, host, frequency_mean, frequency_stddev, frequency_m2, hourly_distribution,
              argument_fingerprints, tool_bigrams, error_rate_mean, error_rate_stddev,
              error_rate_m2, last_updated, sample_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(tool, host) DO UPDATE SET
             frequency_mean = excluded.frequency_mean,
             frequency_stddev = excluded.frequency_stddev,
             frequency_m2 = excluded.frequency_m2,
             hourly_distribution = excluded.hourly_distribution,
             argument_fingerprints = excluded.argument_fingerprints,
             tool_bigrams = excluded.tool_bigrams,
             error_rate_mean = excluded.error_rate_mean,
             error_rate_stddev = excluded.error_rate_stddev,
             error_rate_m2 = excluded.error_rate_m2,
             last_updated = excluded.last_updated,
             sample_count = excluded.sample_count",
        rusqlite::params![
            baseline.tool,
            baseline.host,
            baseline.frequency_mean,
            baseline.frequency_stddev,
            baseline.frequency_m2,
            serde_json::to_string(&baseline.hourly_distribution)?,
            serde_json::to_string(&baseline.argument_fingerprints)?,
            serde_json::to_string(&baseline.tool_bigrams)?,
            baseline.error_rate_mean,
            baseline.error_rate_stddev,
            baseline.error_rate_m2,
            baseline.last_updated,
            baseline.sample_count as i64,
        ],
    )
    .context("saving baseline")?;
    Ok(())
}
