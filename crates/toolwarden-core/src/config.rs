//! Sentinel mode, anomaly thresholds, and file-based settings.
//!
//! The mode and thresholds live in the store's `config` key/value table so
//! they survive restarts and take effect on the very next request. The TOML
//! settings file covers everything decided at process start (paths, timeouts,
//! webhook URL).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Process-global policy posture. Read on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Observe: unmatched requests are allowed.
    SilentAllow,
    /// Interactive: unmatched requests require confirmation.
    Alert,
    /// Enforce: unmatched requests are denied.
    SilentDeny,
    /// Only health/status tools pass.
    Lockdown,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::SilentAllow => "silent-allow",
            Mode::Alert => "alert",
            Mode::SilentDeny => "silent-deny",
            Mode::Lockdown => "lockdown",
        }
    }

    /// Parse a persisted mode string. Anything outside the four enumerated
    /// values is a hard error: the engine must never fall through to a
    /// permissive default on a corrupt or unknown mode.
    pub fn parse(s: &str) -> Result<Mode> {
        match s {
            "silent-allow" => Ok(Mode::SilentAllow),
            "alert" => Ok(Mode::Alert),
            "silent-deny" => Ok(Mode::SilentDeny),
            "lockdown" => Ok(Mode::Lockdown),
            other => bail!("unknown sentinel mode '{other}', expected silent-allow/alert/silent-deny/lockdown"),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read a config value by key.
pub fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row("SELECT value FROM config WHERE key = ?1", [key], |row| row.get(0))
        .optional()
        .with_context(|| format!("reading config key '{key}'"))
}

/// Write a config value by key.
pub fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [key, value],
    )?;
    Ok(())
}

/// Load the current mode. Missing or unknown values are hard errors.
pub fn load_mode(conn: &Connection) -> Result<Mode> {
    let raw = get_value(conn, "mode")?
        .ok_or_else(|| anyhow::anyhow!("sentinel mode is not configured"))?;
    Mode::parse(&raw)
}

/// Persist the mode.
pub fn set_mode(conn: &Connection, mode: Mode) -> Result<()> {
    set_value(conn, "mode", mode.as_str())
}

/// The four anomaly thresholds used to tier alert severity.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self { low: 25.0, medium: 50.0, high: 75.0, critical: 90.0 }
    }
}

/// Load the anomaly thresholds from the config table.
pub fn load_thresholds(conn: &Connection) -> Result<AnomalyThresholds> {
    let read = |key: &str, default: f64| -> Result<f64> {
        match get_value(conn, key)? {
            Some(raw) => raw
                .parse::<f64>()
                .with_context(|| format!("config key '{key}' is not a number: '{raw}'")),
            None => Ok(default),
        }
    };
    let defaults = AnomalyThresholds::default();
    Ok(AnomalyThresholds {
        low: read("anomaly_threshold_low", defaults.low)?,
        medium: read("anomaly_threshold_medium", defaults.medium)?,
        high: read("anomaly_threshold_high", defaults.high)?,
        critical: read("anomaly_threshold_critical", defaults.critical)?,
    })
}

/// Process-start settings, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the sentinel database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Milliseconds to wait for a downstream reply before synthesizing a timeout.
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,

    /// Consecutive failures before a host's circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_failure_threshold: u32,

    /// Seconds a circuit stays open before a half-open probe is admitted.
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Confirmation token time-to-live in seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Hours a rate-limit bucket may sit untouched before cleanup.
    #[serde(default = "default_bucket_max_idle_hours")]
    pub bucket_max_idle_hours: u64,

    /// Optional webhook URL for alert notifications (localhost only).
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".local/share/toolwarden/sentinel.db")
}

fn default_forward_timeout_ms() -> u64 {
    15_000
}

fn default_breaker_threshold() -> u32 {
    2
}

fn default_breaker_cooldown_secs() -> u64 {
    120
}

fn default_token_ttl_secs() -> u64 {
    300
}

fn default_bucket_max_idle_hours() -> u64 {
    24
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            forward_timeout_ms: default_forward_timeout_ms(),
            breaker_failure_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            token_ttl_secs: default_token_ttl_secs(),
            bucket_max_idle_hours: default_bucket_max_idle_hours(),
            alert_webhook_url: None,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("parsing settings file {}", path.display()))
    }
}
