//! Policy rule model, persistence, and predicate matching.
//!
//! Rules are read from the store on every evaluation (strong read
//! consistency; no caching beyond a single evaluation) ordered by priority
//! ascending, then creation time ascending. All predicates a rule specifies
//! must match for the rule to fire; the first matching rule wins.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::matcher::{pattern_cache, GlobMatcher, RegexMatcher};
use super::{PolicyContext, RuleAction};

/// Per-rule rate limit parameters. `window_seconds` is informational; the
/// bucket refills continuously at `refill_rate_per_sec`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub max_tokens: f64,
    pub window_seconds: u64,
    pub refill_rate_per_sec: f64,
}

/// Wall-clock window during which a rule is active.
///
/// `days` uses 0 = Sunday .. 6 = Saturday; `[start_hour, end_hour]` is
/// inclusive on both ends. The moment is evaluated in `timezone` (IANA name)
/// when set, otherwise in the system zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub days: Vec<u8>,
    pub start_hour: u8,
    pub end_hour: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Schedule {
    /// Whether `ts` falls inside this schedule.
    pub fn is_active(&self, ts: DateTime<Utc>) -> bool {
        let (day, hour) = match &self.timezone {
            Some(tz_name) => match tz_name.parse::<chrono_tz::Tz>() {
                Ok(tz) => {
                    let local = ts.with_timezone(&tz);
                    (local.weekday().num_days_from_sunday() as u8, local.hour() as u8)
                }
                Err(_) => {
                    warn!(timezone = %tz_name, "unparseable schedule timezone, rule treated as inactive");
                    return false;
                }
            },
            None => {
                let local = ts.with_timezone(&chrono::Local);
                (local.weekday().num_days_from_sunday() as u8, local.hour() as u8)
            }
        };
        self.days.contains(&day) && self.start_hour <= hour && hour <= self.end_hour
    }
}

/// An operator-defined policy entry.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    /// Smaller integer evaluates earlier.
    pub priority: i64,
    pub action: RuleAction,
    pub enabled: bool,
    pub tool_pattern: Option<String>,
    pub host_pattern: Option<String>,
    pub agent_pattern: Option<String>,
    pub argument_pattern: Option<String>,
    pub rate_limit: Option<RateLimitSpec>,
    pub schedule: Option<Schedule>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Rule {
    /// Build a rule with a fresh id and timestamps, no predicates.
    pub fn new(name: impl Into<String>, priority: i64, action: RuleAction) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            priority,
            action,
            enabled: true,
            tool_pattern: None,
            host_pattern: None,
            agent_pattern: None,
            argument_pattern: None,
            rate_limit: None,
            schedule: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether this rule matches the given context.
    ///
    /// `canonical_args` is the canonical JSON of `ctx.arguments`, computed
    /// once per evaluation by the caller.
    pub fn matches(&self, ctx: &PolicyContext, canonical_args: &str) -> bool {
        if let Some(ref pat) = self.tool_pattern {
            if !pattern_cache::glob_matches(pat, &ctx.tool) {
                return false;
            }
        }
        if let Some(ref pat) = self.host_pattern {
            if !pattern_cache::glob_matches(pat, &ctx.host) {
                return false;
            }
        }
        if let Some(ref pat) = self.agent_pattern {
            if !pattern_cache::glob_matches(pat, &ctx.agent) {
                return false;
            }
        }
        if let Some(ref pat) = self.argument_pattern {
            if !pattern_cache::regex_matches(pat, canonical_args) {
                return false;
            }
        }
        if let Some(ref schedule) = self.schedule {
            if !schedule.is_active(ctx.timestamp) {
                return false;
            }
        }
        true
    }
}

/// Validate a rule before it is written to the store.
pub fn validate(rule: &Rule) -> Result<()> {
    for pat in [&rule.tool_pattern, &rule.host_pattern, &rule.agent_pattern]
        .into_iter()
        .flatten()
    {
        GlobMatcher::new(pat).with_context(|| format!("rule '{}'", rule.name))?;
    }
    if let Some(ref pat) = rule.argument_pattern {
        RegexMatcher::new(pat).with_context(|| format!("rule '{}'", rule.name))?;
    }
    if let Some(ref rl) = rule.rate_limit {
        if rl.max_tokens <= 0.0 || rl.refill_rate_per_sec <= 0.0 {
            bail!("rule '{}': rate limit parameters must be positive", rule.name);
        }
    }
    if let Some(ref schedule) = rule.schedule {
        if schedule.start_hour > 23 || schedule.end_hour > 23 {
            bail!("rule '{}': schedule hours must be 0..=23", rule.name);
        }
        if schedule.days.is_empty() || schedule.days.iter().any(|d| *d > 6) {
            bail!("rule '{}': schedule days must be a non-empty subset of 0..=6", rule.name);
        }
        if let Some(ref tz) = schedule.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                bail!("rule '{}': unknown timezone '{tz}'", rule.name);
            }
        }
    }
    Ok(())
}

/// Insert a rule.
pub fn insert(conn: &Connection, rule: &Rule) -> Result<()> {
    validate(rule)?;
    conn.execute(
        "INSERT INTO rules (id, name, priority, action, enabled, tool_pattern, host_pattern,
                            agent_pattern, argument_pattern, rate_limit, schedule,
                            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            rule.id,
            rule.name,
            rule.priority,
            rule.action.as_str(),
            rule.enabled,
            rule.tool_pattern,
            rule.host_pattern,
            rule.agent_pattern,
            rule.argument_pattern,
            rule.rate_limit.as_ref().map(serde_json::to_string).transpose()?,
            rule.schedule.as_ref().map(serde_json::to_string).transpose()?,
            rule.created_at,
            rule.updated_at,
        ],
    )
    .with_context(|| format!("inserting rule '{}'", rule.name))?;
    Ok(())
}

/// Update a rule in place (matched by id), refreshing `updated_at`.
pub fn update(conn: &Connection, rule: &Rule) -> Result<()> {
    validate(rule)?;
    let updated = conn.execute(
        "UPDATE rules SET name = ?2, priority = ?3, action = ?4, enabled = ?5,
                          tool_pattern = ?6, host_pattern = ?7, agent_pattern = ?8,
                          argument_pattern = ?9, rate_limit = ?10, schedule = ?11,
                          updated_at = ?12
         WHERE id = ?1",
        rusqlite::params![
            rule.id,
            rule.name,
            rule.priority,
            rule.action.as_str(),
            rule.enabled,
            rule.tool_pattern,
            rule.host_pattern,
            rule.agent_pattern,
            rule.argument_pattern,
            rule.rate_limit.as_ref().map(serde_json::to_string).transpose()?,
            rule.schedule.as_ref().map(serde_json::to_string).transpose()?,
            Utc::now().timestamp_millis(),
        ],
    )?;
    if updated == 0 {
        bail!("rule '{}' not found", rule.id);
    }
    Ok(())
}

/// Delete a rule by id. Returns true if a row was removed.
pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
    let removed = conn.execute("DELETE FROM rules WHERE id = ?1", [id])?;
    Ok(removed > 0)
}

/// Load a rule by id.
pub fn get(conn: &Connection, id: &str) -> Result<Option<Rule>> {
    let row = conn
        .query_row(
            "SELECT id, name, priority, action, enabled, tool_pattern, host_pattern,
                    agent_pattern, argument_pattern, rate_limit, schedule, created_at, updated_at
             FROM rules WHERE id = ?1",
            [id],
            raw_from_row,
        )
        .optional()?;
    row.map(Rule::try_from).transpose()
}

/// Load every rule, ordered for evaluation.
pub fn list(conn: &Connection) -> Result<Vec<Rule>> {
    load_ordered(conn, false)
}

/// Load the enabled rules, ordered by priority ascending then creation time.
pub fn load_enabled(conn: &Connection) -> Result<Vec<Rule>> {
    load_ordered(conn, true)
}

fn load_ordered(conn: &Connection, enabled_only: bool) -> Result<Vec<Rule>> {
    let sql = format!(
        "SELECT id, name, priority, action, enabled, tool_pattern, host_pattern,
                agent_pattern, argument_pattern, rate_limit, schedule, created_at, updated_at
         FROM rules {} ORDER BY priority ASC, created_at ASC",
        if enabled_only { "WHERE enabled = 1" } else { "" },
    );
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map([], raw_from_row)?
        .collect::<rusqlite::Result<Vec<RawRule>>>()?;
    raws.into_iter().map(Rule::try_from).collect()
}

/// A rule row as raw column values, converted to a [`Rule`] outside the
/// rusqlite mapping closure so enum and JSON parse failures surface as
/// real errors instead of silently dropped rows.
struct RawRule {
    id: String,
    name: String,
    priority: i64,
    action: String,
    enabled: bool,
    tool_pattern: Option<String>,
    host_pattern: Option<String>,
    agent_pattern: Option<String>,
    argument_pattern: Option<String>,
    rate_limit: Option<String>,
    schedule: Option<String>,
    created_at: i64,
    updated_at: i64,
}

fn raw_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRule> {
    Ok(RawRule {
        id: row.get(0)?,
        name: row.get(1)?,
        priority: row.get(2)?,
        action: row.get(3)?,
        enabled: row.get(4)?,
        tool_pattern: row.get(5)?,
        host_pattern: row.get(6)?,
        agent_pattern: row.get(7)?,
        argument_pattern: row.get(8)?,
        rate_limit: row.get(9)?,
        schedule: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

impl TryFrom<RawRule> for Rule {
    type Error = anyhow::Error;

    fn try_from(raw: RawRule) -> Result<Self> {
        Ok(Rule {
            action: RuleAction::parse(&raw.action)
                .with_context(|| format!("rule '{}'", raw.id))?,
            rate_limit: raw
                .rate_limit
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(|| format!("rule '{}': malformed rate limit", raw.id))?,
            schedule: raw
                .schedule
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(|| format!("rule '{}': malformed schedule", raw.id))?,
            id: raw.id,
            name: raw.name,
            priority: raw.priority,
            enabled: raw.enabled,
            tool_pattern: raw.tool_pattern,
            host_pattern: raw.host_pattern,
            agent_pattern: raw.agent_pattern,
            argument_pattern: raw.argument_pattern,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}
