//! Single-use confirmation tokens.
//!
//! A token is minted when the engine defers a decision (an `ask` rule or the
//! alert-mode default), bound to the exact (tool, host, agent) context it was
//! minted for. Validation consumes the token atomically: a single UPDATE
//! checks unused + unexpired + context match and flips the `used` flag, so
//! two concurrent retries can never both succeed.

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use uuid::Uuid;

/// Default token time-to-live: 5 minutes.
pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;

/// A persisted confirmation token (diagnostic view).
#[derive(Debug, Clone)]
pub struct ConfirmationToken {
    pub token: String,
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub arguments: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
}

/// Mint a fresh token bound to (tool, host, agent).
///
/// `redacted_arguments` is stored for later diagnostics; it must already be
/// redacted canonical JSON.
pub fn mint(
    conn: &Connection,
    tool: &str,
    host: &str,
    agent: &str,
    redacted_arguments: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<String> {
    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO confirmation_tokens (token, tool, host, agent, arguments, created_at, expires_at, used)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
        rusqlite::params![token, tool, host, agent, redacted_arguments, now_ms, now_ms + ttl_ms],
    )
    .context("minting confirmation token")?;
    Ok(token)
}

/// Validate a presented token and consume it.
///
/// Returns true only when the token exists, is unused, has not expired, and
/// binds the same (tool, host, agent). Expired tokens are pruned
/// opportunistically on every call.
pub fn validate_and_consume(
    conn: &Connection,
    token: &str,
    tool: &str,
    host: &str,
    agent: &str,
    now_ms: i64,
) -> Result<bool> {
    prune_expired(conn, now_ms)?;
    let consumed = conn.execute(
        "UPDATE confirmation_tokens SET used = 1
         WHERE token = ?1 AND used = 0 AND expires_at > ?2
           AND tool = ?3 AND host = ?4 AND agent = ?5",
        rusqlite::params![token, now_ms, tool, host, agent],
    )?;
    Ok(consumed == 1)
}

/// Delete expired, unused tokens. Used ones are kept for diagnostics.
pub fn prune_expired(conn: &Connection, now_ms: i64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM confirmation_tokens WHERE used = 0 AND expires_at <= ?1",
        [now_ms],
    )?;
    Ok(removed)
}

/// Load a token by value (diagnostics and tests).
pub fn get(conn: &Connection, token: &str) -> Result<Option<ConfirmationToken>> {
    conn.query_row(
        "SELECT token, tool, host, agent, arguments, created_at, expires_at, used
         FROM confirmation_tokens WHERE token = ?1",
        [token],
        |row| {
            Ok(ConfirmationToken {
                token: row.get(0)?,
                tool: row.get(1)?,
                host: row.get(2)?,
                agent: row.get(3)?,
                arguments: row.get(4)?,
                created_at: row.get(5)?,
                expires_at: row.get(6)?,
                used: row.get(7)?,
            })
        },
    )
    .optional()
    .context("loading confirmation token")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    const T0: i64 = 1_700_000_000_000;

    #[test]
    fn mint_and_consume_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let token = mint(&conn, "exec", "h", "a", "{}", T0, DEFAULT_TTL_MS).unwrap();

        assert!(validate_and_consume(&conn, &token, "exec", "h", "a", T0 + 1000).unwrap());
        let stored = get(&conn, &token).unwrap().unwrap();
        assert!(stored.used);
    }

    #[test]
    fn consumed_token_never_validates_again() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let token = mint(&conn, "exec", "h", "a", "{}", T0, DEFAULT_TTL_MS).unwrap();

        assert!(validate_and_consume(&conn, &token, "exec", "h", "a", T0 + 1).unwrap());
        assert!(!validate_and_consume(&conn, &token, "exec", "h", "a", T0 + 2).unwrap());
    }

    #[test]
    fn token_is_context_bound() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let token = mint(&conn, "exec", "h", "a", "{}", T0, DEFAULT_TTL_MS).unwrap();

        assert!(!validate_and_consume(&conn, &token, "other", "h", "a", T0 + 1).unwrap());
        assert!(!validate_and_consume(&conn, &token, "exec", "h2", "a", T0 + 1).unwrap());
        assert!(!validate_and_consume(&conn, &token, "exec", "h", "b", T0 + 1).unwrap());
        // Failed context checks must not consume the token.
        assert!(validate_and_consume(&conn, &token, "exec", "h", "a", T0 + 1).unwrap());
    }

    #[test]
    fn expired_token_never_validates() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let token = mint(&conn, "exec", "h", "a", "{}", T0, 1000).unwrap();

        assert!(!validate_and_consume(&conn, &token, "exec", "h", "a", T0 + 1000).unwrap());
        // The expired token was pruned by the validation call.
        assert!(get(&conn, &token).unwrap().is_none());
    }

    #[test]
    fn unknown_token_never_validates() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        assert!(!validate_and_consume(&conn, "no-such-token", "exec", "h", "a", T0).unwrap());
    }

    #[test]
    fn prune_keeps_used_and_live_tokens() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();

        let live = mint(&conn, "t", "h", "a", "{}", T0, DEFAULT_TTL_MS).unwrap();
        let dead = mint(&conn, "t", "h", "a", "{}", T0, 10).unwrap();
        let used = mint(&conn, "t", "h", "a", "{}", T0, 10).unwrap();
        assert!(validate_and_consume(&conn, &used, "t", "h", "a", T0 + 1).unwrap());

        let removed = prune_expired(&conn, T0 + 1000).unwrap();
        assert_eq!(removed, 1);
        assert!(get(&conn, &live).unwrap().is_some());
        assert!(get(&conn, &dead).unwrap().is_none());
        assert!(get(&conn, &used).unwrap().is_some());
    }

    #[test]
    fn tokens_are_unique() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn();
        let a = mint(&conn, "t", "h", "a", "{}", T0, DEFAULT_TTL_MS).unwrap();
        let b = mint(&conn, "t", "h", "a", "{}", T0, DEFAULT_TTL_MS).unwrap();
        assert_ne!(a, b);
    }
}
