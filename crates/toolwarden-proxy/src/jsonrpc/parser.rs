//! Newline-delimited JSON-RPC stream handling.
//!
//! Each side of the relay feeds raw bytes in and takes complete messages
//! out. A message keeps the exact bytes it arrived as, so forwarding is
//! byte-transparent: key order, whitespace, and escaping reach the other
//! side untouched. Hostile input is bounded three ways -- per-line size,
//! total unterminated buffer, and JSON nesting depth -- and a bad line only
//! ever costs that one line.

use anyhow::{bail, Context, Result};
use tracing::warn;

use super::types::JsonRpcMessage;

/// Largest single line the relay will attempt to parse (10 MB).
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Buffered bytes allowed without a line terminator before the stream is
/// presumed hostile and the buffer discarded (20 MB).
const MAX_PENDING_BYTES: usize = 20 * 1024 * 1024;

/// Deepest object/array nesting accepted.
const MAX_NESTING_DEPTH: usize = 128;

/// Decode one line's bytes into a message, enforcing the input bounds.
pub fn parse_message(bytes: &[u8]) -> Result<JsonRpcMessage> {
    if bytes.len() > MAX_LINE_BYTES {
        bail!("refusing a {} byte line (limit {} bytes)", bytes.len(), MAX_LINE_BYTES);
    }
    if nesting_too_deep(bytes, MAX_NESTING_DEPTH) {
        bail!("refusing JSON nested deeper than {MAX_NESTING_DEPTH} levels");
    }
    serde_json::from_slice(bytes).context("undecodable JSON-RPC line")
}

/// Scan for bracket depth beyond `limit` without a full parse.
///
/// A three-state lexer tracks whether the scanner is inside a string (where
/// brackets are literal text) or right after a backslash escape, and counts
/// `{`/`[` only in code position.
fn nesting_too_deep(bytes: &[u8], limit: usize) -> bool {
    enum Lex {
        Code,
        Str,
        StrEscape,
    }

    let mut state = Lex::Code;
    let mut open: usize = 0;
    for &byte in bytes {
        state = match state {
            Lex::StrEscape => Lex::Str,
            Lex::Str => match byte {
                b'\\' => Lex::StrEscape,
                b'"' => Lex::Code,
                _ => Lex::Str,
            },
            Lex::Code => match byte {
                b'"' => Lex::Str,
                b'{' | b'[' => {
                    open += 1;
                    if open > limit {
                        return true;
                    }
                    Lex::Code
                }
                b'}' | b']' => {
                    open = open.saturating_sub(1);
                    Lex::Code
                }
                _ => Lex::Code,
            },
        };
    }
    false
}

/// Encode a message as one newline-terminated JSON line.
pub fn serialize_message(msg: &JsonRpcMessage) -> Vec<u8> {
    let mut line = serde_json::to_vec(msg).expect("wire types always encode");
    line.push(b'\n');
    line
}

/// A decoded message paired with the exact bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct RawJsonRpcMessage {
    /// Decoded view, for classification and correlation.
    pub parsed: JsonRpcMessage,
    /// The line as received, without its terminator. Forward these bytes,
    /// never a re-encoding of `parsed`.
    pub bytes: Vec<u8>,
}

impl RawJsonRpcMessage {
    /// The original line with the newline restored, ready for the wire.
    pub fn forward_bytes(&self) -> Vec<u8> {
        let mut line = self.bytes.clone();
        line.push(b'\n');
        line
    }
}

/// Accumulates stream chunks and splits out complete lines.
#[derive(Default)]
pub struct StreamParser {
    pending: Vec<u8>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer another chunk from the stream.
    ///
    /// A peer that streams forever without ever sending a newline would pin
    /// the buffer at an unbounded size; once it passes the cap with no
    /// terminator in sight, the accumulated bytes are discarded.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() > MAX_PENDING_BYTES && !self.pending.contains(&b'\n') {
            warn!(
                discarded = self.pending.len(),
                "no line terminator within the buffer cap, discarding stream backlog"
            );
            self.pending.clear();
        }
    }

    /// Pop the next complete message, skipping blank lines.
    ///
    /// `Some(Err(_))` reports a line that was complete but undecodable or
    /// over limits; that line is gone and the stream continues.
    pub fn next_raw_message(&mut self) -> Option<Result<RawJsonRpcMessage>> {
        loop {
            let line = self.take_line()?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(parse_message(&line).map(|parsed| RawJsonRpcMessage { parsed, bytes: line }));
        }
    }

    /// Pop the next complete message, discarding its raw bytes.
    pub fn next_message(&mut self) -> Option<Result<JsonRpcMessage>> {
        self.next_raw_message().map(|r| r.map(|raw| raw.parsed))
    }

    /// Split off everything up to the next newline. The terminator (and a
    /// preceding `\r`, for CRLF peers) is consumed but not returned.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        let cut = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=cut).collect();
        line.pop();
        if line.ends_with(b"\r") {
            line.pop();
        }
        Some(line)
    }
}
