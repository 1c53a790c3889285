//! Pattern matching for policy rules.
//!
//! Tool/host/agent predicates use glob patterns: `*` matches any run of
//! non-`/` characters, `**` matches any run, `?` matches one character,
//! everything else is literal; comparison is case-insensitive.
//! `argument_pattern` predicates use case-insensitive regular expressions
//! applied to the canonical JSON of the arguments.

use anyhow::{Context, Result};

/// Glob matcher over tool, host, and agent names.
pub struct GlobMatcher {
    /// The glob pattern string (for display).
    pub pattern: String,
    compiled: glob::Pattern,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let compiled = glob::Pattern::new(pattern)
            .with_context(|| format!("invalid glob pattern: {pattern}"))?;
        Ok(Self { pattern: pattern.to_string(), compiled })
    }

    /// Returns true if the given value matches this glob pattern.
    ///
    /// Uses `require_literal_separator` so `*` stays within one `/`-separated
    /// segment while `**` crosses segments. Matching is case-insensitive.
    pub fn is_match(&self, value: &str) -> bool {
        let opts = glob::MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            ..Default::default()
        };
        self.compiled.matches_with(value, opts)
    }
}

/// Regex matcher over the canonical JSON of tool arguments.
pub struct RegexMatcher {
    /// The regex pattern string (for display).
    pub pattern: String,
    compiled: regex::Regex,
}

impl RegexMatcher {
    /// Maximum compiled regex size (256 KB) to prevent ReDoS via pathological patterns.
    const MAX_REGEX_SIZE: usize = 256 * 1024;

    pub fn new(pattern: &str) -> Result<Self> {
        let compiled = regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .size_limit(Self::MAX_REGEX_SIZE)
            .build()
            .with_context(|| format!("invalid regex pattern: {pattern}"))?;
        Ok(Self { pattern: pattern.to_string(), compiled })
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.compiled.is_match(value)
    }
}

/// Thread-local caches for compiled patterns so rule evaluation does not
/// recompile on every request.
pub(crate) mod pattern_cache {
    use super::{GlobMatcher, RegexMatcher};
    use std::cell::RefCell;
    use std::collections::HashMap;

    thread_local! {
        static GLOBS: RefCell<HashMap<String, Option<GlobMatcher>>> = RefCell::new(HashMap::new());
        static REGEXES: RefCell<HashMap<String, Option<RegexMatcher>>> = RefCell::new(HashMap::new());
    }

    /// Check `value` against the glob `pattern`, caching the compiled form.
    /// Invalid patterns never match.
    pub fn glob_matches(pattern: &str, value: &str) -> bool {
        GLOBS.with(|cache| {
            let mut cache = cache.borrow_mut();
            let entry = cache
                .entry(pattern.to_string())
                .or_insert_with(|| GlobMatcher::new(pattern).ok());
            match entry {
                Some(matcher) => matcher.is_match(value),
                None => false,
            }
        })
    }

    /// Check `value` against the regex `pattern`, caching the compiled form.
    pub fn regex_matches(pattern: &str, value: &str) -> bool {
        REGEXES.with(|cache| {
            let mut cache = cache.borrow_mut();
            let entry = cache
                .entry(pattern.to_string())
                .or_insert_with(|| RegexMatcher::new(pattern).ok());
            match entry {
                Some(matcher) => matcher.is_match(value),
                None => false,
            }
        })
    }
}
