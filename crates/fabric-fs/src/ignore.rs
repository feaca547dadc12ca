//! Ignore rules for site scanning
//!
//! Rules are read one glob per line. Blank lines and lines starting with `#`
//! are skipped, and user rules are layered on top of [`DEFAULT_IGNORES`].
//!
//! Glob syntax:
//! - `*` matches anything except `/`, `?` matches one such character
//! - `**` matches across directory boundaries
//! - a trailing `/` restricts the rule to directories
//! - a pattern without an inner `/` matches the basename at any depth
//! - a leading `!` re-includes paths excluded by an earlier rule
//!
//! The last matching rule wins. Anything under an ignored directory stays
//! ignored regardless of later negations.

use regex::Regex;

use crate::{Error, Result};

/// Patterns applied to every scan before user rules.
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git/",
    ".fabric/",
    ".fabricignore",
    ".DS_Store",
    "node_modules/",
    "*.swp",
    ".env",
];

#[derive(Debug, Clone)]
struct IgnoreRule {
    source: String,
    regex: Regex,
    negated: bool,
    dir_only: bool,
}

impl IgnoreRule {
    fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(None);
        }

        let (negated, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (dir_only, body) = match body.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, body),
        };
        let anchored = body.contains('/');
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: trimmed.to_string(),
                message: "pattern matches nothing".to_string(),
            });
        }

        let translated = glob_to_regex(body);
        let full = if anchored {
            format!("^{translated}$")
        } else {
            format!("^(?:.*/)?{translated}$")
        };
        let regex = Regex::new(&full).map_err(|e| Error::InvalidPattern {
            pattern: trimmed.to_string(),
            message: e.to_string(),
        })?;

        Ok(Some(Self {
            source: trimmed.to_string(),
            regex,
            negated,
            dir_only,
        }))
    }

    fn applies_to(&self, path: &str, is_dir: bool) -> bool {
        (!self.dir_only || is_dir) && self.regex.is_match(path)
    }
}

fn glob_to_regex(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    out
}

/// An ordered set of ignore rules.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    rules: Vec<IgnoreRule>,
}

impl IgnoreRules {
    /// Rules containing only [`DEFAULT_IGNORES`].
    pub fn defaults() -> Self {
        let mut rules = Self::default();
        for pattern in DEFAULT_IGNORES {
            if let Ok(Some(rule)) = IgnoreRule::parse(pattern) {
                rules.rules.push(rule);
            }
        }
        rules
    }

    /// Parse ignore-file content into rules, without defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] for a line that cannot be compiled.
    pub fn parse(content: &str) -> Result<Self> {
        let mut rules = Self::default();
        rules.extend_from_str(content)?;
        Ok(rules)
    }

    /// Defaults followed by the rules parsed from `content`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] for a line that cannot be compiled.
    pub fn with_defaults(content: &str) -> Result<Self> {
        let mut rules = Self::defaults();
        rules.extend_from_str(content)?;
        Ok(rules)
    }

    fn extend_from_str(&mut self, content: &str) -> Result<()> {
        for line in content.lines() {
            if let Some(rule) = IgnoreRule::parse(line)? {
                self.rules.push(rule);
            }
        }
        Ok(())
    }

    /// Number of active rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are active.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Source text of every active rule, in evaluation order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.source.as_str())
    }

    fn verdict(&self, path: &str, is_dir: bool) -> Option<bool> {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.applies_to(path, is_dir))
            .map(|rule| !rule.negated)
    }

    /// Whether a site path is ignored.
    ///
    /// Ancestor directories are checked first; a path under an ignored
    /// directory is always ignored.
    pub fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
        let mut ancestor_end = 0;
        while let Some(offset) = path[ancestor_end..].find('/') {
            let end = ancestor_end + offset;
            if self.verdict(&path[..end], true) == Some(true) {
                return true;
            }
            ancestor_end = end + 1;
        }
        self.verdict(path, is_dir) == Some(true)
    }
}
