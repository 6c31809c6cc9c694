//! Path validation and glob compilation.
//!
//! Paths name nodes in the hierarchical namespace: `/`-separated components
//! of `[a-zA-Z0-9.\-_]`. Glob patterns additionally allow `*` (matches
//! within one component) and `**` (matches across components). Patterns are
//! compiled once into an anchored regex.

use std::fmt;

use regex::Regex;

/// A path or pattern that does not fit the namespace shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadPathError {
    pub path: String,
}

impl fmt::Display for BadPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad path: {}", self.path)
    }
}

impl std::error::Error for BadPathError {}

fn shape_ok(s: &str, allow_glob: bool) -> bool {
    if !s.starts_with('/') || s.contains("//") {
        return false;
    }
    if s.len() > 1 && s.ends_with('/') {
        return false;
    }
    s.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '/' | '.' | '-' | '_')
            || (allow_glob && c == '*')
    })
}

/// Validate a concrete path (no glob metacharacters).
///
/// # Errors
///
/// Returns [`BadPathError`] if the path is malformed.
pub fn check_path(path: &str) -> Result<(), BadPathError> {
    if shape_ok(path, false) {
        Ok(())
    } else {
        Err(BadPathError {
            path: path.to_owned(),
        })
    }
}

/// A compiled glob pattern over the namespace.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    re: Regex,
}

impl Glob {
    /// Compile a glob pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BadPathError`] if the pattern is malformed.
    pub fn compile(pattern: &str) -> Result<Glob, BadPathError> {
        if !shape_ok(pattern, true) {
            return Err(BadPathError {
                path: pattern.to_owned(),
            });
        }

        let mut re = String::with_capacity(pattern.len() + 8);
        re.push('^');
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '*' {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            } else {
                re.push_str(&regex::escape(&c.to_string()));
            }
        }
        re.push('$');

        // shape_ok restricts the alphabet, so the translation is always a
        // valid regex
        let re = Regex::new(&re).expect("translated glob is a valid regex");
        Ok(Glob {
            pattern: pattern.to_owned(),
            re,
        })
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.re.is_match(path)
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}
