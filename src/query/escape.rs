//! ServerQuery escaping for keys, values and command tokens.
//!
//! Every reserved character is replaced by a two-character sequence
//! introduced by a backslash:
//!
//! ```text
//! \   ->  \\        |   ->  \p        \t  ->  \t
//! /   ->  \/        \n  ->  \n        \v  ->  \v
//! ' ' ->  \s        \r  ->  \r        \f  ->  \f
//! ```
//!
//! Older server builds also expect `;` as `\;`. That is selected with
//! [`EscapePolicy::EscapeSemicolon`]; the default policy leaves `;` alone.

use serde::{Deserialize, Serialize};

/// Which reserved-character set the codec applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscapePolicy {
    /// Backslash, slash, pipe, control whitespace and space.
    #[default]
    Standard,
    /// The standard set plus `;`.
    EscapeSemicolon,
}

impl EscapePolicy {
    fn escapes_semicolon(self) -> bool {
        matches!(self, EscapePolicy::EscapeSemicolon)
    }
}

/// Escape `s` for transmission using the standard policy.
pub fn escape(s: &str) -> String {
    escape_with(s, EscapePolicy::Standard)
}

/// Unescape a received token using the standard policy.
pub fn unescape(s: &str) -> String {
    unescape_with(s, EscapePolicy::Standard)
}

/// Escape `s` for transmission.
///
/// Works in a single pass, which is equivalent to replacing the backslash
/// first and every other reserved character afterwards.
pub fn escape_with(s: &str, policy: EscapePolicy) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '|' => out.push_str("\\p"),
            ';' if policy.escapes_semicolon() => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x0B' => out.push_str("\\v"),
            '\x0C' => out.push_str("\\f"),
            ' ' => out.push_str("\\s"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_with`].
///
/// A backslash is consumed together with the character after it, so a
/// decoded `\\` can never be combined with a following character into a new
/// escape. Unknown sequences (and a trailing lone backslash) are kept as-is.
pub fn unescape_with(s: &str, policy: EscapePolicy) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }

        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('p') => out.push('|'),
            Some(';') if policy.escapes_semicolon() => out.push(';'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('v') => out.push('\x0B'),
            Some('f') => out.push('\x0C'),
            Some('s') => out.push(' '),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
