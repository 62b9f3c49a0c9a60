//! Configuration pattern parsing and template compilation.
//!
//! Realm configuration expresses user locations and role filters as
//! positional-substitution templates (`cn={0},ou=people`). The user pattern
//! option additionally accepts a parenthesized list of alternatives,
//! optionally wrapped in an `(|...)` LDAP OR expression. Templates are
//! compiled once per configuration snapshot and reused for every request.

use dirauth_core::{RealmError, RealmResult};

/// Split a user pattern option into its ordered alternative templates.
///
/// A string without parentheses is a single bare template. Otherwise each
/// `(...)` group at the top level is one alternative; a `(` immediately
/// followed by `|` (the OR wrapper) and parentheses preceded by `\` are not
/// treated as delimiters.
pub fn parse_user_pattern_list(raw: &str) -> RealmResult<Vec<String>> {
    let bytes = raw.as_bytes();

    let mut start_paren = match raw.find('(') {
        // No parens here; the whole string is one pattern
        None => return Ok(vec![raw.to_string()]),
        Some(idx) => Some(idx),
    };

    let mut patterns = Vec::new();
    while let Some(mut start) = start_paren {
        // Skip the OR wrapper paren and escaped parens
        loop {
            let next_is_or = bytes.get(start + 1) == Some(&b'|');
            let escaped = start > 0 && bytes[start - 1] == b'\\';
            if !next_is_or && !escaped {
                break;
            }
            start = match raw[start + 1..].find('(') {
                Some(rel) => start + 1 + rel,
                None => {
                    return Err(RealmError::configuration(format!(
                        "malformed user pattern list: {raw}"
                    )))
                }
            };
        }

        // Find the matching unescaped close paren
        let mut end = match raw[start + 1..].find(')') {
            Some(rel) => start + 1 + rel,
            None => {
                return Err(RealmError::configuration(format!(
                    "unterminated group in user pattern list: {raw}"
                )))
            }
        };
        while bytes[end - 1] == b'\\' {
            end = match raw[end + 1..].find(')') {
                Some(rel) => end + 1 + rel,
                None => {
                    return Err(RealmError::configuration(format!(
                        "unterminated group in user pattern list: {raw}"
                    )))
                }
            };
        }

        patterns.push(raw[start + 1..end].to_string());
        start_paren = raw[end + 1..].find('(').map(|rel| end + 1 + rel);
    }

    Ok(patterns)
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Argument(usize),
}

/// A compiled positional-substitution template.
///
/// `{0}` marks the username slot; role search templates also use `{1}` and
/// `{2}`, and role base templates use one slot per DN component.
#[derive(Debug, Clone)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Compile a `{N}` template. Braces that do not form a positional slot
    /// are a configuration error.
    pub fn compile(pattern: &str) -> RealmResult<Self> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.char_indices().peekable();

        while let Some((idx, c)) = chars.next() {
            if c != '{' {
                literal.push(c);
                continue;
            }

            let rest = &pattern[idx + 1..];
            let close = rest.find('}').ok_or_else(|| {
                RealmError::configuration(format!("unterminated substitution in template: {pattern}"))
            })?;
            let digits = &rest[..close];
            let arg: usize = digits.parse().map_err(|_| {
                RealmError::configuration(format!(
                    "invalid substitution index {{{digits}}} in template: {pattern}"
                ))
            })?;

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(Segment::Argument(arg));

            // Advance past the digits and the closing brace
            for _ in 0..=close {
                chars.next();
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// Substitute positional arguments into the template.
    pub fn format(&self, args: &[&str]) -> RealmResult<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Argument(idx) => {
                    let value = args.get(*idx).ok_or_else(|| {
                        RealmError::configuration(format!(
                            "template references argument {{{idx}}} but only {} were supplied",
                            args.len()
                        ))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}
