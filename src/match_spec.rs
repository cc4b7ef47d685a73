//! Field matching for dispatch entries.
//!
//! Handler entries match message fields with three-valued semantics: a
//! wildcard field matches any value the message actually carries, but an
//! absent message field matches nothing. The extra-rule grammar is the
//! D-Bus match-string subset `argN='value'` / `path='value'`.

use anyhow::{bail, Result};
use zbus::{message::Message, zvariant::Structure};

/// One matchable string field of a handler entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MatchSpec {
    /// Matches any message that carries the field at all.
    #[default]
    Any,
    Exact(String),
}

impl MatchSpec {
    pub fn from_option(value: Option<&str>) -> Self {
        match value {
            Some(v) => Self::Exact(v.to_string()),
            None => Self::Any,
        }
    }

    pub fn exact(&self) -> Option<&str> {
        match self {
            Self::Exact(v) => Some(v),
            Self::Any => None,
        }
    }

    /// A missing message-side field never matches, not even a wildcard.
    pub fn matches(&self, field: Option<&str>) -> bool {
        match (self, field) {
            (_, None) => false,
            (Self::Any, Some(_)) => true,
            (Self::Exact(want), Some(got)) => want == got,
        }
    }
}

/// Parsed `key=value` clauses of a handler entry's extra match rule.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtraRule {
    clauses: Vec<Clause>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Clause {
    /// The Nth positional argument must be a string equal to the value.
    Arg { index: u8, value: String },
    /// The message's object path must equal the value.
    Path(String),
}

/// Highest argument index the bus match language admits.
const MAX_ARG_INDEX: u8 = 63;

impl ExtraRule {
    /// Parse zero or more comma-separated `key=value` clauses. Values may be
    /// single-quoted, which preserves embedded commas.
    pub fn parse(rule: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        for part in split_clauses(rule)? {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some((key, value)) = part.split_once('=') else {
                bail!("match clause without '=': {part:?}");
            };
            let key = key.trim();
            let value = unquote(value.trim())?;
            if let Some(n) = key.strip_prefix("arg") {
                let index: u8 = n
                    .parse()
                    .map_err(|_| anyhow::anyhow!("bad argument index in {key:?}"))?;
                if index > MAX_ARG_INDEX {
                    bail!("argument index {index} out of range");
                }
                clauses.push(Clause::Arg { index, value });
            } else if key == "path" {
                clauses.push(Clause::Path(value));
            } else {
                bail!("unsupported match key {key:?}");
            }
        }
        Ok(Self { clauses })
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Whether every clause holds for the message.
    pub fn matches(&self, msg: &Message) -> bool {
        if self.clauses.is_empty() {
            return true;
        }
        let header = msg.header();
        for clause in &self.clauses {
            match clause {
                Clause::Arg { index, value } => {
                    match nth_string_arg(msg, usize::from(*index)) {
                        Some(arg) if arg == *value => {}
                        _ => return false,
                    }
                }
                Clause::Path(value) => match header.path() {
                    Some(path) if path.as_str() == value => {}
                    _ => return false,
                },
            }
        }
        true
    }
}

/// Read the Nth positional argument as a string, if it is one.
///
/// The body deserializes as a structure of its top-level fields, the same
/// trick the bus library's own match rules use.
fn nth_string_arg(msg: &Message, index: usize) -> Option<String> {
    let body = msg.body();
    let structure: Structure<'_> = body.deserialize().ok()?;
    let fields = structure.fields();
    match fields.get(index) {
        Some(zbus::zvariant::Value::Str(s)) => Some(s.to_string()),
        _ => None,
    }
}

/// Split on commas that are not inside single quotes.
fn split_clauses(rule: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in rule.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if quoted {
        bail!("unterminated quote in match rule {rule:?}");
    }
    parts.push(current);
    Ok(parts)
}

fn unquote(value: &str) -> Result<String> {
    if let Some(inner) = value.strip_prefix('\'') {
        match inner.strip_suffix('\'') {
            Some(inner) => Ok(inner.to_string()),
            None => bail!("unterminated quote in value {value:?}"),
        }
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_needs_a_field() {
        assert!(MatchSpec::Any.matches(Some("anything")));
        assert!(!MatchSpec::Any.matches(None));
        let exact = MatchSpec::Exact("a.b".into());
        assert!(exact.matches(Some("a.b")));
        assert!(!exact.matches(Some("a.c")));
        assert!(!exact.matches(None));
    }

    #[test]
    fn parse_quoted_and_unquoted() {
        let rule = ExtraRule::parse("arg0='hello, world', arg1=plain, path='/a/b'").unwrap();
        assert_eq!(
            rule.clauses(),
            &[
                Clause::Arg {
                    index: 0,
                    value: "hello, world".into()
                },
                Clause::Arg {
                    index: 1,
                    value: "plain".into()
                },
                Clause::Path("/a/b".into()),
            ]
        );
    }

    #[test]
    fn parse_empty_is_empty() {
        assert!(ExtraRule::parse("").unwrap().is_empty());
        assert!(ExtraRule::parse("  ").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(ExtraRule::parse("frob='x'").is_err());
        assert!(ExtraRule::parse("arg0").is_err());
        assert!(ExtraRule::parse("argx='x'").is_err());
        assert!(ExtraRule::parse("arg64='x'").is_err());
        assert!(ExtraRule::parse("arg0='unterminated").is_err());
    }

    fn signal(body_arg: &str) -> Message {
        Message::signal("/org/ex", "org.ex.I", "S")
            .unwrap()
            .build(&(body_arg,))
            .unwrap()
    }

    #[test]
    fn arg_clause_matches_nth_string() {
        let rule = ExtraRule::parse("arg0='hello'").unwrap();
        assert!(!rule.matches(&signal("hi")));
        assert!(rule.matches(&signal("hello")));
    }

    #[test]
    fn arg_clause_rejects_missing_argument() {
        let rule = ExtraRule::parse("arg1='hello'").unwrap();
        assert!(!rule.matches(&signal("hello")));
    }

    #[test]
    fn path_clause_matches_object_path() {
        let rule = ExtraRule::parse("path='/org/ex'").unwrap();
        assert!(rule.matches(&signal("x")));
        let rule = ExtraRule::parse("path='/org/other'").unwrap();
        assert!(!rule.matches(&signal("x")));
    }

    #[test]
    fn empty_rule_matches_everything() {
        let rule = ExtraRule::parse("").unwrap();
        assert!(rule.matches(&signal("x")));
    }
}
