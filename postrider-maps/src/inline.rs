//! Read-only in-memory table parsed from `{name=value, ...}` text.
//!
//! Either side of an entry may be brace-quoted to protect commas and
//! whitespace: `{ {aliased name}={a, quoted, value} }`.

use ahash::AHashMap;

use crate::{Map, MapError};

#[derive(Debug)]
pub struct InlineMap {
    spec: String,
    table: AHashMap<String, String>,
}

impl InlineMap {
    /// Parse `{name=value, ...}` into a table. Duplicate names and empty
    /// tables are rejected.
    pub fn parse(spec: &str) -> Result<Self, MapError> {
        let body = spec
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| MapError::syntax(spec, "need {name=value...}"))?;

        let mut table = AHashMap::new();
        for entry in split_entries(body) {
            let (name, value) = split_nameval(&entry)
                .ok_or_else(|| MapError::syntax(spec, format!("missing '=' in {entry:?}")))?;
            if table.insert(name.clone(), value).is_some() {
                return Err(MapError::syntax(spec, format!("duplicate name {name:?}")));
            }
        }
        if table.is_empty() {
            return Err(MapError::syntax(spec, "empty table"));
        }
        Ok(Self {
            spec: format!("inline:{spec}"),
            table,
        })
    }
}

/// Split on commas and whitespace outside braces.
fn split_entries(body: &str) -> Vec<String> {
    let mut entries = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in body.chars() {
        match ch {
            '{' => {
                depth += 1;
                current.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' | ' ' | '\t' if depth == 0 => {
                if !current.is_empty() {
                    entries.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        entries.push(current);
    }
    entries
}

/// Split one `name=value` entry, unquoting braced sides.
fn split_nameval(entry: &str) -> Option<(String, String)> {
    let eq = find_eq(entry)?;
    let name = unquote(entry[..eq].trim());
    let value = unquote(entry[eq + 1..].trim());
    if name.is_empty() {
        return None;
    }
    Some((name, value))
}

/// Position of the `=` separator, skipping any inside a braced name.
fn find_eq(entry: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, ch) in entry.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '=' if depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn unquote(text: &str) -> String {
    text.strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .map_or_else(|| text.to_string(), |inner| inner.trim().to_string())
}

impl Map for InlineMap {
    fn name(&self) -> &str {
        &self.spec
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, MapError> {
        Ok(self.table.get(key).cloned())
    }

    fn entries(&self) -> Result<Vec<(String, String)>, MapError> {
        let mut entries: Vec<_> = self
            .table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_entries() {
        let map = InlineMap::parse("{a=b, c=d}").unwrap();
        assert_eq!(map.lookup("a").unwrap(), Some("b".to_string()));
        assert_eq!(map.lookup("c").unwrap(), Some("d".to_string()));
        assert_eq!(map.lookup("x").unwrap(), None);
    }

    #[test]
    fn braced_quoting_protects_commas_and_spaces() {
        let map = InlineMap::parse("{ {alias name}={one, two} }").unwrap();
        assert_eq!(map.lookup("alias name").unwrap(), Some("one, two".to_string()));
    }

    #[test]
    fn rejects_bad_syntax() {
        assert!(InlineMap::parse("a=b").is_err());
        assert!(InlineMap::parse("{}").is_err());
        assert!(InlineMap::parse("{noequals}").is_err());
        assert!(InlineMap::parse("{a=1, a=2}").is_err());
    }

    #[test]
    fn keys_are_case_sensitive() {
        let map = InlineMap::parse("{User=x}").unwrap();
        assert_eq!(map.lookup("user").unwrap(), None);
        assert_eq!(map.lookup("User").unwrap(), Some("x".to_string()));
    }

    #[test]
    fn entries_enumerate_sorted() {
        let map = InlineMap::parse("{b=2, a=1}").unwrap();
        assert_eq!(
            map.entries().unwrap(),
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
    }
}
