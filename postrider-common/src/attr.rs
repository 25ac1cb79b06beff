//! Typed attribute lists, the wire format for all local IPC.
//!
//! A request or reply is a sequence of `name:value` lines terminated by an
//! empty line. A repeated name forms a list; a dotted name (`rcpt.addr`)
//! contributes to a hash under the prefix. Unknown attributes are ignored by
//! receivers so the format can grow.

use std::fmt::Write as _;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::AttrError;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Int(i64),
    Str(String),
    List(Vec<String>),
    Hash(Vec<(String, String)>),
}

/// An ordered attribute list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttrList {
    attrs: Vec<(String, AttrValue)>,
}

impl AttrList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.attrs.push((name.to_string(), AttrValue::Int(value)));
        self
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.attrs
            .push((name.to_string(), AttrValue::Str(value.into())));
        self
    }

    pub fn set_list(&mut self, name: &str, values: Vec<String>) -> &mut Self {
        self.attrs.push((name.to_string(), AttrValue::List(values)));
        self
    }

    pub fn set_hash(&mut self, name: &str, entries: Vec<(String, String)>) -> &mut Self {
        self.attrs.push((name.to_string(), AttrValue::Hash(entries)));
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &'static str) -> Result<&str, AttrError> {
        match self.get(name) {
            Some(AttrValue::Str(s)) => Ok(s),
            Some(AttrValue::Int(_) | AttrValue::List(_) | AttrValue::Hash(_)) | None => {
                Err(AttrError::Missing(name))
            }
        }
    }

    pub fn get_int(&self, name: &'static str) -> Result<i64, AttrError> {
        match self.get(name) {
            Some(AttrValue::Int(i)) => Ok(*i),
            Some(AttrValue::Str(s)) => s.parse().map_err(|_| AttrError::BadValue {
                name: name.to_string(),
                expected: "integer",
                value: s.clone(),
            }),
            _ => Err(AttrError::Missing(name)),
        }
    }

    /// A list attribute; a single occurrence reads as a one-element list.
    #[must_use]
    pub fn get_list(&self, name: &str) -> Vec<String> {
        match self.get(name) {
            Some(AttrValue::List(items)) => items.clone(),
            Some(AttrValue::Str(s)) => vec![s.clone()],
            Some(AttrValue::Int(i)) => vec![i.to_string()],
            Some(AttrValue::Hash(_)) | None => Vec::new(),
        }
    }

    /// All hash attributes carried under `name`, in wire order.
    #[must_use]
    pub fn get_hashes(&self, name: &str) -> Vec<&[(String, String)]> {
        self.attrs
            .iter()
            .filter(|(n, _)| n == name)
            .filter_map(|(_, v)| match v {
                AttrValue::Hash(entries) => Some(entries.as_slice()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Render the list in wire form, including the terminating empty line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.attrs {
            match value {
                AttrValue::Int(i) => {
                    let _ = writeln!(out, "{}:{i}", escape(name));
                }
                AttrValue::Str(s) => {
                    let _ = writeln!(out, "{}:{}", escape(name), escape(s));
                }
                AttrValue::List(items) => {
                    for item in items {
                        let _ = writeln!(out, "{}:{}", escape(name), escape(item));
                    }
                }
                AttrValue::Hash(entries) => {
                    // A hash opens with a `name:{` line so that an empty
                    // hash is still visible on the wire.
                    let _ = writeln!(out, "{}:{{", escape(name));
                    for (key, val) in entries {
                        let _ = writeln!(out, "{}.{}:{}", escape(name), escape(key), escape(val));
                    }
                }
            }
        }
        out.push('\n');
        out
    }

    /// Parse wire form produced by [`encode`](Self::encode).
    pub fn decode(text: &str) -> Result<Self, AttrError> {
        let mut list = Self::new();
        for line in text.lines() {
            if line.is_empty() {
                break;
            }
            list.accept_line(line)?;
        }
        Ok(list)
    }

    fn accept_line(&mut self, line: &str) -> Result<(), AttrError> {
        let (raw_name, raw_value) = line
            .split_once(':')
            .ok_or_else(|| AttrError::MalformedLine(line.to_string()))?;
        // The hash-open marker is a raw `{`; a literal brace in a string
        // value arrives escaped and never looks like one.
        let opens_hash = raw_value == "{";
        let value = unescape(raw_value)?;

        // Split on the raw (still escaped) name so that an escaped dot in an
        // attribute name never reads as a hash separator.
        if let Some((prefix, key)) = raw_name.split_once('.') {
            let prefix = unescape(prefix)?;
            let key = unescape(key)?;
            // Hash member: attach to the most recent hash with this prefix.
            if let Some((_, AttrValue::Hash(entries))) = self
                .attrs
                .iter_mut()
                .rev()
                .find(|(n, v)| *n == prefix && matches!(v, AttrValue::Hash(_)))
            {
                entries.push((key, value));
            } else {
                self.attrs
                    .push((prefix, AttrValue::Hash(vec![(key, value)])));
            }
            return Ok(());
        }
        let name = unescape(raw_name)?;

        if opens_hash {
            self.attrs.push((name, AttrValue::Hash(Vec::new())));
            return Ok(());
        }

        // A repeated plain name upgrades to a list.
        if let Some((_, existing)) = self.attrs.iter_mut().rev().find(|(n, _)| *n == name) {
            match existing {
                AttrValue::Str(prev) => {
                    *existing = AttrValue::List(vec![std::mem::take(prev), value]);
                    return Ok(());
                }
                AttrValue::List(items) => {
                    items.push(value);
                    return Ok(());
                }
                AttrValue::Int(_) | AttrValue::Hash(_) => {}
            }
        }
        self.attrs.push((name, AttrValue::Str(value)));
        Ok(())
    }

    /// Write the list to an async stream and flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), AttrError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(self.encode().as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one attribute list from an async stream.
    ///
    /// Returns `Ok(None)` on clean end of stream before the first line.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>, AttrError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut list = Self::new();
        let mut seen_any = false;
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                if seen_any {
                    return Err(AttrError::UnexpectedEof);
                }
                return Ok(None);
            }
            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                return Ok(Some(list));
            }
            seen_any = true;
            list.accept_line(trimmed)?;
        }
    }
}

/// Escape the characters that carry structure on the wire.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            ':' => out.push_str("%3A"),
            '{' => out.push_str("%7B"),
            '.' => out.push_str("%2E"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(text: &str) -> Result<String, AttrError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let hex: String = chars.by_ref().take(2).collect();
        let code = u8::from_str_radix(&hex, 16)
            .map_err(|_| AttrError::MalformedLine(text.to_string()))?;
        out.push(char::from(code));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut list = AttrList::new();
        list.set_str("queue_id", "01ARZ3NDEKTSV4RRFFQ69G5FAV")
            .set_int("offset", 4096)
            .set_list(
                "rcpt",
                vec!["a@example.com".to_string(), "b@example.com".to_string()],
            )
            .set_hash(
                "status",
                vec![
                    ("addr".to_string(), "a@example.com".to_string()),
                    ("code".to_string(), "2.0.0".to_string()),
                ],
            );

        let decoded = AttrList::decode(&list.encode()).unwrap();
        assert_eq!(decoded.get_str("queue_id").unwrap(), "01ARZ3NDEKTSV4RRFFQ69G5FAV");
        assert_eq!(decoded.get_int("offset").unwrap(), 4096);
        assert_eq!(decoded.get_list("rcpt").len(), 2);
        assert_eq!(decoded.get_hashes("status").len(), 1);
        assert_eq!(decoded.get_hashes("status")[0].len(), 2);
    }

    #[test]
    fn values_survive_escaping() {
        let mut list = AttrList::new();
        list.set_str("reason", "line one\nline two: 100%");
        let decoded = AttrList::decode(&list.encode()).unwrap();
        assert_eq!(decoded.get_str("reason").unwrap(), "line one\nline two: 100%");
    }

    #[test]
    fn unknown_attributes_are_ignored_by_getters() {
        let decoded = AttrList::decode("known:yes\nnovel:whatever\n\n").unwrap();
        assert_eq!(decoded.get_str("known").unwrap(), "yes");
        assert!(decoded.get_str("absent").is_err());
    }

    #[test]
    fn repeated_names_form_a_list() {
        let decoded = AttrList::decode("rcpt:a\nrcpt:b\nrcpt:c\n\n").unwrap();
        assert_eq!(decoded.get_list("rcpt"), vec!["a", "b", "c"]);
    }

    #[test]
    fn multiple_hashes_stay_separate() {
        let mut list = AttrList::new();
        list.set_hash("rcpt", vec![("addr".to_string(), "a@x".to_string())]);
        list.set_hash("rcpt", vec![("addr".to_string(), "b@x".to_string())]);
        let decoded = AttrList::decode(&list.encode()).unwrap();
        let hashes = decoded.get_hashes("rcpt");
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0][0].1, "a@x");
        assert_eq!(hashes[1][0].1, "b@x");
    }

    #[tokio::test]
    async fn async_stream_round_trip() {
        let mut list = AttrList::new();
        list.set_str("command", "flush").set_str("site", "example.com");

        let mut buf = Vec::new();
        list.write_to(&mut buf).await.unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let mut reader = tokio::io::BufReader::new(&mut reader);
        let decoded = AttrList::read_from(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded.get_str("command").unwrap(), "flush");

        // A second read hits clean EOF.
        assert!(AttrList::read_from(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn truncated_stream_is_an_error() {
        // decode() tolerates missing terminator; the async reader does not.
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let mut reader = tokio::io::BufReader::new(std::io::Cursor::new(b"half:done\n".to_vec()));
            let err = AttrList::read_from(&mut reader).await.unwrap_err();
            assert!(matches!(err, AttrError::UnexpectedEof));
        });
    }
}
