//! Symbolic service-name to TCP-port associations.
//!
//! Keeps nexthop port resolution independent of the system services
//! database. The table is populated from the `known_tcp_ports` parameter,
//! a comma or whitespace separated `name=port` list.

use ahash::AHashMap;

use crate::error::ParseError;

#[derive(Debug, Clone, Default)]
pub struct KnownTcpPorts {
    ports: AHashMap<String, u16>,
}

impl KnownTcpPorts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `name=port` list such as `"lmtp=24, smtp=25"`.
    ///
    /// The whole list is rejected on the first malformed entry.
    pub fn parse(spec: &str) -> Result<Self, ParseError> {
        let mut table = Self::new();
        for entry in spec
            .split([',', ' ', '\t'])
            .map(str::trim)
            .filter(|e| !e.is_empty())
        {
            let (name, port) = entry
                .split_once('=')
                .ok_or_else(|| ParseError::new(format!("missing '=' in {entry:?}")))?;
            table.add(name.trim(), port.trim())?;
        }
        Ok(table)
    }

    /// Associate a symbolic name with a numerical port.
    pub fn add(&mut self, name: &str, port: &str) -> Result<(), ParseError> {
        if name.is_empty() || name.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::new(format!("numerical service name {name:?}")));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ParseError::new(format!("bad service port {port:?} for {name:?}")))?;
        if self.ports.contains_key(name) {
            return Err(ParseError::new(format!("duplicate service name {name:?}")));
        }
        self.ports.insert(name.to_string(), port);
        Ok(())
    }

    /// Map a symbolic name to its port; numbers and unknown names pass
    /// through unchanged.
    #[must_use]
    pub fn filter<'a>(&self, name_or_port: &'a str) -> std::borrow::Cow<'a, str> {
        if name_or_port.bytes().all(|b| b.is_ascii_digit()) {
            return name_or_port.into();
        }
        self.ports
            .get(name_or_port)
            .map_or_else(|| name_or_port.into(), |port| port.to_string().into())
    }

    pub fn clear(&mut self) {
        self.ports.clear();
    }

    /// All associations as sorted `name=port` text, for diagnostics.
    #[must_use]
    pub fn export(&self) -> String {
        let mut entries: Vec<_> = self.ports.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(name, port)| format!("{name}={port}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_list() {
        let table = KnownTcpPorts::parse("lmtp=24, smtp=25").unwrap();
        assert_eq!(table.filter("smtp"), "25");
        assert_eq!(table.filter("lmtp"), "24");
    }

    #[test]
    fn numbers_and_unknown_names_pass_through() {
        let table = KnownTcpPorts::parse("smtp=25").unwrap();
        assert_eq!(table.filter("2525"), "2525");
        assert_eq!(table.filter("submission"), "submission");
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(KnownTcpPorts::parse("25=smtp").is_err());
        assert!(KnownTcpPorts::parse("smtp=notaport").is_err());
        assert!(KnownTcpPorts::parse("smtp=99999").is_err());
        assert!(KnownTcpPorts::parse("smtp=25, smtp=26").is_err());
        assert!(KnownTcpPorts::parse("smtp").is_err());
    }

    #[test]
    fn export_is_sorted() {
        let table = KnownTcpPorts::parse("smtp=25 lmtp=24").unwrap();
        assert_eq!(table.export(), "lmtp=24 smtp=25");
    }
}
