//! Transport table: destination domain to `(transport, nexthop)` mapping.

use postrider_common::ports::KnownTcpPorts;
use postrider_maps::SharedMap;

use crate::ResolveError;

/// A transport table entry after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEntry {
    /// Delivery agent service name; `None` keeps the caller's default.
    pub transport: Option<String>,
    /// Agent-specific target; `None` keeps the caller's default.
    pub nexthop: Option<String>,
}

/// Rule-driven transport lookup over a map stack.
///
/// Values have the form `transport:nexthop`; either side may be empty to
/// keep the default. A symbolic port in `host:port` is translated through
/// the known-ports table.
#[derive(Debug)]
pub struct TransportTable {
    map: Option<SharedMap>,
    /// Match `.parent.domain` entries for subdomains.
    parent_matching: bool,
    ports: KnownTcpPorts,
}

impl TransportTable {
    #[must_use]
    pub fn new(map: Option<SharedMap>, parent_matching: bool, ports: KnownTcpPorts) -> Self {
        Self {
            map,
            parent_matching,
            ports,
        }
    }

    /// An always-empty table.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(None, false, KnownTcpPorts::new())
    }

    /// Look up a destination domain.
    ///
    /// Tries the exact domain first, then — when parent matching is on —
    /// `.parent` entries for every ancestor domain, nearest first.
    pub fn lookup(&self, domain: &str) -> Result<Option<TransportEntry>, ResolveError> {
        let Some(map) = &self.map else {
            return Ok(None);
        };

        if let Some(value) = map.lookup(domain)? {
            return Ok(Some(self.parse_entry(&value)));
        }
        if self.parent_matching {
            let mut rest = domain;
            while let Some((_, parent)) = rest.split_once('.') {
                if let Some(value) = map.lookup(&format!(".{parent}"))? {
                    return Ok(Some(self.parse_entry(&value)));
                }
                rest = parent;
            }
        }
        Ok(None)
    }

    fn parse_entry(&self, value: &str) -> TransportEntry {
        let (transport, nexthop) = value
            .split_once(':')
            .map_or((value, ""), |(t, n)| (t, n));

        let nexthop = if nexthop.is_empty() {
            None
        } else {
            Some(self.filter_port(nexthop))
        };
        TransportEntry {
            transport: if transport.is_empty() {
                None
            } else {
                Some(transport.to_string())
            },
            nexthop,
        }
    }

    /// Translate a symbolic port in `host:port`. A bare `[addr]` literal has
    /// no port suffix to translate.
    fn filter_port(&self, nexthop: &str) -> String {
        if nexthop.ends_with(']') {
            return nexthop.to_string();
        }
        nexthop.rsplit_once(':').map_or_else(
            || nexthop.to_string(),
            |(host, port)| format!("{host}:{}", self.ports.filter(port)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use postrider_maps::InlineMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn table(spec: &str, parent: bool) -> TransportTable {
        TransportTable::new(
            Some(Arc::new(InlineMap::parse(spec).unwrap())),
            parent,
            KnownTcpPorts::parse("smtp=25, submission=587").unwrap(),
        )
    }

    #[test]
    fn exact_match_wins() {
        let table = table("{example.org=smtp:mail.example.org}", true);
        let entry = table.lookup("example.org").unwrap().unwrap();
        assert_eq!(entry.transport.as_deref(), Some("smtp"));
        assert_eq!(entry.nexthop.as_deref(), Some("mail.example.org"));
    }

    #[test]
    fn parent_matching_walks_ancestors() {
        let table = table("{.example.org=relay:gw.example.org}", true);
        let entry = table.lookup("deep.sub.example.org").unwrap().unwrap();
        assert_eq!(entry.transport.as_deref(), Some("relay"));

        // Disabled parent matching means only exact keys hit.
        let strict = table_spec_no_parent();
        assert!(strict.lookup("deep.sub.example.org").unwrap().is_none());
    }

    fn table_spec_no_parent() -> TransportTable {
        table("{.example.org=relay:gw.example.org}", false)
    }

    #[test]
    fn empty_fields_keep_defaults() {
        let table = table("{a.example=:nexthop.example, b.example=smtp:}", false);
        let a = table.lookup("a.example").unwrap().unwrap();
        assert_eq!(a.transport, None);
        assert_eq!(a.nexthop.as_deref(), Some("nexthop.example"));

        let b = table.lookup("b.example").unwrap().unwrap();
        assert_eq!(b.transport.as_deref(), Some("smtp"));
        assert_eq!(b.nexthop, None);
    }

    #[test]
    fn symbolic_ports_are_translated() {
        let table = table("{x.example=smtp:mail.x.example:submission}", false);
        let entry = table.lookup("x.example").unwrap().unwrap();
        assert_eq!(entry.nexthop.as_deref(), Some("mail.x.example:587"));
    }

    #[test]
    fn miss_is_none() {
        let table = table("{example.org=smtp:mx}", false);
        assert!(table.lookup("elsewhere.net").unwrap().is_none());
        assert!(TransportTable::disabled().lookup("anything").unwrap().is_none());
    }
}
