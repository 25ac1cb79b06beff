//! Canonical address rewriting.
//!
//! Order of operations: tokenize, bang-path swap, percent hack, extension
//! stripping (only when the caller asks), masquerading, then the canonical
//! maps. Rewriting is total: every input yields an address or a structured
//! error, never a silent empty string.

use postrider_common::Params;
use postrider_maps::SharedMap;

use crate::{ResolveError, tokens::TokenTree};

/// Which canonical map set applies in addition to the common one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonKind {
    Sender,
    Recipient,
}

/// Result of canonicalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewritten {
    /// Canonical internal-form address.
    pub addr: String,
    /// Stripped address extension, without the delimiter.
    pub extension: Option<String>,
}

/// Canonical-map application is iterated to a fixed point; this bounds
/// runaway map cycles.
const MAX_MAP_ROUNDS: usize = 100;

#[derive(Debug, Default)]
pub struct Rewriter {
    swap_bangpath: bool,
    percent_hack: bool,
    recipient_delimiter: Option<char>,
    masquerade_domains: Vec<String>,
    empty_address_recipient: String,
    canonical_maps: Vec<SharedMap>,
    sender_canonical_maps: Vec<SharedMap>,
    recipient_canonical_maps: Vec<SharedMap>,
}

impl Rewriter {
    #[must_use]
    pub fn new(params: &Params) -> Self {
        Self {
            swap_bangpath: params.swap_bangpath,
            percent_hack: params.percent_hack,
            recipient_delimiter: params.recipient_delimiter,
            masquerade_domains: params.masquerade_domains.clone(),
            empty_address_recipient: params.empty_address_recipient.clone(),
            canonical_maps: Vec::new(),
            sender_canonical_maps: Vec::new(),
            recipient_canonical_maps: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_canonical_maps(mut self, maps: Vec<SharedMap>) -> Self {
        self.canonical_maps = maps;
        self
    }

    #[must_use]
    pub fn with_sender_canonical_maps(mut self, maps: Vec<SharedMap>) -> Self {
        self.sender_canonical_maps = maps;
        self
    }

    #[must_use]
    pub fn with_recipient_canonical_maps(mut self, maps: Vec<SharedMap>) -> Self {
        self.recipient_canonical_maps = maps;
        self
    }

    /// Canonicalize an address in external or internal form.
    pub fn canonicalize(
        &self,
        input: &str,
        kind: CanonKind,
        strip_extension: bool,
    ) -> Result<Rewritten, ResolveError> {
        if input.chars().all(char::is_whitespace) && !input.is_empty() {
            return Err(ResolveError::Malformed(input.to_string()));
        }

        let tree = TokenTree::scan(input);
        let mut internal = if tree.is_empty() || tree.is_lone_quoted_empty() {
            self.empty_address_recipient.clone()
        } else {
            tree.internalize()
        };

        // host!user -> user@host
        if self.swap_bangpath && !internal.contains('@') {
            if let Some(bang) = internal.find('!') {
                internal = format!("{}@{}", &internal[bang + 1..], &internal[..bang]);
            }
        }

        // The rightmost % becomes @.
        if self.percent_hack && !internal.contains('@') {
            if let Some(pct) = internal.rfind('%') {
                internal.replace_range(pct..=pct, "@");
            }
        }

        let (mut local, mut domain) = split_addr(&internal);

        let mut extension = None;
        if strip_extension {
            if let Some(delim) = self.recipient_delimiter {
                if let Some(pos) = local.find(delim) {
                    // Keep a leading delimiter; "user+"@ strips to "user".
                    if pos > 0 {
                        extension = Some(local[pos + delim.len_utf8()..].to_string());
                        local.truncate(pos);
                    }
                }
            }
        }

        if local.is_empty() {
            local = self.empty_address_recipient.clone();
        }

        if let Some(d) = &domain {
            for parent in &self.masquerade_domains {
                if d.eq_ignore_ascii_case(parent)
                    || d.to_ascii_lowercase()
                        .ends_with(&format!(".{}", parent.to_ascii_lowercase()))
                {
                    domain = Some(parent.clone());
                    break;
                }
            }
        }

        let kind_maps = match kind {
            CanonKind::Sender => &self.sender_canonical_maps,
            CanonKind::Recipient => &self.recipient_canonical_maps,
        };
        self.apply_maps(kind_maps, &mut local, &mut domain)?;
        self.apply_maps(&self.canonical_maps, &mut local, &mut domain)?;

        let addr = match &domain {
            Some(d) => format!("{local}@{d}"),
            None => local,
        };
        Ok(Rewritten { addr, extension })
    }

    /// Apply one canonical map set to a fixed point.
    ///
    /// Lookup order per round: the full address, the bare local part, then
    /// `@domain`. An `@otherdomain` result keeps the original local part.
    fn apply_maps(
        &self,
        maps: &[SharedMap],
        local: &mut String,
        domain: &mut Option<String>,
    ) -> Result<(), ResolveError> {
        if maps.is_empty() {
            return Ok(());
        }
        for _ in 0..MAX_MAP_ROUNDS {
            let mut changed = false;
            for map in maps {
                let full = match domain.as_ref() {
                    Some(d) => format!("{local}@{d}"),
                    None => local.clone(),
                };
                let hit = if let Some(value) = map.lookup(&full)? {
                    Some(value)
                } else if let Some(value) = map.lookup(local)? {
                    Some(value)
                } else if let Some(d) = domain.as_ref() {
                    map.lookup(&format!("@{d}"))?
                } else {
                    None
                };
                if let Some(value) = hit {
                    let (new_local, new_domain) = split_addr(&value);
                    if new_local.is_empty() {
                        // @otherdomain: keep the original local part.
                        *domain = new_domain;
                    } else {
                        *local = new_local;
                        if new_domain.is_some() {
                            *domain = new_domain;
                        }
                    }
                    let after = match domain.as_ref() {
                        Some(d) => format!("{local}@{d}"),
                        None => local.clone(),
                    };
                    if after != full {
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Split an internal-form address at the last `@`.
fn split_addr(addr: &str) -> (String, Option<String>) {
    addr.rsplit_once('@').map_or_else(
        || (addr.to_string(), None),
        |(local, domain)| {
            let domain = domain.trim_end_matches('.');
            (
                local.to_string(),
                if domain.is_empty() {
                    None
                } else {
                    Some(domain.to_string())
                },
            )
        },
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use postrider_maps::InlineMap;
    use pretty_assertions::assert_eq;

    use super::*;

    fn rewriter() -> Rewriter {
        let mut params = Params::default();
        params.recipient_delimiter = Some('+');
        params.masquerade_domains = vec!["example.com".to_string()];
        Rewriter::new(&params)
    }

    fn canon(rw: &Rewriter, addr: &str) -> String {
        rw.canonicalize(addr, CanonKind::Recipient, false)
            .unwrap()
            .addr
    }

    #[test]
    fn bangpath_swaps_to_domain_form() {
        let rw = rewriter();
        assert_eq!(canon(&rw, "example.org!user"), "user@example.org");
    }

    #[test]
    fn percent_hack_uses_the_rightmost_percent() {
        let rw = rewriter();
        assert_eq!(canon(&rw, "user%inner%outer.example.org"), "user%inner@outer.example.org");
    }

    #[test]
    fn existing_at_sign_disables_both_hacks() {
        let rw = rewriter();
        assert_eq!(canon(&rw, "a!b@example.org"), "a!b@example.org");
    }

    #[test]
    fn extension_is_stripped_only_on_request() {
        let rw = rewriter();
        let with = rw
            .canonicalize("user+lists@example.org", CanonKind::Recipient, true)
            .unwrap();
        assert_eq!(with.addr, "user@example.org");
        assert_eq!(with.extension.as_deref(), Some("lists"));

        let without = rw
            .canonicalize("user+lists@example.org", CanonKind::Recipient, false)
            .unwrap();
        assert_eq!(without.addr, "user+lists@example.org");
        assert_eq!(without.extension, None);
    }

    #[test]
    fn masquerade_strips_to_the_listed_parent() {
        let rw = rewriter();
        assert_eq!(canon(&rw, "user@host.dept.example.com"), "user@example.com");
        assert_eq!(canon(&rw, "user@other.example.net"), "user@other.example.net");
    }

    #[test]
    fn empty_local_part_becomes_the_configured_recipient() {
        let rw = rewriter();
        assert_eq!(canon(&rw, "@example.org"), "MAILER-DAEMON@example.org");
        assert_eq!(canon(&rw, "\"\""), "MAILER-DAEMON");
    }

    #[test]
    fn whitespace_only_address_is_malformed() {
        let rw = rewriter();
        assert!(matches!(
            rw.canonicalize("   ", CanonKind::Recipient, false),
            Err(ResolveError::Malformed(_))
        ));
    }

    #[test]
    fn canonical_map_full_address_match() {
        let map: SharedMap = Arc::new(InlineMap::parse("{old@example.org=new@example.net}").unwrap());
        let rw = rewriter().with_canonical_maps(vec![map]);
        assert_eq!(canon(&rw, "old@example.org"), "new@example.net");
    }

    #[test]
    fn canonical_map_at_domain_keeps_local_part() {
        let map: SharedMap =
            Arc::new(InlineMap::parse("{@old.example.org=@new.example.org}").unwrap());
        let rw = rewriter().with_canonical_maps(vec![map]);
        assert_eq!(canon(&rw, "user@old.example.org"), "user@new.example.org");
    }

    #[test]
    fn sender_maps_apply_to_senders_only() {
        let map: SharedMap = Arc::new(InlineMap::parse("{root=hostmaster@example.org}").unwrap());
        let rw = rewriter().with_sender_canonical_maps(vec![map]);
        assert_eq!(
            rw.canonicalize("root", CanonKind::Sender, false).unwrap().addr,
            "hostmaster@example.org"
        );
        assert_eq!(canon(&rw, "root"), "root");
    }

    #[test]
    fn rewriting_twice_equals_once() {
        let map: SharedMap = Arc::new(
            InlineMap::parse("{a@x.example=b@y.example, b@y.example=c@z.example}").unwrap(),
        );
        let rw = rewriter().with_canonical_maps(vec![map]);
        let once = canon(&rw, "a@x.example");
        let twice = canon(&rw, &once);
        assert_eq!(once, "c@z.example");
        assert_eq!(once, twice);
    }
}
