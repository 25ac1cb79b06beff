//! Address resolution: classify an address and pick its delivery route.

use std::sync::Arc;

use postrider_common::Params;
use tracing::debug;

use crate::{
    ResolveError, TransportTable,
    rewrite::{CanonKind, Rewriter},
};

/// The resolver's answer for one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Delivery agent service name.
    pub transport: String,
    /// Agent-specific target; empty for fully local delivery.
    pub nexthop: String,
    /// Recipient in canonical internal form.
    pub recipient: String,
}

/// Maps a canonical address to `(transport, nexthop, recipient)`.
///
/// The loop strips local domains and re-resolves routing characters left in
/// the local part until the destination is remote or gone; this is what
/// makes `resolve(resolve(a)) == resolve(a)` hold.
#[derive(Debug)]
pub struct Resolver {
    params: Arc<Params>,
    rewriter: Rewriter,
    transports: TransportTable,
}

/// Bound on local-domain stripping rounds; a longer chain means a routing
/// loop in the configuration.
const MAX_STRIP_ROUNDS: usize = 64;

impl Resolver {
    #[must_use]
    pub fn new(params: Arc<Params>, rewriter: Rewriter, transports: TransportTable) -> Self {
        Self {
            params,
            rewriter,
            transports,
        }
    }

    pub fn resolve(&self, addr: &str) -> Result<Resolution, ResolveError> {
        let mut current = self
            .rewriter
            .canonicalize(addr, CanonKind::Recipient, false)?
            .addr;

        let mut saved_domain: Option<String> = None;
        let mut remote_domain: Option<String> = None;

        for _ in 0..MAX_STRIP_ROUNDS {
            let (local, domain) = match current.rsplit_once('@') {
                Some((local, domain)) => (local.to_string(), Some(domain.trim_end_matches('.'))),
                None => (current.clone(), None),
            };

            if let Some(domain) = domain {
                if !self.params.is_local_domain(domain) {
                    remote_domain = Some(domain.to_string());
                    current = format!("{local}@{domain}");
                    break;
                }
                // Strip (and save) the local @domain, then retry with the
                // local part alone.
                saved_domain = Some(domain.to_string());
                current = local;
                continue;
            }

            // No domain left: re-resolve routing characters hidden in the
            // local part.
            if (self.params.swap_bangpath && current.contains('!'))
                || (self.params.percent_hack && current.contains('%'))
            {
                current = self
                    .rewriter
                    .canonicalize(&current, CanonKind::Recipient, false)?
                    .addr;
                continue;
            }
            break;
        }

        if let Some(domain) = remote_domain {
            let entry = self.transports.lookup(&domain)?;
            let (transport, nexthop) = match entry {
                Some(entry) => (
                    entry
                        .transport
                        .unwrap_or_else(|| self.params.default_transport.clone()),
                    entry.nexthop.unwrap_or_else(|| domain.clone()),
                ),
                None => (
                    self.params.default_transport.clone(),
                    self.params
                        .relayhost
                        .clone()
                        .unwrap_or_else(|| domain.clone()),
                ),
            };
            let resolution = Resolution {
                transport,
                nexthop,
                recipient: current,
            };
            debug!(addr, transport = %resolution.transport, nexthop = %resolution.nexthop, "resolved remote");
            return Ok(resolution);
        }

        // Fully local: requalify with the stripped domain, or our hostname.
        let domain = saved_domain.unwrap_or_else(|| self.params.myhostname.clone());
        let resolution = Resolution {
            transport: self.params.local_transport.clone(),
            nexthop: String::new(),
            recipient: format!("{current}@{domain}"),
        };
        debug!(addr, recipient = %resolution.recipient, "resolved local");
        Ok(resolution)
    }
}
