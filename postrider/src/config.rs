//! The RON configuration file.
//!
//! `POSTRIDER_CONFIG` (or `--config`) names the configuration directory;
//! the file inside is `postrider.ron`.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use postrider_common::{Params, ports::KnownTcpPorts};
use postrider_maps::{MapRegistry, registry::OpenFlags};
use postrider_master::ServiceConfig;
use postrider_rewrite::{Resolver, Rewriter, TransportTable};
use serde::Deserialize;

pub const CONFIG_ENV: &str = "POSTRIDER_CONFIG";
const CONFIG_FILE: &str = "postrider.ron";

/// Map specifications by role; each value is a list of `type:name` specs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapSpecs {
    pub canonical: Option<String>,
    pub sender_canonical: Option<String>,
    pub recipient_canonical: Option<String>,
    pub virtual_aliases: Option<String>,
    pub transport: Option<String>,
    /// Match `.parent` transport entries for subdomains.
    pub transport_parent_matching: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub params: Params,
    pub maps: MapSpecs,
    pub services: Vec<ServiceConfig>,
}

impl AppConfig {
    /// Resolve the configuration directory from the flag or environment.
    #[must_use]
    pub fn config_dir(flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/etc/postrider"))
    }

    /// Load `postrider.ron` from the configuration directory. A missing
    /// file yields the built-in defaults.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(ron::from_str(&text)
                .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!("{}: {e}", path.display())),
        }
    }

    /// Build the rewriter from the configured canonical maps.
    pub fn build_rewriter(&self, registry: &MapRegistry) -> anyhow::Result<Rewriter> {
        let open = |specs: &Option<String>| -> anyhow::Result<Vec<_>> {
            specs.as_deref().map_or_else(
                || Ok(Vec::new()),
                |specs| Ok(registry.open_list(specs, OpenFlags { fold_case: true })?),
            )
        };
        Ok(Rewriter::new(&self.params)
            .with_canonical_maps(open(&self.maps.canonical)?)
            .with_sender_canonical_maps(open(&self.maps.sender_canonical)?)
            .with_recipient_canonical_maps(open(&self.maps.recipient_canonical)?))
    }

    /// Build the resolver, including the transport table and known ports.
    pub fn build_resolver(&self, registry: &MapRegistry) -> anyhow::Result<Resolver> {
        let ports = KnownTcpPorts::parse(&self.params.known_tcp_ports)
            .map_err(|e| anyhow::anyhow!("known_tcp_ports: {e}"))?;
        let transport_map = self
            .maps
            .transport
            .as_deref()
            .map(|spec| registry.open(spec, OpenFlags { fold_case: true }))
            .transpose()?;
        let transports = TransportTable::new(
            transport_map,
            self.maps.transport_parent_matching,
            ports,
        );
        Ok(Resolver::new(
            Arc::new(self.params.clone()),
            self.build_rewriter(registry)?,
            transports,
        ))
    }

    /// Virtual alias maps for cleanup.
    pub fn build_aliases(
        &self,
        registry: &MapRegistry,
    ) -> anyhow::Result<Vec<postrider_maps::SharedMap>> {
        self.maps.virtual_aliases.as_deref().map_or_else(
            || Ok(Vec::new()),
            |specs| Ok(registry.open_list(specs, OpenFlags { fold_case: true })?),
        )
    }
}
