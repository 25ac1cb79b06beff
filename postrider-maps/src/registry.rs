//! Map registry: opens `type:name` specifications and shares backend
//! instances between openers.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::{
    DebugMap, InlineMap, MapError, PipelineMap, SharedMap, StaticMap, UnionMap, map::FoldMap,
};

/// Open options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OpenFlags {
    /// Fold keys to lowercase before lookup.
    pub fold_case: bool,
}

/// Explicit handle replacing a process-global dictionary registry.
///
/// Opening the same specification twice yields the same underlying backend
/// instance; the `Arc` reference count tracks the openers.
#[derive(Debug, Default)]
pub struct MapRegistry {
    open: Mutex<AHashMap<(String, bool), SharedMap>>,
}

impl MapRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a map by specification, e.g. `inline:{a=b}`,
    /// `pipeline:{inline:{a=b}, inline:{b=c}}`, `static:relay.example.com`,
    /// or `debug:inline:{a=b}`.
    pub fn open(&self, spec: &str, flags: OpenFlags) -> Result<SharedMap, MapError> {
        let key = (spec.to_string(), flags.fold_case);
        if let Some(existing) = self.open.lock().get(&key) {
            return Ok(Arc::clone(existing));
        }

        let mut map = self.build(spec)?;
        if flags.fold_case {
            map = Arc::new(FoldMap::new(map));
        }
        self.open.lock().insert(key, Arc::clone(&map));
        Ok(map)
    }

    /// Open a whitespace/comma separated list of specifications.
    pub fn open_list(&self, specs: &str, flags: OpenFlags) -> Result<Vec<SharedMap>, MapError> {
        split_specs(specs)
            .into_iter()
            .map(|spec| self.open(&spec, flags))
            .collect()
    }

    fn build(&self, spec: &str) -> Result<SharedMap, MapError> {
        let (kind, name) = spec
            .split_once(':')
            .ok_or_else(|| MapError::syntax(spec, "need type:name"))?;
        match kind {
            "inline" => Ok(Arc::new(InlineMap::parse(name)?)),
            "static" => Ok(Arc::new(StaticMap::new(name))),
            "debug" => Ok(Arc::new(DebugMap::new(self.build(name)?))),
            "pipeline" => Ok(Arc::new(PipelineMap::new(self.build_members(spec, name)?))),
            "union" => Ok(Arc::new(UnionMap::new(self.build_members(spec, name)?))),
            other => Err(MapError::syntax(spec, format!("unknown map type {other:?}"))),
        }
    }

    fn build_members(&self, spec: &str, body: &str) -> Result<Vec<SharedMap>, MapError> {
        let inner = body
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .ok_or_else(|| MapError::syntax(spec, "need {map, map...}"))?;
        let members = split_specs(inner);
        if members.is_empty() {
            return Err(MapError::syntax(spec, "empty member list"));
        }
        members.into_iter().map(|m| self.build(&m)).collect()
    }
}

/// Split a specification list on commas and whitespace outside braces.
fn split_specs(text: &str) -> Vec<String> {
    let mut specs = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '{' => {
                depth += 1;
                current.push(ch);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' | ' ' | '\t' | '\n' if depth == 0 => {
                if !current.is_empty() {
                    specs.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        specs.push(current);
    }
    specs
}
