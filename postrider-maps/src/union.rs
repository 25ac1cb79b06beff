//! Union map: concatenation of all member results.

use crate::{MapError, SharedMap, map::Map};

/// Looks up the key in every member and joins the successful results with
/// commas, in member order. Not-found only when every member misses; a soft
/// error from any member is a soft error for the union.
#[derive(Debug)]
pub struct UnionMap {
    spec: String,
    members: Vec<SharedMap>,
}

impl UnionMap {
    #[must_use]
    pub fn new(members: Vec<SharedMap>) -> Self {
        let spec = format!(
            "union:{{{}}}",
            members
                .iter()
                .map(|m| m.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self { spec, members }
    }
}

impl Map for UnionMap {
    fn name(&self) -> &str {
        &self.spec
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, MapError> {
        let mut found = Vec::new();
        for member in &self.members {
            if let Some(value) = member.lookup(key)? {
                found.push(value);
            }
        }
        if found.is_empty() {
            Ok(None)
        } else {
            Ok(Some(found.join(",")))
        }
    }
}
