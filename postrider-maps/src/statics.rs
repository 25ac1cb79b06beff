//! Map that answers every lookup with one fixed value.

use crate::{Map, MapError};

#[derive(Debug)]
pub struct StaticMap {
    spec: String,
    value: String,
}

impl StaticMap {
    #[must_use]
    pub fn new(value: &str) -> Self {
        Self {
            spec: format!("static:{value}"),
            value: value.to_string(),
        }
    }
}

impl Map for StaticMap {
    fn name(&self) -> &str {
        &self.spec
    }

    fn lookup(&self, _key: &str) -> Result<Option<String>, MapError> {
        Ok(Some(self.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_everything() {
        let map = StaticMap::new("relay.example.com");
        assert_eq!(
            map.lookup("anything").unwrap(),
            Some("relay.example.com".to_string())
        );
        assert_eq!(map.lookup("").unwrap(), Some("relay.example.com".to_string()));
    }
}
