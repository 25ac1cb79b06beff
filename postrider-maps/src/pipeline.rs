//! Sequential map composition.
//!
//! Each successful lookup result feeds the next stage; the result is the
//! value after the last stage that matched. Not-found in the first stage is
//! not-found for the pipeline; a later stage that misses keeps the value
//! from the previous stage.

use crate::{MapError, SharedMap, map::Map};

#[derive(Debug)]
pub struct PipelineMap {
    spec: String,
    stages: Vec<SharedMap>,
}

impl PipelineMap {
    #[must_use]
    pub fn new(stages: Vec<SharedMap>) -> Self {
        let spec = format!(
            "pipeline:{{{}}}",
            stages
                .iter()
                .map(|m| m.name().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Self { spec, stages }
    }
}

impl Map for PipelineMap {
    fn name(&self) -> &str {
        &self.spec
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, MapError> {
        let mut current: Option<String> = None;
        for stage in &self.stages {
            let probe = current.as_deref().unwrap_or(key);
            // Soft errors propagate; the caller retries the whole operation.
            match stage.lookup(probe)? {
                Some(value) => current = Some(value),
                None if current.is_none() => return Ok(None),
                None => {}
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::InlineMap;

    fn inline(spec: &str) -> SharedMap {
        Arc::new(InlineMap::parse(spec).unwrap())
    }

    #[test]
    fn results_feed_forward() {
        let pipeline = PipelineMap::new(vec![inline("{a=b}"), inline("{b=c}")]);
        assert_eq!(pipeline.lookup("a").unwrap(), Some("c".to_string()));
    }

    #[test]
    fn later_miss_keeps_earlier_value() {
        let pipeline = PipelineMap::new(vec![inline("{a=b}"), inline("{x=y}")]);
        assert_eq!(pipeline.lookup("a").unwrap(), Some("b".to_string()));
    }

    #[test]
    fn first_stage_miss_is_not_found() {
        let pipeline = PipelineMap::new(vec![inline("{a=b}"), inline("{b=c}")]);
        assert_eq!(pipeline.lookup("zz").unwrap(), None);
    }

    #[test]
    fn soft_error_propagates() {
        #[derive(Debug)]
        struct Flaky;

        impl Map for Flaky {
            fn name(&self) -> &str {
                "flaky:test"
            }

            fn lookup(&self, _key: &str) -> Result<Option<String>, MapError> {
                Err(MapError::transient("flaky:test", "backend down"))
            }
        }

        let pipeline = PipelineMap::new(vec![inline("{a=b}"), Arc::new(Flaky)]);
        assert!(pipeline.lookup("a").unwrap_err().is_transient());
    }
}
