// pipelite-core/src/options.rs
// Engine configuration

use serde::{Deserialize, Serialize};

/// Options that shape how pipelines run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Seed for `$sample`; unset draws from OS entropy
    pub sample_seed: Option<u64>,

    /// Run `$facet` branches on scoped worker threads
    pub parallel_facets: bool,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_seed(mut self, seed: u64) -> Self {
        self.sample_seed = Some(seed);
        self
    }

    pub fn with_parallel_facets(mut self, parallel: bool) -> Self {
        self.parallel_facets = parallel;
        self
    }
}
