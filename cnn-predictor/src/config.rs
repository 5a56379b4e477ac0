use serde::{Deserialize, Serialize};

/// Default number of samples evaluated in one pass.
pub const DEFAULT_LIMIT: usize = 10_000;

/// Settings applied to every prediction made by a `CnnPredictor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    /// Number of classes returned per sample.
    pub k: usize,
    /// Maximum rows per evaluation. Tune to the memory of the host,
    /// the image size and the model size.
    pub default_limit: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            k: 1,
            default_limit: DEFAULT_LIMIT,
        }
    }
}

impl PredictorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit;
        self
    }

    /// Parse a config from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
