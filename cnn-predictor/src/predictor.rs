//! Load a trained classifier once and predict with it many times.

use crate::config::PredictorConfig;
use crate::model::ClassifierNet;
use crate::ops::{softmax, top_k, TopK};
use crate::session::Session;
use crate::{Error, Result};
use ndarray::{s, ArrayView2};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Dropout is disabled for every prediction.
const KEEP_PROB: f32 = 1.0;

/// Top-k classifier over a model restored from a checkpoint.
pub struct CnnPredictor {
    model: Arc<ClassifierNet>,
    config: PredictorConfig,
}

impl CnnPredictor {
    /// Restore the model saved under `model_scope` in `result_dir/result_file`
    /// and prepare a top-`k` evaluation over its class probabilities.
    pub fn new(
        session: &mut Session,
        model_scope: &str,
        result_dir: impl AsRef<Path>,
        result_file: &str,
        k: usize,
    ) -> Result<Self> {
        let config = PredictorConfig::default().with_k(k);
        Self::with_config(session, model_scope, result_dir, result_file, config)
    }

    pub fn with_config(
        session: &mut Session,
        model_scope: &str,
        result_dir: impl AsRef<Path>,
        result_file: &str,
        config: PredictorConfig,
    ) -> Result<Self> {
        let model = session.restore(result_dir, result_file, model_scope)?;
        Self::from_model(model, config)
    }

    /// Wrap a model that is already restored.
    pub fn from_model(model: Arc<ClassifierNet>, config: PredictorConfig) -> Result<Self> {
        if config.k == 0 || config.k > model.num_classes() {
            return Err(Error::invalid(format!(
                "k must be between 1 and {}, got {}",
                model.num_classes(),
                config.k
            )));
        }
        if config.default_limit == 0 {
            return Err(Error::invalid("default limit must be at least 1"));
        }
        Ok(Self { model, config })
    }

    pub fn model(&self) -> &ClassifierNet {
        &self.model
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// One evaluation: softmax over the logits, then top-k.
    fn evaluate(&self, features: ArrayView2<f32>) -> Result<TopK> {
        let logits = self.model.forward(features, KEEP_PROB)?;
        top_k(softmax(logits.view()).view(), self.config.k)
    }

    /// Predict the top classes of every row of `features`, evaluating at
    /// most `limit` rows at a time. Rows come back in input order.
    pub fn predict(&self, features: ArrayView2<f32>, limit: usize) -> Result<TopK> {
        let count = features.nrows();
        if limit == 0 {
            return Err(Error::invalid("limit must be at least 1"));
        }
        if count <= limit {
            return self.evaluate(features);
        }

        let mut result = TopK::empty(self.config.k);
        let mut start = 0;
        while start < count {
            let end = (start + limit).min(count);
            debug!(start, end, count, "Evaluating chunk");
            let part = self.evaluate(features.slice(s![start..end, ..]))?;
            result.append(&part)?;
            start = end;
        }

        assert_eq!(result.values.nrows(), count);
        assert_eq!(result.indices.nrows(), count);
        Ok(result)
    }

    /// `predict` with the configured default limit.
    pub fn predict_default(&self, features: ArrayView2<f32>) -> Result<TopK> {
        self.predict(features, self.config.default_limit)
    }
}
