use crate::checkpoint::{load_checkpoint, meta_path};
use crate::model::ClassifierNet;
use crate::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Owns the networks restored from checkpoints. Predictors hold shared
/// read-only handles, so a checkpoint/scope pair is restored at most once
/// per session.
#[derive(Default)]
pub struct Session {
    restored: HashMap<(PathBuf, String), Arc<ClassifierNet>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore the graph under `scope` from checkpoint `file` in `dir`,
    /// or return the handle restored earlier.
    pub fn restore(
        &mut self,
        dir: impl AsRef<Path>,
        file: &str,
        scope: &str,
    ) -> Result<Arc<ClassifierNet>> {
        let dir = dir.as_ref();
        let key = (meta_path(dir, file), scope.to_string());
        if let Some(net) = self.restored.get(&key) {
            return Ok(Arc::clone(net));
        }

        let mut checkpoint = load_checkpoint(dir, file)?;
        checkpoint.retain_scope(scope);
        let net = Arc::new(ClassifierNet::from_checkpoint(&checkpoint, scope)?);
        info!(
            path = %checkpoint.path().display(),
            scope = net.scope(),
            inputs = net.input_dim(),
            classes = net.num_classes(),
            "Restored model"
        );
        self.restored.insert(key, Arc::clone(&net));
        Ok(net)
    }

    /// Number of distinct models restored so far.
    pub fn len(&self) -> usize {
        self.restored.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restored.is_empty()
    }
}
