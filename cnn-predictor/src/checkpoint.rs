//! On-disk checkpoint layout.
//!
//! A checkpoint called `name` is a pair of files in one directory:
//! `name.meta` holds the JSON graph description and variable table, and
//! `name.weights` holds every variable as little-endian `f32` values laid
//! out back to back. The weights file is memory-mapped on load.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use memmap2::{Mmap, MmapOptions};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Suffix of the metadata file that names a checkpoint.
pub const META_SUFFIX: &str = ".meta";
/// Suffix of the raw weights file.
pub const WEIGHTS_SUFFIX: &str = ".weights";
/// Layout version written by `save_checkpoint`.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    #[default]
    #[serde(rename = "none")]
    Linear,
}

/// One node of a stored graph. Weight and bias fields name entries in the
/// checkpoint's variable table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerDef {
    /// 3x3 "same" convolution with stride 1. Weights are `[3, 3, in, out]`.
    Conv2d {
        weights: String,
        bias: String,
        #[serde(default)]
        activation: Activation,
    },
    MaxPool { size: usize },
    Flatten,
    /// Fully connected layer. Weights are `[in, out]`.
    Dense {
        weights: String,
        bias: String,
        #[serde(default)]
        activation: Activation,
    },
    Dropout,
}

/// A classifier graph registered under a scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphDef {
    pub scope: String,
    /// Image shape `[height, width, channels]`; samples arrive flattened.
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub layers: Vec<LayerDef>,
}

impl GraphDef {
    /// Length of one flattened input row.
    pub fn input_dim(&self) -> usize {
        self.input_shape.iter().product()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableEntry {
    pub name: String,
    pub shape: Vec<usize>,
    /// Position of the first value, counted in `f32` elements.
    pub offset: usize,
}

impl VariableEntry {
    /// Number of values, or `None` if the shape overflows.
    pub fn value_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// One past the last value, or `None` on overflow.
    pub fn end(&self) -> Option<usize> {
        self.offset.checked_add(self.value_count()?)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub graphs: Vec<GraphDef>,
    pub variables: Vec<VariableEntry>,
}

pub fn meta_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{META_SUFFIX}"))
}

pub fn weights_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}{WEIGHTS_SUFFIX}"))
}

enum WeightStore {
    Mapped(Mmap),
    Owned(Vec<f32>),
}

impl WeightStore {
    fn as_slice(&self) -> &[f32] {
        match self {
            // Length and alignment are checked before a map is kept.
            WeightStore::Mapped(map) => bytemuck::cast_slice(&map[..]),
            WeightStore::Owned(values) => values,
        }
    }
}

/// A checkpoint restored from disk.
pub struct Checkpoint {
    path: PathBuf,
    meta: CheckpointMeta,
    weights: WeightStore,
}

impl Checkpoint {
    pub fn meta(&self) -> &CheckpointMeta {
        &self.meta
    }

    /// Path of the `.meta` file this checkpoint was read from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.weights, WeightStore::Mapped(_))
    }

    pub fn graph(&self, scope: &str) -> Result<&GraphDef> {
        self.meta
            .graphs
            .iter()
            .find(|g| g.scope == scope)
            .ok_or_else(|| Error::MissingScope(scope.to_string()))
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.meta.variables.iter().map(|v| v.name.as_str())
    }

    /// Borrow a variable's values in its stored shape.
    pub fn variable(&self, name: &str) -> Result<ArrayViewD<'_, f32>> {
        let entry = self
            .meta
            .variables
            .iter()
            .find(|v| v.name == name)
            .ok_or_else(|| Error::checkpoint(format!("variable `{name}` not found")))?;
        let values = self.weights.as_slice();
        let end = match entry.end() {
            Some(end) if end <= values.len() => end,
            _ => {
                return Err(Error::checkpoint(format!(
                    "variable `{name}` at offset {} with shape {:?} exceeds the {} stored values",
                    entry.offset,
                    entry.shape,
                    values.len()
                )))
            }
        };
        let view = ArrayViewD::from_shape(IxDyn(&entry.shape), &values[entry.offset..end])?;
        Ok(view)
    }

    /// Drop every variable whose name does not start with `scope`, so only
    /// one model's weights stay addressable.
    pub fn retain_scope(&mut self, scope: &str) {
        self.meta.variables.retain(|v| v.name.starts_with(scope));
    }
}

/// Read `name.meta` and `name.weights` from `dir`.
pub fn load_checkpoint(dir: impl AsRef<Path>, name: &str) -> Result<Checkpoint> {
    let dir = dir.as_ref();
    let path = meta_path(dir, name);
    let meta: CheckpointMeta = serde_json::from_reader(File::open(&path)?)?;
    if meta.format_version != FORMAT_VERSION {
        return Err(Error::checkpoint(format!(
            "unsupported format version {} in {}",
            meta.format_version,
            path.display()
        )));
    }

    let weights = read_weights(&weights_path(dir, name))?;
    let total = weights.as_slice().len();
    if let Some(v) = meta.variables.iter().find(|v| v.end().map_or(true, |end| end > total)) {
        return Err(Error::checkpoint(format!(
            "variable `{}` runs past the end of the weights file",
            v.name
        )));
    }

    tracing::debug!(
        path = %path.display(),
        graphs = meta.graphs.len(),
        variables = meta.variables.len(),
        mapped = matches!(weights, WeightStore::Mapped(_)),
        "Read checkpoint"
    );
    Ok(Checkpoint { path, meta, weights })
}

fn read_weights(path: &Path) -> Result<WeightStore> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len % 4 != 0 {
        return Err(Error::checkpoint(format!(
            "{} holds {len} bytes, not a whole number of f32 values",
            path.display()
        )));
    }

    if cfg!(target_endian = "little") && len > 0 {
        // SAFETY: the map is read-only and checkpoints are not rewritten
        // while a predictor holds them.
        match unsafe { MmapOptions::new().map(&file) } {
            Ok(map) if bytemuck::try_cast_slice::<u8, f32>(&map[..]).is_ok() => {
                return Ok(WeightStore::Mapped(map));
            }
            Ok(_) => tracing::debug!(path = %path.display(), "Unaligned map, reading weights"),
            Err(e) => tracing::debug!(path = %path.display(), "Mapping failed, reading weights: {}", e),
        }
    }

    let bytes = std::fs::read(path)?;
    let values = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(WeightStore::Owned(values))
}

/// Write a checkpoint named `name` into `dir`. Variable offsets are assigned
/// in the order given. Returns the path of the `.meta` file.
pub fn save_checkpoint(
    dir: impl AsRef<Path>,
    name: &str,
    graphs: Vec<GraphDef>,
    variables: &[(String, ArrayD<f32>)],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    let mut entries = Vec::with_capacity(variables.len());
    let mut offset = 0;
    let mut out = BufWriter::new(File::create(weights_path(dir, name))?);
    for (var_name, values) in variables {
        if entries.iter().any(|e: &VariableEntry| &e.name == var_name) {
            return Err(Error::invalid(format!("duplicate variable `{var_name}`")));
        }
        // `iter` walks logical (row-major) order whatever the memory layout.
        for v in values.iter() {
            out.write_all(&v.to_le_bytes())?;
        }
        entries.push(VariableEntry {
            name: var_name.clone(),
            shape: values.shape().to_vec(),
            offset,
        });
        offset += values.len();
    }
    out.flush()?;

    let meta = CheckpointMeta {
        format_version: FORMAT_VERSION,
        saved_at: Utc::now(),
        graphs,
        variables: entries,
    };
    let path = meta_path(dir, name);
    let mut f = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut f, &meta)?;
    f.flush()?;

    tracing::info!(path = %path.display(), values = offset, "Saved checkpoint");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    fn dense_graph(scope: &str) -> GraphDef {
        GraphDef {
            scope: scope.to_string(),
            input_shape: [1, 1, 2],
            num_classes: 2,
            layers: vec![LayerDef::Dense {
                weights: format!("{scope}fc/weights"),
                bias: format!("{scope}fc/bias"),
                activation: Activation::Linear,
            }],
        }
    }

    #[test]
    fn save_then_load_keeps_variables() {
        let dir = tempfile::tempdir().unwrap();
        let w = arr2(&[[1.0_f32, 2.0], [3.0, 4.0]]).into_dyn();
        let b = arr1(&[0.5_f32, -0.5]).into_dyn();
        save_checkpoint(
            dir.path(),
            "step1_model",
            vec![dense_graph("step1_")],
            &[
                ("step1_fc/weights".to_string(), w.clone()),
                ("step1_fc/bias".to_string(), b.clone()),
            ],
        )
        .unwrap();

        let ckpt = load_checkpoint(dir.path(), "step1_model").unwrap();
        assert_eq!(ckpt.variable("step1_fc/weights").unwrap(), w.view());
        assert_eq!(ckpt.variable("step1_fc/bias").unwrap(), b.view());
        assert_eq!(ckpt.graph("step1_").unwrap().input_dim(), 2);
    }

    #[test]
    fn retain_scope_drops_other_models() {
        let dir = tempfile::tempdir().unwrap();
        let v = arr1(&[1.0_f32]).into_dyn();
        save_checkpoint(
            dir.path(),
            "both",
            vec![],
            &[("a/x".to_string(), v.clone()), ("b/x".to_string(), v)],
        )
        .unwrap();

        let mut ckpt = load_checkpoint(dir.path(), "both").unwrap();
        ckpt.retain_scope("a/");
        assert_eq!(ckpt.variable_names().collect::<Vec<_>>(), vec!["a/x"]);
        assert!(ckpt.variable("b/x").is_err());
    }

    #[test]
    fn truncated_weights_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = arr1(&[1.0_f32, 2.0, 3.0]).into_dyn();
        save_checkpoint(dir.path(), "short", vec![], &[("x".to_string(), v)]).unwrap();
        std::fs::write(weights_path(dir.path(), "short"), [0u8; 8]).unwrap();

        let err = load_checkpoint(dir.path(), "short").err().unwrap();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    fn rewrite_meta(dir: &Path, name: &str, edit: impl FnOnce(&mut CheckpointMeta)) {
        let path = meta_path(dir, name);
        let mut meta: CheckpointMeta =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        edit(&mut meta);
        std::fs::write(&path, serde_json::to_string(&meta).unwrap()).unwrap();
    }

    #[test]
    fn overflowing_offset_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = arr1(&[1.0_f32, 2.0]).into_dyn();
        save_checkpoint(dir.path(), "bad", vec![], &[("x".to_string(), v)]).unwrap();
        rewrite_meta(dir.path(), "bad", |m| m.variables[0].offset = usize::MAX);

        let err = load_checkpoint(dir.path(), "bad").err().unwrap();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let v = arr1(&[1.0_f32]).into_dyn();
        save_checkpoint(dir.path(), "huge", vec![], &[("x".to_string(), v)]).unwrap();
        rewrite_meta(dir.path(), "huge", |m| {
            m.variables[0].shape = vec![usize::MAX, 2];
        });

        let err = load_checkpoint(dir.path(), "huge").err().unwrap();
        assert!(matches!(err, Error::Checkpoint(_)));
    }

    #[test]
    fn weights_are_memory_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let v = arr1(&[1.5_f32, -2.0, 3.25]).into_dyn();
        let meta = save_checkpoint(dir.path(), "mapped", vec![], &[("x".to_string(), v.clone())])
            .unwrap();

        let ckpt = load_checkpoint(dir.path(), "mapped").unwrap();
        assert_eq!(ckpt.is_mapped(), cfg!(target_endian = "little"));
        assert_eq!(ckpt.path(), meta.as_path());
        assert_eq!(ckpt.variable("x").unwrap(), v.view());
    }

    #[test]
    fn empty_weights_are_read_without_mapping() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(dir.path(), "bare", vec![dense_graph("m/")], &[]).unwrap();

        let ckpt = load_checkpoint(dir.path(), "bare").unwrap();
        assert!(!ckpt.is_mapped());
        assert_eq!(ckpt.variable_names().count(), 0);
        assert!(ckpt.graph("m/").is_ok());
    }

    #[test]
    fn missing_meta_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_checkpoint(dir.path(), "absent").err().unwrap();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn activation_defaults_to_none() {
        let layer: LayerDef =
            serde_json::from_str(r#"{ "type": "dense", "weights": "w", "bias": "b" }"#).unwrap();
        assert_eq!(
            layer,
            LayerDef::Dense {
                weights: "w".into(),
                bias: "b".into(),
                activation: Activation::Linear,
            }
        );
    }
}
