use anyhow::{bail, Context, Result};
use cnn_predictor::{CnnPredictor, TopK};
use ndarray::{Array2, ArrayView2};
use std::path::Path;

/// Parse a feature matrix: one sample per line, values separated by
/// whitespace or commas. Blank lines and `#` comments are skipped.
pub fn parse_features(text: &str) -> Result<Array2<f32>> {
    let mut values = Vec::new();
    let mut cols = None;
    let mut rows = 0;
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let row = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<f32>()
                    .with_context(|| format!("line {}: bad value `{s}`", lineno + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        match cols {
            None => cols = Some(row.len()),
            Some(n) if n != row.len() => {
                bail!("line {}: expected {n} values, found {}", lineno + 1, row.len())
            }
            Some(_) => {}
        }
        values.extend(row);
        rows += 1;
    }
    Ok(Array2::from_shape_vec((rows, cols.unwrap_or(0)), values)?)
}

pub fn read_features(path: &Path) -> Result<Array2<f32>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading features from {}", path.display()))?;
    parse_features(&text)
}

/// Predict every sample with the configured limit. A file holding no
/// samples has no width to check against the model, so it yields no rows.
pub fn predict_samples(predictor: &CnnPredictor, features: ArrayView2<f32>) -> Result<TopK> {
    if features.nrows() == 0 {
        return Ok(TopK::empty(predictor.config().k));
    }
    Ok(predictor.predict_default(features)?)
}

/// One line per sample: `row: class=probability ...`.
pub fn format_predictions(top: &TopK) -> Vec<String> {
    top.values
        .outer_iter()
        .zip(top.indices.outer_iter())
        .enumerate()
        .map(|(row, (vals, idxs))| {
            let classes = idxs
                .iter()
                .zip(vals.iter())
                .map(|(i, v)| format!("{i}={v:.4}"))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{row}: {classes}")
        })
        .collect()
}
