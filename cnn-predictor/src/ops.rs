//! Row-wise softmax and top-k selection.

use crate::{Error, Result};
use ndarray::{s, Array2, ArrayView2, Axis};

/// The `k` best classes for each sample.
#[derive(Clone, Debug, PartialEq)]
pub struct TopK {
    /// Probabilities, `(samples, k)`, descending along each row.
    pub values: Array2<f32>,
    /// Class index of each entry in `values`.
    pub indices: Array2<usize>,
}

impl TopK {
    pub fn empty(k: usize) -> Self {
        Self {
            values: Array2::zeros((0, k)),
            indices: Array2::zeros((0, k)),
        }
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn k(&self) -> usize {
        self.values.ncols()
    }

    /// Append the rows of `other` below the rows of `self`.
    pub fn append(&mut self, other: &TopK) -> Result<()> {
        self.values.append(Axis(0), other.values.view())?;
        self.indices.append(Axis(0), other.indices.view())?;
        Ok(())
    }

    /// Rows `start..end` as an owned result.
    pub fn rows(&self, start: usize, end: usize) -> TopK {
        TopK {
            values: self.values.slice(s![start..end, ..]).to_owned(),
            indices: self.indices.slice(s![start..end, ..]).to_owned(),
        }
    }
}

pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut out = logits.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    out
}

/// Keep the `k` largest entries of each row, largest first. Equal scores
/// keep the lower column index first.
pub fn top_k(scores: ArrayView2<f32>, k: usize) -> Result<TopK> {
    let (rows, cols) = scores.dim();
    if k > cols {
        return Err(Error::invalid(format!(
            "k = {k} exceeds the {cols} available classes"
        )));
    }

    let mut values = Array2::<f32>::zeros((rows, k));
    let mut indices = Array2::<usize>::zeros((rows, k));
    let mut order: Vec<usize> = Vec::with_capacity(cols);
    for (i, row) in scores.axis_iter(Axis(0)).enumerate() {
        order.clear();
        order.extend(0..cols);
        // Stable sort, so ties stay in index order. NaN sorts last.
        order.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or_else(|| {
            row[a].is_nan().cmp(&row[b].is_nan())
        }));
        for (j, &c) in order.iter().take(k).enumerate() {
            values[[i, j]] = row[c];
            indices[[i, j]] = c;
        }
    }
    Ok(TopK { values, indices })
}
