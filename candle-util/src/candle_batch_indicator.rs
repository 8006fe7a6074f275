use candle_core::{DType, Device, Tensor};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Explicit mapping from batch labels to indicator columns.
///
/// Columns follow the sorted distinct labels. Integer labels sort
/// numerically (so `1..=K` land on columns `0..K`), other labels sort
/// lexicographically after them.
#[derive(Clone, Debug, Default)]
pub struct BatchLabelMap {
    names: Vec<Box<str>>,
    column: HashMap<Box<str>, usize>,
}

fn label_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        _ => a.cmp(b),
    }
}

impl BatchLabelMap {
    pub fn from_labels<S: AsRef<str>>(labels: &[S]) -> Self {
        let mut names: Vec<Box<str>> = labels.iter().map(|x| Box::from(x.as_ref())).collect();
        names.sort_by(|a, b| label_order(a, b));
        names.dedup();

        let column = names
            .iter()
            .enumerate()
            .map(|(j, x)| (x.clone(), j))
            .collect();

        Self { names, column }
    }

    /// number of distinct batch labels
    pub fn num_batches(&self) -> usize {
        self.names.len()
    }

    /// number of columns of the indicator matrix (at least one)
    pub fn indicator_width(&self) -> usize {
        if self.num_batches() > 1 {
            self.num_batches()
        } else {
            1
        }
    }

    pub fn column(&self, label: &str) -> Option<usize> {
        self.column.get(label).copied()
    }

    pub fn names(&self) -> &[Box<str>] {
        &self.names
    }

    /// Build the batch indicator matrix for `labels` (n x width)
    ///
    /// * more than one batch: one-hot rows
    /// * a single batch: a column of ones
    ///
    /// Every label must have been registered in this map.
    pub fn indicator<S: AsRef<str>>(&self, labels: &[S], dev: &Device) -> anyhow::Result<Tensor> {
        let nn = labels.len();

        for x in labels {
            if self.column(x.as_ref()).is_none() {
                return Err(anyhow::anyhow!("unknown batch label: {}", x.as_ref()));
            }
        }

        if self.num_batches() <= 1 {
            return Ok(Tensor::ones((nn, 1), DType::F32, dev)?);
        }

        let kk = self.num_batches();
        let mut data = vec![0_f32; nn * kk];
        for (i, x) in labels.iter().enumerate() {
            if let Some(j) = self.column(x.as_ref()) {
                data[i * kk + j] = 1.;
            }
        }
        Ok(Tensor::from_vec(data, (nn, kk), dev)?)
    }
}

/// Register labels and build their indicator matrix in one go
///
/// Returns `(indicator_nb, label_map)`
pub fn one_hot_batches<S: AsRef<str>>(
    labels: &[S],
    dev: &Device,
) -> anyhow::Result<(Tensor, BatchLabelMap)> {
    let label_map = BatchLabelMap::from_labels(labels);
    let batch_nb = label_map.indicator(labels, dev)?;
    Ok((batch_nb, label_map))
}
