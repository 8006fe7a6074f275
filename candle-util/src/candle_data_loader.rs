use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use rand::prelude::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

pub struct MinibatchData {
    /// cells x genes
    pub input: Tensor,
    /// global row index of each cell in `input`
    pub rows: Vec<usize>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;

    /// Partition the samples in their original order (no shuffling)
    fn arrange_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrix. Each row will be
/// considered as a feature vector. A loader may cover a subset of
/// rows, but minibatches always report global row indexes.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    shuffled_input_data: Option<Vec<Tensor>>,
    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec();
        if data.is_empty() {
            return Err(anyhow::anyhow!("empty data"));
        }
        let rows = (0..data.len()).collect();

        Ok(InMemoryData {
            input_data: data,
            shuffled_input_data: None,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }

    ///
    /// A loader over `rows` only, sharing the row tensors of `self`
    ///
    pub fn subset(&self, rows: &[usize]) -> anyhow::Result<Self> {
        if let Some(&r) = rows.iter().find(|&&r| r >= self.input_data.len()) {
            return Err(anyhow::anyhow!(
                "row {} out of range (ntot = {})",
                r,
                self.input_data.len()
            ));
        }

        Ok(InMemoryData {
            input_data: self.input_data.clone(),
            shuffled_input_data: None,
            minibatches: Minibatches {
                samples: rows.to_vec(),
                chunks: vec![],
            },
        })
    }

    pub fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    pub fn num_features(&self) -> usize {
        self.input_data
            .first()
            .and_then(|x| x.dims().last().copied())
            .unwrap_or(0)
    }

    pub fn samples(&self) -> &[usize] {
        &self.minibatches.samples
    }

    fn preload_chunks(&mut self) -> anyhow::Result<()> {
        let mut shuffled_data = Vec::with_capacity(self.minibatches.chunks.len());
        for samples in self.minibatches.chunks.iter() {
            let chunk: Vec<Tensor> = samples.iter().map(|&i| self.input_data[i].clone()).collect();
            shuffled_data.push(Tensor::cat(&chunk, 0)?);
        }
        self.shuffled_input_data = Some(shuffled_data);
        Ok(())
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let shuffled = self
            .shuffled_input_data
            .as_ref()
            .ok_or(anyhow::anyhow!("need to shuffle data"))?;

        match (shuffled.get(batch_idx), self.minibatches.chunks.get(batch_idx)) {
            (Some(input), Some(rows)) => Ok(MinibatchData {
                input: input.to_device(target_device)?,
                rows: rows.clone(),
            }),
            _ => Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                self.num_minibatch()
            )),
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size);
        self.preload_chunks()
    }

    fn arrange_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.arrange_minibatch(batch_size);
        self.preload_chunks()
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);
        self.arrange_minibatch(batch_size);
    }

    pub fn arrange_minibatch(&mut self, batch_size: usize) {
        self.chunks = self
            .samples
            .par_chunks(batch_size.max(1))
            .map(|c| c.to_vec())
            .collect();
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

/// Train/validation/test fractions; the test split takes the rest
#[derive(Clone, Debug)]
pub struct SplitConfig {
    pub train_frac: f64,
    pub validation_frac: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train_frac: 0.8,
            validation_frac: 0.1,
            seed: 42,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
}

///
/// Randomly partition `0..nrows` into train, validation and test rows
///
pub fn split_rows(nrows: usize, config: &SplitConfig) -> anyhow::Result<DataSplit> {
    let (ft, fv) = (config.train_frac, config.validation_frac);
    if !(0.0..=1.0).contains(&ft) || !(0.0..=1.0).contains(&fv) || ft + fv > 1.0 + 1e-8 {
        return Err(anyhow::anyhow!(
            "invalid split fractions: train {}, validation {}",
            ft,
            fv
        ));
    }

    let mut rows: Vec<usize> = (0..nrows).collect();
    let mut rng = StdRng::seed_from_u64(config.seed);
    rows.shuffle(&mut rng);

    let ntrain = ((nrows as f64) * ft).round() as usize;
    let ntrain = ntrain.min(nrows);
    let nval = (((nrows as f64) * fv).round() as usize).min(nrows - ntrain);

    if ntrain == 0 {
        return Err(anyhow::anyhow!("no training samples out of {}", nrows));
    }

    let test = rows.split_off(ntrain + nval);
    let validation = rows.split_off(ntrain);

    Ok(DataSplit {
        train: rows,
        validation,
        test,
    })
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .and_then(|v| v.reshape((1, row.len())))
                    .expect("failed to create tensor");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let nrows = self.dims().first().copied().unwrap_or(0);
        (0..nrows)
            .map(|i| self.narrow(0, i, 1).expect("failed to narrow"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    #[test]
    fn minibatches_cover_every_row_once() -> anyhow::Result<()> {
        let x = Tensor::arange(0_f32, 30_f32, &Device::Cpu)?.reshape((10, 3))?;
        let mut data = InMemoryData::new(&x)?;
        data.shuffle_minibatch(4)?;
        assert_eq!(data.num_minibatch(), 3);

        let mut seen = vec![];
        for b in 0..data.num_minibatch() {
            let mb = data.minibatch_data(b, &Device::Cpu)?;
            let rows = mb.input.to_vec2::<f32>()?;
            for (r, row) in mb.rows.iter().zip(rows.iter()) {
                // row r of `x` starts with 3 * r
                assert_eq!(row[0], (*r * 3) as f32);
            }
            seen.extend(mb.rows);
        }
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn subset_keeps_global_rows() -> anyhow::Result<()> {
        let x = Tensor::ones((6, 2), DType::F32, &Device::Cpu)?;
        let data = InMemoryData::new(&x)?;
        let mut sub = data.subset(&[5, 1, 3])?;
        sub.arrange_minibatch(2)?;
        assert_eq!(sub.num_minibatch(), 2);
        assert_eq!(sub.minibatch_data(0, &Device::Cpu)?.rows, vec![5, 1]);
        assert_eq!(sub.minibatch_data(1, &Device::Cpu)?.rows, vec![3]);
        assert!(data.subset(&[6]).is_err());
        Ok(())
    }

    #[test]
    fn split_partitions_rows() -> anyhow::Result<()> {
        let split = split_rows(
            100,
            &SplitConfig {
                train_frac: 0.7,
                validation_frac: 0.2,
                seed: 1,
            },
        )?;
        assert_eq!(split.train.len(), 70);
        assert_eq!(split.validation.len(), 20);
        assert_eq!(split.test.len(), 10);

        let mut all: Vec<usize> = [split.train, split.validation, split.test].concat();
        all.sort();
        assert_eq!(all, (0..100).collect::<Vec<_>>());

        let too_much = SplitConfig {
            train_frac: 0.9,
            validation_frac: 0.5,
            seed: 0,
        };
        assert!(split_rows(10, &too_much).is_err());
        Ok(())
    }
}
