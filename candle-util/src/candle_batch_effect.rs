use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Additive batch effect `delta[n,g] = sum_b B[n,b] * W[g,b]`
///
/// A bias-free linear projection of the batch indicator matrix
/// (one-hot or a constant column of ones) onto genes. Weights start
/// at zero, so an untrained model applies no correction at all.
#[derive(Clone, Debug)]
pub struct BatchEffectCorrector {
    n_batch: usize,
    n_genes: usize,
    linear: Linear,
}

impl BatchEffectCorrector {
    /// Will create these variables:
    ///
    /// * `{vb}.weight` - n_genes x n_batch, all zero
    pub fn new(n_batch: usize, n_genes: usize, vb: VarBuilder) -> Result<Self> {
        let n_batch = n_batch.max(1);
        let ws = vb.get_with_hints((n_genes, n_batch), "weight", candle_nn::init::ZERO)?;
        Ok(Self {
            n_batch,
            n_genes,
            linear: Linear::new(ws, None),
        })
    }

    /// batch x gene effect sizes
    pub fn effects(&self) -> Result<Tensor> {
        self.linear.weight().t()
    }

    pub fn dim_batch(&self) -> usize {
        self.n_batch
    }

    pub fn dim_obs(&self) -> usize {
        self.n_genes
    }
}

impl Module for BatchEffectCorrector {
    /// * `batch_nb` - batch indicator (n x b)
    ///
    /// Returns `delta_nd` (n x genes)
    fn forward(&self, batch_nb: &Tensor) -> Result<Tensor> {
        let (_, b) = batch_nb.dims2()?;
        if b != self.n_batch {
            return Err(candle_core::Error::Msg(format!(
                "batch indicator has {} columns, but the correction layer expects {}",
                b, self.n_batch
            )));
        }
        self.linear.forward(batch_nb)
    }
}
