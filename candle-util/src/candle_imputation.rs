use crate::candle_aux_layers::*;
use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder};

pub const DEFAULT_IMPUTATION_HIDDEN: usize = 64;

/// Two-layer feed-forward network `genes -> 64 (ReLU) -> genes`
/// estimating values for dropped-out entries from a reconstruction.
pub struct ImputationNet {
    n_genes: usize,
    fc: StackLayers<Linear>,
}

impl ImputationNet {
    /// Will create these variables:
    ///
    /// * `{vb}.hidden.weight`, `{vb}.hidden.bias`
    /// * `{vb}.out.weight`, `{vb}.out.bias`
    pub fn new(n_genes: usize, n_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let mut fc = StackLayers::<Linear>::new();
        fc.push_with_act(
            normal_linear(n_genes, n_hidden, DEFAULT_WEIGHT_SD, vb.pp("hidden"))?,
            Activation::Relu,
        );
        fc.push(normal_linear(
            n_hidden,
            n_genes,
            DEFAULT_WEIGHT_SD,
            vb.pp("out"),
        )?);
        Ok(Self { n_genes, fc })
    }

    pub fn dim_obs(&self) -> usize {
        self.n_genes
    }

    /// Impute from the previous round's reconstruction and keep only
    /// the entries where `x_nd` is zero.
    ///
    /// * `recon_nd` - reconstruction of the previous round
    /// * `x_nd` - raw observed data
    pub fn impute(&self, recon_nd: &Tensor, x_nd: &Tensor) -> Result<Tensor> {
        let imputed_nd = self.fc.forward(recon_nd)?;
        merge_imputed(&imputed_nd, x_nd)
    }
}

impl Module for ImputationNet {
    fn forward(&self, recon_nd: &Tensor) -> Result<Tensor> {
        self.fc.forward(recon_nd)
    }
}

/// `imputed * (1 - sign(x))`: zero out every entry that was observed
/// (nonzero) in `x_nd`, so that imputation only fills the gaps.
pub fn merge_imputed(imputed_nd: &Tensor, x_nd: &Tensor) -> Result<Tensor> {
    let missing_nd = x_nd.eq(0.0)?.to_dtype(imputed_nd.dtype())?;
    imputed_nd.mul(&missing_nd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn merge_never_touches_observed_entries() -> Result<()> {
        let dev = Device::Cpu;
        let x_nd = Tensor::from_vec(vec![0_f32, 2., 0., 5., 1., 0.], (2, 3), &dev)?;
        let imputed_nd = Tensor::from_vec(vec![0.5_f32, -3., 7., 0.2, 9., -1.], (2, 3), &dev)?;

        let merged = merge_imputed(&imputed_nd, &x_nd)?.to_vec2::<f32>()?;
        assert_eq!(merged, vec![vec![0.5, 0., 7.], vec![0., 0., -1.]]);
        Ok(())
    }

    #[test]
    fn impute_keeps_shape() -> Result<()> {
        let dev = Device::Cpu;
        let parameters = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&parameters, DType::F32, &dev);
        let net = ImputationNet::new(8, DEFAULT_IMPUTATION_HIDDEN, vb.pp("impute"))?;
        assert_eq!(parameters.all_vars().len(), 4);

        let recon_nd = Tensor::rand(0_f32, 1_f32, (3, 8), &dev)?;
        let x_nd = Tensor::ones((3, 8), DType::F32, &dev)?;
        let filled = net.impute(&recon_nd, &x_nd)?;
        assert_eq!(filled.dims(), &[3, 8]);
        // nothing to fill in a fully observed matrix
        assert_eq!(filled.abs()?.sum_all()?.to_scalar::<f32>()?, 0.);
        Ok(())
    }
}
