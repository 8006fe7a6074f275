use crate::candle_batch_effect::BatchEffectCorrector;
use crate::candle_dense_autoencoder::DenseAutoencoder;
use crate::candle_imputation::*;
use crate::candle_model_traits::AutoencoderModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};
use std::sync::OnceLock;

pub struct RecurrentAutoencoderArgs<'a> {
    pub n_features: usize,
    pub encoder_layers: &'a [usize],
    pub decoder_layers: &'a [usize],
    pub n_latent: usize,
    pub n_rounds: usize,
    /// width of the batch indicator; 0 or 1 means a single batch
    pub n_batch: usize,
}

/// Intermediate tensors of one imputation round
pub struct RoundState {
    pub input: Tensor,
    pub encoded: Tensor,
    pub latent: Tensor,
    pub decoded: Tensor,
    pub output: Tensor,
}

pub struct RecurrentOutput {
    pub rounds: Vec<RoundState>,
    pub batch_correction: Tensor,
}

impl RecurrentOutput {
    pub fn outputs(&self) -> Vec<Tensor> {
        self.rounds.iter().map(|r| r.output.clone()).collect()
    }

    pub fn latents(&self) -> Vec<Tensor> {
        self.rounds.iter().map(|r| r.latent.clone()).collect()
    }

    pub fn num_rounds(&self) -> usize {
        self.rounds.len()
    }
}

/// Autoencoder unrolled over `t` imputation rounds.
///
/// Round 0 encodes `relu(x - delta)`. Every later round fills the
/// zeros of `x` with an imputation of the previous reconstruction and
/// encodes `relu(fill + x - delta)`. All rounds share the same
/// encoder, latent, decoder and output weights.
pub struct RecurrentImputer<A>
where
    A: AutoencoderModuleT,
{
    n_rounds: usize,
    autoencoder: A,
    batch_effect: BatchEffectCorrector,
    imputation: OnceLock<ImputationNet>,
    vb: VarBuilder<'static>,
}

pub type RecurrentImputingAutoencoder = RecurrentImputer<DenseAutoencoder>;

impl RecurrentImputer<DenseAutoencoder> {
    /// Will create these variables:
    ///
    /// * `nn.enc.*`, `nn.dec.*` - see `DenseAutoencoder`
    /// * `nn.batch.weight` - genes x batch
    /// * `nn.impute.*` - only once a second round is needed
    pub fn new(args: RecurrentAutoencoderArgs, vs: VarBuilder<'static>) -> Result<Self> {
        let autoencoder = DenseAutoencoder::new(
            args.n_features,
            args.encoder_layers,
            args.decoder_layers,
            args.n_latent,
            vs.clone(),
        )?;
        Self::from_autoencoder(autoencoder, args.n_rounds, args.n_batch, vs)
    }
}

impl<A> RecurrentImputer<A>
where
    A: AutoencoderModuleT,
{
    pub fn from_autoencoder(
        autoencoder: A,
        n_rounds: usize,
        n_batch: usize,
        vs: VarBuilder<'static>,
    ) -> Result<Self> {
        if n_rounds < 1 {
            return Err(candle_core::Error::Msg("need at least one imputation round".into()));
        }

        let batch_effect =
            BatchEffectCorrector::new(n_batch, autoencoder.dim_obs(), vs.pp("nn.batch"))?;

        Ok(Self {
            n_rounds,
            autoencoder,
            batch_effect,
            imputation: OnceLock::new(),
            vb: vs,
        })
    }

    /// The imputation network, created on first request.
    ///
    /// Racing initializers resolve to the same variables in the
    /// underlying `VarMap`, and only one instance is ever published.
    pub fn ensure_imputation(&self) -> Result<&ImputationNet> {
        if let Some(net) = self.imputation.get() {
            return Ok(net);
        }
        let net = ImputationNet::new(
            self.autoencoder.dim_obs(),
            DEFAULT_IMPUTATION_HIDDEN,
            self.vb.pp("nn.impute"),
        )?;
        let _ = self.imputation.set(net);
        self.imputation
            .get()
            .ok_or_else(|| candle_core::Error::Msg("imputation network unavailable".into()))
    }

    pub fn has_imputation(&self) -> bool {
        self.imputation.get().is_some()
    }

    /// * `x_nd` - raw expression (cells x genes)
    /// * `batch_nb` - batch indicator (cells x batch)
    pub fn forward(&self, x_nd: &Tensor, batch_nb: &Tensor) -> Result<RecurrentOutput> {
        let (_, d) = x_nd.dims2()?;
        if d != self.dim_obs() {
            return Err(candle_core::Error::Msg(format!(
                "input has {} features, but the model expects {}",
                d,
                self.dim_obs()
            )));
        }

        let delta_nd = self.batch_effect.forward(batch_nb)?;

        let mut rounds: Vec<RoundState> = Vec::with_capacity(self.n_rounds);

        for _ in 0..self.n_rounds {
            let input_nd = match rounds.last() {
                None => (x_nd - &delta_nd)?.relu()?,
                Some(prev) => {
                    let fill_nd = self.ensure_imputation()?.impute(&prev.output, x_nd)?;
                    ((fill_nd + x_nd)? - &delta_nd)?.relu()?
                }
            };
            rounds.push(self.round(input_nd)?);
        }

        Ok(RecurrentOutput {
            rounds,
            batch_correction: delta_nd,
        })
    }

    fn round(&self, input: Tensor) -> Result<RoundState> {
        let encoded = self.autoencoder.encode(&input)?;
        let latent = self.autoencoder.latent(&encoded)?;
        let decoded = self.autoencoder.decode(&latent)?;
        let output = self.autoencoder.output(&decoded)?;
        Ok(RoundState {
            input,
            encoded,
            latent,
            decoded,
            output,
        })
    }

    pub fn batch_effect(&self) -> &BatchEffectCorrector {
        &self.batch_effect
    }

    pub fn num_rounds(&self) -> usize {
        self.n_rounds
    }

    pub fn dim_batch(&self) -> usize {
        self.batch_effect.dim_batch()
    }

    pub fn dim_obs(&self) -> usize {
        self.autoencoder.dim_obs()
    }

    pub fn dim_latent(&self) -> usize {
        self.autoencoder.dim_latent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn build(
        n_rounds: usize,
        parameters: &candle_nn::VarMap,
    ) -> Result<RecurrentImputingAutoencoder> {
        let vb = VarBuilder::from_varmap(parameters, DType::F32, &Device::Cpu);
        RecurrentImputingAutoencoder::new(
            RecurrentAutoencoderArgs {
                n_features: 6,
                encoder_layers: &[8],
                decoder_layers: &[8],
                n_latent: 3,
                n_rounds,
                n_batch: 2,
            },
            vb,
        )
    }

    #[test]
    fn single_round_never_builds_imputation() -> Result<()> {
        let parameters = candle_nn::VarMap::new();
        let model = build(1, &parameters)?;
        let n_vars = parameters.all_vars().len();

        let x_nd = Tensor::rand(0_f32, 1_f32, (4, 6), &Device::Cpu)?;
        let batch_nb = Tensor::ones((4, 2), DType::F32, &Device::Cpu)?;
        let out = model.forward(&x_nd, &batch_nb)?;

        assert_eq!(out.num_rounds(), 1);
        assert!(!model.has_imputation());
        assert_eq!(parameters.all_vars().len(), n_vars);
        Ok(())
    }

    #[test]
    fn imputation_is_built_once_and_reused() -> Result<()> {
        let parameters = candle_nn::VarMap::new();
        let model = build(3, &parameters)?;
        let n_vars = parameters.all_vars().len();

        let x_nd = Tensor::rand(0_f32, 1_f32, (4, 6), &Device::Cpu)?;
        let batch_nb = Tensor::ones((4, 2), DType::F32, &Device::Cpu)?;

        let first = model.forward(&x_nd, &batch_nb)?;
        assert!(model.has_imputation());
        assert_eq!(parameters.all_vars().len(), n_vars + 4);

        let second = model.forward(&x_nd, &batch_nb)?;
        assert_eq!(parameters.all_vars().len(), n_vars + 4);

        // same weights, same input, same reconstruction
        for (a, b) in first.outputs().iter().zip(second.outputs().iter()) {
            assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        }
        Ok(())
    }

    #[test]
    fn rejects_zero_rounds() {
        let parameters = candle_nn::VarMap::new();
        assert!(build(0, &parameters).is_err());
    }
}
