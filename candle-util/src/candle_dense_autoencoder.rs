use crate::candle_aux_layers::*;
use crate::candle_model_traits::AutoencoderModuleT;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder};

/// Plain fully-connected autoencoder
///
/// `d -> encoder_layers (ReLU) -> k -> decoder_layers (ReLU) -> d`
pub struct DenseAutoencoder {
    n_features: usize,
    n_latent: usize,
    enc: StackLayers<Linear>,
    z: Linear,
    dec: StackLayers<Linear>,
    out: Linear,
}

impl AutoencoderModuleT for DenseAutoencoder {
    fn encode(&self, x_nd: &Tensor) -> Result<Tensor> {
        self.enc.forward(x_nd)
    }

    fn latent(&self, h_nh: &Tensor) -> Result<Tensor> {
        self.z.forward(h_nh)
    }

    fn decode(&self, z_nk: &Tensor) -> Result<Tensor> {
        self.dec.forward(z_nk)
    }

    fn output(&self, h_nh: &Tensor) -> Result<Tensor> {
        self.out.forward(h_nh)
    }

    fn dim_obs(&self) -> usize {
        self.n_features
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

impl DenseAutoencoder {
    /// Will create these variables:
    ///
    /// * `nn.enc.fc.{}.weight`, `nn.enc.fc.{}.bias` where {} is the layer index
    /// * `nn.enc.z.weight`, `nn.enc.z.bias`
    /// * `nn.dec.fc.{}.weight`, `nn.dec.fc.{}.bias`
    /// * `nn.dec.out.weight`, `nn.dec.out.bias`
    pub fn new(
        n_features: usize,
        encoder_layers: &[usize],
        decoder_layers: &[usize],
        n_latent: usize,
        vs: VarBuilder,
    ) -> Result<Self> {
        // (1) data -> fc -> latent
        let (enc, enc_dim) = relu_stack(n_features, encoder_layers, "nn.enc.fc", vs.clone())?;
        let z = normal_linear(enc_dim, n_latent, DEFAULT_WEIGHT_SD, vs.pp("nn.enc.z"))?;

        // (2) latent -> fc -> data
        let (dec, dec_dim) = relu_stack(n_latent, decoder_layers, "nn.dec.fc", vs.clone())?;
        let out = normal_linear(dec_dim, n_features, DEFAULT_WEIGHT_SD, vs.pp("nn.dec.out"))?;

        Ok(Self {
            n_features,
            n_latent,
            enc,
            z,
            dec,
            out,
        })
    }
}
