use crate::candle_data_loader::MinibatchData;
use candle_core::{Result, Tensor};

pub trait AutoencoderModuleT {
    /// Encoder stack: corrected input (n x d) -> hidden (n x h)
    fn encode(&self, x_nd: &Tensor) -> Result<Tensor>;

    /// Bottleneck: hidden (n x h) -> latent (n x k)
    fn latent(&self, h_nh: &Tensor) -> Result<Tensor>;

    /// Decoder stack: latent (n x k) -> hidden (n x h')
    fn decode(&self, z_nk: &Tensor) -> Result<Tensor>;

    /// Final projection: hidden (n x h') -> reconstruction (n x d)
    fn output(&self, h_nh: &Tensor) -> Result<Tensor>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// Lifecycle hooks called by the training driver
pub trait TrainingHooksT {
    /// Called once before the first epoch
    fn on_training_begin(&mut self) -> anyhow::Result<()>;

    /// One optimization step on a minibatch
    fn on_training_loop(&mut self, minibatch: &MinibatchData) -> anyhow::Result<()>;

    /// Called after each epoch
    ///
    /// Returns the mean validation loss if it was evaluated.
    fn on_epoch_end(&mut self, epoch: usize) -> anyhow::Result<Option<f32>>;

    /// Loss of the most recent training step
    fn current_loss(&self) -> Option<f32>;
}
