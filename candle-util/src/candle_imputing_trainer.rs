use crate::candle_batch_indicator::*;
use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::masked_reconstruction_loss;
use crate::candle_model_traits::{AutoencoderModuleT, TrainingHooksT};
use crate::candle_recurrent_autoencoder::*;

use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::{info, warn};

pub type Mat = nalgebra::DMatrix<f32>;

/// Binds a `RecurrentImputer` and the masked reconstruction loss to
/// the training hooks, and predicts on new data afterwards.
pub struct ImputingTrainer<'a, A>
where
    A: AutoencoderModuleT,
{
    pub model: &'a RecurrentImputer<A>,
    pub variable_map: &'a candle_nn::VarMap,
    config: &'a TrainConfig,
    batch_nb: Tensor,
    label_map: BatchLabelMap,
    validation: Option<InMemoryData>,
    optimizer: Option<AdamW>,
    current_loss: Option<f32>,
    /// cleared while validating; no layer here behaves differently in
    /// evaluation, so it only feeds `is_training`
    training: bool,
}

/// Detached results of `predict`
pub struct PredictOut {
    /// reconstruction of each round (cells x genes)
    pub outputs: Vec<Mat>,
    /// latent states of each round (cells x latent)
    pub latents: Vec<Mat>,
    /// batch correction (cells x genes)
    pub batch_correction: Mat,
}

impl PredictOut {
    pub fn final_output(&self) -> Option<&Mat> {
        self.outputs.last()
    }

    pub fn final_latent(&self) -> Option<&Mat> {
        self.latents.last()
    }
}

fn to_mat(x: &Tensor) -> anyhow::Result<Mat> {
    let (nrow, ncol) = x.dims2()?;
    let data = x
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(Mat::from_row_slice(nrow, ncol, &data))
}

fn cat_to_mat(chunks: &[Tensor]) -> anyhow::Result<Mat> {
    to_mat(&Tensor::cat(chunks, 0)?)
}

impl<'a, A> ImputingTrainer<'a, A>
where
    A: AutoencoderModuleT,
{
    /// * `model` - recurrent imputing autoencoder
    /// * `variable_map` - every variable of `model`
    /// * `batch_labels` - batch label of every row of the full data
    /// * `validation` - loader over the validation rows
    /// * `config` - training configuration
    pub fn new<S: AsRef<str>>(
        model: &'a RecurrentImputer<A>,
        variable_map: &'a candle_nn::VarMap,
        batch_labels: &[S],
        validation: Option<InMemoryData>,
        config: &'a TrainConfig,
    ) -> anyhow::Result<Self> {
        let (batch_nb, label_map) = one_hot_batches(batch_labels, &config.device)?;

        let (_, nb) = batch_nb.dims2()?;
        if nb != model.dim_batch() {
            return Err(anyhow::anyhow!(
                "{} batch indicator columns vs. {} expected by the model",
                nb,
                model.dim_batch()
            ));
        }

        let validation = match validation {
            Some(mut data) if data.num_samples() > 0 => {
                data.arrange_minibatch(config.batch_size)?;
                Some(data)
            }
            _ => None,
        };

        Ok(Self {
            model,
            variable_map,
            config,
            batch_nb,
            label_map,
            validation,
            optimizer: None,
            current_loss: None,
            training: false,
        })
    }

    pub fn label_map(&self) -> &BatchLabelMap {
        &self.label_map
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Forward a minibatch with the indicator rows of its cells
    pub fn model_output(
        &self,
        minibatch: &MinibatchData,
    ) -> anyhow::Result<(RecurrentOutput, Tensor)> {
        let dev = &self.config.device;
        let rows: Vec<u32> = minibatch.rows.iter().map(|&r| r as u32).collect();
        let nn = rows.len();
        let idx = Tensor::from_vec(rows, nn, dev)?;
        let batch_nb = self.batch_nb.index_select(&idx, 0)?;

        let x_nd = minibatch.input.to_device(dev)?;
        let out = self.model.forward(&x_nd, &batch_nb)?;
        Ok((out, x_nd))
    }

    fn loss(&self, out: &RecurrentOutput, x_nd: &Tensor) -> anyhow::Result<Tensor> {
        Ok(masked_reconstruction_loss(
            &out.outputs(),
            x_nd,
            &out.batch_correction,
            self.config.use_mask,
            self.config.denominator_guard,
        )?)
    }

    /// Mean loss over the minibatches already arranged in `data`
    fn evaluate_arranged(&self, data: &InMemoryData) -> anyhow::Result<Option<f32>> {
        let dev = &self.config.device;
        let nb = data.num_minibatch();
        if nb == 0 {
            return Ok(None);
        }
        let mut tot = 0_f32;
        for b in 0..nb {
            let minibatch = data.minibatch_data(b, dev)?;
            let (out, x_nd) = self.model_output(&minibatch)?;
            tot += self.loss(&out, &x_nd)?.to_scalar::<f32>()?;
        }
        Ok(Some(tot / nb as f32))
    }

    /// Mean loss over `data` without updating parameters
    pub fn evaluate(&self, data: &mut InMemoryData) -> anyhow::Result<Option<f32>> {
        data.arrange_minibatch(self.config.batch_size)?;
        self.evaluate_arranged(data)
    }

    /// Impute, embed and estimate batch effects of new data
    ///
    /// * `x_nd` - raw expression (cells x genes)
    /// * `batch_labels` - one label per cell, seen during training
    pub fn predict<S: AsRef<str>>(
        &self,
        x_nd: &Tensor,
        batch_labels: &[S],
    ) -> anyhow::Result<PredictOut> {
        let dev = &self.config.device;
        let (nn, _) = x_nd.dims2()?;
        if batch_labels.len() != nn {
            return Err(anyhow::anyhow!(
                "{} batch labels for {} cells",
                batch_labels.len(),
                nn
            ));
        }

        let batch_nb = self.label_map.indicator(batch_labels, dev)?;
        let x_nd = x_nd.to_device(dev)?.to_dtype(DType::F32)?;

        let n_rounds = self.model.num_rounds();
        let mut outputs: Vec<Vec<Tensor>> = vec![vec![]; n_rounds];
        let mut latents: Vec<Vec<Tensor>> = vec![vec![]; n_rounds];
        let mut deltas = vec![];

        let block_size = self.config.batch_size.max(1);
        for lb in (0..nn).step_by(block_size) {
            let len = block_size.min(nn - lb);
            let out = self
                .model
                .forward(&x_nd.narrow(0, lb, len)?, &batch_nb.narrow(0, lb, len)?)?;
            for (r, round) in out.rounds.into_iter().enumerate() {
                outputs[r].push(round.output.detach());
                latents[r].push(round.latent.detach());
            }
            deltas.push(out.batch_correction.detach());
        }

        Ok(PredictOut {
            outputs: outputs
                .iter()
                .map(|x| cat_to_mat(x))
                .collect::<anyhow::Result<Vec<_>>>()?,
            latents: latents
                .iter()
                .map(|x| cat_to_mat(x))
                .collect::<anyhow::Result<Vec<_>>>()?,
            batch_correction: cat_to_mat(&deltas)?,
        })
    }
}

impl<A> TrainingHooksT for ImputingTrainer<'_, A>
where
    A: AutoencoderModuleT,
{
    fn on_training_begin(&mut self) -> anyhow::Result<()> {
        // the optimizer only sees variables that exist at this point
        if self.model.num_rounds() > 1 {
            self.model.ensure_imputation()?;
        }

        // plain Adam: decay would also shrink the batch effects
        let params = ParamsAdamW {
            lr: self.config.learning_rate.into(),
            weight_decay: 0.,
            ..Default::default()
        };
        self.optimizer = Some(AdamW::new(self.variable_map.all_vars(), params)?);
        self.training = true;
        Ok(())
    }

    fn on_training_loop(&mut self, minibatch: &MinibatchData) -> anyhow::Result<()> {
        let (out, x_nd) = self.model_output(minibatch)?;
        let loss = self.loss(&out, &x_nd)?;

        let adam = self
            .optimizer
            .as_mut()
            .ok_or(anyhow::anyhow!("on_training_begin was not called"))?;
        adam.backward_step(&loss)?;

        let loss_val = loss.to_scalar::<f32>()?;
        if !loss_val.is_finite() {
            warn!("non-finite training loss: {}", loss_val);
        }
        self.current_loss = Some(loss_val);
        Ok(())
    }

    fn on_epoch_end(&mut self, epoch: usize) -> anyhow::Result<Option<f32>> {
        let freq = self.config.frequency_stats.max(1);
        let last_epoch = epoch + 1 == self.config.num_epochs;

        if epoch % freq != 0 && !last_epoch {
            return Ok(None);
        }

        self.training = false;
        let ret = match self.validation.as_ref() {
            Some(data) => self.evaluate_arranged(data),
            None => Ok(None),
        };
        self.training = true;

        let ret = ret?;
        if let Some(val) = ret {
            info!("[{}] validation loss: {:.4}", epoch + 1, val);
        }
        Ok(ret)
    }

    fn current_loss(&self) -> Option<f32> {
        self.current_loss
    }
}

pub struct TrainTrace {
    /// mean training loss of each epoch
    pub train_loss: Vec<f32>,
    /// `(epoch, mean validation loss)` whenever it was evaluated
    pub validation_loss: Vec<(usize, f32)>,
}

/// Run the training hooks over `data` for `config.num_epochs` epochs
///
/// * `hooks` - model-specific training steps
/// * `data` - training data loader
/// * `config` - training configuration
pub fn fit<H, DataL>(
    hooks: &mut H,
    data: &mut DataL,
    config: &TrainConfig,
) -> anyhow::Result<TrainTrace>
where
    H: TrainingHooksT,
    DataL: DataLoader,
{
    let device = &config.device;

    hooks.on_training_begin()?;

    let pb = ProgressBar::new(config.num_epochs as u64);

    if !config.show_progress || config.verbose {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }

    let mut train_loss = Vec::with_capacity(config.num_epochs);
    let mut validation_loss = vec![];

    for epoch in 0..config.num_epochs {
        data.shuffle_minibatch(config.batch_size)?;

        let mut loss_tot = 0_f32;
        for b in 0..data.num_minibatch() {
            let minibatch = data.minibatch_data(b, device)?;
            hooks.on_training_loop(&minibatch)?;
            loss_tot += hooks.current_loss().unwrap_or(0.);
        }
        train_loss.push(loss_tot / data.num_minibatch().max(1) as f32);

        if let Some(val) = hooks.on_epoch_end(epoch)? {
            validation_loss.push((epoch, val));
        }

        pb.inc(1);

        if config.verbose {
            info!(
                "[{}] training loss: {}",
                epoch + 1,
                train_loss.last().ok_or(anyhow::anyhow!("loss"))?
            );
        }
    }

    pb.finish_and_clear();

    Ok(TrainTrace {
        train_loss,
        validation_loss,
    })
}
