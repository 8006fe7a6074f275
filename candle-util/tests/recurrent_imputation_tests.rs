use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_batch_indicator::*;
use candle_util::candle_data_loader::*;
use candle_util::candle_imputation::merge_imputed;
use candle_util::candle_imputing_trainer::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::*;
use candle_util::candle_model_traits::TrainingHooksT;
use candle_util::candle_recurrent_autoencoder::*;

/// 10 x 5 with two zeros per row and no all-zero column
fn expression_10x5() -> anyhow::Result<Tensor> {
    let mut data = vec![0_f32; 50];
    for i in 0..10 {
        for j in 0..5 {
            if j != i % 5 && j != (i + 2) % 5 {
                data[i * 5 + j] = (1 + i + j) as f32;
            }
        }
    }
    Ok(Tensor::from_vec(data, (10, 5), &Device::Cpu)?)
}

fn build_model(
    parameters: &VarMap,
    n_features: usize,
    n_rounds: usize,
    n_batch: usize,
) -> anyhow::Result<RecurrentImputingAutoencoder> {
    let vb = VarBuilder::from_varmap(parameters, DType::F32, &Device::Cpu);
    Ok(RecurrentImputingAutoencoder::new(
        RecurrentAutoencoderArgs {
            n_features,
            encoder_layers: &[16, 8],
            decoder_layers: &[8, 16],
            n_latent: 3,
            n_rounds,
            n_batch,
        },
        vb,
    )?)
}

#[test]
fn single_round_model_has_no_imputation_parameters() -> anyhow::Result<()> {
    let one = VarMap::new();
    let model = build_model(&one, 5, 1, 1)?;
    let x_nd = expression_10x5()?;
    let batch_nb = Tensor::ones((10, 1), DType::F32, &Device::Cpu)?;
    model.forward(&x_nd, &batch_nb)?;

    let two = VarMap::new();
    let model = build_model(&two, 5, 2, 1)?;
    model.forward(&x_nd, &batch_nb)?;

    assert_eq!(two.all_vars().len(), one.all_vars().len() + 4);
    Ok(())
}

#[test]
fn perfect_reconstruction_on_the_mask_has_zero_loss() -> anyhow::Result<()> {
    let x_nd = expression_10x5()?;
    let delta_nd = x_nd.zeros_like()?;

    // anything goes outside the observed entries
    let missing_nd = x_nd.eq(0.0)?.to_dtype(DType::F32)?;
    let recon_nd = (&x_nd + (missing_nd * 7.0)?)?;

    let loss = masked_reconstruction_loss(
        &[recon_nd],
        &x_nd,
        &delta_nd,
        true,
        DenominatorGuard::Unguarded,
    )?;
    assert_eq!(loss.to_scalar::<f32>()?, 0.);
    Ok(())
}

#[test]
fn imputation_merge_keeps_observed_entries() -> anyhow::Result<()> {
    let x_nd = expression_10x5()?;
    let imputed_nd = Tensor::randn(0_f32, 3_f32, (10, 5), &Device::Cpu)?;
    let merged = merge_imputed(&imputed_nd, &x_nd)?.to_vec2::<f32>()?;
    let imputed = imputed_nd.to_vec2::<f32>()?;
    let x = x_nd.to_vec2::<f32>()?;

    for i in 0..10 {
        for j in 0..5 {
            if x[i][j] != 0. {
                assert_eq!(merged[i][j], 0.);
            } else {
                assert_eq!(merged[i][j], imputed[i][j]);
            }
        }
    }
    Ok(())
}

#[test]
fn unmasked_loss_covers_more_entries() -> anyhow::Result<()> {
    let x_nd = expression_10x5()?;
    let on = reconstruction_mask(&x_nd, true)?.sum_all()?.to_scalar::<f32>()?;
    let off = reconstruction_mask(&x_nd, false)?.sum_all()?.to_scalar::<f32>()?;
    assert_eq!(on, 30.);
    assert_eq!(off, 50.);
    assert!(off > on);
    Ok(())
}

#[test]
fn loss_is_the_plain_sum_over_rounds() -> anyhow::Result<()> {
    let x_nd = expression_10x5()?;
    let delta_nd = x_nd.zeros_like()?;
    let first_nd = Tensor::ones((10, 5), DType::F32, &Device::Cpu)?;
    let guard = DenominatorGuard::Unguarded;

    let first = masked_reconstruction_loss(&[first_nd.clone()], &x_nd, &delta_nd, true, guard)?
        .to_scalar::<f32>()?;
    assert!(first > 0.);

    // the second round reconstructs perfectly
    let both = masked_reconstruction_loss(
        &[first_nd.clone(), x_nd.clone()],
        &x_nd,
        &delta_nd,
        true,
        guard,
    )?
    .to_scalar::<f32>()?;
    assert_eq!(both, first);

    // and two imperfect rounds add up
    let second_nd = (&x_nd * 0.5)?;
    let second = masked_reconstruction_loss(&[second_nd.clone()], &x_nd, &delta_nd, true, guard)?
        .to_scalar::<f32>()?;
    let total = masked_reconstruction_loss(&[first_nd, second_nd], &x_nd, &delta_nd, true, guard)?
        .to_scalar::<f32>()?;
    assert_abs_diff_eq!(total, first + second, epsilon = 1e-5);
    Ok(())
}

#[test]
fn single_batch_indicator_is_a_column_of_ones() -> anyhow::Result<()> {
    let labels = vec!["1"; 10];
    let (batch_nb, _) = one_hot_batches(&labels, &Device::Cpu)?;
    assert_eq!(batch_nb.dims(), &[10, 1]);
    assert_eq!(batch_nb.sum_all()?.to_scalar::<f32>()?, 10.);
    Ok(())
}

#[test]
fn three_rounds_end_to_end() -> anyhow::Result<()> {
    let parameters = VarMap::new();
    let model = build_model(&parameters, 5, 3, 1)?;

    let x_nd = expression_10x5()?;
    let labels = vec!["1"; 10];
    let (batch_nb, _) = one_hot_batches(&labels, &Device::Cpu)?;

    let out = model.forward(&x_nd, &batch_nb)?;
    assert_eq!(out.num_rounds(), 3);
    assert_eq!(out.batch_correction.dims(), &[10, 5]);

    for (recon, latent) in out.outputs().iter().zip(out.latents().iter()) {
        assert_eq!(recon.dims(), &[10, 5]);
        assert_eq!(latent.dims(), &[10, 3]);
        for v in recon.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
        }
        for v in latent.flatten_all()?.to_vec1::<f32>()? {
            assert!(v.is_finite());
        }
    }

    let loss = masked_reconstruction_loss(
        &out.outputs(),
        &x_nd,
        &out.batch_correction,
        true,
        DenominatorGuard::Strict,
    )?;
    assert!(loss.dims().is_empty());
    let loss = loss.to_scalar::<f32>()?;
    assert!(loss.is_finite());
    assert!(loss >= 0.);
    Ok(())
}

#[test]
fn train_and_predict_with_two_batches() -> anyhow::Result<()> {
    // two batches of 20 cells; batch "2" has a shifted profile
    let (nn, dd) = (40, 6);
    let mut data = vec![0_f32; nn * dd];
    let mut labels: Vec<Box<str>> = vec![];
    for i in 0..nn {
        let shift = if i < 20 { 0. } else { 2. };
        for j in 0..dd {
            if (i + j) % 4 != 0 {
                data[i * dd + j] = 1. + (j as f32) + shift;
            }
        }
        labels.push(if i < 20 { "1".into() } else { "2".into() });
    }
    let x_nd = Tensor::from_vec(data, (nn, dd), &Device::Cpu)?;

    let parameters = VarMap::new();
    let model = build_model(&parameters, dd, 2, 2)?;

    let config = TrainConfig {
        learning_rate: 1e-2,
        batch_size: 8,
        num_epochs: 5,
        frequency_stats: 2,
        show_progress: false,
        ..TrainConfig::default()
    };

    let split = split_rows(
        nn,
        &SplitConfig {
            train_frac: 0.75,
            validation_frac: 0.25,
            seed: 7,
        },
    )?;

    let full = InMemoryData::new(&x_nd)?;
    let mut train = full.subset(&split.train)?;
    let validation = full.subset(&split.validation)?;

    let mut trainer =
        ImputingTrainer::new(&model, &parameters, &labels, Some(validation), &config)?;
    let trace = fit(&mut trainer, &mut train, &config)?;

    assert_eq!(trace.train_loss.len(), 5);
    assert!(trace.train_loss.iter().all(|x| x.is_finite() && *x >= 0.));
    // epochs 0, 2 and the last one (4)
    let evaluated: Vec<usize> = trace.validation_loss.iter().map(|(e, _)| *e).collect();
    assert_eq!(evaluated, vec![0, 2, 4]);
    assert!(trainer.is_training());

    // the batch effects start at zero and have been learned since
    let effects = model.batch_effect().effects()?;
    assert!(effects.abs()?.sum_all()?.to_scalar::<f32>()? > 0.);

    let pred = trainer.predict(&x_nd, &labels)?;
    assert_eq!(pred.outputs.len(), 2);
    assert_eq!(pred.latents.len(), 2);
    assert_eq!(pred.final_output().map(|m| m.shape()), Some((nn, dd)));
    assert_eq!(pred.final_latent().map(|m| m.shape()), Some((nn, 3)));
    assert_eq!(pred.batch_correction.shape(), (nn, dd));

    let unknown: Vec<Box<str>> = vec!["3".into(); nn];
    assert!(trainer.predict(&x_nd, &unknown).is_err());
    Ok(())
}

#[test]
fn all_zero_minibatch_keeps_parameters_finite() -> anyhow::Result<()> {
    let parameters = VarMap::new();
    let model = build_model(&parameters, 6, 2, 1)?;

    let config = TrainConfig {
        denominator_guard: DenominatorGuard::Epsilon(1e-8),
        show_progress: false,
        ..TrainConfig::default()
    };

    let labels = vec!["1"; 8];
    let mut trainer = ImputingTrainer::new(&model, &parameters, &labels, None, &config)?;
    trainer.on_training_begin()?;

    let before: Vec<Vec<f32>> = parameters
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect::<candle_core::Result<_>>()?;

    // nothing observed at all
    let minibatch = MinibatchData {
        input: Tensor::zeros((8, 6), DType::F32, &Device::Cpu)?,
        rows: (0..8).collect(),
    };
    trainer.on_training_loop(&minibatch)?;
    assert_eq!(trainer.current_loss(), Some(0.));

    let after: Vec<Vec<f32>> = parameters
        .all_vars()
        .iter()
        .map(|v| v.as_tensor().flatten_all()?.to_vec1::<f32>())
        .collect::<candle_core::Result<_>>()?;

    // no gradient and no weight decay, so nothing moves
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert!(a.iter().all(|x| x.is_finite()));
        assert_eq!(b, a);
    }
    Ok(())
}
