use crate::common::*;

use candle_core::{DType, Tensor};
use candle_util::candle_batch_indicator::BatchLabelMap;
use candle_util::candle_data_loader::*;
use candle_util::candle_imputing_trainer::*;
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_loss_functions::DenominatorGuard;
use candle_util::candle_recurrent_autoencoder::*;
use matrix_util::common_io::{mkdir, read_label_lines, write_lines};
use matrix_util::traits::IoOps;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum GuardPolicy {
    Unguarded,
    Epsilon,
    Strict,
}

#[derive(Args, Debug)]
pub struct ImputeArgs {
    #[arg(
        required = true,
        help = "Expression data file",
        long_help = "Expression data file (cells x genes).\n\
		     Tab-separated unless the name ends with `.csv` or `.csv.gz`.\n\
		     Zero entries are treated as dropouts."
    )]
    data_file: Box<str>,

    #[arg(
        long,
        default_value_t = false,
        help = "The data file has a header line",
        long_help = "Skip over the first line of the data file (e.g., gene names)."
    )]
    header: bool,

    #[arg(
        long,
        short,
        help = "Batch membership file",
        long_help = "Batch membership file with one label per line,\n\
		     one line per cell in the order of the data file.\n\
		     If not specified, all cells belong to a single batch."
    )]
    batch_file: Option<Box<str>>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results.\n\
		     Specify the output file or prefix for generated files:\n\
		     - {out}.imputed.tsv.gz\n\
		     - {out}.latent.tsv.gz\n\
		     - {out}.batch_correction.tsv.gz\n\
		     - {out}.batch_effect.tsv.gz\n\
		     - {out}.batch_names.txt.gz\n\
		     - {out}.loss.tsv.gz\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        short = 'e',
        value_delimiter(','),
        default_values_t = vec![64, 32],
        help = "Encoder layers",
        long_help = "Encoder layers (comma-separated).\n\
		     Specify the size of each hidden layer in the encoder model.\n\
		     Example: 64,32"
    )]
    encoder_layers: Vec<usize>,

    #[arg(
        long,
        short = 'l',
        value_delimiter(','),
        default_values_t = vec![32, 64],
        help = "Decoder layers",
        long_help = "Decoder layers (comma-separated).\n\
		     Specify the size of each hidden layer in the decoder model.\n\
		     Example: 32,64"
    )]
    decoder_layers: Vec<usize>,

    #[arg(
        short = 'k',
        long,
        default_value_t = 16,
        help = "Latent dimension",
        long_help = "Dimension of the latent embedding of each cell."
    )]
    n_latent: usize,

    #[arg(
        short = 't',
        long,
        default_value_t = 2,
        help = "Number of imputation rounds",
        long_help = "Number of recurrent imputation rounds (at least 1).\n\
		     With one round the model is a plain autoencoder\n\
		     and no imputation network is created."
    )]
    rounds: usize,

    #[arg(
        long,
        short = 'i',
        default_value_t = 100,
        help = "Number of training epochs",
        long_help = "Number of training epochs.\n\
		     Controls how many times the model is trained over the data."
    )]
    epochs: usize,

    #[arg(
        long,
        default_value_t = 64,
        help = "Minibatch size",
        long_help = "Minibatch size for training.\n\
		     Controls the number of samples per training batch."
    )]
    minibatch_size: usize,

    #[arg(
        long,
        default_value_t = 1e-3,
        help = "Learning rate",
        long_help = "Learning rate for optimization.\n\
		     Controls the step size for parameter updates."
    )]
    learning_rate: f32,

    #[arg(
        long,
        default_value_t = 10,
        help = "Validation frequency",
        long_help = "Evaluate the validation loss every {n} epochs,\n\
		     as well as at the first and the last epoch."
    )]
    frequency_stats: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Do not mask out dropouts in the loss",
        long_help = "Compare the reconstruction with every entry of the data,\n\
		     not only the observed (nonzero) ones."
    )]
    no_mask: bool,

    #[arg(
        long,
        value_enum,
        default_value = "unguarded",
        help = "Zero-denominator policy",
        long_help = "What to do when a minibatch has no observed entries:\n\
		     unguarded: report a non-finite loss\n\
		     epsilon: add --eps to the denominator\n\
		     strict: stop with an error"
    )]
    denominator_guard: GuardPolicy,

    #[arg(
        long,
        default_value_t = 1e-8,
        help = "Denominator offset",
        long_help = "Offset added to the denominator with `--denominator-guard epsilon`."
    )]
    eps: f64,

    #[arg(
        long,
        default_value_t = 0.8,
        help = "Fraction of training cells"
    )]
    train_frac: f64,

    #[arg(
        long,
        default_value_t = 0.1,
        help = "Fraction of validation cells",
        long_help = "Fraction of validation cells.\n\
		     The rest of the cells will be held out as a test set."
    )]
    validation_frac: f64,

    #[arg(long, default_value_t = 42, help = "Random seed for the data split")]
    seed: u64,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or meta, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(
        long,
        default_value_t = false,
        help = "Save every round",
        long_help = "Save the latent states and imputed data of every round:\n\
		     - {out}.latent.{r}.tsv.gz\n\
		     - {out}.imputed.{r}.tsv.gz\n"
    )]
    save_all_rounds: bool,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Enable verbose output.\n\
		     Prints additional information during execution."
    )]
    pub verbose: bool,
}

impl ImputeArgs {
    fn train_config(&self) -> anyhow::Result<TrainConfig> {
        let denominator_guard = match self.denominator_guard {
            GuardPolicy::Unguarded => DenominatorGuard::Unguarded,
            GuardPolicy::Epsilon => DenominatorGuard::Epsilon(self.eps),
            GuardPolicy::Strict => DenominatorGuard::Strict,
        };

        Ok(TrainConfig {
            learning_rate: self.learning_rate,
            batch_size: self.minibatch_size,
            num_epochs: self.epochs,
            frequency_stats: self.frequency_stats,
            use_mask: !self.no_mask,
            denominator_guard,
            device: self.device.to_device(self.device_no)?,
            verbose: self.verbose,
            show_progress: true,
        })
    }
}

pub fn fit_impute(args: &ImputeArgs) -> anyhow::Result<()> {
    // 1. Read the data with batch membership
    let skip = if args.header { Some(0) } else { None };
    let x_nd = Tensor::read_file_delim(&args.data_file, delimiter_of(&args.data_file), skip)?
        .to_dtype(DType::F32)?;
    let (nn, dd) = x_nd.dims2()?;
    info!("Read {} cells x {} genes", nn, dd);

    let batch_labels: Vec<Box<str>> = match args.batch_file.as_deref() {
        Some(batch_file) => {
            let labels = read_label_lines(batch_file)?;
            if labels.len() != nn {
                return Err(anyhow::anyhow!(
                    "{} batch labels in {} vs. {} cells",
                    labels.len(),
                    batch_file,
                    nn
                ));
            }
            labels
        }
        None => vec![Box::from("1"); nn],
    };

    let label_map = BatchLabelMap::from_labels(&batch_labels);
    info!("{} batch(es)", label_map.num_batches());

    // 2. Split cells
    let split = split_rows(
        nn,
        &SplitConfig {
            train_frac: args.train_frac,
            validation_frac: args.validation_frac,
            seed: args.seed,
        },
    )?;

    info!(
        "{} training, {} validation, {} test cells",
        split.train.len(),
        split.validation.len(),
        split.test.len()
    );

    let full_data = InMemoryData::new(&x_nd)?;
    let mut train_data = full_data.subset(&split.train)?;
    let validation_data = full_data.subset(&split.validation)?;
    let mut test_data = full_data.subset(&split.test)?;

    // 3. Train the recurrent imputing autoencoder
    let config = args.train_config()?;

    let parameters = candle_nn::VarMap::new();
    let param_builder = candle_nn::VarBuilder::from_varmap(&parameters, DType::F32, &config.device);

    let model = RecurrentImputingAutoencoder::new(
        RecurrentAutoencoderArgs {
            n_features: dd,
            encoder_layers: &args.encoder_layers,
            decoder_layers: &args.decoder_layers,
            n_latent: args.n_latent,
            n_rounds: args.rounds,
            n_batch: label_map.indicator_width(),
        },
        param_builder,
    )?;

    let mut trainer = ImputingTrainer::new(
        &model,
        &parameters,
        &batch_labels,
        Some(validation_data),
        &config,
    )?;

    info!("Start training for {} epochs ...", config.num_epochs);
    let trace = fit(&mut trainer, &mut train_data, &config)?;

    if let Some(last) = trace.train_loss.last() {
        info!("Final training loss: {}", last);
    }

    if test_data.num_samples() > 0 {
        if let Some(test_loss) = trainer.evaluate(&mut test_data)? {
            info!("Test loss: {:.4}", test_loss);
        }
    }

    // 4. Impute, embed and batch-correct every cell
    let pred = trainer.predict(&x_nd, &batch_labels)?;

    mkdir(&args.out)?;

    let imputed = pred
        .final_output()
        .ok_or(anyhow::anyhow!("no imputation round"))?;
    imputed.to_tsv(&(args.out.to_string() + ".imputed.tsv.gz"))?;

    let latent = pred
        .final_latent()
        .ok_or(anyhow::anyhow!("no imputation round"))?;
    latent.to_tsv(&(args.out.to_string() + ".latent.tsv.gz"))?;

    if args.save_all_rounds {
        for (r, (output, latent)) in pred.outputs.iter().zip(pred.latents.iter()).enumerate() {
            output.to_tsv(&format!("{}.imputed.{}.tsv.gz", args.out, r))?;
            latent.to_tsv(&format!("{}.latent.{}.tsv.gz", args.out, r))?;
        }
    }

    pred.batch_correction
        .to_tsv(&(args.out.to_string() + ".batch_correction.tsv.gz"))?;

    model
        .batch_effect()
        .effects()?
        .to_tsv(&(args.out.to_string() + ".batch_effect.tsv.gz"))?;
    write_lines(
        trainer.label_map().names(),
        &(args.out.to_string() + ".batch_names.txt.gz"),
    )?;

    write_lines(
        &loss_trace_lines(&trace),
        &(args.out.to_string() + ".loss.tsv.gz"),
    )?;

    Ok(())
}

/// `epoch train validation` with `NaN` on epochs without validation
fn loss_trace_lines(trace: &TrainTrace) -> Vec<Box<str>> {
    let mut validation = trace.validation_loss.iter().peekable();
    let mut lines: Vec<Box<str>> = vec!["epoch\ttrain\tvalidation".into()];

    for (epoch, train) in trace.train_loss.iter().enumerate() {
        let val = match validation.peek() {
            Some(&&(e, v)) if e == epoch => {
                validation.next();
                v
            }
            _ => f32::NAN,
        };
        lines.push(format!("{}\t{}\t{}", epoch + 1, train, val).into_boxed_str());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: ImputeArgs,
    }

    #[test]
    fn loss_trace_fills_missing_validation() {
        let trace = TrainTrace {
            train_loss: vec![3., 2., 1.],
            validation_loss: vec![(0, 2.5), (2, 0.5)],
        };
        let lines = loss_trace_lines(&trace);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1].as_ref(), "1\t3\t2.5");
        assert_eq!(lines[2].as_ref(), "2\t2\tNaN");
        assert_eq!(lines[3].as_ref(), "3\t1\t0.5");
    }

    #[test]
    fn impute_writes_outputs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data_file = dir.path().join("data.tsv");
        let batch_file = dir.path().join("batch.txt");
        let out = dir.path().join("out");

        let (nn, dd) = (24, 5);
        let lines: Vec<Box<str>> = (0..nn)
            .map(|i| {
                (0..dd)
                    .map(|j| if (i + j) % 3 == 0 { 0 } else { 1 + i % 4 + j })
                    .map(|x| x.to_string())
                    .collect::<Vec<_>>()
                    .join("\t")
                    .into_boxed_str()
            })
            .collect();
        write_lines(&lines, data_file.to_str().ok_or(anyhow::anyhow!("path"))?)?;

        let labels: Vec<Box<str>> = (0..nn).map(|i| (1 + i % 2).to_string().into()).collect();
        write_lines(&labels, batch_file.to_str().ok_or(anyhow::anyhow!("path"))?)?;

        let out = out.to_str().ok_or(anyhow::anyhow!("path"))?.to_string();

        let cli = TestCli::try_parse_from([
            "impute",
            data_file.to_str().ok_or(anyhow::anyhow!("path"))?,
            "--batch-file",
            batch_file.to_str().ok_or(anyhow::anyhow!("path"))?,
            "--out",
            &out,
            "-e",
            "8",
            "-l",
            "8",
            "-k",
            "2",
            "-t",
            "2",
            "--epochs",
            "3",
            "--minibatch-size",
            "8",
            "--save-all-rounds",
        ])?;

        fit_impute(&cli.args)?;

        let imputed = Mat::from_tsv(&(out.clone() + ".imputed.tsv.gz"), None)?;
        assert_eq!(imputed.shape(), (nn, dd));
        let latent = Mat::from_tsv(&(out.clone() + ".latent.1.tsv.gz"), None)?;
        assert_eq!(latent.shape(), (nn, 2));
        let effect = Mat::from_tsv(&(out.clone() + ".batch_effect.tsv.gz"), None)?;
        assert_eq!(effect.shape(), (2, dd));
        Ok(())
    }
}
