use crate::common::*;

use candle_core::{Device, Tensor};
use matrix_util::common_io::{mkdir, write_lines};
use matrix_util::traits::IoOps;
use rand::SeedableRng;
use rand_distr::{Bernoulli, Distribution, Gamma, Normal, Poisson, Uniform};

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(long, short = 'n', default_value_t = 1000, help = "Number of cells")]
    cells: usize,

    #[arg(long, short = 'g', default_value_t = 200, help = "Number of genes")]
    genes: usize,

    #[arg(
        long,
        short = 'k',
        default_value_t = 5,
        help = "Number of factors",
        long_help = "Number of latent factors generating cell-type-like structure."
    )]
    factors: usize,

    #[arg(long, short = 'b', default_value_t = 2, help = "Number of batches")]
    batches: usize,

    #[arg(
        long,
        default_value_t = 0.5,
        help = "Batch effect size",
        long_help = "Standard deviation of the gene-specific log batch effects."
    )]
    batch_effect_sd: f32,

    #[arg(
        long,
        default_value_t = 10.0,
        help = "Average count per gene",
        long_help = "Average expected count of a gene in a cell before dropouts."
    )]
    depth: f32,

    #[arg(
        long,
        short = 'p',
        default_value_t = 0.3,
        help = "Dropout probability",
        long_help = "Probability that an entry is replaced by zero."
    )]
    dropout: f64,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    rseed: u64,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results.\n\
		     Specify the output file or prefix for generated files:\n\
		     - {out}.data.tsv.gz (cells x genes, with dropouts)\n\
		     - {out}.truth.tsv.gz (cells x genes, before dropouts)\n\
		     - {out}.batch.txt.gz (batch label of each cell)\n\
		     - {out}.ln_batch.tsv.gz (genes x batches)\n"
    )]
    out: Box<str>,

    #[arg(long, short, help = "Verbosity")]
    pub verbose: bool,
}

pub struct SimOut {
    /// cells x genes with dropouts
    pub data_ng: Tensor,
    /// cells x genes before dropouts
    pub truth_ng: Tensor,
    /// batch index of each cell
    pub batch: Vec<usize>,
    /// genes x batches
    pub ln_batch_gb: Tensor,
}

///
/// Sample a dropout-corrupted count matrix
///
/// ```text
/// Y(i,g) ~ Poisson( depth * delta(g, B(i)) * sum_k beta(g,k) * theta(k,i) )
/// X(i,g) = Y(i,g) * (1 - Z(i,g)), Z(i,g) ~ Bernoulli(dropout)
/// ```
///
pub fn generate_dropout_data(args: &SimulateArgs) -> anyhow::Result<SimOut> {
    let nn = args.cells;
    let dd = args.genes;
    let kk = args.factors.max(1);
    let bb = args.batches.max(1);

    let mut rng = rand::rngs::StdRng::seed_from_u64(args.rseed);

    // 1. batch membership
    let runif = Uniform::new(0, bb)?;
    let batch: Vec<usize> = (0..nn).map(|_| runif.sample(&mut rng)).collect();

    // 2. log batch effects, centred across batches
    let rnorm = Normal::new(0_f32, args.batch_effect_sd)?;
    let ln_delta = Tensor::from_vec(
        (0..(dd * bb))
            .map(|_| rnorm.sample(&mut rng))
            .collect::<Vec<f32>>(),
        (dd, bb),
        &Device::Cpu,
    )?;
    let ln_batch_gb = ln_delta.broadcast_sub(&ln_delta.mean_keepdim(1)?)?;

    // 3. factorization model
    let rgamma_beta = Gamma::new(1_f32, 1.)?;
    let beta_gk = Tensor::from_vec(
        (0..(dd * kk))
            .map(|_| rgamma_beta.sample(&mut rng))
            .collect::<Vec<f32>>(),
        (dd, kk),
        &Device::Cpu,
    )?;

    let rgamma_theta = Gamma::new(0.5_f32, 1. / (kk as f32))?;
    let theta_kn = Tensor::from_vec(
        (0..(kk * nn))
            .map(|_| rgamma_theta.sample(&mut rng))
            .collect::<Vec<f32>>(),
        (kk, nn),
        &Device::Cpu,
    )?;

    // average count per gene will be `depth`
    let mu_gn = beta_gk.matmul(&theta_kn)?;
    let scale = args.depth as f64 / mu_gn.mean_all()?.to_scalar::<f32>()? as f64;
    let mu_gn = (mu_gn * scale)?;

    // 4. putting them all together
    let rdrop = Bernoulli::new(args.dropout)?;
    let mut truth = Vec::with_capacity(nn * dd);
    let mut data = Vec::with_capacity(nn * dd);

    for (i, &b) in batch.iter().enumerate() {
        let lambda_i = (ln_batch_gb.narrow(1, b, 1)?.exp()?)
            .mul(&mu_gn.narrow(1, i, 1)?)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        for lambda in lambda_i {
            let y = if lambda > 0. {
                Poisson::new(lambda)?.sample(&mut rng)
            } else {
                0.
            };
            truth.push(y);
            data.push(if rdrop.sample(&mut rng) { 0. } else { y });
        }
    }

    Ok(SimOut {
        data_ng: Tensor::from_vec(data, (nn, dd), &Device::Cpu)?,
        truth_ng: Tensor::from_vec(truth, (nn, dd), &Device::Cpu)?,
        batch,
        ln_batch_gb,
    })
}

pub fn simulate_data(args: &SimulateArgs) -> anyhow::Result<()> {
    let sim = generate_dropout_data(args)?;

    mkdir(&args.out)?;

    sim.data_ng.to_tsv(&(args.out.to_string() + ".data.tsv.gz"))?;
    sim.truth_ng.to_tsv(&(args.out.to_string() + ".truth.tsv.gz"))?;
    sim.ln_batch_gb
        .to_tsv(&(args.out.to_string() + ".ln_batch.tsv.gz"))?;

    // batch labels are 1-based
    let batch_out: Vec<Box<str>> = sim
        .batch
        .iter()
        .map(|&b| Box::from((b + 1).to_string()))
        .collect();
    write_lines(&batch_out, &(args.out.to_string() + ".batch.txt.gz"))?;

    let nzero = sim
        .data_ng
        .eq(0_f32)?
        .to_dtype(candle_core::DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    info!(
        "simulated {} cells x {} genes, {:.1}% zeros",
        args.cells,
        args.genes,
        100. * nzero / ((args.cells * args.genes).max(1) as f32)
    );
    Ok(())
}
