mod common;
mod fit_impute;
mod simulate;

use common::*;
use fit_impute::*;
use simulate::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LENTIL",
    long_about = "Learning Expression with iNTerleaved Imputation Loops\n\
		  A recurrent autoencoder that imputes dropouts of single-cell\n\
		  expression data while learning additive batch effects.\n\
		  Data files are delimited text (`.tsv`, `.csv`, optionally `.gz`)."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Impute dropouts and embed cells",
        long_about = "Train a recurrent imputing autoencoder in the three stages: \n\
		      (1) Split cells into training, validation and test sets\n\
		      (2) Estimate encoder-decoder, imputation and batch-effect weights via SGD\n\
		      (3) Impute, embed and batch-correct every cell of the data.\n"
    )]
    Impute(ImputeArgs),

    #[command(
        about = "Simulate expression data with dropouts and batch effects",
        long_about = "Sample a cell x gene count matrix from a factored Poisson model\n\
		      with gene-specific batch effects, then drop out entries at random.\n"
    )]
    Simulate(SimulateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let verbose = match &cli.commands {
        Commands::Impute(args) => args.verbose,
        Commands::Simulate(args) => args.verbose,
    };

    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    match &cli.commands {
        Commands::Impute(args) => {
            fit_impute(args)?;
        }
        Commands::Simulate(args) => {
            simulate_data(args)?;
        }
    }

    info!("Done");
    Ok(())
}
