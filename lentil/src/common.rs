pub use clap::{Args, Parser, Subcommand, ValueEnum};
pub use log::{info, warn};

pub use candle_util::{candle_core, candle_nn};

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self, device_no: usize) -> anyhow::Result<candle_core::Device> {
        Ok(match self {
            ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
            ComputeDevice::Cpu => candle_core::Device::Cpu,
        })
    }
}

/// Comma for `.csv` and `.csv.gz`, tab otherwise
pub fn delimiter_of(file: &str) -> &'static str {
    let file = file.strip_suffix(".gz").unwrap_or(file);
    if file.ends_with(".csv") {
        ","
    } else {
        "\t"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_by_extension() {
        assert_eq!(delimiter_of("x.csv.gz"), ",");
        assert_eq!(delimiter_of("x.csv"), ",");
        assert_eq!(delimiter_of("x.tsv.gz"), "\t");
        assert_eq!(delimiter_of("x.txt"), "\t");
    }
}
