use crate::candle_loss_functions::DenominatorGuard;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// evaluate the validation loss every `frequency_stats` epochs
    pub frequency_stats: usize,
    /// restrict the reconstruction loss to observed entries
    pub use_mask: bool,
    pub denominator_guard: DenominatorGuard,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: 64,
            num_epochs: 100,
            frequency_stats: 10,
            use_mask: true,
            denominator_guard: DenominatorGuard::default(),
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}
