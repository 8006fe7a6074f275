pub mod candle_aux_layers;
pub mod candle_batch_effect;
pub mod candle_batch_indicator;
pub mod candle_data_loader;
pub mod candle_dense_autoencoder;
pub mod candle_imputation;
pub mod candle_imputing_trainer;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_recurrent_autoencoder;

pub use candle_core;
pub use candle_nn;
