pub mod candle_assumptions;
pub mod candle_aux_layers;
pub mod candle_data_loader;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_mlp;
pub mod candle_model_traits;
pub mod candle_optimizer;
pub mod candle_parameter_spec;
pub mod candle_rnn;
pub mod candle_vae_inference;
pub mod cli;
pub mod sgvb;

pub use candle_core;
pub use candle_nn;
