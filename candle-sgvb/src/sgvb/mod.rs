//! Stochastic Gradient Variational Bayes (SGVB) core.
//!
//! A recognition model maps data `x` to the statistics of q(z|x), a
//! reparameterized sample `z` is drawn from them, and a generating
//! model maps `z` to the statistics of p(x|z). The training objective
//! is the negative evidence lower bound
//!
//! `E_q[-log p(x|z)] + KL(q(z|x) || p(z))`
//!
//! # Key pieces
//!
//! - `graph`: wiring of recognition, sampling and generation
//! - `loss`: reconstruction and KL terms, white and slow priors
//! - `likelihood`: importance-sampling estimate of `-log p(x)`
//! - `noise`: seeded standard-normal draws for the sampler
//!
//! # Example
//!
//! ```ignore
//! let nodes = exprs(&x, |x| recog(x), |stt| latent.sample_latents(stt, &mut noise), |z| gen(z))?;
//! let exprs = compose_loss(nodes, &assumptions, LatentPrior::WhiteGauss, None)?;
//! exprs.loss.backward()?;
//! ```

pub mod graph;
pub mod likelihood;
pub mod loss;
pub mod noise;

pub use graph::{check_input_rank, exprs, flatten_time, recover_time, SgvbNodes};
pub use likelihood::{estimate_nll, log_sum_exp_rows, prior_nll, sum_per_example, DensityModel};
pub use loss::{compose_loss, kl_loss, rec_loss, slow_white_kl, KlLoss, RecLoss, SgvbExprs};
pub use noise::NoiseSource;
