use crate::candle_assumptions::{LatentAssumption, LatentPrior};
use crate::sgvb::noise::NoiseSource;
use candle_core::{bail, Result, Tensor};

/// Model interface needed to estimate -log p(x) by importance
/// sampling with the recognition model as proposal
///
/// All `nll_*` methods return one value per example: shape `(n,)`,
/// with features (and, for sequences, time steps) summed out.
pub trait DensityModel {
    /// Posterior statistics and optional shortcut, computed once per
    /// batch without dropout noise
    fn posterior(&self, x: &Tensor) -> Result<(Tensor, Option<Tensor>)>;

    /// One draw z ~ q(z|x) per example (per step for sequences)
    fn sample_latent(&self, latent: &Tensor, noise: &mut NoiseSource) -> Result<Tensor>;

    /// -log p(z)
    fn nll_prior(&self, z: &Tensor) -> Result<Tensor>;

    /// -log p(x|z)
    fn nll_gen(&self, x: &Tensor, z: &Tensor, shortcut: Option<&Tensor>) -> Result<Tensor>;

    /// -log q(z|x)
    fn nll_recog(&self, z: &Tensor, latent: &Tensor) -> Result<Tensor>;
}

/// Sum all but the batch axis: `(n, d) -> (n,)`, `(t, n, d) -> (n,)`
pub fn sum_per_example(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        2 => x.sum(1),
        3 => x.sum(2)?.sum(0),
        r => bail!("ndim must be 2 or 3, but it is {}", r),
    }
}

/// Row-wise log(sum(exp(x))), computed as
/// `max + log(sum(exp(x - max)))`
///
/// * `x_ns` - `(n, s)` matrix
pub fn log_sum_exp_rows(x_ns: &Tensor) -> Result<Tensor> {
    let max_n1 = x_ns.max_keepdim(1)?;
    let lse_n1 = (x_ns.broadcast_sub(&max_n1)?.exp()?.sum_keepdim(1)?.log()? + &max_n1)?;
    lse_n1.squeeze(1)
}

/// -log p(z) under the prior, per example
///
/// Under `slow_white_gauss` the first step is scored by N(0, I) and
/// every increment `z(t) - z(t-1)` by N(0, I).
pub fn prior_nll(
    z: &Tensor,
    latent: &dyn LatentAssumption,
    prior: LatentPrior,
) -> Result<Tensor> {
    let coord_wise = match prior {
        LatentPrior::WhiteGauss => latent.nll_prior(z)?,
        LatentPrior::SlowWhiteGauss => {
            if z.rank() != 3 {
                bail!(
                    "slow_white_gauss prior needs time-major (t, n, d) samples, got rank {}",
                    z.rank()
                );
            }
            let t = z.dim(0)?;
            let first = latent.nll_prior(&z.narrow(0, 0, 1)?)?;
            if t == 1 {
                first
            } else {
                let diff = z.narrow(0, 1, t - 1)?.sub(&z.narrow(0, 0, t - 1)?)?;
                Tensor::cat(&[&first, &latent.nll_prior(&diff)?], 0)?
            }
        }
    };
    sum_per_example(&coord_wise)
}

/// Importance-sampling estimate of -log p(x) for every example
///
/// log w(s) = log p(z(s)) + log p(x|z(s)) - log q(z(s)|x), and the
/// estimate is -(logsumexp(log w) - log n). Nothing is differentiated
/// through; the result is detached.
///
/// * `x` - `(n, d)` or `(t, n, d)` data
/// * `model` - density model
/// * `n_samples` - number of importance samples per example
/// * `noise` - randomness for the proposal draws
pub fn estimate_nll<M>(
    x: &Tensor,
    model: &M,
    n_samples: usize,
    noise: &mut NoiseSource,
) -> Result<Tensor>
where
    M: DensityModel + ?Sized,
{
    if n_samples == 0 {
        bail!("need at least one importance sample");
    }

    let (latent, shortcut) = model.posterior(x)?;
    let latent = latent.detach();
    let shortcut = shortcut.map(|s| s.detach());

    let mut log_weights = Vec::with_capacity(n_samples);
    for _ in 0..n_samples {
        let z = model.sample_latent(&latent, noise)?;
        let nll_prior = model.nll_prior(&z)?;
        let nll_gen = model.nll_gen(x, &z, shortcut.as_ref())?;
        let nll_recog = model.nll_recog(&z, &latent)?;
        let log_w = (nll_recog - (nll_prior + nll_gen)?)?;
        log_weights.push(log_w.detach());
    }

    let log_w_ns = Tensor::stack(&log_weights, 1)?;
    let log_px = (log_sum_exp_rows(&log_w_ns)? - (n_samples as f64).ln())?;
    log_px.neg()
}
