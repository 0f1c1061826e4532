//! Distributional assumptions of an SGVB model.
//!
//! A model is defined by a latent family (the recognition posterior
//! q(z|x) and the prior p(z)) and a visible family (the generating
//! likelihood p(x|z)). Networks emit unconstrained real values; the
//! assumptions turn them into valid sufficient statistics, sample from
//! them and score data under them.
//!
//! All methods accept batched `(n, d)` or time-major `(t, n, d)`
//! tensors. Statistics are laid out along the last axis, e.g. a
//! diagonal Gaussian over `k` variables is `[mean (k) | var (k)]`.

use crate::sgvb::graph::{flatten_time, recover_time};
use crate::sgvb::noise::NoiseSource;
use crate::candle_loss_functions::*;
use candle_core::{bail, Result, Tensor};
use std::str::FromStr;

/// Floor added to squared network output to get a variance
pub const VAR_FLOOR: f64 = 1e-5;

/// Floor inside the square root of the reparameterized sample
pub const SAMPLE_VAR_FLOOR: f64 = 1e-8;

/// Prior over latent trajectories
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatentPrior {
    /// z(t) ~ N(0, I) independently for every step
    WhiteGauss,
    /// z(0) ~ N(0, I) and z(t) - z(t-1) ~ N(0, I)
    SlowWhiteGauss,
}

impl FromStr for LatentPrior {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "white_gauss" => Ok(Self::WhiteGauss),
            "slow_white_gauss" => Ok(Self::SlowWhiteGauss),
            _ => bail!("unknown latent prior: {}", s),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatentFamily {
    DiagGauss,
}

impl FromStr for LatentFamily {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diag_gauss" => Ok(Self::DiagGauss),
            _ => bail!("unknown latent posterior distribution: {}", s),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisibleFamily {
    DiagGauss,
    Bern,
}

impl FromStr for VisibleFamily {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "diag_gauss" => Ok(Self::DiagGauss),
            "bern" | "bernoulli" => Ok(Self::Bern),
            _ => bail!("unknown visible distribution: {}", s),
        }
    }
}

pub trait LatentAssumption {
    fn name(&self) -> &'static str;

    /// Number of sufficient statistics needed for `n_latent` variables
    fn latent_layer_size(&self, n_latent: usize) -> usize;

    /// Map raw network output to valid posterior statistics
    fn statify_latent(&self, raw: &Tensor) -> Result<Tensor>;

    /// First two moments `(mean, var)` of the posterior statistics
    fn mean_var(&self, stt: &Tensor) -> Result<(Tensor, Tensor)>;

    /// Differentiable sample z ~ q(z|stt) using noise from `noise`
    fn sample_latents(&self, stt: &Tensor, noise: &mut NoiseSource) -> Result<Tensor>;

    /// Coordinate-wise KL(q(z|stt) || N(0, I))
    fn kl_recog_prior(&self, stt: &Tensor) -> Result<Tensor>;

    /// Element-wise -log p(z) under the unit prior
    fn nll_prior(&self, z: &Tensor) -> Result<Tensor>;

    /// Coordinate-wise -log q(z|stt)
    fn nll_recog_model(&self, z: &Tensor, stt: &Tensor) -> Result<Tensor>;

    /// Whether the KL against `prior` can be formed from this family
    fn supports_prior(&self, prior: LatentPrior) -> bool {
        prior == LatentPrior::WhiteGauss
    }
}

pub trait VisibleAssumption {
    fn name(&self) -> &'static str;

    /// Number of sufficient statistics needed for `n_visible` variables
    fn visible_layer_size(&self, n_visible: usize) -> usize;

    /// Map raw network output to valid likelihood statistics
    fn statify_visible(&self, raw: &Tensor) -> Result<Tensor>;

    /// Expected value of the visibles under the statistics
    fn visible_mean(&self, stt: &Tensor) -> Result<Tensor>;

    /// Coordinate-wise -log p(x|stt)
    fn nll_gen_model(&self, x: &Tensor, stt: &Tensor) -> Result<Tensor>;
}

/// Split `[mean | var]` statistics along the last axis
pub fn split_mean_var(stt: &Tensor) -> Result<(Tensor, Tensor)> {
    let d = stt.rank() - 1;
    let n_stat = stt.dim(d)?;
    if n_stat % 2 != 0 {
        bail!("diagonal Gaussian statistics need an even width, got {}", n_stat);
    }
    let half = n_stat / 2;
    Ok((stt.narrow(d, 0, half)?, stt.narrow(d, half, half)?))
}

/// identity on the mean half, `raw^2 + 1e-5` on the variance half
fn diag_gauss_statify(raw: &Tensor) -> Result<Tensor> {
    let (mean, raw_var) = split_mean_var(raw)?;
    let var = (raw_var.sqr()? + VAR_FLOOR)?;
    Tensor::cat(&[&mean, &var], raw.rank() - 1)
}

/// Diagonal Gaussian posterior N(mean, diag(var))
#[derive(Clone, Copy, Debug, Default)]
pub struct DiagGaussLatent;

impl LatentAssumption for DiagGaussLatent {
    fn name(&self) -> &'static str {
        "diag_gauss"
    }

    fn latent_layer_size(&self, n_latent: usize) -> usize {
        n_latent * 2
    }

    fn statify_latent(&self, raw: &Tensor) -> Result<Tensor> {
        diag_gauss_statify(raw)
    }

    fn mean_var(&self, stt: &Tensor) -> Result<(Tensor, Tensor)> {
        split_mean_var(stt)
    }

    /// z = mu + sqrt(var + 1e-8) * eps, where eps ~ N(0, I)
    ///
    /// Time-major statistics are flattened to `(t * n, d)`, sampled
    /// and restored, since steps carry no cross-time structure.
    fn sample_latents(&self, stt: &Tensor, noise: &mut NoiseSource) -> Result<Tensor> {
        let stt_flat = flatten_time(stt)?;
        let (mean, var) = split_mean_var(&stt_flat)?;
        let eps = noise.standard_normal_like(&mean)?;
        let sample = (mean + (var + SAMPLE_VAR_FLOOR)?.sqrt()?.mul(&eps)?)?;
        if stt.rank() == 3 {
            recover_time(&sample, stt.dim(0)?)
        } else {
            Ok(sample)
        }
    }

    fn kl_recog_prior(&self, stt: &Tensor) -> Result<Tensor> {
        let (mean, var) = split_mean_var(stt)?;
        gaussian_kl_loss(&mean, &var)
    }

    fn nll_prior(&self, z: &Tensor) -> Result<Tensor> {
        std_normal_nll(z)
    }

    fn nll_recog_model(&self, z: &Tensor, stt: &Tensor) -> Result<Tensor> {
        let (mean, var) = split_mean_var(stt)?;
        diag_gauss_nll(z, &mean, &var)
    }

    fn supports_prior(&self, _prior: LatentPrior) -> bool {
        true
    }
}

/// Diagonal Gaussian likelihood N(mean, diag(var))
#[derive(Clone, Copy, Debug, Default)]
pub struct DiagGaussVisible;

impl VisibleAssumption for DiagGaussVisible {
    fn name(&self) -> &'static str {
        "diag_gauss"
    }

    fn visible_layer_size(&self, n_visible: usize) -> usize {
        n_visible * 2
    }

    fn statify_visible(&self, raw: &Tensor) -> Result<Tensor> {
        diag_gauss_statify(raw)
    }

    fn visible_mean(&self, stt: &Tensor) -> Result<Tensor> {
        Ok(split_mean_var(stt)?.0)
    }

    fn nll_gen_model(&self, x: &Tensor, stt: &Tensor) -> Result<Tensor> {
        let (mean, var) = split_mean_var(stt)?;
        diag_gauss_nll(x, &mean, &var)
    }
}

/// Independent Bernoulli likelihood; statistics are probabilities
#[derive(Clone, Copy, Debug, Default)]
pub struct BernoulliVisible;

impl VisibleAssumption for BernoulliVisible {
    fn name(&self) -> &'static str {
        "bern"
    }

    fn visible_layer_size(&self, n_visible: usize) -> usize {
        n_visible
    }

    fn statify_visible(&self, raw: &Tensor) -> Result<Tensor> {
        candle_nn::ops::sigmoid(raw)
    }

    fn visible_mean(&self, stt: &Tensor) -> Result<Tensor> {
        Ok(stt.clone())
    }

    fn nll_gen_model(&self, x: &Tensor, stt: &Tensor) -> Result<Tensor> {
        bernoulli_nll(x, stt)
    }
}

/// A latent family paired with a visible family
pub struct Assumptions {
    pub latent: Box<dyn LatentAssumption>,
    pub visible: Box<dyn VisibleAssumption>,
}

impl Assumptions {
    pub fn new<L, V>(latent: L, visible: V) -> Self
    where
        L: LatentAssumption + 'static,
        V: VisibleAssumption + 'static,
    {
        Self {
            latent: Box::new(latent),
            visible: Box::new(visible),
        }
    }

    pub fn from_families(latent: LatentFamily, visible: VisibleFamily) -> Self {
        let latent: Box<dyn LatentAssumption> = match latent {
            LatentFamily::DiagGauss => Box::new(DiagGaussLatent),
        };
        let visible: Box<dyn VisibleAssumption> = match visible {
            VisibleFamily::DiagGauss => Box::new(DiagGaussVisible),
            VisibleFamily::Bern => Box::new(BernoulliVisible),
        };
        Self { latent, visible }
    }

    /// e.g. `Assumptions::from_names("diag_gauss", "bern")`
    pub fn from_names(latent: &str, visible: &str) -> Result<Self> {
        Ok(Self::from_families(latent.parse()?, visible.parse()?))
    }
}

impl std::fmt::Debug for Assumptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assumptions")
            .field("latent", &self.latent.name())
            .field("visible", &self.visible.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn statified_variance_is_floored() -> Result<()> {
        let raw = Tensor::new(&[[0.3f32, -1.0, 0.0, 2.0]], &Device::Cpu)?;
        let stt = DiagGaussLatent.statify_latent(&raw)?.to_vec2::<f32>()?;
        approx::assert_abs_diff_eq!(stt[0][0], 0.3, epsilon = 1e-7);
        approx::assert_abs_diff_eq!(stt[0][1], -1.0, epsilon = 1e-7);
        approx::assert_abs_diff_eq!(stt[0][2], 1e-5, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(stt[0][3], 4.0 + 1e-5, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn layer_sizes() {
        assert_eq!(DiagGaussLatent.latent_layer_size(3), 6);
        assert_eq!(DiagGaussVisible.visible_layer_size(5), 10);
        assert_eq!(BernoulliVisible.visible_layer_size(5), 5);
    }

    #[test]
    fn sampling_is_deterministic_given_the_noise() -> Result<()> {
        let dev = Device::Cpu;
        let stt = Tensor::new(&[[0.5f32, -2.0, 1.0, 0.25], [1.5, 0.0, 0.1, 3.0]], &dev)?;
        let za = DiagGaussLatent.sample_latents(&stt, &mut NoiseSource::new(3))?;
        let zb = DiagGaussLatent.sample_latents(&stt, &mut NoiseSource::new(3))?;
        assert_eq!(za.to_vec2::<f32>()?, zb.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn sample_mean_converges_to_posterior_mean() -> Result<()> {
        let dev = Device::Cpu;
        let n = 20_000;
        let row = Tensor::new(&[[1.5f32, -0.5, 0.5, 2.0]], &dev)?;
        let stt = row.broadcast_as((n, 4))?.contiguous()?;
        let z = DiagGaussLatent.sample_latents(&stt, &mut NoiseSource::new(11))?;
        let z_mean = z.mean(0)?.to_vec1::<f32>()?;
        // standard errors are sqrt(0.5 / n) and sqrt(2 / n)
        approx::assert_abs_diff_eq!(z_mean[0], 1.5, epsilon = 0.03);
        approx::assert_abs_diff_eq!(z_mean[1], -0.5, epsilon = 0.05);
        Ok(())
    }

    #[test]
    fn time_major_sampling_keeps_layout() -> Result<()> {
        let dev = Device::Cpu;
        let stt = Tensor::ones((5, 3, 4), DType::F32, &dev)?;
        let z = DiagGaussLatent.sample_latents(&stt, &mut NoiseSource::new(0))?;
        assert_eq!(z.dims(), &[5, 3, 2]);
        Ok(())
    }

    #[test]
    fn kl_is_zero_at_unit_prior() -> Result<()> {
        let stt = Tensor::new(&[[0.0f32, 0.0, 1.0, 1.0]], &Device::Cpu)?;
        let kl = DiagGaussLatent.kl_recog_prior(&stt)?.sum_all()?.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-7);
        Ok(())
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        assert!(Assumptions::from_names("diag_gauss", "bern").is_ok());
        assert!(Assumptions::from_names("bern", "bern").is_err());
        assert!(Assumptions::from_names("diag_gauss", "poisson").is_err());
        assert!("slow_white_gauss".parse::<LatentPrior>().is_ok());
        assert!("brown_gauss".parse::<LatentPrior>().is_err());
    }

    #[test]
    fn bernoulli_mean_is_probability() -> Result<()> {
        let raw = Tensor::new(&[[-50f32, 0.0, 50.0]], &Device::Cpu)?;
        let p = BernoulliVisible.statify_visible(&raw)?;
        let m = BernoulliVisible.visible_mean(&p)?.to_vec2::<f32>()?;
        assert!(m[0].iter().all(|&v| (0.0..=1.0).contains(&v)));
        approx::assert_abs_diff_eq!(m[0][1], 0.5, epsilon = 1e-6);
        Ok(())
    }
}
