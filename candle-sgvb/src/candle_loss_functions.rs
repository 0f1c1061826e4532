use candle_core::{Result, Tensor};

/// ln(2π)
const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Probabilities are kept inside `[BERN_EPS, 1 - BERN_EPS]` before
/// taking logs.
const BERN_EPS: f64 = 1e-7;

/// KL divergence of a diagonal Gaussian from the unit Gaussian,
/// coordinate by coordinate
///
/// 0.5 * (mu^2 + sigma^2 - 1 - log(sigma^2))
///
/// * `z_mean` - mean of Gaussian distribution
/// * `z_var` - variance of Gaussian distribution (strictly positive)
///
pub fn gaussian_kl_loss(z_mean: &Tensor, z_var: &Tensor) -> Result<Tensor> {
    ((z_mean.sqr()? + z_var)? - z_var.log()?)?.affine(0.5, -0.5)
}

/// Negative log-density of a diagonal Gaussian, coordinate by coordinate
///
/// nll(i,d) = 0.5 * log(2π var(i,d)) + (x(i,d) - mu(i,d))^2 / (2 var(i,d))
///
/// * `x_nd` - query points
/// * `mean_nd` - mean
/// * `var_nd` - variance (strictly positive)
///
pub fn diag_gauss_nll(x_nd: &Tensor, mean_nd: &Tensor, var_nd: &Tensor) -> Result<Tensor> {
    let resid_sq = x_nd.sub(mean_nd)?.sqr()?;
    let log_norm = (var_nd.log()? + LN_2PI)?;
    (resid_sq.div(var_nd)? + log_norm)? * 0.5
}

/// Bernoulli negative log-likelihood (binary cross entropy),
/// coordinate by coordinate
///
/// nll(i,d) = -x(i,d) log p(i,d) - (1 - x(i,d)) log(1 - p(i,d))
///
/// * `x_nd` - observed data in [0, 1]
/// * `prob_nd` - success probability
///
pub fn bernoulli_nll(x_nd: &Tensor, prob_nd: &Tensor) -> Result<Tensor> {
    let p = prob_nd.clamp(BERN_EPS, 1.0 - BERN_EPS)?;
    let log_p = p.log()?;
    let log_1mp = p.affine(-1.0, 1.0)?.log()?;
    let one_minus_x = x_nd.affine(-1.0, 1.0)?;
    (x_nd.mul(&log_p)? + one_minus_x.mul(&log_1mp)?)?.neg()
}

/// Negative log-density under the unit Gaussian, element by element
///
/// nll(z) = 0.5 * z^2 + 0.5 * log(2π)
///
pub fn std_normal_nll(z: &Tensor) -> Result<Tensor> {
    z.sqr()?.affine(0.5, 0.5 * LN_2PI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn kl_vanishes_at_unit_gaussian() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::zeros((3, 4), candle_core::DType::F32, &dev)?;
        let var = Tensor::ones((3, 4), candle_core::DType::F32, &dev)?;
        let kl = gaussian_kl_loss(&mean, &var)?.flatten_all()?.to_vec1::<f32>()?;
        for k in kl {
            approx::assert_abs_diff_eq!(k, 0.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn kl_is_non_negative() -> Result<()> {
        let dev = Device::Cpu;
        let mean = Tensor::new(&[[-3.0f32, -0.5, 0.0, 0.1, 2.5]], &dev)?;
        let var = Tensor::new(&[[1e-5f32, 0.3, 1.0, 4.0, 100.0]], &dev)?;
        let kl = gaussian_kl_loss(&mean, &var)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(kl.iter().all(|&k| k >= 0.0), "{:?}", kl);
        Ok(())
    }

    #[test]
    fn gauss_nll_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, -2.0]], &dev)?;
        let mean = Tensor::new(&[[0.0f32, -1.0]], &dev)?;
        let var = Tensor::new(&[[1.0f32, 4.0]], &dev)?;
        let nll = diag_gauss_nll(&x, &mean, &var)?.to_vec2::<f32>()?;
        let expected_0 = 0.5 * LN_2PI + 0.5;
        let expected_1 = 0.5 * (2.0 * std::f64::consts::PI * 4.0).ln() + 1.0 / 8.0;
        approx::assert_abs_diff_eq!(nll[0][0] as f64, expected_0, epsilon = 1e-5);
        approx::assert_abs_diff_eq!(nll[0][1] as f64, expected_1, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn bernoulli_nll_is_finite_at_the_boundary() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 0.0, 1.0]], &dev)?;
        let p = Tensor::new(&[[0.0f32, 1.0, 0.5]], &dev)?;
        let nll = bernoulli_nll(&x, &p)?.to_vec2::<f32>()?;
        assert!(nll[0].iter().all(|v| v.is_finite()));
        approx::assert_abs_diff_eq!(nll[0][2], std::f32::consts::LN_2, epsilon = 1e-5);
        Ok(())
    }
}
