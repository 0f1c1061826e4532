use candle_core::{DType, Device, Tensor};
use candle_sgvb::candle_assumptions::{LatentPrior, VisibleFamily};
use candle_sgvb::candle_optimizer::OptimizerSpec;
use candle_sgvb::candle_vae_inference::{Architecture, Vae, VaeConfig};
use candle_sgvb::sgvb::NoiseSource;

fn binary_data(n: usize, d: usize, seed: u64) -> candle_core::Result<Tensor> {
    // two noisy prototypes
    let u = NoiseSource::new(seed).standard_normal((n, d), &Device::Cpu)?;
    let proto: Vec<f32> = (0..n * d)
        .map(|k| {
            let (i, j) = (k / d, k % d);
            if (i % 2 == 0) == (j < d / 2) {
                1.0
            } else {
                0.0
            }
        })
        .collect();
    let proto = Tensor::from_vec(proto, (n, d), &Device::Cpu)?;
    // flip where |u| > 1.5
    let flip = u.abs()?.ge(1.5)?.to_dtype(DType::F32)?;
    (proto - &flip)?.abs()
}

#[test]
fn bernoulli_vae_learns() -> anyhow::Result<()> {
    let x = binary_data(100, 8, 1)?;

    let mut config = VaeConfig::new(8, &[4], 2, &[4]);
    config.visible_family = VisibleFamily::Bern;
    config.optimizer = OptimizerSpec::adamw(0.01);
    config.max_iter = 200;

    let mut vae = Vae::new(config)?;
    let trace = vae.fit(&x)?;
    assert_eq!(trace.len(), 200);
    assert!(trace.iter().all(|l| l.is_finite()));
    assert!(trace[199] < trace[0], "{} vs {}", trace[199], trace[0]);

    let recon = vae.reconstruct(&x)?;
    assert_eq!(recon.dims(), &[100, 8]);
    let recon = recon.flatten_all()?.to_vec1::<f32>()?;
    assert!(recon.iter().all(|p| (0.0..=1.0).contains(p)));
    Ok(())
}

#[test]
fn gaussian_vae_transform_and_nll() -> anyhow::Result<()> {
    let x = NoiseSource::new(5).standard_normal((20, 4), &Device::Cpu)?;

    let mut config = VaeConfig::new(4, &[8], 1, &[8]);
    config.max_iter = 100;
    config.optimizer = OptimizerSpec::adamw(0.01);
    let mut vae = Vae::new(config)?;
    vae.fit(&x)?;

    assert_eq!(vae.transform(&x)?.dims(), &[20, 1]);
    assert_eq!(vae.denoise(&x)?.dims(), &[20, 4]);

    let nll = vae.estimate_nll(&x, 50)?;
    assert_eq!(nll.len(), 20);
    assert!(nll.iter().all(|v| v.is_finite() && *v > 0.0), "{:?}", nll);

    let (mean, var) = vae.latent_mean_var(&x)?;
    assert_eq!(mean.dims(), &[20, 1]);
    assert!(var.flatten_all()?.to_vec1::<f32>()?.iter().all(|v| *v >= 1e-5));
    Ok(())
}

#[test]
fn samples_to_outputs() -> anyhow::Result<()> {
    let mut vae = Vae::new(VaeConfig::new(3, &[4], 2, &[4]))?;
    let z = Tensor::zeros((5, 2), DType::F32, &Device::Cpu)?;
    let x = Tensor::ones((5, 3), DType::F32, &Device::Cpu)?;
    assert_eq!(vae.output_from_sample(&z)?.dims(), &[5, 6]);
    assert_eq!(vae.rec_loss_of_sample(&x, &z)?.dims(), &[5]);

    let w = Tensor::ones((5, 1), DType::F32, &Device::Cpu)?;
    assert!(vae.fit_weighted(&x, &w).is_err());
    Ok(())
}

#[test]
fn importance_weighted_fit() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let x = NoiseSource::new(2).standard_normal((12, 3), &dev)?;
    let w = Tensor::from_vec(
        (0..12).map(|i| if i < 6 { 1f32 } else { 0.5 }).collect::<Vec<_>>(),
        (12, 1),
        &dev,
    )?;

    let mut config = VaeConfig::new(3, &[4], 1, &[4]);
    config.use_imp_weight = true;
    config.max_iter = 20;
    config.batch_size = Some(5);
    let mut vae = Vae::new(config)?;

    assert!(vae.fit(&x).is_err());
    let trace = vae.fit_weighted(&x, &w)?;
    assert_eq!(trace.len(), 20);

    let ex = vae.exprs(&x, Some(&w))?;
    assert!(ex.node("imp_weight").is_some());
    Ok(())
}

fn sequence_config(architecture: Architecture, prior: LatentPrior) -> VaeConfig {
    let mut config = VaeConfig::new(3, &[5], 2, &[4]);
    config.architecture = architecture;
    config.latent_prior = prior;
    config.max_iter = 3;
    config.batch_size = Some(2);
    config
}

#[test]
fn sequence_architectures() -> anyhow::Result<()> {
    let x = NoiseSource::new(9).standard_normal((6, 4, 3), &Device::Cpu)?;

    for architecture in [
        Architecture::Rnn,
        Architecture::BiRnnRecog,
        Architecture::BiRnn,
        Architecture::OneStepPredictor,
    ] {
        for prior in [LatentPrior::WhiteGauss, LatentPrior::SlowWhiteGauss] {
            let mut vae = Vae::new(sequence_config(architecture, prior))?;

            let (recog, gen) = vae.parameter_spec();
            assert_eq!(
                vae.num_parameters(),
                recog.num_parameters() + gen.num_parameters(),
                "{:?}",
                architecture
            );

            let trace = vae.fit(&x)?;
            assert_eq!(trace.len(), 3);
            assert_eq!(vae.transform(&x)?.dims(), &[6, 4, 2]);
            assert_eq!(vae.reconstruct(&x)?.dims(), &[6, 4, 3]);
            assert_eq!(vae.estimate_nll(&x, 4)?.len(), 4);

            let z = Tensor::zeros((6, 4, 2), DType::F32, &Device::Cpu)?;
            assert_eq!(vae.rec_loss_of_sample(&x, &z)?.dims(), &[6, 4]);
            assert_eq!(
                vae.output_from_sample(&z).is_err(),
                architecture == Architecture::OneStepPredictor
            );

            // flat data does not fit a sequence model
            let flat = Tensor::zeros((4, 3), DType::F32, &Device::Cpu)?;
            assert!(vae.fit(&flat).is_err());
        }
    }
    Ok(())
}

#[test]
fn one_step_predictor_has_a_shortcut() -> anyhow::Result<()> {
    let x = NoiseSource::new(4).standard_normal((5, 2, 3), &Device::Cpu)?;
    let vae = Vae::new(sequence_config(
        Architecture::OneStepPredictor,
        LatentPrior::WhiteGauss,
    ))?;
    let ex = vae.exprs(&x, None)?;
    let shortcut = ex
        .node("shortcut")
        .ok_or_else(|| anyhow::anyhow!("no shortcut"))?;
    assert_eq!(shortcut.dims(), &[5, 2, 5]);
    assert_eq!(ex.nodes.output.dims(), &[5, 2, 6]);
    Ok(())
}

#[test]
fn same_seed_same_trace_with_dropout() -> anyhow::Result<()> {
    let x = NoiseSource::new(11).standard_normal((6, 4, 3), &Device::Cpu)?;

    for architecture in [
        Architecture::BiRnnRecog,
        Architecture::BiRnn,
        Architecture::OneStepPredictor,
    ] {
        let fit_with_seed = |seed: u64| -> anyhow::Result<Vec<f32>> {
            let mut config = sequence_config(architecture, LatentPrior::WhiteGauss);
            config.max_iter = 5;
            config.seed = seed;
            Vae::new(config)?.fit(&x)
        };
        let a = fit_with_seed(7)?;
        let b = fit_with_seed(7)?;
        let c = fit_with_seed(8)?;
        assert_eq!(a, b, "{:?}", architecture);
        assert_ne!(a, c, "{:?}", architecture);
    }
    Ok(())
}
