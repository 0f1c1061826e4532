use crate::candle_assumptions::*;
use crate::candle_aux_layers::Transfer;
use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_mlp::MlpNet;
use crate::candle_model_traits::{GenerativeNet, RecognitionNet};
use crate::candle_optimizer::{minimize, OptimizerSpec};
use crate::candle_parameter_spec::ParameterSpec;
use crate::candle_rnn::{DropoutRates, OneStepRecognition, RnnNet};
use crate::sgvb::graph::{check_input_rank, exprs};
use crate::sgvb::likelihood::{estimate_nll, prior_nll, sum_per_example, DensityModel};
use crate::sgvb::loss::{compose_loss, SgvbExprs};
use crate::sgvb::noise::NoiseSource;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::cell::{OnceCell, RefCell};
use std::rc::Rc;
use std::str::FromStr;

/// Rate of the fixed Gaussian dropout in the recurrent variants
const FIXED_DROPOUT: f64 = 0.1;

/// Network layout of the recognition and generating models
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Architecture {
    /// feed-forward both ways, `(n, d)` data
    #[default]
    Mlp,
    /// Elman recurrent both ways, `(t, n, d)` data
    Rnn,
    /// bidirectional recognition with learned dropout rates
    BiRnnRecog,
    /// bidirectional recognition (learned rates) and generation
    BiRnn,
    /// recurrent recognition whose past hidden state feeds a
    /// per-step feed-forward generating model
    OneStepPredictor,
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "mlp" => Ok(Self::Mlp),
            "rnn" => Ok(Self::Rnn),
            "birnn_recog" => Ok(Self::BiRnnRecog),
            "birnn" => Ok(Self::BiRnn),
            "one_step_predictor" => Ok(Self::OneStepPredictor),
            _ => Err(anyhow::anyhow!("unknown architecture: {}", s)),
        }
    }
}

impl Architecture {
    /// 2 for flat data, 3 for time-major sequences
    pub fn input_rank(&self) -> usize {
        match self {
            Self::Mlp => 2,
            _ => 3,
        }
    }

    pub fn has_shortcut(&self) -> bool {
        matches!(self, Self::OneStepPredictor)
    }
}

pub struct VaeConfig {
    pub n_inpt: usize,
    pub n_hiddens_recog: Vec<usize>,
    pub n_latent: usize,
    pub n_hiddens_gen: Vec<usize>,
    pub recog_transfers: Vec<Transfer>,
    pub gen_transfers: Vec<Transfer>,
    pub latent_family: LatentFamily,
    pub visible_family: VisibleFamily,
    pub architecture: Architecture,
    pub latent_prior: LatentPrior,
    /// train with per-example importance weights (`fit_weighted`)
    pub use_imp_weight: bool,
    /// `None` for full-batch training
    pub batch_size: Option<usize>,
    pub optimizer: OptimizerSpec,
    pub max_iter: usize,
    /// seeds parameter initialization, sampling noise and shuffling
    pub seed: u64,
    pub device: Device,
    pub verbose: bool,
    pub log_every: usize,
}

impl Default for VaeConfig {
    /// No layers yet; diagonal Gaussian latent and visible variables,
    /// feed-forward networks and the white prior
    fn default() -> Self {
        Self {
            n_inpt: 0,
            n_hiddens_recog: vec![],
            n_latent: 0,
            n_hiddens_gen: vec![],
            recog_transfers: vec![],
            gen_transfers: vec![],
            latent_family: LatentFamily::DiagGauss,
            visible_family: VisibleFamily::DiagGauss,
            architecture: Architecture::Mlp,
            latent_prior: LatentPrior::WhiteGauss,
            use_imp_weight: false,
            batch_size: None,
            optimizer: OptimizerSpec::default(),
            max_iter: 1000,
            seed: 0,
            device: Device::Cpu,
            verbose: false,
            log_every: 100,
        }
    }
}

impl VaeConfig {
    /// Default configuration with these layer sizes and tanh hidden
    /// layers
    pub fn new(
        n_inpt: usize,
        n_hiddens_recog: &[usize],
        n_latent: usize,
        n_hiddens_gen: &[usize],
    ) -> Self {
        Self {
            n_inpt,
            n_hiddens_recog: n_hiddens_recog.to_vec(),
            n_latent,
            n_hiddens_gen: n_hiddens_gen.to_vec(),
            recog_transfers: vec![Transfer::Tanh; n_hiddens_recog.len()],
            gen_transfers: vec![Transfer::Tanh; n_hiddens_gen.len()],
            ..Default::default()
        }
    }

    fn train_config(&self) -> TrainConfig {
        TrainConfig {
            batch_size: self.batch_size,
            max_iter: self.max_iter,
            device: self.device.clone(),
            verbose: self.verbose,
            log_every: self.log_every,
            seed: self.seed,
        }
    }
}

/// Recognition and generating networks tied to their assumptions
pub struct SgvbGraph {
    recog: Box<dyn RecognitionNet>,
    gen: Box<dyn GenerativeNet>,
    assumptions: Assumptions,
    prior: LatentPrior,
    recog_spec: ParameterSpec,
    gen_spec: ParameterSpec,
}

impl SgvbGraph {
    /// Will register parameters under `recog.*` and `gen.*`
    pub fn new(
        config: &VaeConfig,
        assumptions: Assumptions,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let n_stat_latent = assumptions.latent.latent_layer_size(config.n_latent);
        let n_stat_visible = assumptions.visible.visible_layer_size(config.n_inpt);
        let (hr, rt) = (&config.n_hiddens_recog, &config.recog_transfers);
        let (hg, gt) = (&config.n_hiddens_gen, &config.gen_transfers);
        let (vb_r, vb_g) = (vb.pp("recog"), vb.pp("gen"));
        let (n_in, n_z) = (config.n_inpt, config.n_latent);
        // dropout streams apart from the sampler's
        let (recog_seed, gen_seed) = (config.seed.wrapping_add(1), config.seed.wrapping_add(2));

        let (recog, recog_spec, gen, gen_spec): (
            Box<dyn RecognitionNet>,
            ParameterSpec,
            Box<dyn GenerativeNet>,
            ParameterSpec,
        ) = match config.architecture {
            Architecture::Mlp => {
                let r = MlpNet::new(n_in, hr, n_stat_latent, rt, vb_r)?;
                let g = MlpNet::new(n_z, hg, n_stat_visible, gt, vb_g)?;
                let (rs, gs) = (r.parameter_spec(), g.parameter_spec());
                (
                    Box::new(r) as Box<dyn RecognitionNet>,
                    rs,
                    Box::new(g) as Box<dyn GenerativeNet>,
                    gs,
                )
            }
            Architecture::Rnn | Architecture::BiRnnRecog | Architecture::BiRnn => {
                let (recog_bi, recog_drop) = match config.architecture {
                    Architecture::Rnn => (false, DropoutRates::Off),
                    _ => (true, DropoutRates::Learned),
                };
                let (gen_bi, gen_drop) = match config.architecture {
                    Architecture::BiRnn => (true, DropoutRates::Fixed(FIXED_DROPOUT)),
                    _ => (false, DropoutRates::Off),
                };
                let r = RnnNet::new(n_in, hr, n_stat_latent, rt, recog_bi, recog_drop, vb_r)?
                    .with_noise_seed(recog_seed);
                let g = RnnNet::new(n_z, hg, n_stat_visible, gt, gen_bi, gen_drop, vb_g)?
                    .with_noise_seed(gen_seed);
                let (rs, gs) = (r.parameter_spec(), g.parameter_spec());
                (
                    Box::new(r) as Box<dyn RecognitionNet>,
                    rs,
                    Box::new(g) as Box<dyn GenerativeNet>,
                    gs,
                )
            }
            Architecture::OneStepPredictor => {
                let net = RnnNet::new(
                    n_in,
                    hr,
                    n_stat_latent,
                    rt,
                    false,
                    DropoutRates::Fixed(FIXED_DROPOUT),
                    vb_r,
                )?
                .with_noise_seed(recog_seed);
                let r = OneStepRecognition::new(net)?;
                let g = MlpNet::new(n_z + r.dim_shortcut(), hg, n_stat_visible, gt, vb_g)?;
                let (rs, gs) = (r.parameter_spec(), g.parameter_spec());
                (
                    Box::new(r) as Box<dyn RecognitionNet>,
                    rs,
                    Box::new(g) as Box<dyn GenerativeNet>,
                    gs,
                )
            }
        };

        Ok(Self {
            recog,
            gen,
            assumptions,
            prior: config.latent_prior,
            recog_spec,
            gen_spec,
        })
    }

    pub fn input_rank(&self) -> usize {
        self.recog.input_rank()
    }

    /// Statified posterior statistics and the optional shortcut
    pub fn posterior(
        &self,
        x: &Tensor,
        train: bool,
    ) -> candle_core::Result<(Tensor, Option<Tensor>)> {
        check_input_rank(x, self.recog.input_rank())?;
        let out = self.recog.forward_t(x, train)?;
        Ok((self.assumptions.latent.statify_latent(&out.raw)?, out.shortcut))
    }

    /// Statified visible statistics for latent samples `z`
    pub fn output_stats(
        &self,
        z: &Tensor,
        shortcut: Option<&Tensor>,
        train: bool,
    ) -> candle_core::Result<Tensor> {
        let gen_inpt = match shortcut {
            Some(s) => Tensor::cat(&[z, s], z.rank() - 1)?,
            None => z.clone(),
        };
        self.gen_stats(&gen_inpt, train)
    }

    fn gen_stats(&self, gen_inpt: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let raw = self.gen.forward_t(gen_inpt, train)?;
        self.assumptions.visible.statify_visible(&raw)
    }

    /// Assemble the graph and attach the losses for a batch
    pub fn exprs(
        &self,
        x: &Tensor,
        imp_weight: Option<&Tensor>,
        noise: &mut NoiseSource,
        train: bool,
    ) -> candle_core::Result<SgvbExprs> {
        let latent = self.assumptions.latent.as_ref();
        let nodes = exprs(
            x,
            |x| self.posterior(x, train),
            |stt| latent.sample_latents(stt, noise),
            |z| self.gen_stats(z, train),
        )?;
        compose_loss(nodes, &self.assumptions, self.prior, imp_weight)
    }
}

/// Evaluates the importance-sampling terms with dropout switched off
pub struct NllEvaluator {
    graph: Rc<SgvbGraph>,
}

impl DensityModel for NllEvaluator {
    fn posterior(&self, x: &Tensor) -> candle_core::Result<(Tensor, Option<Tensor>)> {
        self.graph.posterior(x, false)
    }

    fn sample_latent(
        &self,
        latent: &Tensor,
        noise: &mut NoiseSource,
    ) -> candle_core::Result<Tensor> {
        self.graph.assumptions.latent.sample_latents(latent, noise)
    }

    fn nll_prior(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        prior_nll(z, self.graph.assumptions.latent.as_ref(), self.graph.prior)
    }

    fn nll_gen(
        &self,
        x: &Tensor,
        z: &Tensor,
        shortcut: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let stt = self.graph.output_stats(z, shortcut, false)?;
        sum_per_example(&self.graph.assumptions.visible.nll_gen_model(x, &stt)?)
    }

    fn nll_recog(&self, z: &Tensor, latent: &Tensor) -> candle_core::Result<Tensor> {
        sum_per_example(&self.graph.assumptions.latent.nll_recog_model(z, latent)?)
    }
}

/// Variational autoencoder trained by SGVB
///
/// The model keeps its sampling noise in a `RefCell` and builds its
/// likelihood evaluator lazily in a `OnceCell`, so it is neither
/// `Send` nor `Sync`.
pub struct Vae {
    config: VaeConfig,
    varmap: VarMap,
    graph: Rc<SgvbGraph>,
    noise: RefCell<NoiseSource>,
    nll_evaluator: OnceCell<NllEvaluator>,
}

impl Vae {
    /// Build a model with the families named in `config`
    pub fn new(config: VaeConfig) -> anyhow::Result<Self> {
        let assumptions = Assumptions::from_families(config.latent_family, config.visible_family);
        Self::with_assumptions(config, assumptions)
    }

    /// Build a model with custom distributional assumptions
    pub fn with_assumptions(config: VaeConfig, assumptions: Assumptions) -> anyhow::Result<Self> {
        if !assumptions.latent.supports_prior(config.latent_prior) {
            return Err(anyhow::anyhow!(
                "unknown combination for latent_prior and latent_posterior: {:?}, {}",
                config.latent_prior,
                assumptions.latent.name()
            ));
        }
        if config.latent_prior == LatentPrior::SlowWhiteGauss
            && config.architecture.input_rank() != 3
        {
            return Err(anyhow::anyhow!(
                "slow_white_gauss prior needs a sequence architecture, got {:?}",
                config.architecture
            ));
        }
        if config.n_inpt == 0 || config.n_latent == 0 {
            return Err(anyhow::anyhow!("n_inpt and n_latent must be positive"));
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &config.device);
        let graph = SgvbGraph::new(&config, assumptions, vb)?;

        let vae = Self {
            noise: RefCell::new(NoiseSource::new(config.seed)),
            config,
            varmap,
            graph: Rc::new(graph),
            nll_evaluator: OnceCell::new(),
        };
        vae.init_pars(vae.config.seed)?;

        info!(
            "{:?} model with {} parameters ({:?})",
            vae.config.architecture,
            vae.num_parameters(),
            vae.graph.assumptions
        );
        Ok(vae)
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Replace every parameter by a fresh N(0, 1) draw
    ///
    /// Parameters are visited in name order so that the same seed
    /// always gives the same values.
    pub fn init_pars(&self, seed: u64) -> anyhow::Result<()> {
        let mut rng = StdRng::seed_from_u64(seed);
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|e| anyhow::anyhow!("parameter store lock: {}", e))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            let var = &data[name];
            let draws: Vec<f32> = (0..var.elem_count())
                .map(|_| StandardNormal.sample(&mut rng))
                .collect();
            var.set(&Tensor::from_vec(draws, var.dims(), var.device())?)?;
        }
        Ok(())
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Declared layouts of the recognition and generating networks
    pub fn parameter_spec(&self) -> (&ParameterSpec, &ParameterSpec) {
        (&self.graph.recog_spec, &self.graph.gen_spec)
    }

    fn to_device(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        Ok(x.to_dtype(DType::F32)?.to_device(&self.config.device)?)
    }

    /// All named nodes for a batch, in training mode
    pub fn exprs(&self, x: &Tensor, imp_weight: Option<&Tensor>) -> anyhow::Result<SgvbExprs> {
        let x = self.to_device(x)?;
        let w = imp_weight.map(|w| self.to_device(w)).transpose()?;
        let mut noise = self.noise.borrow_mut();
        Ok(self.graph.exprs(&x, w.as_ref(), &mut noise, true)?)
    }

    /// Fit the model to `x`, returning the loss of every iteration
    pub fn fit(&mut self, x: &Tensor) -> anyhow::Result<Vec<f32>> {
        if self.config.use_imp_weight {
            return Err(anyhow::anyhow!(
                "model was configured with importance weights; use fit_weighted"
            ));
        }
        check_input_rank(x, self.graph.input_rank())?;
        let mut data = InMemoryData::new(x, self.config.seed)?;
        self.train(&mut data)
    }

    /// Fit with per-example importance weights, `(n, 1)` for flat data
    /// or `(t, n, 1)` for sequences
    pub fn fit_weighted(&mut self, x: &Tensor, imp_weight: &Tensor) -> anyhow::Result<Vec<f32>> {
        if !self.config.use_imp_weight {
            return Err(anyhow::anyhow!(
                "model was configured without importance weights; use fit"
            ));
        }
        check_input_rank(x, self.graph.input_rank())?;
        let mut data = InMemoryData::new_with_imp_weight(x, imp_weight, self.config.seed)?;
        self.train(&mut data)
    }

    fn train<DataL: DataLoader>(&self, data: &mut DataL) -> anyhow::Result<Vec<f32>> {
        let train_config = self.config.train_config();
        let graph = &self.graph;
        let noise = &self.noise;

        minimize(
            |mb| {
                let mut noise = noise.borrow_mut();
                let exprs = graph.exprs(&mb.input, mb.imp_weight.as_ref(), &mut noise, true)?;
                Ok(exprs.loss)
            },
            self.varmap.all_vars(),
            data,
            &self.config.optimizer,
            &train_config,
        )
    }

    /// Posterior means and variances, without dropout
    pub fn latent_mean_var(&self, x: &Tensor) -> anyhow::Result<(Tensor, Tensor)> {
        let x = self.to_device(x)?;
        let (latent, _) = self.graph.posterior(&x, false)?;
        let (mean, var) = self.graph.assumptions.latent.mean_var(&latent)?;
        Ok((mean.detach(), var.detach()))
    }

    /// Posterior mean of the latent variables
    pub fn transform(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        Ok(self.latent_mean_var(x)?.0)
    }

    /// Expected visibles given the posterior mean; same shape as `x`
    pub fn reconstruct(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        let x = self.to_device(x)?;
        let (latent, shortcut) = self.graph.posterior(&x, false)?;
        let (mean, _) = self.graph.assumptions.latent.mean_var(&latent)?;
        let stt = self.graph.output_stats(&mean, shortcut.as_ref(), false)?;
        Ok(self.graph.assumptions.visible.visible_mean(&stt)?.detach())
    }

    pub fn denoise(&self, x: &Tensor) -> anyhow::Result<Tensor> {
        self.reconstruct(x)
    }

    /// Visible statistics generated from latent samples `z`
    ///
    /// Not available for architectures that feed a shortcut into the
    /// generating model; use `rec_loss_of_sample` there.
    pub fn output_from_sample(&self, z: &Tensor) -> anyhow::Result<Tensor> {
        if self.config.architecture.has_shortcut() {
            return Err(anyhow::anyhow!(
                "{:?} generation depends on the data; no output from samples alone",
                self.config.architecture
            ));
        }
        let z = self.to_device(z)?;
        Ok(self.graph.output_stats(&z, None, false)?.detach())
    }

    /// Reconstruction loss of `x` given latent samples `z`, summed
    /// over features: `(n,)` or `(t, n)`
    pub fn rec_loss_of_sample(&self, x: &Tensor, z: &Tensor) -> anyhow::Result<Tensor> {
        let x = self.to_device(x)?;
        let z = self.to_device(z)?;
        let shortcut = if self.config.architecture.has_shortcut() {
            self.graph.posterior(&x, false)?.1
        } else {
            None
        };
        let stt = self.graph.output_stats(&z, shortcut.as_ref(), false)?;
        let nll = self.graph.assumptions.visible.nll_gen_model(&x, &stt)?;
        Ok(nll.sum(nll.rank() - 1)?.detach())
    }

    /// Importance-sampling estimate of -log p(x), one value per
    /// example (per sequence for time-major data)
    pub fn estimate_nll(&self, x: &Tensor, n_samples: usize) -> anyhow::Result<Vec<f32>> {
        let x = self.to_device(x)?;
        let evaluator = self.nll_evaluator.get_or_init(|| NllEvaluator {
            graph: Rc::clone(&self.graph),
        });
        let mut noise = self.noise.borrow_mut();
        let nll = estimate_nll(&x, evaluator, n_samples, &mut noise)?;
        Ok(nll.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn architecture_names() -> anyhow::Result<()> {
        assert_eq!("birnn_recog".parse::<Architecture>()?, Architecture::BiRnnRecog);
        assert_eq!(
            "one_step_predictor".parse::<Architecture>()?,
            Architecture::OneStepPredictor
        );
        assert!("lstm".parse::<Architecture>().is_err());
        assert_eq!(Architecture::Mlp.input_rank(), 2);
        assert_eq!(Architecture::BiRnn.input_rank(), 3);
        Ok(())
    }

    #[test]
    fn init_is_reproducible() -> anyhow::Result<()> {
        let a = Vae::new(VaeConfig::new(3, &[2], 1, &[2]))?;
        let b = Vae::new(VaeConfig::new(3, &[2], 1, &[2]))?;
        let x = Tensor::new(&[[0.5f32, -1.0, 2.0]], &Device::Cpu)?;
        assert_eq!(
            a.transform(&x)?.to_vec2::<f32>()?,
            b.transform(&x)?.to_vec2::<f32>()?
        );
        b.init_pars(99)?;
        assert_ne!(
            a.transform(&x)?.to_vec2::<f32>()?,
            b.transform(&x)?.to_vec2::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn default_config_needs_sizes() -> anyhow::Result<()> {
        let config = VaeConfig::default();
        assert_eq!(config.architecture, Architecture::Mlp);
        assert_eq!(config.optimizer.kind()?, OptimizerSpec::default().kind()?);
        assert_eq!(config.max_iter, 1000);
        assert!(Vae::new(config).is_err());

        let config = VaeConfig {
            n_inpt: 3,
            n_latent: 1,
            ..Default::default()
        };
        let vae = Vae::new(config)?;
        let x = Tensor::ones((2, 3), DType::F32, &Device::Cpu)?;
        assert_eq!(vae.transform(&x)?.dims(), &[2, 1]);
        Ok(())
    }

    #[test]
    fn configuration_errors() {
        let mut slow_mlp = VaeConfig::new(3, &[2], 1, &[2]);
        slow_mlp.latent_prior = LatentPrior::SlowWhiteGauss;
        assert!(Vae::new(slow_mlp).is_err());

        let mut bad_transfers = VaeConfig::new(3, &[2, 2], 1, &[2]);
        bad_transfers.recog_transfers = vec![Transfer::Tanh];
        assert!(Vae::new(bad_transfers).is_err());

        let mut one_step = VaeConfig::new(3, &[], 1, &[2]);
        one_step.architecture = Architecture::OneStepPredictor;
        assert!(Vae::new(one_step).is_err());
    }

    #[test]
    fn named_nodes() -> anyhow::Result<()> {
        let vae = Vae::new(VaeConfig::new(3, &[4], 2, &[4]))?;
        let x = Tensor::randn(0f32, 1f32, (5, 3), &Device::Cpu)?;
        let ex = vae.exprs(&x, None)?;
        for name in [
            "inpt",
            "latent",
            "latent_mean",
            "latent_var",
            "sample",
            "output",
            "kl_coord_wise",
            "kl_sample_wise",
            "kl",
            "rec_loss_coord_wise",
            "rec_loss_sample_wise",
            "rec_loss",
            "loss_sample_wise",
            "loss",
        ] {
            assert!(ex.node(name).is_some(), "missing node {}", name);
        }
        assert!(ex.node("shortcut").is_none());
        assert!(ex.node("imp_weight").is_none());
        assert_eq!(ex.nodes.latent.dims(), &[5, 4]);
        assert_eq!(ex.nodes.output.dims(), &[5, 6]);
        assert_eq!(ex.loss_sample_wise.dims(), &[5]);

        let total = ex.kl.kl.to_scalar::<f32>()? + ex.rec.loss.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(ex.loss.to_scalar::<f32>()?, total, epsilon = 1e-4);
        Ok(())
    }
}
