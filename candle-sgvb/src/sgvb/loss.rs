use crate::candle_assumptions::{Assumptions, LatentAssumption, LatentPrior, VisibleAssumption};
use crate::candle_loss_functions::gaussian_kl_loss;
use crate::sgvb::graph::SgvbNodes;
use candle_core::{bail, Result, Tensor};

/// Negative log-likelihood of the data given the generated statistics
#[derive(Clone, Debug)]
pub struct RecLoss {
    pub coord_wise: Tensor,
    /// summed over the feature axis
    pub sample_wise: Tensor,
    /// averaged over examples (and steps)
    pub loss: Tensor,
}

#[derive(Clone, Debug)]
pub struct KlLoss {
    pub coord_wise: Tensor,
    pub sample_wise: Tensor,
    pub kl: Tensor,
}

/// Importance weights are per example, `(n, 1)` or `(t, n, 1)`, and
/// broadcast across the feature axis of `coord_wise`.
pub fn apply_imp_weight(coord_wise: &Tensor, imp_weight: Option<&Tensor>) -> Result<Tensor> {
    let Some(w) = imp_weight else {
        return Ok(coord_wise.clone());
    };
    let d = coord_wise.rank() - 1;
    if w.rank() != coord_wise.rank() || w.dim(w.rank() - 1)? != 1 {
        bail!(
            "importance weights must have shape {:?} with a singleton last axis, got {:?}",
            &coord_wise.dims()[..d],
            w.dims()
        );
    }
    coord_wise.broadcast_mul(w)
}

/// Sum over the last axis, then average over everything else
fn reduce(coord_wise: &Tensor) -> Result<(Tensor, Tensor)> {
    let sample_wise = coord_wise.sum(coord_wise.rank() - 1)?;
    let reduced = sample_wise.mean_all()?;
    Ok((sample_wise, reduced))
}

/// Reconstruction loss `-log p(x|z)`
///
/// * `inpt` - observed data
/// * `output` - visible statistics from the generating model
/// * `visible` - visible assumption used to score `inpt`
/// * `imp_weight` - optional per-example weights
pub fn rec_loss(
    inpt: &Tensor,
    output: &Tensor,
    visible: &dyn VisibleAssumption,
    imp_weight: Option<&Tensor>,
) -> Result<RecLoss> {
    let coord_wise = apply_imp_weight(&visible.nll_gen_model(inpt, output)?, imp_weight)?;
    let (sample_wise, loss) = reduce(&coord_wise)?;
    Ok(RecLoss {
        coord_wise,
        sample_wise,
        loss,
    })
}

/// KL of a random walk posterior against the slow prior
///
/// Step 0 is compared with N(0, I); every later step contributes the KL
/// of the increment `N(mu(t) - mu(t-1), var(t) + var(t-1))` against
/// N(0, I). The result is concatenated along time and has the shape of
/// `mean_tnd`.
pub fn slow_white_kl(mean_tnd: &Tensor, var_tnd: &Tensor) -> Result<Tensor> {
    if mean_tnd.rank() != 3 {
        bail!(
            "slow_white_gauss prior needs time-major (t, n, d) statistics, got rank {}",
            mean_tnd.rank()
        );
    }
    let t = mean_tnd.dim(0)?;
    let kl_first = gaussian_kl_loss(&mean_tnd.narrow(0, 0, 1)?, &var_tnd.narrow(0, 0, 1)?)?;
    if t == 1 {
        return Ok(kl_first);
    }
    let d_mean = mean_tnd
        .narrow(0, 1, t - 1)?
        .sub(&mean_tnd.narrow(0, 0, t - 1)?)?;
    let d_var = var_tnd
        .narrow(0, 1, t - 1)?
        .add(&var_tnd.narrow(0, 0, t - 1)?)?;
    let kl_diff = gaussian_kl_loss(&d_mean, &d_var)?;
    Tensor::cat(&[&kl_first, &kl_diff], 0)
}

/// KL(q(z|x) || p(z)) for the posterior family and prior mode
///
/// Reduction is over the feature axis first and then the average over
/// examples and steps, never a sum over time.
pub fn kl_loss(
    latent_stt: &Tensor,
    latent: &dyn LatentAssumption,
    prior: LatentPrior,
    imp_weight: Option<&Tensor>,
) -> Result<KlLoss> {
    if !latent.supports_prior(prior) {
        bail!(
            "unknown combination for latent_prior and latent_posterior: {:?}, {}",
            prior,
            latent.name()
        );
    }
    let coord_wise = match prior {
        LatentPrior::WhiteGauss => latent.kl_recog_prior(latent_stt)?,
        LatentPrior::SlowWhiteGauss => {
            let (mean, var) = latent.mean_var(latent_stt)?;
            slow_white_kl(&mean, &var)?
        }
    };
    let coord_wise = apply_imp_weight(&coord_wise, imp_weight)?;
    let (sample_wise, kl) = reduce(&coord_wise)?;
    Ok(KlLoss {
        coord_wise,
        sample_wise,
        kl,
    })
}

/// The full set of named nodes: the assembled graph plus its losses
#[derive(Clone, Debug)]
pub struct SgvbExprs {
    pub nodes: SgvbNodes,
    pub latent_mean: Tensor,
    pub latent_var: Tensor,
    pub imp_weight: Option<Tensor>,
    pub rec: RecLoss,
    pub kl: KlLoss,
    pub loss_sample_wise: Tensor,
    /// the training objective, an upper bound on -log p(x)
    pub loss: Tensor,
}

impl SgvbExprs {
    /// Look up a node by its conventional name
    pub fn node(&self, name: &str) -> Option<&Tensor> {
        match name {
            "inpt" => Some(&self.nodes.inpt),
            "imp_weight" => self.imp_weight.as_ref(),
            "latent" => Some(&self.nodes.latent),
            "latent_mean" => Some(&self.latent_mean),
            "latent_var" => Some(&self.latent_var),
            "sample" => Some(&self.nodes.sample),
            "shortcut" => self.nodes.shortcut.as_ref(),
            "output" => Some(&self.nodes.output),
            "rec_loss_coord_wise" => Some(&self.rec.coord_wise),
            "rec_loss_sample_wise" => Some(&self.rec.sample_wise),
            "rec_loss" => Some(&self.rec.loss),
            "kl_coord_wise" => Some(&self.kl.coord_wise),
            "kl_sample_wise" => Some(&self.kl.sample_wise),
            "kl" => Some(&self.kl.kl),
            "loss_sample_wise" => Some(&self.loss_sample_wise),
            "loss" => Some(&self.loss),
            _ => None,
        }
    }
}

/// Attach reconstruction and KL losses to an assembled graph
///
/// loss = mean(kl_sample_wise) + mean(rec_loss_sample_wise)
pub fn compose_loss(
    nodes: SgvbNodes,
    assumptions: &Assumptions,
    prior: LatentPrior,
    imp_weight: Option<&Tensor>,
) -> Result<SgvbExprs> {
    let rec = rec_loss(
        &nodes.inpt,
        &nodes.output,
        assumptions.visible.as_ref(),
        imp_weight,
    )?;
    let kl = kl_loss(&nodes.latent, assumptions.latent.as_ref(), prior, imp_weight)?;
    let (latent_mean, latent_var) = assumptions.latent.mean_var(&nodes.latent)?;

    let loss_sample_wise = kl.sample_wise.add(&rec.sample_wise)?;
    let loss = kl.kl.add(&rec.loss)?;

    Ok(SgvbExprs {
        nodes,
        latent_mean,
        latent_var,
        imp_weight: imp_weight.cloned(),
        rec,
        kl,
        loss_sample_wise,
        loss,
    })
}
