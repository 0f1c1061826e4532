use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;

use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use log::{debug, info};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerKind {
    AdamW,
    /// AdamW without weight decay unless asked for
    Adam,
    Sgd,
}

impl FromStr for OptimizerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "adamw" => Ok(Self::AdamW),
            "adam" => Ok(Self::Adam),
            "sgd" | "gd" => Ok(Self::Sgd),
            _ => Err(anyhow::anyhow!("unknown optimizer: {}", s)),
        }
    }
}

/// Optimizer identifier with keyword arguments, e.g.
/// `"adamw:lr=0.01,beta1=0.9"` or `"sgd:lr=0.1"`
///
/// Recognized keywords: `lr`, `beta1`, `beta2`, `eps`, `weight_decay`
/// (the last four for the Adam family only).
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizerSpec {
    pub identifier: String,
    pub kwargs: Vec<(String, f64)>,
}

impl Default for OptimizerSpec {
    fn default() -> Self {
        Self::adamw(1e-3)
    }
}

impl OptimizerSpec {
    pub fn adamw(lr: f64) -> Self {
        Self {
            identifier: "adamw".into(),
            kwargs: vec![("lr".into(), lr)],
        }
    }

    pub fn sgd(lr: f64) -> Self {
        Self {
            identifier: "sgd".into(),
            kwargs: vec![("lr".into(), lr)],
        }
    }

    /// Set (or replace) a keyword argument
    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.kwargs.retain(|(k, _)| k != key);
        self.kwargs.push((key.into(), value));
        self
    }

    pub fn kind(&self) -> anyhow::Result<OptimizerKind> {
        self.identifier.parse()
    }

    fn get(&self, key: &str) -> Option<f64> {
        self.kwargs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn learning_rate(&self) -> f64 {
        self.get("lr").unwrap_or(1e-3)
    }

    /// Build the optimizer over `vars`
    pub fn build(&self, vars: Vec<Var>) -> anyhow::Result<AnyOptimizer> {
        let kind = self.kind()?;
        let allowed: &[&str] = match kind {
            OptimizerKind::AdamW | OptimizerKind::Adam => {
                &["lr", "beta1", "beta2", "eps", "weight_decay"]
            }
            OptimizerKind::Sgd => &["lr"],
        };
        if let Some((k, _)) = self.kwargs.iter().find(|(k, _)| !allowed.contains(&k.as_str())) {
            return Err(anyhow::anyhow!(
                "optimizer {} does not take argument {}",
                self.identifier,
                k
            ));
        }

        let lr = self.learning_rate();
        match kind {
            OptimizerKind::AdamW | OptimizerKind::Adam => {
                let defaults = ParamsAdamW::default();
                let decay_default = if kind == OptimizerKind::Adam {
                    0.0
                } else {
                    defaults.weight_decay
                };
                let params = ParamsAdamW {
                    lr,
                    beta1: self.get("beta1").unwrap_or(defaults.beta1),
                    beta2: self.get("beta2").unwrap_or(defaults.beta2),
                    eps: self.get("eps").unwrap_or(defaults.eps),
                    weight_decay: self.get("weight_decay").unwrap_or(decay_default),
                };
                Ok(AnyOptimizer::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerKind::Sgd => Ok(AnyOptimizer::Sgd(SGD::new(vars, lr)?)),
        }
    }
}

impl FromStr for OptimizerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (identifier, rest) = match s.split_once(':') {
            Some((id, rest)) => (id.trim(), rest),
            None => (s.trim(), ""),
        };
        identifier.parse::<OptimizerKind>()?;

        let mut kwargs = vec![];
        for kv in rest.split(',').map(str::trim).filter(|kv| !kv.is_empty()) {
            let (k, v) = kv
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected key=value, got {}", kv))?;
            kwargs.push((k.trim().to_string(), v.trim().parse::<f64>()?));
        }
        Ok(Self {
            identifier: identifier.to_string(),
            kwargs,
        })
    }
}

/// The optimizers candle provides, behind one type
pub enum AnyOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl AnyOptimizer {
    pub fn backward_step(&mut self, loss: &Tensor) -> candle_core::Result<()> {
        match self {
            Self::AdamW(opt) => opt.backward_step(loss),
            Self::Sgd(opt) => opt.backward_step(loss),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::AdamW(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }
}

/// Minimize a scalar loss over minibatches
///
/// Every iteration takes the next minibatch, evaluates `loss_fn` and
/// takes one optimizer step; the data are reshuffled whenever the
/// minibatches run out. Returns the loss of every iteration.
///
/// * `loss_fn` - minibatch to scalar loss
/// * `vars` - parameters to update
/// * `data` - data loader
/// * `spec` - optimizer identifier and arguments
/// * `train_config` - training configuration
pub fn minimize<DataL, LossFn>(
    mut loss_fn: LossFn,
    vars: Vec<Var>,
    data: &mut DataL,
    spec: &OptimizerSpec,
    train_config: &TrainConfig,
) -> anyhow::Result<Vec<f32>>
where
    DataL: DataLoader,
    LossFn: FnMut(&MinibatchData) -> candle_core::Result<Tensor>,
{
    let device = &train_config.device;
    let mut opt = spec.build(vars)?;

    let batch_size = train_config
        .batch_size
        .unwrap_or(data.num_samples())
        .max(1);

    data.shuffle_minibatch(batch_size)?;

    let mut loss_trace = Vec::with_capacity(train_config.max_iter);
    let mut batch_idx = 0;

    for iter in 0..train_config.max_iter {
        if batch_idx >= data.num_minibatch() {
            data.shuffle_minibatch(batch_size)?;
            batch_idx = 0;
        }

        let minibatch_data = data.minibatch_data(batch_idx, device)?;
        let loss = loss_fn(&minibatch_data)?;
        opt.backward_step(&loss)?;
        let loss_val = loss.to_scalar::<f32>()?;
        loss_trace.push(loss_val);
        batch_idx += 1;

        if train_config.verbose && (iter + 1) % train_config.log_every.max(1) == 0 {
            info!(
                "[{}] loss: {} (lr: {})",
                iter + 1,
                loss_val,
                opt.learning_rate()
            );
        }
    }

    if let Some(last) = loss_trace.last() {
        debug!("[{}] final loss: {}", loss_trace.len(), last);
    }
    Ok(loss_trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn parse_identifiers() -> anyhow::Result<()> {
        let spec: OptimizerSpec = "adamw:lr=0.01, beta1=0.5".parse()?;
        assert_eq!(spec.kind()?, OptimizerKind::AdamW);
        approx::assert_abs_diff_eq!(spec.learning_rate(), 0.01);
        assert_eq!(spec.kwargs.len(), 2);

        assert_eq!("adam".parse::<OptimizerSpec>()?.kind()?, OptimizerKind::Adam);
        assert!("rprop".parse::<OptimizerSpec>().is_err());
        assert!("sgd:lr".parse::<OptimizerSpec>().is_err());
        Ok(())
    }

    #[test]
    fn unknown_arguments_are_rejected() -> anyhow::Result<()> {
        let x = Var::zeros(3, DType::F32, &Device::Cpu)?;
        assert!(OptimizerSpec::sgd(0.1)
            .with("beta1", 0.9)
            .build(vec![x.clone()])
            .is_err());
        assert!(OptimizerSpec::adamw(0.1).with("momentum", 0.9).build(vec![x]).is_err());
        Ok(())
    }

    #[test]
    fn minimize_a_quadratic() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[3f32, -2.0], &dev)?;
        let target = Tensor::new(&[[1f32, 1.0]], &dev)?;
        let mut data = InMemoryData::new(&target, 0)?;

        let config = TrainConfig {
            max_iter: 200,
            ..Default::default()
        };
        let ww = w.clone();
        let trace = minimize(
            |mb| ww.as_tensor().unsqueeze(0)?.sub(&mb.input)?.sqr()?.sum_all(),
            vec![w.clone()],
            &mut data,
            &OptimizerSpec::sgd(0.1),
            &config,
        )?;
        assert_eq!(trace.len(), 200);
        assert!(trace[199] < 1e-6);
        let w = w.as_tensor().to_vec1::<f32>()?;
        approx::assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-3);
        approx::assert_abs_diff_eq!(w[1], 1.0, epsilon = 1e-3);
        Ok(())
    }
}
