use candle_core::{bail, Result, Tensor};
use candle_nn::{ops, Module};
use std::str::FromStr;

/// Element-wise (or, for softmax, row-wise) transfer functions applied
/// after each affine map
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Transfer {
    #[default]
    Identity,
    Tanh,
    Sigmoid,
    Relu,
    Softplus,
    /// normalized over the last axis
    Softmax,
}

impl FromStr for Transfer {
    type Err = candle_core::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "identity" | "linear" => Ok(Self::Identity),
            "tanh" => Ok(Self::Tanh),
            "sigmoid" => Ok(Self::Sigmoid),
            "relu" | "rectifier" => Ok(Self::Relu),
            "softplus" => Ok(Self::Softplus),
            "softmax" => Ok(Self::Softmax),
            _ => bail!("unknown transfer function: {}", s),
        }
    }
}

impl Transfer {
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Self>> {
        names.iter().map(|s| s.as_ref().parse()).collect()
    }
}

/// softplus(x) = relu(x) + log(1 + exp(-|x|))
fn stable_softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()? + tail
}

impl Module for Transfer {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(x.clone()),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => ops::sigmoid(x),
            Self::Relu => x.relu(),
            Self::Softplus => stable_softplus(x),
            Self::Softmax => ops::softmax_last_dim(x),
        }
    }
}

/// build a stack of alternating `M` and transfer layers
pub struct StackLayers<M>
where
    M: Module,
{
    module_layers: Vec<M>,
    transfer_layers: Vec<Option<Transfer>>,
}

impl<M> Module for StackLayers<M>
where
    M: Module,
{
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut x = input.clone();
        for (module, transfer) in self.module_layers.iter().zip(self.transfer_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(transfer) = transfer {
                x = transfer.forward(&x)?;
            }
        }
        Ok(x)
    }
}

impl<M> StackLayers<M>
where
    M: Module,
{
    pub fn new() -> Self {
        Self {
            module_layers: Vec::new(),
            transfer_layers: Vec::new(),
        }
    }

    /// Appends a layer after all the current layers.
    pub fn push_with_transfer(&mut self, layer: M, transfer: Transfer) {
        self.module_layers.push(layer);
        self.transfer_layers.push(Some(transfer));
    }

    pub fn push(&mut self, layer: M) {
        self.module_layers.push(layer);
        self.transfer_layers.push(None);
    }

    pub fn len(&self) -> usize {
        self.module_layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.module_layers.is_empty()
    }

    /// Like `forward`, but keeps the output of every layer
    pub fn forward_all(&self, input: &Tensor) -> Result<Vec<Tensor>> {
        let mut ret = Vec::with_capacity(self.len());
        let mut x = input.clone();
        for (module, transfer) in self.module_layers.iter().zip(self.transfer_layers.iter()) {
            x = module.forward(&x)?;
            if let Some(transfer) = transfer {
                x = transfer.forward(&x)?;
            }
            ret.push(x.clone());
        }
        Ok(ret)
    }
}

impl<M> Default for StackLayers<M>
where
    M: Module,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn softplus_is_stable_for_large_inputs() -> Result<()> {
        let x = Tensor::new(&[-100f32, -1.0, 0.0, 1.0, 100.0], &Device::Cpu)?;
        let y = Transfer::Softplus.forward(&x)?.to_vec1::<f32>()?;
        assert!(y.iter().all(|v| v.is_finite() && *v >= 0.0));
        approx::assert_abs_diff_eq!(y[2], std::f32::consts::LN_2, epsilon = 1e-6);
        approx::assert_abs_diff_eq!(y[4], 100.0, epsilon = 1e-4);
        approx::assert_abs_diff_eq!(y[3], (1f32 + 1f32.exp()).ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn softmax_rows_sum_to_one() -> Result<()> {
        let x = Tensor::new(&[[1f32, 2.0, 3.0], [0.0, 0.0, 0.0]], &Device::Cpu)?;
        let s = Transfer::Softmax.forward(&x)?.sum(1)?.to_vec1::<f32>()?;
        for v in s {
            approx::assert_abs_diff_eq!(v, 1.0, epsilon = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn transfer_names() {
        assert_eq!("tanh".parse::<Transfer>().ok(), Some(Transfer::Tanh));
        assert_eq!("rectifier".parse::<Transfer>().ok(), Some(Transfer::Relu));
        assert!("swish".parse::<Transfer>().is_err());
        assert_eq!(
            Transfer::parse_list(&["identity", "sigmoid"]).ok(),
            Some(vec![Transfer::Identity, Transfer::Sigmoid])
        );
    }

    #[test]
    fn forward_all_ends_with_forward() -> Result<()> {
        let dev = Device::Cpu;
        let w1 = Tensor::new(&[[1f32, 0.0], [0.0, -1.0]], &dev)?;
        let w2 = Tensor::new(&[[2f32, 1.0]], &dev)?;
        let mut stack = StackLayers::new();
        stack.push_with_transfer(candle_nn::Linear::new(w1, None), Transfer::Relu);
        stack.push(candle_nn::Linear::new(w2, None));

        let x = Tensor::new(&[[1f32, 1.0], [-1.0, -2.0]], &dev)?;
        let all = stack.forward_all(&x)?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].to_vec2::<f32>()?, vec![vec![1.0, 0.0], vec![0.0, 2.0]]);
        assert_eq!(all[1].to_vec2::<f32>()?, stack.forward(&x)?.to_vec2::<f32>()?);
        Ok(())
    }
}
