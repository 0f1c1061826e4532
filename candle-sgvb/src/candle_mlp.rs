use crate::candle_aux_layers::*;
use crate::candle_model_traits::*;
use crate::candle_parameter_spec::ParameterSpec;
use crate::sgvb::graph::{flatten_time, recover_time};
use candle_core::{bail, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

/// Activations of a feed-forward pass
pub struct MlpExprs {
    /// one per hidden layer, after the transfer
    pub hiddens: Vec<Tensor>,
    /// last affine map, no transfer
    pub output: Tensor,
}

/// Feed-forward network whose output is read as sufficient statistics
///
/// Rank-3 input `(t, n, d)` is processed step by step by flattening the
/// time axis, so the same net serves flat and sequence data.
pub struct MlpNet {
    n_in: usize,
    n_out: usize,
    hidden_sizes: Vec<usize>,
    fc: StackLayers<Linear>,
}

impl MlpNet {
    /// Will create a new feed-forward module with these variables:
    /// `layer.{i}.weight` and `layer.{i}.bias` for every hidden layer
    /// `i` and for the output layer last.
    ///
    /// # Arguments
    /// * `n_in` - input dimension
    /// * `hiddens` - hidden layer sizes
    /// * `n_out` - output (statistics) dimension
    /// * `transfers` - one transfer function per hidden layer
    /// * `vb` - variable builder
    pub fn new(
        n_in: usize,
        hiddens: &[usize],
        n_out: usize,
        transfers: &[Transfer],
        vb: VarBuilder,
    ) -> Result<Self> {
        if hiddens.len() != transfers.len() {
            bail!(
                "{} hidden layers but {} transfer functions",
                hiddens.len(),
                transfers.len()
            );
        }

        let mut fc = StackLayers::<Linear>::new();
        let mut n_prev = n_in;
        for (i, (&h, &transfer)) in hiddens.iter().zip(transfers.iter()).enumerate() {
            let layer = candle_nn::linear(n_prev, h, vb.pp(format!("layer.{}", i)))?;
            fc.push_with_transfer(layer, transfer);
            n_prev = h;
        }
        let out = candle_nn::linear(n_prev, n_out, vb.pp(format!("layer.{}", hiddens.len())))?;
        fc.push(out);

        Ok(Self {
            n_in,
            n_out,
            hidden_sizes: hiddens.to_vec(),
            fc,
        })
    }

    pub fn parameter_spec(&self) -> ParameterSpec {
        ParameterSpec::mlp(self.n_in, &self.hidden_sizes, self.n_out)
    }

    /// All layer activations
    pub fn forward_exprs(&self, x: &Tensor) -> Result<MlpExprs> {
        let (x_flat, time_steps) = match x.rank() {
            3 => (flatten_time(x)?, Some(x.dim(0)?)),
            _ => (x.clone(), None),
        };

        let mut layers = self.fc.forward_all(&x_flat)?;
        if let Some(t) = time_steps {
            layers = layers
                .iter()
                .map(|h| recover_time(h, t))
                .collect::<Result<Vec<_>>>()?;
        }
        let output = match layers.pop() {
            Some(out) => out,
            None => bail!("empty feed-forward stack"),
        };
        Ok(MlpExprs {
            hiddens: layers,
            output,
        })
    }

    pub fn forward_t(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        Ok(self.forward_exprs(x)?.output)
    }
}

impl RecognitionNet for MlpNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<RecognitionOutput> {
        Ok(RecognitionOutput {
            raw: MlpNet::forward_t(self, x, train)?,
            shortcut: None,
        })
    }

    fn input_rank(&self) -> usize {
        2
    }
}

impl GenerativeNet for MlpNet {
    fn forward_t(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        MlpNet::forward_t(self, z, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn shapes_for_flat_and_sequence_input() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let net = MlpNet::new(5, &[4, 3], 6, &[Transfer::Tanh, Transfer::Relu], vb)?;

        let x = Tensor::randn(0f32, 1f32, (7, 5), &dev)?;
        let ex = net.forward_exprs(&x)?;
        assert_eq!(ex.hiddens.len(), 2);
        assert_eq!(ex.hiddens[0].dims(), &[7, 4]);
        assert_eq!(ex.output.dims(), &[7, 6]);

        let xs = Tensor::randn(0f32, 1f32, (3, 2, 5), &dev)?;
        let ex = net.forward_exprs(&xs)?;
        assert_eq!(ex.hiddens[1].dims(), &[3, 2, 3]);
        assert_eq!(ex.output.dims(), &[3, 2, 6]);
        Ok(())
    }

    #[test]
    fn registered_parameters_match_declared() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let net = MlpNet::new(8, &[4], 4, &[Transfer::Tanh], vb)?;
        let n: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(n, net.parameter_spec().num_parameters());
        Ok(())
    }

    #[test]
    fn transfer_count_must_match() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(MlpNet::new(8, &[4, 4], 4, &[Transfer::Tanh], vb).is_err());
    }
}
