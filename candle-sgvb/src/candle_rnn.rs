use crate::candle_aux_layers::Transfer;
use crate::candle_model_traits::*;
use crate::candle_parameter_spec::ParameterSpec;
use crate::sgvb::graph::check_input_rank;
use crate::sgvb::noise::NoiseSource;
use candle_core::{bail, DType, Module, Result, Tensor};
use candle_nn::{ops, Linear, VarBuilder};
use std::cell::RefCell;

/// Learned rates live in `(0.025, 0.975)`
const MIN_DROPOUT: f64 = 0.025;
const DROPOUT_RANGE: f64 = 0.95;

/// Gaussian dropout in a recurrent network
///
/// Position 0 is the input, position `1 + i` the recurrent state of
/// hidden layer `i`, and the last position the connection from the
/// top hidden layer to the output.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum DropoutRates {
    #[default]
    Off,
    /// the same rate at every position
    Fixed(f64),
    /// one logit per position, trained with the rest of the network
    Learned,
}

/// One direction of an Elman layer
///
/// h(t) = f(W x(t) + b + R' h(t-1)), with a learned h(-1)
struct RecurrentDirection {
    input: Linear,
    recurrent: Tensor,
    initial: Tensor,
}

impl RecurrentDirection {
    fn new(n_in: usize, n_hidden: usize, vb: VarBuilder) -> Result<Self> {
        let input = candle_nn::linear(n_in, n_hidden, vb.pp("input"))?;
        let recurrent = vb.get_with_hints(
            (n_hidden, n_hidden),
            "recurrent",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let initial = vb.get_with_hints((1, n_hidden), "initial", candle_nn::init::ZERO)?;
        Ok(Self {
            input,
            recurrent,
            initial,
        })
    }

    fn forward<D>(
        &self,
        x_tnd: &Tensor,
        transfer: Transfer,
        reverse: bool,
        drop_state: &D,
    ) -> Result<Tensor>
    where
        D: Fn(&Tensor) -> Result<Tensor>,
    {
        let (t, n, _) = x_tnd.dims3()?;
        let n_hidden = self.recurrent.dim(0)?;
        let pre_tnh = self.input.forward(x_tnd)?;

        let mut h_nh = self.initial.broadcast_as((n, n_hidden))?.contiguous()?;
        let mut steps: Vec<Option<Tensor>> = vec![None; t];

        let order: Box<dyn Iterator<Item = usize>> = if reverse {
            Box::new((0..t).rev())
        } else {
            Box::new(0..t)
        };

        for s in order {
            let rec_nh = drop_state(&h_nh)?.matmul(&self.recurrent)?;
            h_nh = transfer.forward(&(pre_tnh.get(s)? + rec_nh)?)?;
            steps[s] = Some(h_nh.clone());
        }

        let steps = steps.into_iter().flatten().collect::<Vec<_>>();
        Tensor::stack(&steps, 0)
    }
}

struct RecurrentLayer {
    fwd: RecurrentDirection,
    bwd: Option<RecurrentDirection>,
    transfer: Transfer,
}

impl RecurrentLayer {
    fn forward<D>(&self, x_tnd: &Tensor, drop_state: &D) -> Result<Tensor>
    where
        D: Fn(&Tensor) -> Result<Tensor>,
    {
        let h_fwd = self.fwd.forward(x_tnd, self.transfer, false, drop_state)?;
        match self.bwd.as_ref() {
            Some(bwd) => {
                let h_bwd = bwd.forward(x_tnd, self.transfer, true, drop_state)?;
                Tensor::cat(&[&h_fwd, &h_bwd], 2)
            }
            None => Ok(h_fwd),
        }
    }
}

/// Activations of a recurrent pass, all time-major
pub struct RnnExprs {
    pub hiddens: Vec<Tensor>,
    /// per-step output of the dense output layer, no transfer
    pub output: Tensor,
}

/// Elman recurrent network over time-major `(t, n, d)` data
pub struct RnnNet {
    n_in: usize,
    n_out: usize,
    hidden_sizes: Vec<usize>,
    bidirectional: bool,
    dropout: DropoutRates,
    layers: Vec<RecurrentLayer>,
    out: Linear,
    dropout_logits: Option<Tensor>,
    noise: RefCell<NoiseSource>,
}

impl RnnNet {
    /// Will create a new recurrent module with these variables:
    /// * `layer.{i}.fwd.{input.weight, input.bias, recurrent, initial}`
    /// * `layer.{i}.bwd.*` when bidirectional
    /// * `out.weight`, `out.bias`
    /// * `dropout_logit` when the rates are learned
    ///
    /// # Arguments
    /// * `n_in` - input dimension
    /// * `hiddens` - hidden layer sizes (per direction)
    /// * `n_out` - output (statistics) dimension
    /// * `transfers` - one transfer function per hidden layer
    /// * `bidirectional` - also run every hidden layer backward in time
    /// * `dropout` - Gaussian dropout rates
    /// * `vb` - variable builder
    pub fn new(
        n_in: usize,
        hiddens: &[usize],
        n_out: usize,
        transfers: &[Transfer],
        bidirectional: bool,
        dropout: DropoutRates,
        vb: VarBuilder,
    ) -> Result<Self> {
        if hiddens.len() != transfers.len() {
            bail!(
                "{} hidden layers but {} transfer functions",
                hiddens.len(),
                transfers.len()
            );
        }
        if let DropoutRates::Fixed(p) = dropout {
            if !(0.0..1.0).contains(&p) {
                bail!("dropout rate must be in [0, 1), got {}", p);
            }
        }

        let mut layers = Vec::with_capacity(hiddens.len());
        let mut n_prev = n_in;
        for (i, (&h, &transfer)) in hiddens.iter().zip(transfers.iter()).enumerate() {
            let vb_i = vb.pp(format!("layer.{}", i));
            let fwd = RecurrentDirection::new(n_prev, h, vb_i.pp("fwd"))?;
            let bwd = if bidirectional {
                Some(RecurrentDirection::new(n_prev, h, vb_i.pp("bwd"))?)
            } else {
                None
            };
            layers.push(RecurrentLayer { fwd, bwd, transfer });
            n_prev = if bidirectional { 2 * h } else { h };
        }
        let out = candle_nn::linear(n_prev, n_out, vb.pp("out"))?;

        let dropout_logits = match dropout {
            DropoutRates::Learned => Some(vb.get_with_hints(
                hiddens.len() + 2,
                "dropout_logit",
                candle_nn::init::ZERO,
            )?),
            _ => None,
        };

        Ok(Self {
            n_in,
            n_out,
            hidden_sizes: hiddens.to_vec(),
            bidirectional,
            dropout,
            layers,
            out,
            dropout_logits,
            noise: RefCell::new(NoiseSource::new(0)),
        })
    }

    /// Draw dropout noise from a source seeded with `seed`
    pub fn with_noise_seed(self, seed: u64) -> Self {
        Self {
            noise: RefCell::new(NoiseSource::new(seed)),
            ..self
        }
    }

    /// width of the top hidden layer (both directions)
    pub fn n_top_hidden(&self) -> usize {
        match self.hidden_sizes.last() {
            Some(&h) if self.bidirectional => 2 * h,
            Some(&h) => h,
            None => self.n_in,
        }
    }

    pub fn parameter_spec(&self) -> ParameterSpec {
        ParameterSpec::rnn(
            self.n_in,
            &self.hidden_sizes,
            self.n_out,
            self.bidirectional,
            self.dropout == DropoutRates::Learned,
        )
    }

    /// Current dropout rates, one per position
    pub fn dropout_rates(&self) -> Result<Option<Tensor>> {
        match (&self.dropout, self.dropout_logits.as_ref()) {
            (DropoutRates::Learned, Some(logits)) => Ok(Some(
                ops::sigmoid(logits)?.affine(DROPOUT_RANGE, MIN_DROPOUT)?,
            )),
            (DropoutRates::Fixed(p), _) => Ok(Some(Tensor::full(
                *p as f32,
                self.hidden_sizes.len() + 2,
                self.out.weight().device(),
            )?)),
            _ => Ok(None),
        }
    }

    /// h * (1 + sqrt(p / (1 - p)) * eps), eps ~ N(0, 1)
    fn gauss_dropout(&self, h: &Tensor, pos: usize, train: bool) -> Result<Tensor> {
        if !train {
            return Ok(h.clone());
        }
        match (&self.dropout, self.dropout_logits.as_ref()) {
            (DropoutRates::Fixed(p), _) if *p > 0.0 => {
                let scale = (p / (1.0 - p)).sqrt();
                let eps = self.noise.borrow_mut().standard_normal_like(h)?;
                h.mul(&eps.affine(scale, 1.)?)
            }
            (DropoutRates::Learned, Some(logits)) => {
                let p = ops::sigmoid(&logits.narrow(0, pos, 1)?)?
                    .affine(DROPOUT_RANGE, MIN_DROPOUT)?;
                let scale = p.div(&p.affine(-1., 1.)?)?.sqrt()?;
                let eps = self.noise.borrow_mut().standard_normal_like(h)?;
                let noise = (eps.broadcast_mul(&scale)? + 1.)?;
                h.mul(&noise)
            }
            _ => Ok(h.clone()),
        }
    }

    pub fn forward_exprs(&self, x_tnd: &Tensor, train: bool) -> Result<RnnExprs> {
        check_input_rank(x_tnd, 3)?;
        let x_tnd = x_tnd.to_dtype(DType::F32)?;

        let mut h = self.gauss_dropout(&x_tnd, 0, train)?;
        let mut hiddens = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let drop_state = |s: &Tensor| self.gauss_dropout(s, 1 + i, train);
            h = layer.forward(&h, &drop_state)?;
            hiddens.push(h.clone());
        }

        let top = self.gauss_dropout(&h, self.layers.len() + 1, train)?;
        let output = self.out.forward(&top)?;
        Ok(RnnExprs { hiddens, output })
    }
}

impl RecognitionNet for RnnNet {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<RecognitionOutput> {
        Ok(RecognitionOutput {
            raw: self.forward_exprs(x, train)?.output,
            shortcut: None,
        })
    }

    fn input_rank(&self) -> usize {
        3
    }
}

impl GenerativeNet for RnnNet {
    fn forward_t(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.forward_exprs(z, train)?.output)
    }
}

/// Recurrent recognition that also hands its top hidden layer,
/// shifted one step forward in time, to the generating model
///
/// At step `t` the shortcut holds the hidden state of step `t - 1`
/// (zeros at `t = 0`), so generating `x(t)` may only look at the past.
pub struct OneStepRecognition {
    net: RnnNet,
}

impl OneStepRecognition {
    pub fn new(net: RnnNet) -> Result<Self> {
        if net.hidden_sizes.is_empty() {
            bail!("one-step prediction needs at least one recurrent hidden layer");
        }
        Ok(Self { net })
    }

    pub fn parameter_spec(&self) -> ParameterSpec {
        self.net.parameter_spec()
    }
}

/// Shift a time-major tensor one step forward, zero-filling step 0
pub fn shift_forward(x_tnd: &Tensor) -> Result<Tensor> {
    let (t, n, d) = x_tnd.dims3()?;
    let zeros = Tensor::zeros((1, n, d), x_tnd.dtype(), x_tnd.device())?;
    if t == 1 {
        return Ok(zeros);
    }
    Tensor::cat(&[&zeros, &x_tnd.narrow(0, 0, t - 1)?], 0)
}

impl RecognitionNet for OneStepRecognition {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<RecognitionOutput> {
        let exprs = self.net.forward_exprs(x, train)?;
        let top = match exprs.hiddens.last() {
            Some(h) => h,
            None => bail!("one-step prediction needs a hidden layer"),
        };
        Ok(RecognitionOutput {
            raw: exprs.output,
            shortcut: Some(shift_forward(top)?),
        })
    }

    fn input_rank(&self) -> usize {
        3
    }

    fn dim_shortcut(&self) -> usize {
        self.net.n_top_hidden()
    }
}
