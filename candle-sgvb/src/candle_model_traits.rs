use candle_core::{Result, Tensor};

/// Unstatified output of a recognition network
pub struct RecognitionOutput {
    /// raw latent statistics, before `statify_latent`
    pub raw: Tensor,
    /// optional deterministic side channel passed on to generation
    pub shortcut: Option<Tensor>,
}

pub trait RecognitionNet {
    /// Map the data to raw latent statistics
    ///
    /// # Arguments
    /// * `x` - input data, `(n, d)` or time-major `(t, n, d)`
    /// * `train` - whether to inject dropout noise or not
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<RecognitionOutput>;

    /// 2 for flat data, 3 for sequences
    fn input_rank(&self) -> usize;

    /// width of the shortcut channel, if any
    fn dim_shortcut(&self) -> usize {
        0
    }
}

pub trait GenerativeNet {
    /// Map latent samples (with any shortcut already concatenated) to
    /// raw visible statistics
    fn forward_t(&self, z: &Tensor, train: bool) -> Result<Tensor>;
}
