pub struct TrainConfig {
    /// examples per minibatch; `None` uses the full data set
    pub batch_size: Option<usize>,
    pub max_iter: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    /// with `verbose`, report the loss every this many iterations
    pub log_every: usize,
    /// seed of the minibatch shuffling
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_iter: 1000,
            device: candle_core::Device::Cpu,
            verbose: false,
            log_every: 100,
            seed: 0,
        }
    }
}
