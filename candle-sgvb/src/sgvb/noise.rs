use candle_core::{Device, Result, Shape, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

/// Seeded source of standard normal noise for the reparameterization
/// trick. Two sources created with the same seed yield the same draws.
pub struct NoiseSource {
    rng: StdRng,
}

impl NoiseSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// ε ~ N(0, I) with the given shape
    pub fn standard_normal<S: Into<Shape>>(&mut self, shape: S, device: &Device) -> Result<Tensor> {
        let shape = shape.into();
        let draws: Vec<f32> = (0..shape.elem_count())
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Tensor::from_vec(draws, shape, device)
    }

    /// ε ~ N(0, I) with the shape, device and dtype of `like`
    pub fn standard_normal_like(&mut self, like: &Tensor) -> Result<Tensor> {
        self.standard_normal(like.dims(), like.device())?
            .to_dtype(like.dtype())
    }
}
