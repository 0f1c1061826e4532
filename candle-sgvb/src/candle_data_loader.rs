use candle_core::{DType, Device, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub struct MinibatchData {
    pub input: Tensor,
    /// per-example weights, `(b, 1)` or `(t, b, 1)`
    pub imp_weight: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn num_samples(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for an in-memory tensor. Flat data `(n, d)`
/// is split along rows; time-major sequences `(t, n, d)` are split
/// along the second axis so that every minibatch keeps whole
/// sequences.
///
pub struct InMemoryData {
    input_data: Tensor,
    imp_weight_data: Option<Tensor>,
    batch_axis: usize,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_imp_weight_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

fn batch_axis_of(data: &Tensor) -> anyhow::Result<usize> {
    match data.rank() {
        2 => Ok(0),
        3 => Ok(1),
        r => Err(anyhow::anyhow!("ndim must be 2 or 3, but it is {}", r)),
    }
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new(data: &Tensor, seed: u64) -> anyhow::Result<Self> {
        let batch_axis = batch_axis_of(data)?;
        let n = data.dim(batch_axis)?;

        Ok(InMemoryData {
            input_data: data.to_dtype(DType::F32)?,
            imp_weight_data: None,
            batch_axis,
            shuffled_input_data: None,
            shuffled_imp_weight_data: None,
            minibatches: Minibatches::new(n, seed),
        })
    }

    /// Create a data loader with the main `data` and per-example
    /// importance weights `imp_weight`; the weights must match the
    /// data on every axis but the last, which must be 1
    pub fn new_with_imp_weight(
        data: &Tensor,
        imp_weight: &Tensor,
        seed: u64,
    ) -> anyhow::Result<Self> {
        let mut ret = Self::new(data, seed)?;
        let d = data.rank() - 1;
        if imp_weight.rank() != data.rank()
            || imp_weight.dims()[..d] != data.dims()[..d]
            || imp_weight.dim(d)? != 1
        {
            return Err(anyhow::anyhow!(
                "importance weights {:?} do not match data {:?}",
                imp_weight.dims(),
                data.dims()
            ));
        }
        ret.imp_weight_data = Some(imp_weight.to_dtype(DType::F32)?);
        Ok(ret)
    }

    fn take(&self, data: &Tensor, samples: &[usize]) -> anyhow::Result<Tensor> {
        let idx: Vec<u32> = samples.iter().map(|&i| i as u32).collect();
        let idx = Tensor::from_vec(idx, samples.len(), data.device())?;
        Ok(data.index_select(&idx, self.batch_axis)?)
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(input) =
            take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
        {
            let imp_weight = take_shuffled(
                batch_idx,
                target_device,
                self.shuffled_imp_weight_data.as_ref(),
            )?;
            Ok(MinibatchData { input, imp_weight })
        } else {
            Err(anyhow::anyhow!("need to shuffle data"))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn num_samples(&self) -> usize {
        self.minibatches.size()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        /////////////////////
        // shuffle indexes //
        /////////////////////

        self.minibatches.shuffle_minibatch(batch_size)?;

        ///////////////////////////////////
        // preload all the shuffled data //
        ///////////////////////////////////

        let mut shuffled_input = Vec::with_capacity(self.num_minibatch());
        let mut shuffled_weight = self
            .imp_weight_data
            .as_ref()
            .map(|_| Vec::with_capacity(self.num_minibatch()));

        for samples in self.minibatches.chunks.iter() {
            shuffled_input.push(self.take(&self.input_data, samples)?);
            if let (Some(w), Some(out)) = (self.imp_weight_data.as_ref(), shuffled_weight.as_mut())
            {
                out.push(self.take(w, samples)?);
            }
        }

        self.shuffled_input_data = Some(shuffled_input);
        self.shuffled_imp_weight_data = shuffled_weight;
        Ok(())
    }
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` partition indexes.
/// The last chunk may be smaller than the batch size.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
    rng: StdRng,
}

impl Minibatches {
    pub fn new(size: usize, seed: u64) -> Self {
        Self {
            samples: (0..size).collect(),
            chunks: vec![],
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }
        if self.samples.is_empty() {
            return Err(anyhow::anyhow!("no samples to draw minibatches from"));
        }
        self.samples.shuffle(&mut self.rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|c| c.to_vec())
            .collect();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}

///
/// Convert a matrix to a `(rows, cols)` f32 `Tensor`
///
pub trait ToTensor {
    fn to_tensor(&self, device: &Device) -> anyhow::Result<Tensor>;
}

impl ToTensor for Array2<f32> {
    fn to_tensor(&self, device: &Device) -> anyhow::Result<Tensor> {
        let (nrow, ncol) = self.dim();
        let data: Vec<f32> = self.iter().copied().collect();
        Ok(Tensor::from_vec(data, (nrow, ncol), device)?)
    }
}
