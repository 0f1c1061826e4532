use candle_core::{bail, Result, Tensor};

/// Merge the leading time and batch axes: `(t, n, d) -> (t * n, d)`.
/// Rank-2 input is returned as is.
pub fn flatten_time(x: &Tensor) -> Result<Tensor> {
    match x.rank() {
        2 => Ok(x.clone()),
        3 => {
            let (t, n, d) = x.dims3()?;
            x.reshape((t * n, d))
        }
        r => bail!("ndim must be 2 or 3, but it is {}", r),
    }
}

/// Inverse of `flatten_time`: `(t * n, d) -> (t, n, d)`
pub fn recover_time(x: &Tensor, time_steps: usize) -> Result<Tensor> {
    let (tn, d) = x.dims2()?;
    if time_steps == 0 || tn % time_steps != 0 {
        bail!("cannot split {} rows into {} time steps", tn, time_steps);
    }
    x.reshape((time_steps, tn / time_steps, d))
}

/// Flat data must be `(n, d)`, sequences time-major `(t, n, d)`
pub fn check_input_rank(x: &Tensor, expected: usize) -> Result<()> {
    match x.rank() {
        r @ (2 | 3) if r == expected => Ok(()),
        r @ (2 | 3) => bail!("this model expects rank-{} input, got rank {}", expected, r),
        r => bail!("ndim must be 2 or 3, but it is {}", r),
    }
}

/// Nodes of one pass through recognition, sampling and generation
#[derive(Clone, Debug)]
pub struct SgvbNodes {
    pub inpt: Tensor,
    /// posterior statistics
    pub latent: Tensor,
    pub sample: Tensor,
    /// deterministic side channel from the recognition model
    pub shortcut: Option<Tensor>,
    /// visible statistics
    pub output: Tensor,
}

/// Wire `inpt -> recog -> sample -> gen`.
///
/// * `recog` - maps the input to (statified posterior statistics,
///   optional shortcut)
/// * `sample` - draws one differentiable sample per row (per step for
///   sequences) from the statistics
/// * `gen` - maps the sample, concatenated with the shortcut along the
///   feature axis if there is one, to statified visible statistics
///
/// No loss is formed here.
pub fn exprs<Recog, Sample, Gen>(
    inpt: &Tensor,
    recog: Recog,
    sample: Sample,
    gen: Gen,
) -> Result<SgvbNodes>
where
    Recog: FnOnce(&Tensor) -> Result<(Tensor, Option<Tensor>)>,
    Sample: FnOnce(&Tensor) -> Result<Tensor>,
    Gen: FnOnce(&Tensor) -> Result<Tensor>,
{
    if !matches!(inpt.rank(), 2 | 3) {
        bail!("ndim must be 2 or 3, but it is {}", inpt.rank());
    }

    let (latent, shortcut) = recog(inpt)?;
    let z = sample(&latent)?;

    let gen_inpt = match shortcut.as_ref() {
        Some(s) => Tensor::cat(&[&z, s], z.rank() - 1)?,
        None => z.clone(),
    };
    let output = gen(&gen_inpt)?;

    Ok(SgvbNodes {
        inpt: inpt.clone(),
        latent,
        sample: z,
        shortcut,
        output,
    })
}
