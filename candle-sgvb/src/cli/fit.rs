use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::{Args, ValueEnum};
use flate2::read::GzDecoder;
use log::info;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::candle_assumptions::VisibleFamily;
use crate::candle_aux_layers::Transfer;
use crate::candle_data_loader::ToTensor;
use crate::candle_optimizer::OptimizerSpec;
use crate::candle_vae_inference::{Vae, VaeConfig};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum VisibleType {
    /// diagonal Gaussian: x ~ N(mu(z), diag(var(z)))
    Gaussian,
    /// independent Bernoulli: x ~ Bern(p(z)), data in [0, 1]
    Bernoulli,
}

impl From<VisibleType> for VisibleFamily {
    fn from(v: VisibleType) -> Self {
        match v {
            VisibleType::Gaussian => VisibleFamily::DiagGauss,
            VisibleType::Bernoulli => VisibleFamily::Bern,
        }
    }
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(short, long, help = "Data matrix, one example per row (tsv/csv, optionally .gz)")]
    pub data: PathBuf,

    #[arg(short, long, help = "Output prefix (creates {out}.latent.tsv.gz, {out}.recon.tsv.gz)")]
    pub out: String,

    #[arg(long, default_value = "2")]
    pub n_latent: usize,

    #[arg(long, value_delimiter = ',', default_value = "16")]
    pub hiddens_recog: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "16")]
    pub hiddens_gen: Vec<usize>,

    #[arg(long, default_value = "tanh", help = "Hidden transfer function")]
    pub transfer: String,

    #[arg(short, long, default_value = "gaussian")]
    pub visible: VisibleType,

    #[arg(long, default_value = "adamw:lr=0.001", help = "e.g. adamw:lr=0.01,beta1=0.9 or sgd:lr=0.1")]
    pub optimizer: String,

    #[arg(long, default_value = "1000")]
    pub max_iter: usize,

    #[arg(long, help = "Minibatch size (default: full batch)")]
    pub batch_size: Option<usize>,

    #[arg(long, help = "Importance samples per example for a -log p(x) estimate")]
    pub nll_samples: Option<usize>,

    #[arg(long, default_value = "42")]
    pub seed: u64,

    #[arg(long)]
    pub verbose: bool,
}

///
/// Open a file for reading, and return a buffered reader
/// * `input_file` - file name--either gzipped or not
///
pub fn open_buf_reader(input_file: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(input_file)?;
    match input_file.extension().and_then(|x| x.to_str()) {
        Some("gz") => Ok(Box::new(BufReader::new(GzDecoder::new(file)))),
        _ => Ok(Box::new(BufReader::new(file))),
    }
}

///
/// Open a file for writing, and return a buffered writer
/// * `output_file` - file name--either gzipped or not
///
pub fn open_buf_writer(output_file: &Path) -> Result<Box<dyn Write>> {
    let file = File::create(output_file)?;
    match output_file.extension().and_then(|x| x.to_str()) {
        Some("gz") => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => Ok(Box::new(BufWriter::new(file))),
    }
}

/// Read a delimited numeric matrix
///
/// Fields may be separated by tabs, commas or spaces. Blank lines and
/// lines starting with `#` are skipped.
pub fn read_matrix(path: &Path) -> Result<Array2<f32>> {
    let reader = open_buf_reader(path)?;
    let mut data: Vec<f32> = vec![];
    let mut ncol: Option<usize> = None;
    let mut nrow = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let row = line
            .split(|c: char| c == '\t' || c == ',' || c == ' ')
            .filter(|w| !w.is_empty())
            .map(|w| w.parse::<f32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("line {}: {}", line_no + 1, e))?;

        match ncol {
            None => ncol = Some(row.len()),
            Some(d) if d != row.len() => {
                return Err(anyhow::anyhow!(
                    "line {}: expected {} columns, found {}",
                    line_no + 1,
                    d,
                    row.len()
                ));
            }
            _ => {}
        }
        data.extend(row);
        nrow += 1;
    }

    let ncol = ncol.ok_or_else(|| anyhow::anyhow!("no data in {}", path.display()))?;
    Ok(Array2::from_shape_vec((nrow, ncol), data)?)
}

/// Write an `(n, d)` tensor as tab-separated rows
pub fn write_matrix(tensor: &Tensor, path: &Path) -> Result<()> {
    let rows = tensor.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
    let mut writer = open_buf_writer(path)?;
    for row in rows {
        let line = row
            .iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(writer, "{}", line)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn run(args: &FitArgs) -> Result<()> {
    let device = Device::Cpu;
    let x = read_matrix(&args.data)?.to_tensor(&device)?;
    let (n, d) = x.dims2()?;
    info!("read {} x {} data from {}", n, d, args.data.display());

    let transfer: Transfer = args.transfer.parse()?;
    let mut config = VaeConfig::new(d, &args.hiddens_recog, args.n_latent, &args.hiddens_gen);
    config.recog_transfers = vec![transfer; args.hiddens_recog.len()];
    config.gen_transfers = vec![transfer; args.hiddens_gen.len()];
    config.visible_family = args.visible.into();
    config.optimizer = args.optimizer.parse::<OptimizerSpec>()?;
    config.max_iter = args.max_iter;
    config.batch_size = args.batch_size;
    config.seed = args.seed;
    config.verbose = args.verbose;
    config.device = device;

    let mut vae = Vae::new(config)?;
    let trace = vae.fit(&x)?;
    if let (Some(first), Some(last)) = (trace.first(), trace.last()) {
        info!("loss: {} -> {} after {} iterations", first, last, trace.len());
    }

    let latent_file = PathBuf::from(format!("{}.latent.tsv.gz", args.out));
    write_matrix(&vae.transform(&x)?, &latent_file)?;
    info!("wrote {}", latent_file.display());

    let recon_file = PathBuf::from(format!("{}.recon.tsv.gz", args.out));
    write_matrix(&vae.reconstruct(&x)?, &recon_file)?;
    info!("wrote {}", recon_file.display());

    if let Some(n_samples) = args.nll_samples {
        let nll = vae.estimate_nll(&x, n_samples)?;
        let nll_file = PathBuf::from(format!("{}.nll.tsv.gz", args.out));
        let nll = Tensor::from_vec(nll, (n, 1), &Device::Cpu)?;
        write_matrix(&nll, &nll_file)?;
        info!("wrote {}", nll_file.display());
    }

    Ok(())
}
