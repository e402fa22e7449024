//! Run command - execute an engine once on a dedicated stream.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use clap::Args;
use console::style;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use leanrt_core::{AllocationStrategy, Stream, TensorIoMode};

use super::{IoTensor, bind_io, load_config, load_engine, parse_assignment, parse_shape, tensor_values};

/// Arguments for the run command.
#[derive(Args)]
pub struct RunArgs {
    /// Engine file
    #[arg(required = true)]
    engine: PathBuf,

    /// Raw input data as NAME=FILE (native byte order); may be repeated
    #[arg(short, long = "input", value_parser = parse_assignment)]
    inputs: Vec<(String, String)>,

    /// Input shape as NAME=DxD, e.g. tokens=8x4; may be repeated
    #[arg(short, long = "shape", value_parser = parse_shape)]
    shapes: Vec<(String, Vec<i64>)>,

    /// Optimization profile
    #[arg(short, long, default_value = "0")]
    profile: usize,

    /// Activation memory strategy (default: from config)
    #[arg(long, value_enum)]
    strategy: Option<StrategyArg>,

    /// Directory receiving one raw NAME.bin file per output
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum StrategyArg {
    /// Allocate the largest profile up front
    Static,
    /// Allocate for the selected profile on first use
    OnProfileChange,
}

impl From<StrategyArg> for AllocationStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Static => AllocationStrategy::Static,
            StrategyArg::OnProfileChange => AllocationStrategy::OnProfileChange,
        }
    }
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Plain text summary
    Text,
}

#[derive(Serialize)]
struct RunReport {
    engine: String,
    profile: usize,
    elapsed_us: u64,
    outputs: Vec<OutputReport>,
}

#[derive(Serialize)]
struct OutputReport {
    name: String,
    dtype: String,
    dims: Vec<i64>,
    values: Value,
}

pub async fn run(args: RunArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let strategy = args
        .strategy
        .map(AllocationStrategy::from)
        .unwrap_or(config.context.default_strategy);
    if strategy == AllocationStrategy::UserManaged {
        anyhow::bail!("The user_managed strategy needs caller memory; use --strategy static");
    }

    let loaded = load_engine(&args.engine, config)?;
    let engine = &loaded.engine;

    let mut data = HashMap::new();
    for (name, path) in &args.inputs {
        let bytes = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read input '{}' from {}: {}", name, path, e))?;
        data.insert(name.clone(), bytes);
    }
    let shapes: HashMap<String, Vec<i64>> = args.shapes.iter().cloned().collect();

    let mut context = engine
        .create_execution_context(strategy)
        .ok_or_else(|| anyhow::anyhow!("Failed to create an execution context"))?;
    if !context.set_optimization_profile(args.profile) {
        anyhow::bail!(
            "Profile {} out of range; engine has {}",
            args.profile,
            engine.nb_optimization_profiles()
        );
    }

    let tensors = bind_io(engine, &mut context, &shapes, &data)?;
    let stream = Stream::new()?;

    info!("Running '{}' with profile {}", engine.name(), args.profile);
    let start = Instant::now();
    // SAFETY: every bound buffer is owned by `tensors`, which outlives the
    // synchronization below.
    let queued = unsafe { context.enqueue(&stream) };
    if !queued {
        anyhow::bail!("Enqueue failed; see the log above");
    }
    stream.synchronize()?;
    let elapsed = start.elapsed();
    debug!("Launch completed in {:?}", elapsed);

    let outputs: Vec<&IoTensor> = tensors
        .iter()
        .filter(|t| t.mode == TensorIoMode::Output)
        .collect();

    if let Some(dir) = &args.output_dir {
        fs::create_dir_all(dir)?;
        for tensor in &outputs {
            let path = dir.join(format!("{}.bin", tensor.name));
            fs::write(&path, tensor.buffer.as_bytes())?;
            debug!("Wrote '{}' to {}", tensor.name, path.display());
        }
    }

    let report = RunReport {
        engine: engine.name().to_string(),
        profile: args.profile,
        elapsed_us: elapsed.as_micros() as u64,
        outputs: outputs
            .iter()
            .map(|t| OutputReport {
                name: t.name.clone(),
                dtype: t.dtype.to_string(),
                dims: t.dims.clone(),
                values: tensor_values(t.dtype, t.buffer.as_bytes()),
            })
            .collect(),
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string(&report)?),
        OutputFormat::Text => print!("{}", format_text(&report)),
    }

    Ok(())
}

fn format_text(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "{} Ran '{}' (profile {}) in {}us\n",
        style("✓").green(),
        report.engine,
        report.profile,
        report.elapsed_us
    ));
    for tensor in &report.outputs {
        let dims: Vec<String> = tensor.dims.iter().map(|d| d.to_string()).collect();
        output.push_str(&format!(
            "  {} [{}] {}: {}\n",
            tensor.name,
            dims.join(", "),
            tensor.dtype,
            tensor.values
        ));
    }

    output
}
