//! Inspect command - show the IO tensors and profiles of an engine.

use std::path::PathBuf;

use clap::Args;
use console::style;
use serde_json::{Value, json};

use leanrt_core::{Engine, ProfileSelector, TensorIoMode};

use super::{io_mode_name, load_config, load_engine};

/// Arguments for the inspect command.
#[derive(Args)]
pub struct InspectArgs {
    /// Engine file
    #[arg(required = true)]
    engine: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    /// JSON output
    Json,
    /// Plain text summary
    Text,
}

pub async fn run(args: InspectArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let loaded = load_engine(&args.engine, config)?;

    let output = match args.format {
        OutputFormat::Json => serde_json::to_string_pretty(&describe(&loaded.engine))?,
        OutputFormat::Text => format_text(&loaded.engine),
    };
    println!("{}", output);

    Ok(())
}

fn io_names(engine: &Engine) -> Vec<&str> {
    (0..engine.nb_io_tensors())
        .filter_map(|i| engine.io_tensor_name(i))
        .collect()
}

fn describe(engine: &Engine) -> Value {
    let tensors: Vec<Value> = io_names(engine)
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "mode": io_mode_name(engine.tensor_io_mode(name)),
                "dtype": engine.tensor_data_type(name).map(|d| d.to_string()),
                "location": engine.tensor_location(name),
                "dims": engine.tensor_shape(name).as_slice(),
            })
        })
        .collect();

    let profiles: Vec<Value> = (0..engine.nb_optimization_profiles())
        .map(|p| {
            let inputs: serde_json::Map<String, Value> = io_names(engine)
                .into_iter()
                .filter(|name| engine.tensor_io_mode(name) == TensorIoMode::Input)
                .map(|name| {
                    let shape = |s| engine.profile_shape(name, p, s).as_slice().to_vec();
                    let range = json!({
                        "min": shape(ProfileSelector::Min),
                        "opt": shape(ProfileSelector::Opt),
                        "max": shape(ProfileSelector::Max),
                    });
                    (name.to_string(), range)
                })
                .collect();
            json!({
                "index": p,
                "device_memory_size": engine.device_memory_size_for_profile(p),
                "inputs": inputs,
            })
        })
        .collect();

    json!({
        "name": engine.name(),
        "backend": engine.backend_name(),
        "device_memory_size": engine.device_memory_size(),
        "tensors": tensors,
        "profiles": profiles,
    })
}

fn format_text(engine: &Engine) -> String {
    let mut output = String::new();

    output.push_str(&format!("Engine: {}\n", style(engine.name()).bold()));
    output.push_str(&format!("Backend: {}\n", engine.backend_name()));
    output.push_str(&format!("Device memory: {} bytes\n", engine.device_memory_size()));
    output.push('\n');

    output.push_str(&format!("IO tensors ({}):\n", engine.nb_io_tensors()));
    for name in io_names(engine) {
        let dtype = engine
            .tensor_data_type(name)
            .map(|d| d.to_string())
            .unwrap_or_default();
        output.push_str(&format!(
            "  {:<7} {:<20} {:<6} {}\n",
            io_mode_name(engine.tensor_io_mode(name)),
            name,
            dtype,
            engine.tensor_shape(name)
        ));
    }

    for p in 0..engine.nb_optimization_profiles() {
        output.push('\n');
        output.push_str(&format!("Profile {}:\n", p));
        for name in io_names(engine) {
            if engine.tensor_io_mode(name) != TensorIoMode::Input {
                continue;
            }
            output.push_str(&format!(
                "  {:<20} min {}  opt {}  max {}\n",
                name,
                engine.profile_shape(name, p, ProfileSelector::Min),
                engine.profile_shape(name, p, ProfileSelector::Opt),
                engine.profile_shape(name, p, ProfileSelector::Max)
            ));
        }
    }

    output
}
