//! Pack command - build an engine blob from a JSON manifest.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use console::style;
use tracing::{debug, info};

use leanrt_core::{EngineManifest, Logger, Runtime};

use super::load_config;

/// Arguments for the pack command.
#[derive(Args)]
pub struct PackArgs {
    /// Manifest file (JSON)
    #[arg(required = true)]
    manifest: PathBuf,

    /// Output file (default: manifest path with an .lrte extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Skip deserializing the packed blob as a check
    #[arg(long)]
    no_verify: bool,
}

pub async fn run(args: PackArgs, config_path: Option<&str>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    if !args.manifest.exists() {
        anyhow::bail!("Manifest not found: {}", args.manifest.display());
    }

    info!("Packing manifest: {}", args.manifest.display());

    let mut manifest = EngineManifest::from_file(&args.manifest)?;
    if manifest.name.is_empty() {
        manifest.name = args
            .manifest
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("engine")
            .to_string();
    }

    let blob = manifest.into_blob()?;
    let bytes = blob.to_bytes();
    debug!("Encoded '{}' into {} bytes", blob.name, bytes.len());

    if !args.no_verify {
        let runtime = Runtime::with_config(Arc::new(Logger::new()), config);
        runtime
            .try_deserialize_engine(&bytes)
            .map_err(|e| anyhow::anyhow!("Manifest does not describe a valid engine: {}", e))?;
    }

    let output_path = args
        .output
        .unwrap_or_else(|| args.manifest.with_extension("lrte"));
    fs::write(&output_path, &bytes)?;

    println!(
        "{} Packed '{}' ({} tensors, {} ops, {} bytes) into {}",
        style("✓").green(),
        blob.name,
        blob.tensors.len(),
        blob.ops.len(),
        bytes.len(),
        output_path.display()
    );

    Ok(())
}
