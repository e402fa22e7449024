//! CLI application for packing, inspecting and running leanrt engines.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{bench, config, inspect, pack, run};

/// Environment variable overriding the `-v`/`-q` log filter.
const LOG_ENV: &str = "LEANRT_LOG";

const LEANRT_CRATES: [&str; 3] = ["leanrt_cli", "leanrt_core", "leanrt_kernels"];

/// leanrt - Deserialize and execute precompiled inference engines
#[derive(Parser)]
#[command(name = "leanrt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output; repeat for more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an engine blob from a JSON manifest
    Pack(pack::PackArgs),

    /// Show the IO tensors and profiles of an engine
    Inspect(inspect::InspectArgs),

    /// Run an engine once
    Run(run::RunArgs),

    /// Measure launch latency of an engine
    Bench(bench::BenchArgs),

    /// Manage configuration
    Config(config::ConfigArgs),
}

/// Filter directives for a verbosity level.
///
/// Extra verbosity is scoped to the leanrt crates until `-vvv`, which also
/// opens up dependencies.
fn filter_directives(verbose: u8, quiet: bool) -> String {
    let scoped = |level: &str| {
        let mut directives = vec!["warn".to_string()];
        directives.extend(LEANRT_CRATES.iter().map(|krate| format!("{}={}", krate, level)));
        directives.join(",")
    };
    match (quiet, verbose) {
        (true, _) => "error".to_string(),
        (false, 0) => "warn".to_string(),
        (false, 1) => scoped("info"),
        (false, 2) => scoped("debug"),
        (false, _) => "trace".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) => EnvFilter::try_new(&directives)
            .map_err(|e| anyhow::anyhow!("Invalid {} filter '{}': {}", LOG_ENV, directives, e))?,
        Err(_) => EnvFilter::new(filter_directives(cli.verbose, cli.quiet)),
    };

    // stdout carries command output only.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(cli.verbose >= 2)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install the log subscriber: {}", e))?;

    match cli.command {
        Commands::Pack(args) => pack::run(args, cli.config.as_deref()).await,
        Commands::Inspect(args) => inspect::run(args, cli.config.as_deref()).await,
        Commands::Run(args) => run::run(args, cli.config.as_deref()).await,
        Commands::Bench(args) => bench::run(args, cli.config.as_deref()).await,
        Commands::Config(args) => config::run(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_filter_directives() {
        assert_eq!(filter_directives(0, false), "warn");
        assert_eq!(filter_directives(3, true), "error");
        assert_eq!(
            filter_directives(1, false),
            "warn,leanrt_cli=info,leanrt_core=info,leanrt_kernels=info"
        );
        assert_eq!(
            filter_directives(2, false),
            "warn,leanrt_cli=debug,leanrt_core=debug,leanrt_kernels=debug"
        );
        assert_eq!(filter_directives(5, false), "trace");
    }

    #[test]
    fn test_verbosity_flags_conflict() {
        assert!(Cli::try_parse_from(["leanrt", "-q", "-v", "config", "show"]).is_err());
        let cli = Cli::try_parse_from(["leanrt", "config", "show", "-vv"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}