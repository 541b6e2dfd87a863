// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{Level, info};

use sifscan::cache::EngineCache;
use sifscan::config::{FileConfig, Overrides, Settings};
use sifscan::discovery::Discovery;
use sifscan::output;
use sifscan::resolver;
use sifscan::scan::{self, ScanOptions};
use sifscan::{cancel_pair, detect_runtime};

#[derive(Parser)]
#[command(
    name = "sifscan",
    version,
    about = "Vulnerability and inventory scanning for Apptainer/Singularity containers"
)]
struct Cli {
    /// Path to the config file (default: ~/.config/sifscan/config.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Qualys access token (or QUALYS_ACCESS_TOKEN)
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Qualys platform pod (or QUALYS_POD)
    #[arg(short, long, global = true)]
    pod: Option<String>,

    /// Comma-separated scan types (or SCAN_TYPES)
    #[arg(long, global = true)]
    scan_types: Option<String>,

    /// Engine mode
    #[arg(long, global = true)]
    mode: Option<String>,

    /// Comma-separated report formats
    #[arg(long, global = true)]
    format: Option<String>,

    /// Directory for report output (or OUTPUT_DIR)
    #[arg(short, long, global = true)]
    output_dir: Option<String>,

    /// Path to the qscanner binary
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Emit machine-readable JSON instead of a table
    #[arg(long, global = true)]
    json: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Enable debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan one or more SIF image files
    Sif {
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Scan a running container by PID or name pattern
    Running {
        /// List detected container processes instead of scanning
        #[arg(long)]
        list: bool,
        target: Option<String>,
    },
    /// Scan a registry image reference (handled by the engine directly)
    Image {
        #[arg(required = true)]
        refs: Vec<String>,
    },
    /// Scan a source repository checkout (handled by the engine directly)
    Repo {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print version information
    Version,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            token: self.token.clone(),
            pod: self.pod.clone(),
            scan_types: self.scan_types.clone(),
            mode: self.mode.clone(),
            format: self.format.clone(),
            output_dir: self.output_dir.clone(),
            engine: self.engine.clone(),
        }
    }
}

fn scan_options(settings: &Settings, quiet: bool) -> Result<ScanOptions> {
    let cache = EngineCache::default_location();
    let engine = settings
        .locate_engine(&cache)
        .context("could not locate the scanning engine")?;
    info!("using engine at {}", engine.display());

    Ok(ScanOptions {
        token: settings.token.clone(),
        pod: settings.pod.clone(),
        scan_types: settings.scan_types.clone(),
        mode: settings.mode.clone(),
        format: settings.format.clone(),
        output_dir: settings.output_dir.clone(),
        engine,
        quiet,
    })
}

fn print_results(results: &[sifscan::ScanResult], json: bool) -> Result<()> {
    if json {
        println!("{}", output::results_json(results)?);
    } else {
        print!("{}", output::results_table(results));
    }
    Ok(())
}

fn list_containers(json: bool) -> Result<i32> {
    let containers = Discovery::new()
        .list_containers()
        .context("container discovery failed")?;
    if json {
        println!("{}", output::containers_json(&containers)?);
    } else {
        print!("{}", output::containers_table(&containers));
    }
    Ok(0)
}

async fn run(cli: Cli) -> Result<i32> {
    if let Command::Version = cli.command {
        println!("sifscan {}", env!("CARGO_PKG_VERSION"));
        // Report the engine this configuration would use; a missing
        // engine is printed, not fatal.
        let file = FileConfig::load(cli.config.as_deref()).unwrap_or_default();
        let settings = Settings::resolve(file, cli.overrides());
        match settings.locate_engine(&EngineCache::default_location()) {
            Ok(engine) => println!("engine: {}", engine.display()),
            Err(e) => println!("engine: {e}"),
        }
        return Ok(0);
    }

    if let Command::Running { list: true, .. } = cli.command {
        // Listing needs no engine, credentials, or runtime.
        return list_containers(cli.json);
    }

    let file = FileConfig::load(cli.config.as_deref())?;
    let settings = Settings::resolve(file, cli.overrides());
    settings.validate()?;

    let opts = scan_options(&settings, cli.quiet)?;
    let (handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });

    match cli.command {
        Command::Sif { images } => {
            let runtime = detect_runtime()?;
            let results = scan::scan_image_batch(&images, &runtime, &opts, &cancel).await;
            print_results(&results, cli.json)?;
            Ok(scan::worst_exit_code(&results))
        }
        Command::Running { target, .. } => {
            let target = target.context("a PID or container name is required (or use --list)")?;
            let discovery = Discovery::new();
            let result = scan::scan_running(&target, &discovery, &opts, &cancel).await;
            let code = result.exit_code;
            print_results(&[result], cli.json)?;
            Ok(code)
        }
        Command::Image { refs } => {
            let code = scan::run_direct("image", &refs, &opts, &cancel).await?;
            Ok(code)
        }
        Command::Repo { paths } => {
            // Fail on a bad path here instead of deep inside the engine.
            for path in &paths {
                resolver::resolve_direct(path)?;
            }
            let args: Vec<String> = paths
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            let code = scan::run_direct("repo", &args, &opts, &cancel).await?;
            Ok(code)
        }
        Command::Version => Ok(0),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose {
        Level::Debug
    } else if cli.quiet {
        Level::Warn
    } else {
        Level::Info
    };
    simple_logger::init_with_level(level)?;

    let code = run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
