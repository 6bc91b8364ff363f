use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use volcache_cache::CacheConfig;
use volcache_core::{load_multiscale, CacheRuntime, MultiscalePyramid, N5FsReader};

#[derive(Debug, Parser)]
#[command(name = "volcache")]
#[command(about = "Inspect multiscale label datasets and warm their caches")]
pub struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Cache configuration file (defaults to VOLCACHE_* environment variables).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the levels of a multiscale group.
    Inspect {
        #[arg(value_name = "N5_ROOT")]
        root: PathBuf,
        #[arg(value_name = "GROUP")]
        group: String,
        /// Voxel size of the finest level.
        #[arg(long, value_delimiter = ',', default_values_t = vec![1.0, 1.0, 1.0])]
        resolution: Vec<f64>,
        /// Physical origin of the finest level.
        #[arg(long, value_delimiter = ',', default_values_t = vec![0.0, 0.0, 0.0])]
        offset: Vec<f64>,
        /// Print machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Load every cell of one level through the blocking path.
    Warm {
        #[arg(value_name = "N5_ROOT")]
        root: PathBuf,
        #[arg(value_name = "GROUP")]
        group: String,
        #[arg(long, default_value_t = 0)]
        level: usize,
        /// Override the cache size limit.
        #[arg(long, value_name = "MB")]
        max_cache_mb: Option<usize>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    group: String,
    levels: Vec<LevelOutput>,
}

#[derive(Debug, Serialize)]
struct LevelOutput {
    dataset: String,
    dimensions: Vec<u64>,
    block_size: Vec<u32>,
    num_cells: u64,
    downsampling_factors: [f64; 3],
    resolution: [f64; 3],
    shift: [f64; 3],
    transform: [[f64; 4]; 3],
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);

    match cli.command {
        Commands::Inspect { root, group, resolution, offset, json } => {
            let config = load_config(cli.config.as_deref(), None)?;
            run_inspect(config, &root, &group, &resolution, &offset, json)
        }
        Commands::Warm { root, group, level, max_cache_mb } => {
            let config = load_config(cli.config.as_deref(), max_cache_mb)?;
            run_warm(config, &root, &group, level)
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(path: Option<&Path>, max_cache_mb: Option<usize>) -> Result<CacheConfig> {
    let config = match path {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("failed to read cache config {}", path.display()))?,
        None => CacheConfig::from_env().context("invalid cache configuration in environment")?,
    };

    Ok(match max_cache_mb {
        Some(mb) => config.with_max_cache_mb(mb),
        None => config,
    })
}

fn open_pyramid(
    runtime: &CacheRuntime,
    root: &Path,
    group: &str,
    resolution: &[f64],
    offset: &[f64],
) -> Result<MultiscalePyramid> {
    let reader = N5FsReader::open(root)
        .with_context(|| format!("failed to open N5 container {}", root.display()))?;

    load_multiscale(runtime, Arc::new(reader), group, resolution, offset, 0)
        .with_context(|| format!("failed to load multiscale group {group}"))
}

fn run_inspect(
    config: CacheConfig,
    root: &Path,
    group: &str,
    resolution: &[f64],
    offset: &[f64],
    json: bool,
) -> Result<()> {
    let runtime = CacheRuntime::start(config).context("failed to start cache runtime")?;
    let pyramid = open_pyramid(&runtime, root, group, resolution, offset)?;

    let payload = InspectOutput {
        group: group.to_string(),
        levels: pyramid
            .levels()
            .iter()
            .map(|level| LevelOutput {
                dataset: level.scale_dataset.clone(),
                dimensions: level.grid.dimensions().to_vec(),
                block_size: level.grid.cell_dimensions().to_vec(),
                num_cells: level.grid.num_cells(),
                downsampling_factors: level.downsampling_factors,
                resolution: level.resolution,
                shift: level.shift,
                transform: level.transform.to_rows(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("group: {} ({} levels)", payload.group, payload.levels.len());
        for (index, level) in payload.levels.iter().enumerate() {
            println!("level {index}: {}", level.dataset);
            println!("  dimensions: {:?}", level.dimensions);
            println!("  block size: {:?} ({} cells)", level.block_size, level.num_cells);
            println!("  downsampling factors: {:?}", level.downsampling_factors);
            println!("  resolution: {:?}", level.resolution);
            println!("  shift: {:?}", level.shift);
            for row in &level.transform {
                println!("  transform: {:?}", row);
            }
        }
    }

    pyramid.close();
    runtime.shutdown();
    Ok(())
}

fn run_warm(config: CacheConfig, root: &Path, group: &str, level_index: usize) -> Result<()> {
    let runtime = CacheRuntime::start(config).context("failed to start cache runtime")?;
    let pyramid = open_pyramid(&runtime, root, group, &[1.0; 3], &[0.0; 3])?;

    let Some(level) = pyramid.level(level_index) else {
        anyhow::bail!(
            "level {level_index} does not exist; {group} has {} levels",
            pyramid.num_levels()
        );
    };

    let mut loaded = 0u64;
    let mut failed = 0u64;
    for index in 0..level.grid.num_cells() {
        match level.get(index) {
            Ok(_) => loaded += 1,
            Err(error) => {
                failed += 1;
                tracing::warn!(index, %error, "cell failed to load");
            }
        }
    }

    let controller = runtime.controller();
    controller.restrict_to_max_size();

    println!("dataset: {}", level.scale_dataset);
    println!("loaded: {loaded}");
    println!("failed: {failed}");
    println!(
        "memory: {} / {} bytes",
        controller.current_memory_usage_in_bytes(),
        controller.max_size()
    );

    pyramid.close();
    runtime.shutdown();

    if failed > 0 {
        anyhow::bail!("{failed} cells failed to load");
    }
    Ok(())
}
