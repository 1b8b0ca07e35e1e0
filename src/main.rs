//! Build cache maintenance CLI
//!
//! Entry point for the `build-cache` command-line tool.

use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;

use build_cache::{
    BuildCacheConfig, CacheError, HashKey, LocalCacheOptions, LocalCacheService,
};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code for a `load` that found nothing.
const EXIT_MISS: i32 = 2;

#[derive(Parser)]
#[command(name = "build-cache")]
#[command(about = "Inspect and maintain the local build cache", version)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Cache directory, overriding the config
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a file in the cache
    Store {
        /// File whose content is stored
        file: PathBuf,

        /// Key in hex (default: SHA-256 of the file content)
        #[arg(long, short = 'k')]
        key: Option<String>,
    },

    /// Read an entry from the cache
    Load {
        /// Key in hex
        key: String,

        /// Write the content here instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Show cache statistics
    Stats {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove unused entries now
    Cleanup,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match load_config(cli.config.as_deref(), cli.dir.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(1);
        }
    };

    let cache = match LocalCacheService::open(LocalCacheOptions::from_config(&config)) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error opening cache: {}", e);
            process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Store { file, key } => run_store(&cache, &file, key.as_deref()),
        Commands::Load { key, output } => run_load(&cache, &key, output.as_deref()),
        Commands::Stats { json } => run_stats(&cache, json),
        Commands::Cleanup => run_cleanup(&cache),
    };

    if let Err(e) = cache.close() {
        eprintln!("Error closing cache: {}", e);
        process::exit(1);
    }
    process::exit(code);
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("build_cache={level}")));

    let layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(io::stderr)
        .with_target(false);

    tracing_subscriber::registry().with(filter).with(layer).init();
}

fn load_config(config_path: Option<&Path>, dir: Option<&Path>) -> Result<BuildCacheConfig, String> {
    let overrides = dir.map(|dir| {
        let mut table = toml::Table::new();
        table.insert(
            "directory".to_string(),
            toml::Value::String(dir.to_string_lossy().into_owned()),
        );
        toml::Value::Table(table)
    });

    BuildCacheConfig::resolve(config_path, overrides).map_err(|e| e.to_string())
}

fn parse_key(hex: &str) -> Result<HashKey, i32> {
    hex.parse().map_err(|e| {
        eprintln!("Invalid key '{}': {}", hex, e);
        1
    })
}

fn run_store(cache: &LocalCacheService, file: &Path, key: Option<&str>) -> i32 {
    let key = match key {
        Some(hex) => match parse_key(hex) {
            Ok(key) => key,
            Err(code) => return code,
        },
        None => match fs::read(file) {
            Ok(bytes) => HashKey::sha256(&bytes),
            Err(e) => {
                eprintln!("Error reading {}: {}", file.display(), e);
                return 1;
            }
        },
    };

    let mut input = match File::open(file) {
        Ok(f) => BufReader::new(f),
        Err(e) => {
            eprintln!("Error reading {}: {}", file.display(), e);
            return 1;
        }
    };

    match cache.store(&key, |out| io::copy(&mut input, out).map(|_| ())) {
        Ok(()) => {
            println!("{}", key);
            0
        }
        Err(e) => {
            eprintln!("Error storing entry: {}", e);
            1
        }
    }
}

fn run_load(cache: &LocalCacheService, hex: &str, output: Option<&Path>) -> i32 {
    let key = match parse_key(hex) {
        Ok(key) => key,
        Err(code) => return code,
    };

    let result = cache.load(&key, |input| -> Result<(), CacheError> {
        match output {
            Some(path) => {
                let mut file =
                    File::create(path).map_err(|e| CacheError::io("create output", path, e))?;
                io::copy(input, &mut file).map_err(|e| CacheError::io("write output", path, e))?;
            }
            None => {
                let stdout = io::stdout();
                let mut out = stdout.lock();
                io::copy(input, &mut out)
                    .and_then(|_| out.flush())
                    .map_err(|e| CacheError::io("write output", "<stdout>", e))?;
            }
        }
        Ok(())
    });

    match result {
        Ok(Some(())) => 0,
        Ok(None) => {
            eprintln!("No entry for {}", key);
            EXIT_MISS
        }
        Err(e) => {
            eprintln!("Error loading entry: {}", e);
            1
        }
    }
}

fn run_stats(cache: &LocalCacheService, json_output: bool) -> i32 {
    let stats = match cache.stats() {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Error reading cache: {}", e);
            return 1;
        }
    };

    if json_output {
        match serde_json::to_string_pretty(&stats) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                return 1;
            }
        }
    } else {
        println!("Cache: {}", stats.directory.display());
        println!("  Entries: {}", stats.entries);
        println!("  Size: {} bytes", stats.total_bytes);
        println!("  Quarantined: {}", stats.quarantined);
        match stats.cleanup_epoch {
            Some(at) => println!("  Cleanup counted from: {}", at.to_rfc3339()),
            None => println!("  Cleanup counted from: unknown"),
        }
    }
    0
}

fn run_cleanup(cache: &LocalCacheService) -> i32 {
    match cache.cleanup_now() {
        Ok(report) => {
            println!(
                "Removed {} of {} entries, {} bytes reclaimed",
                report.deleted, report.scanned, report.bytes_reclaimed
            );
            for error in &report.errors {
                eprintln!("  {}", error);
            }
            if report.interrupted {
                println!("Cleanup interrupted by another process; it resumes next time");
            }
            0
        }
        Err(e) => {
            eprintln!("Error cleaning cache: {}", e);
            1
        }
    }
}
