//! Tile Simulator - Command Line Interface
//!
//! Usage:
//!   tilesim run [OPTIONS]        Synthetic per-tile instruction trace
//!   tilesim ping-pong [OPTIONS]  Message latency between tile pairs
//!   tilesim exchange [OPTIONS]   Ring block exchange workload
//!   tilesim info [OPTIONS]       Show the resolved configuration

use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;

use tilesim::prelude::*;
use tilesim::workload;

#[derive(Parser)]
#[command(name = "tilesim")]
#[command(about = "Tile-based multicore architectural simulator")]
#[command(version)]
struct Cli {
    /// Output results in JSON format (for machine parsing)
    #[arg(long, global = true)]
    json: bool,

    /// Load simulator configuration from a TOML file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Override the number of simulated tiles
    #[arg(long, global = true)]
    tiles: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synthetic load/store/ALU trace on every tile
    Run {
        /// Instructions per tile
        #[arg(short, long, default_value = "100000")]
        instructions: usize,

        /// Working-set bytes per tile
        #[arg(short, long, default_value = "65536")]
        working_set: u64,

        /// Fraction of instructions that load
        #[arg(long, default_value = "0.25")]
        load_fraction: f64,

        /// Fraction of instructions that store
        #[arg(long, default_value = "0.10")]
        store_fraction: f64,

        /// Trace seed (deterministic per tile)
        #[arg(short, long, default_value = "42")]
        seed: u64,
    },

    /// Bounce a payload between tile pairs
    PingPong {
        /// Round trips per pair
        #[arg(short, long, default_value = "1000")]
        rounds: u32,

        /// Payload bytes per message
        #[arg(short, long, default_value = "64")]
        payload: usize,
    },

    /// Ring block exchange (message-passing matrix-multiply traffic)
    Exchange {
        /// Shift rounds
        #[arg(short, long, default_value = "16")]
        rounds: u32,

        /// Block bytes per tile
        #[arg(short, long, default_value = "4096")]
        block: usize,
    },

    /// Show the resolved configuration and derived cache geometry
    Info,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match SimulationConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{} failed to load {path}: {e}", "error:".red().bold());
                process::exit(1);
            }
        },
        None => SimulationConfig::default(),
    };
    if let Some(tiles) = cli.tiles {
        config.num_tiles = tiles;
    }
    if let Err(e) = config.validate() {
        eprintln!("{} {e}", "error:".red().bold());
        process::exit(1);
    }

    match cli.command {
        Commands::Run { instructions, working_set, load_fraction, store_fraction, seed } => {
            let workload_config = WorkloadConfig {
                instructions_per_tile: instructions,
                working_set_bytes: working_set,
                load_fraction,
                store_fraction,
                seed,
            };
            let sim = start(config);
            let stats = workload::run_synthetic(&sim, &workload_config);
            report(&sim, "synthetic", stats, cli.json);
            sim.shutdown();
        }
        Commands::PingPong { rounds, payload } => {
            let sim = start(config);
            let stats = workload::run_ping_pong(&sim, rounds, payload);
            report(&sim, "ping-pong", stats, cli.json);
            sim.shutdown();
        }
        Commands::Exchange { rounds, block } => {
            let sim = start(config);
            let stats = workload::run_block_exchange(&sim, rounds, block);
            report(&sim, "exchange", stats, cli.json);
            sim.shutdown();
        }
        Commands::Info => {
            show_info(&config, cli.json);
        }
    }
}

fn start(config: SimulationConfig) -> Arc<Simulator> {
    match Simulator::new(config) {
        Ok(sim) => Arc::new(sim),
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            process::exit(1);
        }
    }
}

fn report(sim: &Arc<Simulator>, name: &str, stats: WorkloadStats, json: bool) {
    if json {
        let value = serde_json::json!({
            "workload": name,
            "tiles": sim.num_tiles(),
            "instructions": stats.instructions,
            "cycles": stats.cycles,
            "messages": stats.messages,
            "bytes": stats.bytes,
        });
        println!("{}", serde_json::to_string_pretty(&value).unwrap());
        return;
    }

    println!("{}", format!("=== {name} on {} tiles ===", sim.num_tiles()).bold());
    println!();
    if let Err(e) = sim.output_summary(&mut std::io::stdout()) {
        eprintln!("{} writing summary: {e}", "error:".red().bold());
    }
    println!();
    println!("{}", "Workload totals:".bold());
    println!("  instructions: {}", stats.instructions.to_string().cyan());
    println!("  cycles:       {}", stats.cycles.to_string().cyan());
    println!("  messages:     {}", stats.messages.to_string().cyan());
    println!("  bytes moved:  {}", stats.bytes.to_string().cyan());
    if stats.cycles > 0 {
        let ipc = stats.instructions as f64 / stats.cycles as f64;
        println!("  aggregate IPC: {}", format!("{ipc:.3}").green());
    }
}

fn show_info(config: &SimulationConfig, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(config).unwrap());
        return;
    }

    let dcache_sets = config.dcache.size / (config.dcache.line_size * config.dcache.associativity);
    let icache_sets = config.icache.size / (config.icache.line_size * config.icache.associativity);

    println!("{}", "Simulator configuration".bold());
    println!("  tiles: {} (+ spawner rank {})", config.num_tiles, config.num_tiles);
    println!(
        "  shared pool: {} B, {} ways, {} B lines",
        config.cache.cache_size, config.cache.associativity, config.cache.line_size
    );
    println!(
        "  dcache: {} B, {}-way, {} sets, {} B lines, search depth {}",
        config.dcache.size,
        config.dcache.associativity,
        dcache_sets,
        config.dcache.line_size,
        config.dcache.max_search_depth
    );
    println!(
        "  icache: {} B, {}-way, {} sets, {} B lines, search depth {}",
        config.icache.size,
        config.icache.associativity,
        icache_sets,
        config.icache.line_size,
        config.icache.max_search_depth
    );
    println!(
        "  iocoom: {} outstanding loads, {} store buffer entries",
        config.iocoom.num_outstanding_loads, config.iocoom.num_store_buffer_entries
    );
    println!("  max sharers per line: {}", config.max_sharers());
    println!(
        "  models: perf={} dcache={} icache={} shared_memory={}",
        config.models.perf_model_enabled,
        config.models.dcache_modeling,
        config.models.icache_modeling,
        config.models.shared_memory_enabled
    );
    if config.organic.mutation_interval > 0 {
        println!("  organic repartitioning every {} accesses", config.organic.mutation_interval);
    } else {
        println!("  organic repartitioning disabled");
    }
}
