//! pea - partial escape analysis demo driver
//!
//! # Usage
//!
//! ```bash
//! # Run both phases on a sample graph and show the result
//! pea demo loop --dump
//!
//! # Only partial escape analysis, with debug logging
//! pea demo escape --no-read-elimination --verbose
//!
//! # Use a JSON config file
//! pea demo nested-loops --config pea.json
//!
//! # Print the default configuration
//! pea config
//! ```

mod scenarios;

use clap::{Parser, Subcommand, ValueEnum};
use pea_compiler::config::EscapeConfig;
use pea_compiler::graph::dump::dump_graph;
use pea_compiler::logging;
use pea_compiler::phases::PhaseManager;
use scenarios::Scenario;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "pea")]
#[command(version = "0.1.0")]
#[command(about = "Partial escape analysis over sample graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the escape analysis phases on a sample graph
    Demo {
        /// Sample graph to analyse
        #[arg(value_enum)]
        scenario: Scenario,

        /// Enable debug logging
        #[arg(short, long)]
        verbose: bool,

        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Analyse-and-commit rounds per phase
        #[arg(long)]
        iterations: Option<usize>,

        /// Skip read elimination
        #[arg(long)]
        no_read_elimination: bool,

        /// Print the graph before and after
        #[arg(long)]
        dump: bool,
    },

    /// List the sample graphs
    List,

    /// Print the effective configuration as JSON
    Config {
        /// JSON config file to start from
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Demo {
            scenario,
            verbose,
            config,
            iterations,
            no_read_elimination,
            dump,
        } => run_demo(scenario, verbose, config, iterations, no_read_elimination, dump),
        Commands::List => {
            list_scenarios();
            Ok(())
        }
        Commands::Config { config } => show_config(config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> Result<EscapeConfig, String> {
    let config = match path {
        Some(path) => EscapeConfig::load_from_file(&path).map_err(|e| e.to_string())?,
        None => EscapeConfig::default(),
    };
    Ok(config.with_env_overrides())
}

fn run_demo(
    scenario: Scenario,
    verbose: bool,
    config: Option<PathBuf>,
    iterations: Option<usize>,
    no_read_elimination: bool,
    dump: bool,
) -> Result<(), String> {
    logging::init_cli(verbose);

    let mut config = load_config(config)?;
    if let Some(iterations) = iterations {
        config.iterations = iterations;
    }
    if no_read_elimination {
        config.read_elimination = false;
    }

    let name = scenario
        .to_possible_value()
        .map(|v| v.get_name().to_string())
        .unwrap_or_default();
    println!("Scenario: {} ({})", name, scenario.description());

    let mut graph = scenario.build();
    let nodes_before = graph.alive_nodes().count();
    if dump {
        println!("\n{}", "=".repeat(60));
        println!("Before");
        println!("{}", "=".repeat(60));
        print!("{}", dump_graph(&graph));
    }

    let mut manager = PhaseManager::from_config(&config);
    println!("Phases: {}", manager.phase_names().join(", "));
    let result = manager.run(&mut graph).map_err(|e| format!("{} failed: {}", name, e))?;

    if dump {
        println!("\n{}", "=".repeat(60));
        println!("After");
        println!("{}", "=".repeat(60));
        print!("{}", dump_graph(&graph));
    }

    println!("\nResult:");
    println!("  modified:      {}", result.modified);
    println!("  rounds:        {}", result.rounds);
    println!("  nodes removed: {}", result.nodes_removed);
    println!("  nodes:         {} -> {}", nodes_before, graph.alive_nodes().count());
    let mut stats: Vec<_> = result.stats.iter().collect();
    stats.sort();
    for (key, value) in stats {
        println!("  {:<14} {}", format!("{}:", key), value);
    }
    Ok(())
}

fn list_scenarios() {
    println!("Scenarios:");
    for scenario in Scenario::value_variants() {
        if let Some(value) = scenario.to_possible_value() {
            println!("  {:<14} {}", value.get_name(), scenario.description());
        }
    }
}

fn show_config(path: Option<PathBuf>) -> Result<(), String> {
    let config = load_config(path)?;
    println!("{}", config.to_json_string());
    Ok(())
}
