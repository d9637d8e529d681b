//! Performance benchmarks for the ECS storage engine.
//!
//! CLI tool for running performance regression tests:
//! - Read-transaction throughput under no contention.
//! - Writer-priority commit latency under continuous reader contention.
//! - Entity allocation/growth throughput across batch-growth boundaries.

mod benchmarks;
mod cli;
mod utils;

use clap::Parser;
use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::TransactionThroughput {
            entity_count,
            iterations,
        } => {
            if entity_count == 0 {
                eprintln!("Error: entity_count must be greater than 0");
                std::process::exit(1);
            }
            if iterations == 0 {
                eprintln!("Error: iterations must be greater than 0");
                std::process::exit(1);
            }
            benchmarks::transaction_throughput::run_transaction_throughput_test(entity_count, iterations);
        }
        Commands::WriterPriority { readers, writes } => {
            if writes == 0 {
                eprintln!("Error: writes must be greater than 0");
                std::process::exit(1);
            }
            benchmarks::writer_priority::run_writer_priority_test(readers, writes);
        }
        Commands::EntityGrowth { entity_counts } => {
            let counts = utils::parse_comma_separated(&entity_counts);
            if counts.is_empty() {
                eprintln!("Error: entity_counts must list at least one value");
                std::process::exit(1);
            }
            benchmarks::entity_growth::run_entity_growth_test(&counts);
        }
        Commands::All => {
            utils::run_all_benchmarks();
        }
    }
}
