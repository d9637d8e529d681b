use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run read-transaction throughput test
    TransactionThroughput {
        /// Number of pre-populated entities
        #[arg(short, long, default_value_t = 100_000)]
        entity_count: usize,

        /// Number of transactions to open
        #[arg(short, long, default_value_t = 50_000)]
        iterations: usize,
    },

    /// Run writer-priority-under-contention test
    WriterPriority {
        /// Number of concurrent reader threads
        #[arg(short, long, default_value_t = 16)]
        readers: usize,

        /// Number of writes the writer performs
        #[arg(short, long, default_value_t = 1_000)]
        writes: usize,
    },

    /// Run entity allocation/growth throughput test
    EntityGrowth {
        /// Entity counts to test (comma-separated)
        #[arg(long, default_value = "1000,10000,100000")]
        entity_counts: String,
    },

    /// Run all performance regression tests
    All,
}
