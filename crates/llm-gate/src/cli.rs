use clap::{Parser, Subcommand};
use gate_core::OutputFormat;

#[derive(Parser)]
#[command(name = "llm-gate")]
#[command(about = "Inspect and reset llm-gate's shared concurrency state")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format (text or json)
    #[arg(long, default_value = "text", global = true)]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show live instances, this user's fair share and cluster usage
    Status,

    /// Show persisted learned limits
    Limits,

    /// Set the global multiplier applied to every learned limit
    Multiplier {
        /// Clamped to [0.1, 2.0]
        value: f64,
    },

    /// Reset learned limits (all of them unless a provider/model is given)
    Reset {
        #[arg(long, requires = "model")]
        provider: Option<String>,

        #[arg(long, requires = "provider")]
        model: Option<String>,

        /// Pin the learned limit to this value instead of dropping it
        #[arg(long, requires = "model")]
        limit: Option<u32>,
    },

    /// Show fresh queue snapshots broadcast by running instances
    Queues,

    /// Print the effective configuration
    Config {
        /// Write a commented template to the config path
        #[arg(long)]
        init: bool,
    },
}
