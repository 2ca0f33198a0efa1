use anyhow::Result;
use clap::Parser;
use gate_config::GateConfig;

mod cli;
mod config_cmds;
mod coordinator_cmds;
mod limits_cmds;

use cli::{Cli, Commands};
use limits_cmds::ResetTarget;

fn main() -> Result<()> {
    // Initialize tracing (output to stderr, initialize only once)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let output_format = cli.format.clone();

    if let Commands::Config { init: true } = cli.command {
        return config_cmds::handle_config_init();
    }

    let config = GateConfig::load()?;
    match cli.command {
        Commands::Status => coordinator_cmds::handle_status(&config, output_format)?,
        Commands::Queues => coordinator_cmds::handle_queues(&config, output_format)?,
        Commands::Limits => limits_cmds::handle_limits(&config, output_format)?,
        Commands::Multiplier { value } => {
            limits_cmds::handle_multiplier(&config, value, output_format)?;
        }
        Commands::Reset {
            provider,
            model,
            limit,
        } => {
            let target = ResetTarget::from_args(provider, model, limit)?;
            limits_cmds::handle_reset(&config, target, output_format)?;
        }
        Commands::Config { .. } => config_cmds::handle_config_show(&config, output_format)?,
    }
    Ok(())
}
