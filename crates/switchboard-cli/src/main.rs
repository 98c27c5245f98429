//! Switchboard operator harness.
//!
//! Binary name: `swbd`
//!
//! Parses CLI arguments, installs tracing, loads configuration and
//! dispatches to the command handler.

mod cli;

use clap::Parser;
use clap_complete::generate;
use switchboard_infra::config::{default_config_path, load_config};
use switchboard_observe::tracing_setup::{LogOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands, ConfigAction};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need logging or config
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "swbd", &mut std::io::stdout());
        return Ok(());
    }

    let options = LogOptions {
        json: cli.log_json,
        otel: cli.otel,
        ..LogOptions::from_verbosity(cli.verbose, cli.quiet)
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path).await;

    let result = match cli.command {
        Commands::Simulate {
            agents,
            messages,
            broadcast,
            fail_every,
        } => {
            let plan = cli::simulate::SimulationPlan {
                agents,
                messages,
                broadcast,
                fail_every,
            };
            cli::simulate::run(&config, &plan, cli.json, cli.quiet).await
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => cli::config::show(&config, cli.json),
            ConfigAction::Path => cli::config::path(&config_path, cli.json),
        },
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
