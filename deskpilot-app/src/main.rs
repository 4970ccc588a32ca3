use anyhow::Result;
use clap::Parser;
use deskpilot_app::bootstrap;
use deskpilot_app::commands::cli::{Cli, DeskpilotCommand};
use deskpilot_app::commands::{agent, history, run};
use deskpilot_app::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    bootstrap::init_tracing();
    let config = Config::load(&cli.config)?;

    match cli.command {
        DeskpilotCommand::Agent => agent::run(&config).await,
        DeskpilotCommand::Run {
            objective,
            executor,
            auto_approve,
            max_iterations,
        } => {
            run::run(
                &config,
                run::RunArgs {
                    objective,
                    executor,
                    auto_approve,
                    max_iterations,
                },
            )
            .await
        }
        DeskpilotCommand::Runs { limit } => history::runs(&config, limit).await,
        DeskpilotCommand::Show { run_id } => history::show(&config, &run_id).await,
        DeskpilotCommand::Events { limit } => history::events(&config, limit).await,
        DeskpilotCommand::Prune => history::prune(&config).await,
    }
}
