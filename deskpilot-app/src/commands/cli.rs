use clap::{Parser, Subcommand};
use deskpilot_core::ExecutorMode;
use std::path::PathBuf;

/// CLI definition for the deskpilot binary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "deskpilot")]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    #[command(subcommand)]
    pub command: DeskpilotCommand,
}

#[derive(Subcommand, Debug)]
pub enum DeskpilotCommand {
    /// Run the desktop agent (sensors plus bridge client)
    Agent,
    /// Start one autonomy run and follow it to completion
    Run {
        /// What the run should achieve, in plain language
        objective: String,
        /// Executor to use (simulator, bridge, browser, auto)
        #[arg(long)]
        executor: Option<ExecutorMode>,
        /// Execute irreversible steps without asking
        #[arg(long)]
        auto_approve: bool,
        /// Iteration budget for this run
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// List recent runs
    Runs {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one run as JSON
    Show { run_id: String },
    /// List recent desktop events
    Events {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },
    /// Apply the retention policy to stored runs and events
    Prune,
}
