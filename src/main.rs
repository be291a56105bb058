mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod simulator;
mod state;
mod topology;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::StackConfig;
use declarative::DeployContext;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: StackConfig,
    /// Stack name, environment, region and account for this run
    pub deploy: DeployContext,
    pub state_dir: PathBuf,
}

impl Context {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let mut config = StackConfig::load(cli.config.as_deref())?;
        if let Some(environment) = &cli.environment {
            config.stack.environment.clone_from(environment);
            config.validate()?;
        }

        let state_dir = match &cli.state {
            Some(dir) => dir.clone(),
            None => config.state_dir()?,
        };

        Ok(Self {
            verbose: cli.verbose,
            quiet: cli.quiet,
            deploy: config.deploy_context(),
            config,
            state_dir,
        })
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "stackform", &mut io::stdout());
        return Ok(());
    }

    let ctx = Context::from_cli(&cli)?;

    match cli.command {
        Command::Synth(args) => commands::synth::run(&ctx, &args),
        Command::Deploy(args) => commands::deploy::run(&ctx, &args),
        Command::Destroy(args) => commands::destroy::run(&ctx, &args),
        Command::Diff(args) => commands::diff::run(&ctx, &args),
        Command::Outputs => commands::outputs::run(&ctx),
        Command::Secret { name } => commands::secret::run(&ctx, name.as_deref()),
        Command::Completions { .. } => Ok(()),
    }
}
