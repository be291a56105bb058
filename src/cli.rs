use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "stackform")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Declare, plan and provision the private API stack", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: ~/.config/stackform/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Deployment environment, passed to the service
    #[arg(short, long, global = true, env = "STACKFORM_ENVIRONMENT")]
    pub environment: Option<String>,

    /// Directory for deploy state and the simulated backend
    #[arg(long, global = true, value_name = "DIR")]
    pub state: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the stack and print its deployment stages
    Synth(SynthArgs),

    /// Provision the stack
    Deploy(DeployArgs),

    /// Tear the stack down in reverse stage order
    Destroy(DestroyArgs),

    /// Preview what deploy would change
    Diff(DiffArgs),

    /// Show outputs of the last successful deploy
    Outputs,

    /// Fetch and check the database connection secret
    Secret {
        /// Secret name (default: the stack's connection secret)
        name: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct PasswordArgs {
    /// Database admin password
    #[arg(long, env = "STACKFORM_DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,
}

#[derive(Args)]
pub struct SynthArgs {
    /// Only show resources matching type or type.name (e.g. subnet, security_group.rds)
    #[arg(short, long)]
    pub target: Option<String>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct DeployArgs {
    #[command(flatten)]
    pub password: PasswordArgs,

    /// Concurrent backend calls per stage (overrides engine.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Show every changed resource, not just failures
    #[arg(long)]
    pub details: bool,
}

#[derive(Args)]
pub struct DestroyArgs {
    /// Skip confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Concurrent backend calls per stage (overrides engine.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,
}

#[derive(Args)]
pub struct DiffArgs {
    #[command(flatten)]
    pub password: PasswordArgs,

    /// Only show resources matching type or type.name
    #[arg(short, long)]
    pub target: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy() {
        let cli = Cli::try_parse_from([
            "stackform",
            "deploy",
            "--db-password",
            "hunter2",
            "--jobs",
            "8",
            "-e",
            "Staging",
        ])
        .unwrap();
        assert_eq!(cli.environment.as_deref(), Some("Staging"));
        match cli.command {
            Command::Deploy(args) => {
                assert_eq!(args.password.db_password.as_deref(), Some("hunter2"));
                assert_eq!(args.jobs, Some(8));
            }
            _ => panic!("expected deploy"),
        }
    }

    #[test]
    fn test_parse_synth_target() {
        let cli = Cli::try_parse_from(["stackform", "synth", "--target", "subnet"]).unwrap();
        match cli.command {
            Command::Synth(args) => assert_eq!(args.target.as_deref(), Some("subnet")),
            _ => panic!("expected synth"),
        }
    }
}
