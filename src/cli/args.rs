//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: validate a hydra file and run its stack until interrupted
//! - `validate`: check a hydra file without starting anything
//! - `show`: print the validated stack as JSON

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, PartialEq)]
pub enum ExecutionMode {
    Run(RunConfig),
    Validate { file: Option<PathBuf> },
    Show { file: Option<PathBuf> },
}

#[derive(Debug, PartialEq)]
pub struct RunConfig {
    pub file: Option<PathBuf>,
    pub verbose: bool,
    pub follow_logs: bool,
}

#[derive(Debug, Parser)]
#[command(name = "hydra")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run and supervise stacks of scripts, Docker containers and Kubernetes pods")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a stack until interrupted
    Run {
        /// Path to the hydra file (searched in the current directory if omitted)
        file: Option<PathBuf>,
        /// Enable verbose output
        #[arg(short = 'v', long = "verbose")]
        verbose: bool,
        /// Print container log lines as they arrive
        #[arg(short = 'f', long = "follow-logs")]
        follow_logs: bool,
    },
    /// Validate a hydra file
    Validate {
        /// Path to the hydra file
        file: Option<PathBuf>,
    },
    /// Print the validated stack as JSON
    Show {
        /// Path to the hydra file
        file: Option<PathBuf>,
    },
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                file,
                verbose,
                follow_logs,
            }) => Ok(ExecutionMode::Run(RunConfig {
                file: file.clone(),
                verbose: *verbose,
                follow_logs: *follow_logs,
            })),
            Some(Commands::Validate { file }) => {
                Ok(ExecutionMode::Validate { file: file.clone() })
            }
            Some(Commands::Show { file }) => Ok(ExecutionMode::Show { file: file.clone() }),
            None => Err(
                "No command specified. Use 'hydra --help' to see available commands.".to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command() {
        let args = Args::try_parse_from(["hydra", "run", "stack.yaml", "-v", "--follow-logs"])
            .unwrap();
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Run(RunConfig {
                file: Some(PathBuf::from("stack.yaml")),
                verbose: true,
                follow_logs: true,
            })
        );
    }

    #[test]
    fn test_run_without_file() {
        let args = Args::try_parse_from(["hydra", "run"]).unwrap();
        match args.mode().unwrap() {
            ExecutionMode::Run(config) => {
                assert_eq!(config.file, None);
                assert!(!config.verbose);
                assert!(!config.follow_logs);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_validate_and_show() {
        let args = Args::try_parse_from(["hydra", "validate", "a.toml"]).unwrap();
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Validate {
                file: Some(PathBuf::from("a.toml"))
            }
        );

        let args = Args::try_parse_from(["hydra", "show", "a.yaml"]).unwrap();
        assert_eq!(
            args.mode().unwrap(),
            ExecutionMode::Show {
                file: Some(PathBuf::from("a.yaml"))
            }
        );
    }

    #[test]
    fn test_no_command_error() {
        let args = Args { command: None };
        assert!(args.mode().is_err());
    }

    #[test]
    fn test_unknown_subcommand() {
        assert!(Args::try_parse_from(["hydra", "deploy"]).is_err());
    }
}
