use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "creation")]
#[command(about = "Weave annotated module entry classes into an Android application's lifecycle")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Weaver configuration (JSON). Falls back to $CREATION_CONFIG, then the
    /// user config directory.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run one transform invocation.
    Run {
        /// Invocation description (JSON) listing inputs and their status.
        invocation: PathBuf,

        /// Root directory receiving transformed outputs.
        #[arg(short, long, value_name = "DIR")]
        output: PathBuf,

        /// Force the weaver on regardless of the configured `enable`.
        #[arg(long)]
        enable: bool,
    },
    /// Print the structure of a class file, as the weaver sees it.
    Inspect {
        class_file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_global_flags() {
        let cli = Cli::parse_from([
            "creation",
            "-vv",
            "run",
            "invocation.json",
            "--output",
            "out",
            "--enable",
            "--config",
            "weaver.json",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.config, Some(PathBuf::from("weaver.json")));
        match cli.command {
            Commands::Run {
                invocation,
                output,
                enable,
            } => {
                assert_eq!(invocation, PathBuf::from("invocation.json"));
                assert_eq!(output, PathBuf::from("out"));
                assert!(enable);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_inspect() {
        let cli = Cli::parse_from(["creation", "inspect", "A.class"]);
        assert!(matches!(cli.command, Commands::Inspect { .. }));
        assert_eq!(cli.verbose, 0);
    }
}
