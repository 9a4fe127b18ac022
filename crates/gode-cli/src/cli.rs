//! CLI command definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Gode - embedded scripting host with native plugins
#[derive(Parser)]
#[command(name = "gode")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (defaults to gode.toml/.yaml/.json in the current directory)
    #[arg(short = 'c', long, global = true, env = "GODE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run a script and drain the operation queue until idle
    Run {
        /// Entry script
        entry: PathBuf,

        /// Stop draining after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show how a specifier resolves
    Resolve {
        /// Module specifier, as written in an import
        specifier: String,

        /// Importing file (defaults to the base directory)
        #[arg(short, long, default_value = "")]
        referrer: String,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load native plugin libraries, print their metadata, then dispose them
    Plugins {
        /// Plugin libraries
        #[arg(required = true)]
        libraries: Vec<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_parses_timeout_and_global_flags() {
        let cli = Cli::try_parse_from(["gode", "run", "main.rhai", "--timeout-ms", "250", "-v"]).unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Run { entry, timeout_ms } => {
                assert_eq!(entry, PathBuf::from("main.rhai"));
                assert_eq!(timeout_ms, Some(250));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_resolve_defaults_referrer() {
        let cli = Cli::try_parse_from(["gode", "-c", "gode.toml", "resolve", "@utils/x"]).unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("gode.toml")));
        match cli.command {
            Commands::Resolve { specifier, referrer, json } => {
                assert_eq!(specifier, "@utils/x");
                assert_eq!(referrer, "");
                assert!(!json);
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn test_plugins_needs_a_library() {
        assert!(Cli::try_parse_from(["gode", "plugins"]).is_err());
    }
}
