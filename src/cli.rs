//! Command-line interface of `quarry-boss`

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::constants::DEFAULT_CONFIG_PATH;

/// Orchestration core of the Quarry installer
#[derive(Parser, Debug)]
#[command(name = "quarry-boss")]
#[command(about = "Message bus, module manager and dispatchers of the Quarry installer")]
#[command(version)]
pub struct Cli {
    /// Boss configuration file (JSON)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the installer message bus and activate the configured services
    Bus {
        /// Socket to listen on
        #[arg(short, long, default_value = "/run/quarry/bus.socket")]
        socket: PathBuf,
    },

    /// Start the modules and walk through the installation steps
    Run {
        /// Kickstart file to distribute to the modules
        #[arg(short, long)]
        kickstart: Option<PathBuf>,

        /// Write the regenerated kickstart here after the installation
        #[arg(short, long)]
        generate: Option<PathBuf>,

        /// Never ask questions; failed tasks abort the installation
        #[arg(long)]
        non_interactive: bool,
    },

    /// Split a kickstart file and print its elements
    Split {
        /// Kickstart file to split
        file: PathBuf,

        /// Report missing %include files instead of failing
        #[arg(long)]
        lenient_includes: bool,
    },

    /// Serve the Boss on the installer bus until it is told to quit
    Serve,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["quarry-boss"]).is_err());
    }

    #[test]
    fn test_cli_default_config() {
        let cli = Cli::try_parse_from(["quarry-boss", "serve"]).unwrap();
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert!(matches!(cli.command, Commands::Serve));
    }

    #[test]
    fn test_cli_run_with_kickstart() {
        let cli = Cli::try_parse_from([
            "quarry-boss",
            "run",
            "--kickstart",
            "/run/install/ks.cfg",
            "--generate",
            "/root/generated.cfg",
            "--non-interactive",
            "--config",
            "/etc/quarry/test.json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/quarry/test.json"));
        match cli.command {
            Commands::Run {
                kickstart,
                generate,
                non_interactive,
            } => {
                assert_eq!(kickstart, Some(PathBuf::from("/run/install/ks.cfg")));
                assert_eq!(generate, Some(PathBuf::from("/root/generated.cfg")));
                assert!(non_interactive);
            }
            other => panic!("Expected Run command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_split_file() {
        let cli = Cli::try_parse_from(["quarry-boss", "split", "ks.cfg", "--lenient-includes"]).unwrap();
        match cli.command {
            Commands::Split {
                file,
                lenient_includes,
            } => {
                assert_eq!(file, PathBuf::from("ks.cfg"));
                assert!(lenient_includes);
            }
            other => panic!("Expected Split command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_bus_socket() {
        let cli = Cli::try_parse_from(["quarry-boss", "bus"]).unwrap();
        match cli.command {
            Commands::Bus { socket } => {
                assert_eq!(socket, PathBuf::from("/run/quarry/bus.socket"));
            }
            other => panic!("Expected Bus command, got {:?}", other),
        }
    }
}
