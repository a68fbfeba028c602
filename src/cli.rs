// CLI definitions using clap

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "surface-hub")]
#[command(author, version, about = "Control surface hub")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Attach configured panels and serve until Ctrl-C
    #[command(visible_alias = "r")]
    Run {
        /// Log all driver traffic
        #[arg(long)]
        monitor: bool,

        /// Include image sizes in monitor output
        #[arg(long)]
        payload: bool,

        /// Monitor filter (all, events, draws)
        #[arg(long, default_value = "all")]
        filter: String,
    },

    /// Show stored surfaces and groups
    #[command(visible_aliases = ["ls", "l"])]
    List,

    /// Forget every stored surface and group
    Reset,

    /// Print the default config as TOML
    DefaultConfig,
}
