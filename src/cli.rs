use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "oilwatch")]
#[command(version)]
#[command(about = "Oil price alert bot with crash supervision and module diagnostics", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and per-environment overrides
    #[arg(long, global = true, default_value = "config", env = "OILWATCH_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the bot (the default command)
    Run {
        /// Run a single instance without crash supervision
        #[arg(long)]
        unsupervised: bool,
    },
    /// Load and validate the configuration, then exit
    CheckConfig,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command
            .clone()
            .unwrap_or(Commands::Run { unsupervised: false })
    }
}

/// Whether to run under the supervisor. `RUN_SUPERVISED=false` (or `0`) has the same
/// effect as `--unsupervised`.
pub fn run_supervised(unsupervised_flag: bool, env_value: Option<&str>) -> bool {
    if unsupervised_flag {
        return false;
    }
    match env_value.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => !matches!(v.as_str(), "false" | "0" | "no" | "off"),
        None => true,
    }
}
