use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "discord-mirror-bridge",
    version,
    about = "Mirrors Discord channels into backup channels"
)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long, default_value_t = false)]
    pub check_config: bool,

    /// Run one mapping retention sweep and exit.
    #[arg(long, default_value_t = false)]
    pub cleanup_only: bool,
}
