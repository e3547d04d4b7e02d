use anyhow::Result;
use log::LevelFilter;

mod cli;
mod installer;
mod system;

use cli::{execute_command, Cli};

fn main() -> Result<()> {
    // Parse command line arguments before anything touches the filesystem
    let cli = Cli::parse_or_exit();

    env_logger::Builder::new()
        .filter_level(LevelFilter::Warn)
        .parse_default_env()
        .init();

    execute_command(&cli)
}
