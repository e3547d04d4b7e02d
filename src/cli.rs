use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use std::env;
use std::io;
use std::process::exit;

use crate::installer::Installer;
use crate::system::{check_required_tools, PythonEnv, REQUIRED_TOOLS};
use sdfx_setup::{prompt_action, Action, GpuType, Layout};

const BANNER: &str = "\
███████╗██████╗ ███████╗██╗  ██╗
██╔════╝██╔══██╗██╔════╝╚██╗██╔╝
███████╗██║  ██║█████╗   ╚███╔╝
╚════██║██║  ██║██╔══╝   ██╔██╗
███████║██████╔╝██║     ██╔╝ ██╗
╚══════╝╚═════╝ ╚═╝     ╚═╝  ╚═╝";

// CLI arguments parsing structure
#[derive(Parser, Debug)]
#[command(author, version, about = "Install, update and run SDFX", long_about = None)]
#[command(group(ArgGroup::new("action").args(["install", "update", "run"])))]
#[command(group(ArgGroup::new("gpu").args(["nvidia", "amd", "directml", "cpu", "mac"])))]
pub struct Cli {
    /// Clone ComfyUI and the SDFX bridge, then install all dependencies
    #[arg(long)]
    pub install: bool,

    /// Pull the latest ComfyUI and SDFX bridge, then reinstall
    #[arg(long)]
    pub update: bool,

    /// Start the ComfyUI backend and the SDFX frontend
    #[arg(long)]
    pub run: bool,

    /// Install PyTorch for NVIDIA GPUs (CUDA)
    #[arg(long)]
    pub nvidia: bool,

    /// Install PyTorch for AMD GPUs (ROCm)
    #[arg(long)]
    pub amd: bool,

    /// Install torch-directml (AMD on Windows)
    #[arg(long)]
    pub directml: bool,

    /// Run on the CPU
    #[arg(long)]
    pub cpu: bool,

    /// Apple Mac Silicon
    #[arg(long)]
    pub mac: bool,
}

impl Cli {
    // Parse process arguments; anything unrecognized exits with status 1
    pub fn parse_or_exit() -> Self {
        match Self::try_parse() {
            Ok(cli) => cli,
            Err(e) => {
                let code = parse_error_exit_code(&e);
                let _ = e.print();
                exit(code);
            }
        }
    }

    pub fn action(&self) -> Option<Action> {
        [
            (self.install, Action::Install),
            (self.update, Action::Update),
            (self.run, Action::Run),
        ]
        .into_iter()
        .find_map(|(set, action)| set.then_some(action))
    }

    pub fn gpu(&self) -> Option<GpuType> {
        [
            (self.nvidia, GpuType::Nvidia),
            (self.amd, GpuType::Amd),
            (self.directml, GpuType::DirectMl),
            (self.cpu, GpuType::Cpu),
            (self.mac, GpuType::Mac),
        ]
        .into_iter()
        .find_map(|(set, gpu)| set.then_some(gpu))
    }
}

// Help and version are not errors; every other parse failure exits with 1
fn parse_error_exit_code(error: &clap::Error) -> i32 {
    match error.kind() {
        ErrorKind::DisplayHelp
        | ErrorKind::DisplayVersion
        | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
        _ => 1,
    }
}

// Execute the selected procedure
pub fn execute_command(cli: &Cli) -> Result<()> {
    check_required_tools(&REQUIRED_TOOLS)?;

    let root = env::current_dir().context("failed to determine the working directory")?;
    let layout = Layout::new(root);
    let python = PythonEnv::ensure(&layout).context("failed to prepare the virtual environment")?;

    println!("{BANNER}");

    let action = match cli.action() {
        Some(action) => action,
        None => prompt_action(&mut io::stdin().lock(), &mut io::stdout())?,
    };

    let installer = Installer::new(layout, python);
    match action {
        Action::Install => installer.install(cli.gpu()).context("install failed"),
        Action::Update => installer.update(cli.gpu()).context("update failed"),
        Action::Run => installer.run().context("run failed"),
    }
}
