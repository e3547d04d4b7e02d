use crate::system::{
    download, reinvoke, run_best_effort, run_checked, supervise, tool_command, PythonEnv,
};
use anyhow::{Context, Result};
use log::{debug, info};
use sdfx_setup::{
    copy_if_missing, prompt_gpu, GpuType, Layout, SdfxConfig, BRIDGE_REPO_URL, COMFYUI_REPO_URL,
    MIN_PYTHON_VERSION, PREVIEW_DECODER_URL,
};
use std::io;
use std::path::Path;

// Installer drives the install, update and run procedures
pub struct Installer {
    layout: Layout,
    python: PythonEnv,
}

impl Installer {
    pub fn new(layout: Layout, python: PythonEnv) -> Self {
        Self { layout, python }
    }

    // Clone the external checkouts, prepare config and install every dependency
    pub fn install(&self, gpu: Option<GpuType>) -> Result<()> {
        self.python
            .check_version(MIN_PYTHON_VERSION)
            .context("Python version check failed")?;

        self.clone_checkouts()?;
        self.copy_templates()?;

        let gpu = match gpu {
            Some(gpu) => gpu,
            None => prompt_gpu(&mut io::stdin().lock(), &mut io::stdout())?,
        };
        self.install_gpu_runtime(gpu)?;

        for manifest in self.layout.requirement_manifests() {
            self.python.pip_install(
                [Path::new("-r"), manifest.as_path()],
                &format!("pip install -r {}", manifest.display()),
            )?;
        }

        println!("downloading preview decoder...");
        let decoder = self.layout.preview_decoder();
        download(PREVIEW_DECODER_URL, &decoder)
            .with_context(|| format!("error downloading {}", decoder.display()))?;

        println!("installing frontend dependencies...");
        run_checked(
            tool_command("npm")?
                .arg("install")
                .current_dir(self.layout.frontend_dir()),
            "npm install",
        )?;

        println!("\nFinished! Run `sdfx-setup --run` to launch SDFX");
        Ok(())
    }

    fn clone_checkouts(&self) -> Result<()> {
        let checkouts = [
            (self.layout.comfyui_dir(), COMFYUI_REPO_URL),
            (self.layout.bridge_dir(), BRIDGE_REPO_URL),
        ];

        for (checkout, url) in checkouts {
            if checkout.exists() {
                debug!("{} already present, skipping clone", checkout.display());
                continue;
            }

            println!("cloning {url}...");
            run_checked(
                tool_command("git")?.arg("clone").arg(url).arg(&checkout),
                &format!("git clone {url}"),
            )?;
        }

        Ok(())
    }

    fn copy_templates(&self) -> Result<()> {
        let templates = [
            (self.layout.config_example(), self.layout.config_file()),
            (self.layout.env_example(), self.layout.env_file()),
        ];

        for (example, target) in templates {
            if copy_if_missing(&example, &target)? {
                println!("created {}", target.display());
            } else {
                debug!("{} exists, leaving it untouched", target.display());
            }
        }

        Ok(())
    }

    fn install_gpu_runtime(&self, gpu: GpuType) -> Result<()> {
        let args = gpu.pip_install_args();
        if !args.is_empty() {
            println!("installing PyTorch for {gpu}...");
            self.python
                .pip_install(args, &format!("PyTorch install for {gpu}"))?;
        }

        if let Some(flag) = gpu.config_flag() {
            let config = self.layout.config_file();
            SdfxConfig::set_arg_flag(&config, flag)
                .with_context(|| format!("failed to enable {flag} in {}", config.display()))?;
            info!("set args.{flag} in {}", config.display());
        }

        println!("installation completed for {gpu}");
        Ok(())
    }

    // Pull both checkouts, then reinstall through a fresh invocation
    pub fn update(&self, gpu: Option<GpuType>) -> Result<()> {
        for checkout in [self.layout.comfyui_dir(), self.layout.bridge_dir()] {
            println!("updating {}...", checkout.display());
            let pulled = run_best_effort(
                tool_command("git")?.arg("pull").current_dir(&checkout),
                &format!("git pull in {}", checkout.display()),
            );
            if !pulled {
                eprintln!(
                    "warning: could not update {}, continuing with the existing checkout",
                    checkout.display()
                );
            }
        }

        let mut args = vec!["--install"];
        if let Some(gpu) = gpu {
            args.push(gpu.flag());
        }
        reinvoke(&args).context("reinstall after update failed")
    }

    // Start backend and frontend together and wait for both
    pub fn run(&self) -> Result<()> {
        if let Ok(config) = SdfxConfig::from_file(self.layout.config_file()) {
            let args = config.gpu_args();
            info!("starting backend (directml: {}, cpu: {})", args.directml, args.cpu);
        }

        let mut backend = self
            .python
            .command()
            .arg("main.py")
            .current_dir(self.layout.comfyui_dir())
            .spawn()
            .context("failed to start ComfyUI backend")?;

        let frontend = match tool_command("npm").and_then(|mut npm| {
            npm.args(["run", "start"])
                .current_dir(self.layout.frontend_dir())
                .spawn()
                .context("failed to start frontend")
        }) {
            Ok(child) => child,
            Err(e) => {
                // Don't leave the backend running on its own
                let _ = backend.kill();
                let _ = backend.wait();
                return Err(e);
            }
        };

        supervise(vec![
            ("ComfyUI".to_string(), backend),
            ("frontend".to_string(), frontend),
        ])
    }
}
