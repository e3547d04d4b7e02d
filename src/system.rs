use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use sdfx_setup::{parse_python_version, Layout};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{exit, Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

// Constants
pub const REQUIRED_TOOLS: [&str; 3] = ["git", "node", "npm"];
const PYTHON_OVERRIDE_VAR: &str = "SDFX_PYTHON";
const VIRTUAL_ENV_VAR: &str = "VIRTUAL_ENV";
const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_READ_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_INTERVAL: Duration = Duration::from_millis(200);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[cfg(windows)]
const DEFAULT_PYTHON: &str = "python";
#[cfg(not(windows))]
const DEFAULT_PYTHON: &str = "python3";

/// Fail early when any of `tools` is not on `PATH`.
///
/// # Errors
///
/// Returns an error naming every missing tool.
pub fn check_required_tools(tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools
        .iter()
        .copied()
        .filter(|tool| which::which(tool).is_err())
        .collect();

    if !missing.is_empty() {
        bail!(
            "required tools not found on PATH: {} (install Git and Node.js before proceeding)",
            missing.join(", ")
        );
    }

    Ok(())
}

// Build a command for a tool found on PATH (resolves `npm.cmd` and friends on Windows)
pub fn tool_command(tool: &str) -> Result<Command> {
    let path = which::which(tool).with_context(|| format!("{tool} not found on PATH"))?;
    Ok(Command::new(path))
}

/// Run a command to completion, failing on a spawn error or non-zero exit.
///
/// # Errors
///
/// Returns an error describing `what` failed and how.
pub fn run_checked(command: &mut Command, what: &str) -> Result<()> {
    debug!("running {command:?}");
    let status = command
        .status()
        .with_context(|| format!("failed to start {what}"))?;

    if !status.success() {
        bail!("{what} failed ({})", describe_status(status));
    }

    Ok(())
}

// Run a command to completion, logging instead of failing
pub fn run_best_effort(command: &mut Command, what: &str) -> bool {
    debug!("running {command:?}");
    match command.status() {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("{what} failed ({})", describe_status(status));
            false
        }
        Err(e) => {
            warn!("failed to start {what}: {e}");
            false
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

// Python interpreter inside the project's virtual environment
#[derive(Debug, Clone)]
pub struct PythonEnv {
    interpreter: PathBuf,
}

impl PythonEnv {
    // Interpreter of the virtual environment rooted at `venv`
    pub fn from_venv(venv: &Path) -> Self {
        Self {
            interpreter: venv_scripts_dir(venv).join(if cfg!(windows) {
                "python.exe"
            } else {
                "python"
            }),
        }
    }

    /// Use the active virtual environment, or create one and re-run this
    /// program inside it.
    ///
    /// When no environment is active this never returns: the process exits
    /// with the status of the re-executed child.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment cannot be created or the program
    /// cannot be re-executed.
    pub fn ensure(layout: &Layout) -> Result<Self> {
        if let Some(venv) = env::var_os(VIRTUAL_ENV_VAR).filter(|v| !v.is_empty()) {
            debug!("using active virtual environment {venv:?}");
            return Ok(Self::from_venv(Path::new(&venv)));
        }

        let venv = layout.venv_dir();
        if !venv.exists() {
            println!("creating virtual environment in {}", venv.display());
            let python = env::var_os(PYTHON_OVERRIDE_VAR)
                .unwrap_or_else(|| OsString::from(DEFAULT_PYTHON));
            run_checked(
                Command::new(python).args(["-m", "venv"]).arg(&venv),
                "virtual environment creation",
            )?;
        }

        let code = reexec_in_venv(&venv)?;
        exit(code);
    }

    pub fn command(&self) -> Command {
        Command::new(&self.interpreter)
    }

    /// Check the interpreter is at least `min` (major, minor).
    ///
    /// # Errors
    ///
    /// Returns an error if the version cannot be determined or is too old.
    pub fn check_version(&self, min: (u32, u32)) -> Result<()> {
        let output = self
            .command()
            .arg("--version")
            .output()
            .with_context(|| format!("failed to run {}", self.interpreter.display()))?;

        // Python 2 printed its version to stderr
        let text = if output.stdout.is_empty() {
            String::from_utf8_lossy(&output.stderr).into_owned()
        } else {
            String::from_utf8_lossy(&output.stdout).into_owned()
        };

        let version = parse_python_version(&text)
            .ok_or_else(|| anyhow!("could not parse Python version from '{}'", text.trim()))?;
        info!("found Python {}.{}", version.0, version.1);

        if version < min {
            bail!(
                "Python {}.{} or later is required (found {}.{})",
                min.0,
                min.1,
                version.0,
                version.1
            );
        }

        Ok(())
    }

    /// `python -m pip install <args>`
    ///
    /// # Errors
    ///
    /// Returns an error if pip fails.
    pub fn pip_install<I, S>(&self, args: I, what: &str) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        run_checked(
            self.command().args(["-m", "pip", "install"]).args(args),
            what,
        )
    }
}

fn venv_scripts_dir(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts")
    } else {
        venv.join("bin")
    }
}

// Re-execute the current program with the virtual environment activated
fn reexec_in_venv(venv: &Path) -> Result<i32> {
    let program = env::current_exe().context("failed to locate the current executable")?;
    let venv = fs::canonicalize(venv).unwrap_or_else(|_| venv.to_path_buf());

    let mut paths = vec![venv_scripts_dir(&venv)];
    if let Some(path) = env::var_os("PATH") {
        paths.extend(env::split_paths(&path));
    }
    let path = env::join_paths(paths).context("failed to build PATH for virtual environment")?;

    info!("re-running inside virtual environment {}", venv.display());
    let status = Command::new(program)
        .args(env::args_os().skip(1))
        .env(VIRTUAL_ENV_VAR, &venv)
        .env("PATH", path)
        .status()
        .context("failed to re-run inside the virtual environment")?;

    Ok(status.code().unwrap_or(1))
}

/// Run this program again with `args`.
///
/// # Errors
///
/// Returns an error if the child cannot start or exits unsuccessfully.
pub fn reinvoke(args: &[&str]) -> Result<()> {
    let program = env::current_exe().context("failed to locate the current executable")?;
    run_checked(Command::new(program).args(args), "re-invocation")
}

/// Download `url` to `dest`, creating parent directories.
///
/// The body is streamed into a temporary file beside `dest` which is renamed
/// into place once complete, so an interrupted download leaves no partial file.
///
/// # Errors
///
/// Returns an error on any network or filesystem failure. No retry is made.
pub fn download(url: &str, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;

    let agent = ureq::AgentBuilder::new()
        .timeout_connect(DOWNLOAD_CONNECT_TIMEOUT)
        .timeout_read(DOWNLOAD_READ_TIMEOUT)
        .user_agent(concat!("sdfx-setup/", env!("CARGO_PKG_VERSION")))
        .build();

    debug!("downloading {url}");
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("request to {url} failed"))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temporary file in {}", parent.display()))?;
    let bytes = io::copy(&mut response.into_reader(), &mut temp)
        .with_context(|| format!("failed to read response body from {url}"))?;

    temp.persist(dest)
        .with_context(|| format!("failed to move download into {}", dest.display()))?;
    info!("downloaded {bytes} bytes to {}", dest.display());

    Ok(())
}

/// Wait on concurrently running children.
///
/// As soon as one exits on its own the rest are asked to stop, then killed
/// after a grace period. Children stopped this way do not count as failures.
///
/// # Errors
///
/// Returns an error naming every child that exited unsuccessfully on its own.
pub fn supervise(mut children: Vec<(String, Child)>) -> Result<()> {
    let mut failures = Vec::new();
    let mut stop_requested: Option<Instant> = None;

    while !children.is_empty() {
        let mut exited_on_own = false;
        let mut index = 0;
        while index < children.len() {
            let status = {
                let (name, child) = &mut children[index];
                child
                    .try_wait()
                    .with_context(|| format!("failed to poll {name}"))?
            };

            let Some(status) = status else {
                index += 1;
                continue;
            };

            let (name, _) = children.remove(index);
            if stop_requested.is_none() {
                println!("{name} exited ({})", describe_status(status));
                if !status.success() {
                    failures.push(format!("{name} ({})", describe_status(status)));
                }
                exited_on_own = true;
            } else {
                debug!("{name} stopped ({})", describe_status(status));
            }
        }

        if children.is_empty() {
            break;
        }

        match stop_requested {
            None if exited_on_own => {
                for (name, child) in &mut children {
                    println!("stopping {name}");
                    request_stop(child);
                }
                stop_requested = Some(Instant::now());
            }
            Some(since) if since.elapsed() >= STOP_GRACE_PERIOD => {
                for (name, mut child) in children.drain(..) {
                    warn!("{name} did not stop in time, killing it");
                    if let Err(e) = child.kill() {
                        warn!("failed to kill {name}: {e}");
                    }
                    if let Err(e) = child.wait() {
                        warn!("failed to reap {name}: {e}");
                    }
                }
                break;
            }
            _ => {}
        }

        thread::sleep(POLL_INTERVAL);
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("process failed: {}", failures.join(", ")))
    }
}

// Ask a child to terminate gracefully
#[cfg(unix)]
fn request_stop(child: &mut Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        warn!(
            "failed to signal process {pid}: {}",
            io::Error::last_os_error()
        );
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("failed to stop process {}: {e}", child.id());
    }
}
