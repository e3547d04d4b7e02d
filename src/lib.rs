use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

// Constants
pub const COMFYUI_REPO_URL: &str = "https://github.com/comfyanonymous/ComfyUI.git";
pub const BRIDGE_REPO_URL: &str = "https://github.com/sdfxai/SDFXBridgeForComfyUI";
pub const PREVIEW_DECODER_URL: &str =
    "https://github.com/madebyollin/taesd/raw/main/taesd_decoder.pth";
pub const MIN_PYTHON_VERSION: (u32, u32) = (3, 10);

const NVIDIA_EXTRA_INDEX: &str = "https://download.pytorch.org/whl/cu121";
const ROCM_INDEX: &str = "https://download.pytorch.org/whl/rocm5.6";

// Top-level procedure selected on the command line or at the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Update,
    Run,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Install, Action::Update, Action::Run];

    // Parse a menu answer ("1", "2" or "3")
    #[must_use]
    pub fn from_choice(choice: &str) -> Option<Self> {
        match choice.trim() {
            "1" => Some(Action::Install),
            "2" => Some(Action::Update),
            "3" => Some(Action::Run),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Action::Install => "Install",
            Action::Update => "Update",
            Action::Run => "Run",
        }
    }

    #[must_use]
    pub fn flag(self) -> &'static str {
        match self {
            Action::Install => "--install",
            Action::Update => "--update",
            Action::Run => "--run",
        }
    }
}

// Numerical runtime backend to install
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuType {
    Nvidia,
    Amd,
    DirectMl,
    Cpu,
    Mac,
}

impl GpuType {
    pub const ALL: [GpuType; 5] = [
        GpuType::Nvidia,
        GpuType::Amd,
        GpuType::DirectMl,
        GpuType::Cpu,
        GpuType::Mac,
    ];

    // Parse a menu answer ("1" through "5")
    #[must_use]
    pub fn from_choice(choice: &str) -> Option<Self> {
        match choice.trim() {
            "1" => Some(GpuType::Nvidia),
            "2" => Some(GpuType::Amd),
            "3" => Some(GpuType::DirectMl),
            "4" => Some(GpuType::Cpu),
            "5" => Some(GpuType::Mac),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            GpuType::Nvidia => "NVIDIA",
            GpuType::Amd => "AMD",
            GpuType::DirectMl => "DirectML (AMD on Windows)",
            GpuType::Cpu => "CPU",
            GpuType::Mac => "Apple Mac Silicon",
        }
    }

    #[must_use]
    pub fn flag(self) -> &'static str {
        match self {
            GpuType::Nvidia => "--nvidia",
            GpuType::Amd => "--amd",
            GpuType::DirectMl => "--directml",
            GpuType::Cpu => "--cpu",
            GpuType::Mac => "--mac",
        }
    }

    /// Arguments passed to `pip install` for this backend.
    ///
    /// Empty when the default torch wheel from the requirement manifests is
    /// sufficient.
    #[must_use]
    pub fn pip_install_args(self) -> Vec<&'static str> {
        match self {
            GpuType::Nvidia => vec![
                "torch",
                "torchvision",
                "torchaudio",
                "--extra-index-url",
                NVIDIA_EXTRA_INDEX,
            ],
            GpuType::Amd => vec![
                "torch",
                "torchvision",
                "torchaudio",
                "--index-url",
                ROCM_INDEX,
            ],
            GpuType::DirectMl => vec!["torch-directml"],
            GpuType::Cpu | GpuType::Mac => Vec::new(),
        }
    }

    // Boolean under `args` in the config file that this backend turns on
    #[must_use]
    pub fn config_flag(self) -> Option<&'static str> {
        match self {
            GpuType::DirectMl => Some("directml"),
            GpuType::Cpu => Some("cpu"),
            _ => None,
        }
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// Paths of every file and checkout, relative to the working root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn comfyui_dir(&self) -> PathBuf {
        self.root.join("ComfyUI")
    }

    #[must_use]
    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.comfyui_dir().join("custom_nodes")
    }

    #[must_use]
    pub fn bridge_dir(&self) -> PathBuf {
        self.custom_nodes_dir().join("SDFXBridgeForComfyUI")
    }

    #[must_use]
    pub fn config_example(&self) -> PathBuf {
        self.bridge_dir().join("sdfx.config.json.example")
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("sdfx.config.json")
    }

    #[must_use]
    pub fn frontend_dir(&self) -> PathBuf {
        self.root.join("src")
    }

    #[must_use]
    pub fn env_example(&self) -> PathBuf {
        self.frontend_dir().join(".env.example")
    }

    #[must_use]
    pub fn env_file(&self) -> PathBuf {
        self.frontend_dir().join(".env")
    }

    #[must_use]
    pub fn requirement_manifests(&self) -> [PathBuf; 2] {
        [
            self.comfyui_dir().join("requirements.txt"),
            self.bridge_dir().join("requirements.txt"),
        ]
    }

    #[must_use]
    pub fn preview_decoder(&self) -> PathBuf {
        self.root
            .join("data")
            .join("models")
            .join("vae_approx")
            .join("taesd_decoder.pth")
    }

    #[must_use]
    pub fn venv_dir(&self) -> PathBuf {
        self.root.join(".venv")
    }
}

/// Copy `src` to `dst` unless `dst` already exists.
///
/// Returns `true` when a copy was made.
///
/// # Errors
///
/// Returns an error if the copy fails, including when `src` is missing.
pub fn copy_if_missing<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Result<bool> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if dst.exists() {
        return Ok(false);
    }

    fs::copy(src, dst).with_context(|| {
        format!(
            "failed to copy {} to {}",
            src.to_string_lossy(),
            dst.to_string_lossy()
        )
    })?;
    Ok(true)
}

// GPU mode switches the bridge reads from `args`
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GpuArgs {
    #[serde(default)]
    pub directml: bool,
    #[serde(default)]
    pub cpu: bool,
}

// The bridge config file, kept as raw JSON apart from the `args` object
#[derive(Debug, Clone)]
pub struct SdfxConfig {
    document: Value,
}

impl SdfxConfig {
    /// Load the config from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or if it contains invalid JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config from {path_str}"))?;

        let document: Value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse JSON from {path_str}"))?;

        if !document.is_object() {
            bail!("config in {path_str} is not a JSON object");
        }

        Ok(Self { document })
    }

    /// Save the config to file with two-space indentation
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_str = path.as_ref().to_string_lossy();
        let content = serde_json::to_string_pretty(&self.document)
            .with_context(|| "failed to serialize config to JSON")?;

        fs::write(&path, content).with_context(|| format!("failed to write config to {path_str}"))
    }

    /// Set `args.<key>` to `true`, creating `args` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if `args` exists but is not an object.
    pub fn enable_arg(&mut self, key: &str) -> Result<()> {
        let Some(root) = self.document.as_object_mut() else {
            bail!("config is not a JSON object");
        };

        let args = root
            .entry("args")
            .or_insert_with(|| Value::Object(Map::new()));
        let Some(args) = args.as_object_mut() else {
            bail!("config field `args` is not a JSON object");
        };

        args.insert(key.to_string(), Value::Bool(true));
        Ok(())
    }

    // Typed view of the GPU switches; missing or malformed fields read as off
    #[must_use]
    pub fn gpu_args(&self) -> GpuArgs {
        self.document
            .get("args")
            .cloned()
            .and_then(|args| serde_json::from_value(args).ok())
            .unwrap_or_default()
    }

    /// Read-modify-write of a single `args` boolean on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded, edited or written back.
    pub fn set_arg_flag<P: AsRef<Path>>(path: P, key: &str) -> Result<()> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;
        config
            .enable_arg(key)
            .with_context(|| format!("failed to set `args.{key}`"))?;
        config.save(path)
    }
}

/// Show the action menu and read the answer.
///
/// # Errors
///
/// Returns an error on I/O failure, end of input or an unrecognized answer.
pub fn prompt_action<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<Action> {
    writeln!(output, "Please choose an option:")?;
    for (index, action) in Action::ALL.iter().enumerate() {
        writeln!(output, "{}. {}", index + 1, action.label())?;
    }
    write!(output, "Enter the option number (1, 2 or 3): ")?;
    output.flush()?;

    let answer = read_answer(input)?;
    match Action::from_choice(&answer) {
        Some(action) => Ok(action),
        None => bail!("invalid option '{answer}': use --install, --update or --run"),
    }
}

/// Show the GPU menu and read the answer.
///
/// # Errors
///
/// Returns an error on I/O failure, end of input or an unrecognized answer.
pub fn prompt_gpu<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> Result<GpuType> {
    writeln!(output, "Choose your GPU type:")?;
    for (index, gpu) in GpuType::ALL.iter().enumerate() {
        writeln!(output, "{}. {}", index + 1, gpu.label())?;
    }
    write!(output, "Enter the GPU type (1-5): ")?;
    output.flush()?;

    let answer = read_answer(input)?;
    match GpuType::from_choice(&answer) {
        Some(gpu) => Ok(gpu),
        None => bail!(
            "invalid GPU type '{answer}': enter 1 for NVIDIA, 2 for AMD, 3 for DirectML, 4 for CPU, 5 for Apple Mac Silicon"
        ),
    }
}

fn read_answer<R: BufRead>(input: &mut R) -> Result<String> {
    let mut line = String::new();
    let read = input
        .read_line(&mut line)
        .context("failed to read answer from standard input")?;
    if read == 0 {
        bail!("no answer given: standard input is closed");
    }
    Ok(line.trim().to_string())
}

/// Parse the output of `python --version` ("Python 3.10.12") into (major, minor).
#[must_use]
pub fn parse_python_version(output: &str) -> Option<(u32, u32)> {
    let version = output.split_whitespace().nth(1)?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}
