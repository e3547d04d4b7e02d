#[cfg(test)]
mod tests {
    use anyhow::Result;
    use sdfx_setup::{
        copy_if_missing, parse_python_version, prompt_action, prompt_gpu, Action, GpuArgs,
        GpuType, Layout, SdfxConfig,
    };
    use serde_json::{json, Value};
    use std::fs;
    use std::io::{Cursor, Write};
    use std::path::Path;
    use tempfile::{tempdir, NamedTempFile};

    // Helper to write a config file resembling the bridge's example
    fn create_test_config() -> Result<NamedTempFile> {
        let mut temp_file = NamedTempFile::new()?;
        let json_content = r#"{
  "name": "sdfx",
  "args": {
    "listen": "127.0.0.1",
    "port": 8188
  },
  "paths": {
    "models": "data/models"
  }
}"#;
        write!(temp_file, "{json_content}")?;
        Ok(temp_file)
    }

    fn read_json(path: &Path) -> Result<Value> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }

    // Test menu answers map to actions
    #[test]
    fn test_action_from_choice() {
        assert_eq!(Action::from_choice("1"), Some(Action::Install));
        assert_eq!(Action::from_choice("2"), Some(Action::Update));
        assert_eq!(Action::from_choice(" 3\n"), Some(Action::Run));
        assert_eq!(Action::from_choice("4"), None);
        assert_eq!(Action::from_choice(""), None);
        assert_eq!(Action::from_choice("install"), None);
    }

    // Test menu answers map to GPU selectors
    #[test]
    fn test_gpu_from_choice() {
        for (index, gpu) in GpuType::ALL.iter().enumerate() {
            assert_eq!(GpuType::from_choice(&(index + 1).to_string()), Some(*gpu));
        }
        assert_eq!(GpuType::from_choice("0"), None);
        assert_eq!(GpuType::from_choice("6"), None);
        assert_eq!(GpuType::from_choice("nvidia"), None);
    }

    // Test the runtime packages chosen for each GPU
    #[test]
    fn test_gpu_pip_install_args() {
        let nvidia = GpuType::Nvidia.pip_install_args();
        assert_eq!(&nvidia[..3], &["torch", "torchvision", "torchaudio"]);
        assert!(nvidia.contains(&"--extra-index-url"));
        assert!(nvidia.contains(&"https://download.pytorch.org/whl/cu121"));

        let amd = GpuType::Amd.pip_install_args();
        assert!(amd.contains(&"--index-url"));
        assert!(amd.contains(&"https://download.pytorch.org/whl/rocm5.6"));

        assert_eq!(GpuType::DirectMl.pip_install_args(), vec!["torch-directml"]);
        assert!(GpuType::Cpu.pip_install_args().is_empty());
        assert!(GpuType::Mac.pip_install_args().is_empty());
    }

    #[test]
    fn test_gpu_config_flags() {
        assert_eq!(GpuType::DirectMl.config_flag(), Some("directml"));
        assert_eq!(GpuType::Cpu.config_flag(), Some("cpu"));
        assert_eq!(GpuType::Nvidia.config_flag(), None);
        assert_eq!(GpuType::Amd.config_flag(), None);
        assert_eq!(GpuType::Mac.config_flag(), None);
    }

    // Setting a flag twice leaves it true and the file valid JSON
    #[test]
    fn test_set_arg_flag_is_idempotent() -> Result<()> {
        for gpu in [GpuType::Cpu, GpuType::DirectMl] {
            let temp_file = create_test_config()?;
            let flag = gpu.config_flag().expect("gpu sets a flag");

            SdfxConfig::set_arg_flag(temp_file.path(), flag)?;
            let first = read_json(temp_file.path())?;
            assert_eq!(first["args"][flag], json!(true));

            SdfxConfig::set_arg_flag(temp_file.path(), flag)?;
            let second = read_json(temp_file.path())?;
            assert_eq!(second["args"][flag], json!(true));
            assert_eq!(first, second);
        }
        Ok(())
    }

    // Other fields survive the edit, in their original order
    #[test]
    fn test_set_arg_flag_preserves_other_fields() -> Result<()> {
        let temp_file = create_test_config()?;
        SdfxConfig::set_arg_flag(temp_file.path(), "cpu")?;

        let content = fs::read_to_string(temp_file.path())?;
        let value: Value = serde_json::from_str(&content)?;
        assert_eq!(value["name"], json!("sdfx"));
        assert_eq!(value["args"]["listen"], json!("127.0.0.1"));
        assert_eq!(value["args"]["port"], json!(8188));
        assert_eq!(value["paths"]["models"], json!("data/models"));

        let name_pos = content.find("\"name\"").expect("name key");
        let args_pos = content.find("\"args\"").expect("args key");
        let paths_pos = content.find("\"paths\"").expect("paths key");
        assert!(name_pos < args_pos && args_pos < paths_pos);

        // Two-space indentation
        assert!(content.contains("\n  \"args\": {\n    \"listen\""));
        Ok(())
    }

    #[test]
    fn test_set_arg_flag_creates_missing_args() -> Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        write!(temp_file, r#"{{"name": "sdfx"}}"#)?;

        SdfxConfig::set_arg_flag(temp_file.path(), "directml")?;
        let value = read_json(temp_file.path())?;
        assert_eq!(value["args"], json!({"directml": true}));
        Ok(())
    }

    // Test malformed configs are rejected and left untouched
    #[test]
    fn test_set_arg_flag_rejects_invalid_config() -> Result<()> {
        for content in ["not valid json", "[1, 2, 3]", r#"{"args": "cpu"}"#] {
            let mut temp_file = NamedTempFile::new()?;
            write!(temp_file, "{content}")?;

            assert!(SdfxConfig::set_arg_flag(temp_file.path(), "cpu").is_err());
            assert_eq!(fs::read_to_string(temp_file.path())?, content);
        }

        let missing = tempdir()?.path().join("sdfx.config.json");
        assert!(SdfxConfig::set_arg_flag(&missing, "cpu").is_err());
        Ok(())
    }

    #[test]
    fn test_gpu_args_view() -> Result<()> {
        let temp_file = create_test_config()?;
        let config = SdfxConfig::from_file(temp_file.path())?;
        assert_eq!(config.gpu_args(), GpuArgs::default());

        let mut config = config;
        config.enable_arg("cpu")?;
        assert_eq!(
            config.gpu_args(),
            GpuArgs {
                directml: false,
                cpu: true
            }
        );
        Ok(())
    }

    // Copy steps never overwrite an existing target
    #[test]
    fn test_copy_if_missing_skips_existing() -> Result<()> {
        let dir = tempdir()?;
        let example = dir.path().join(".env.example");
        let target = dir.path().join(".env");
        fs::write(&example, "API_URL=http://localhost:8188\n")?;

        assert!(copy_if_missing(&example, &target)?);
        assert_eq!(
            fs::read_to_string(&target)?,
            "API_URL=http://localhost:8188\n"
        );

        // Local edits survive a second run
        fs::write(&target, "API_URL=http://gpu-box:8188\n")?;
        assert!(!copy_if_missing(&example, &target)?);
        assert_eq!(fs::read_to_string(&target)?, "API_URL=http://gpu-box:8188\n");
        Ok(())
    }

    #[test]
    fn test_copy_if_missing_requires_source() -> Result<()> {
        let dir = tempdir()?;
        let err = copy_if_missing(dir.path().join("absent"), dir.path().join("target"))
            .expect_err("missing source must fail");
        assert!(err.to_string().contains("failed to copy"));
        assert!(!dir.path().join("target").exists());
        Ok(())
    }

    #[test]
    fn test_layout_paths() {
        let layout = Layout::new("/opt/sdfx");
        assert_eq!(layout.root(), Path::new("/opt/sdfx"));
        assert_eq!(layout.comfyui_dir(), Path::new("/opt/sdfx/ComfyUI"));
        assert_eq!(
            layout.bridge_dir(),
            Path::new("/opt/sdfx/ComfyUI/custom_nodes/SDFXBridgeForComfyUI")
        );
        assert_eq!(
            layout.config_example(),
            Path::new("/opt/sdfx/ComfyUI/custom_nodes/SDFXBridgeForComfyUI/sdfx.config.json.example")
        );
        assert_eq!(layout.config_file(), Path::new("/opt/sdfx/sdfx.config.json"));
        assert_eq!(layout.env_file(), Path::new("/opt/sdfx/src/.env"));
        assert_eq!(
            layout.preview_decoder(),
            Path::new("/opt/sdfx/data/models/vae_approx/taesd_decoder.pth")
        );
        assert_eq!(
            layout.requirement_manifests()[1],
            Path::new("/opt/sdfx/ComfyUI/custom_nodes/SDFXBridgeForComfyUI/requirements.txt")
        );
    }

    // Test interactive prompts
    #[test]
    fn test_prompt_action() -> Result<()> {
        let mut output = Vec::new();
        let action = prompt_action(&mut Cursor::new("2\n"), &mut output)?;
        assert_eq!(action, Action::Update);

        let shown = String::from_utf8(output)?;
        assert!(shown.contains("1. Install"));
        assert!(shown.contains("3. Run"));

        let err = prompt_action(&mut Cursor::new("9\n"), &mut Vec::new())
            .expect_err("invalid answer");
        assert!(err.to_string().contains("invalid option"));
        Ok(())
    }

    #[test]
    fn test_prompt_gpu() -> Result<()> {
        let mut output = Vec::new();
        assert_eq!(
            prompt_gpu(&mut Cursor::new("3\r\n"), &mut output)?,
            GpuType::DirectMl
        );
        assert!(String::from_utf8(output)?.contains("5. Apple Mac Silicon"));

        assert!(prompt_gpu(&mut Cursor::new("7\n"), &mut Vec::new()).is_err());

        let err = prompt_gpu(&mut Cursor::new(""), &mut Vec::new()).expect_err("closed stdin");
        assert!(err.to_string().contains("standard input is closed"));
        Ok(())
    }

    // Versions compare numerically, not as strings
    #[test]
    fn test_parse_python_version() {
        assert_eq!(parse_python_version("Python 3.10.12\n"), Some((3, 10)));
        assert_eq!(parse_python_version("Python 3.9.18"), Some((3, 9)));
        assert_eq!(parse_python_version("Python 3.13.0rc1"), Some((3, 13)));
        assert_eq!(parse_python_version("Python 3.12"), Some((3, 12)));
        assert_eq!(parse_python_version("garbage"), None);
        assert_eq!(parse_python_version(""), None);

        assert!(parse_python_version("Python 3.9.18").unwrap() < (3, 10));
        assert!(parse_python_version("Python 3.11.4").unwrap() >= (3, 10));
    }
}
