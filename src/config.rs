use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::Deserialize;

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "monohost.toml";

static PLUGIN_PATHS: OnceLock<PluginPaths> = OnceLock::new();

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub audio: AudioSection,
    pub plugin: PluginSection,
    pub meter: MeterSection,
    pub plugin_paths: PluginPaths,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    /// Substring of the output device name.
    pub output_device: Option<String>,
    /// Substring of the input device name, or `"none"`.
    pub input_device: Option<String>,
    pub sample_rate: u32,
    pub buffer_size: u32,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            output_device: None,
            input_device: None,
            sample_rate: 48000,
            buffer_size: 512,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PluginSection {
    pub path: Option<PathBuf>,
    /// File names tried, in order, when no path is given.
    pub candidates: Vec<String>,
    pub bypass: bool,
    /// Parameter values applied by name after each load.
    pub params: BTreeMap<String, f64>,
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            path: None,
            candidates: vec!["Stardust.clap".into(), "Stardust.vst3".into()],
            bypass: false,
            params: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MeterSection {
    pub refresh_hz: u32,
    /// Channel-0 samples buffered between meter redraws.
    pub waveform_capacity: usize,
}

impl Default for MeterSection {
    fn default() -> Self {
        Self {
            refresh_hz: 30,
            waveform_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginPaths {
    pub clap: Vec<PathBuf>,
    pub vst3: Vec<PathBuf>,
}

impl Config {
    /// Read `path`, or `monohost.toml` in the working directory if present.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {e}", path.display()))?;
        let config = Self::parse(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {e}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.audio.sample_rate == 0 {
            anyhow::bail!("audio.sample_rate must be positive");
        }
        if self.audio.buffer_size == 0 {
            anyhow::bail!("audio.buffer_size must be positive");
        }
        if self.meter.refresh_hz == 0 {
            anyhow::bail!("meter.refresh_hz must be positive");
        }
        if self.meter.waveform_capacity == 0 {
            anyhow::bail!("meter.waveform_capacity must be positive");
        }
        Ok(())
    }
}

/// Publish extra plugin search paths for enumeration. Only the first call wins.
pub fn init(paths: PluginPaths) {
    PLUGIN_PATHS.set(paths).ok();
}

pub fn extra_clap_paths() -> &'static [PathBuf] {
    PLUGIN_PATHS
        .get()
        .map(|p| p.clap.as_slice())
        .unwrap_or(&[])
}

#[cfg_attr(not(feature = "vst3"), allow(dead_code))]
pub fn extra_vst3_paths() -> &'static [PathBuf] {
    PLUGIN_PATHS
        .get()
        .map(|p| p.vst3.as_slice())
        .unwrap_or(&[])
}

/// Existing files for each candidate name, looked up next to the executable, in
/// its `Resources/` directory, then in `cwd`. Order is preserved.
pub fn candidate_paths(candidates: &[String], exe_dir: Option<&Path>, cwd: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::with_capacity(3);
    if let Some(exe_dir) = exe_dir {
        dirs.push(exe_dir.to_path_buf());
        dirs.push(exe_dir.join("Resources"));
    }
    dirs.push(cwd.to_path_buf());

    candidates
        .iter()
        .flat_map(|name| dirs.iter().map(move |dir| dir.join(name)))
        .filter(|path| path.exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.buffer_size, 512);
        assert!(config.audio.output_device.is_none());
        assert!(config.plugin.path.is_none());
        assert!(!config.plugin.bypass);
        assert_eq!(config.plugin.candidates.len(), 2);
        assert_eq!(config.meter.refresh_hz, 30);
        assert!(config.plugin_paths.clap.is_empty());
    }

    #[test]
    fn full_config_parses() {
        let config = Config::parse(
            r#"
            [audio]
            output_device = "USB"
            input_device = "none"
            sample_rate = 44100
            buffer_size = 256

            [plugin]
            path = "/opt/plugins/Delay.clap"
            candidates = ["Delay.clap"]
            bypass = true

            [plugin.params]
            "Mix" = 0.5
            "Feedback" = 0.25

            [meter]
            refresh_hz = 60
            waveform_capacity = 1024

            [plugin_paths]
            clap = ["/opt/clap"]
            vst3 = ["/opt/vst3"]
            "#,
        )
        .unwrap();

        assert_eq!(config.audio.output_device.as_deref(), Some("USB"));
        assert_eq!(config.audio.input_device.as_deref(), Some("none"));
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.audio.buffer_size, 256);
        assert_eq!(
            config.plugin.path.as_deref(),
            Some(Path::new("/opt/plugins/Delay.clap"))
        );
        assert_eq!(config.plugin.candidates, vec!["Delay.clap".to_string()]);
        assert!(config.plugin.bypass);
        assert_eq!(config.plugin.params.get("Mix"), Some(&0.5));
        assert_eq!(config.plugin.params.len(), 2);
        assert_eq!(config.meter.refresh_hz, 60);
        assert_eq!(config.meter.waveform_capacity, 1024);
        assert_eq!(config.plugin_paths.vst3, vec![PathBuf::from("/opt/vst3")]);
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let err = Config::parse("[audio]\nbuffer_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("buffer_size"));
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(Config::parse("[audio\nsample_rate = 1").is_err());
        assert!(Config::parse("[audio]\nsample_rate = \"fast\"").is_err());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "[audio]\nsample_rate = 96000\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.audio.sample_rate, 96000);
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let err = Config::load(Some(Path::new("/no/such/monohost.toml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }

    #[test]
    fn candidates_follow_search_order() {
        let exe = tempfile::tempdir().unwrap();
        let cwd = tempfile::tempdir().unwrap();
        std::fs::create_dir(exe.path().join("Resources")).unwrap();
        std::fs::write(exe.path().join("Resources/Stardust.clap"), b"").unwrap();
        std::fs::write(cwd.path().join("Stardust.clap"), b"").unwrap();
        std::fs::write(cwd.path().join("Other.clap"), b"").unwrap();

        let found = candidate_paths(
            &["Stardust.clap".into(), "Missing.clap".into(), "Other.clap".into()],
            Some(exe.path()),
            cwd.path(),
        );

        assert_eq!(
            found,
            vec![
                exe.path().join("Resources/Stardust.clap"),
                cwd.path().join("Stardust.clap"),
                cwd.path().join("Other.clap"),
            ]
        );
    }

    #[test]
    fn candidates_without_exe_dir_use_cwd() {
        let cwd = tempfile::tempdir().unwrap();
        std::fs::write(cwd.path().join("Stardust.clap"), b"").unwrap();

        let found = candidate_paths(&["Stardust.clap".into()], None, cwd.path());
        assert_eq!(found, vec![cwd.path().join("Stardust.clap")]);
    }
}
