pub mod clap;
#[cfg(feature = "vst3")]
pub mod vst3;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::host::AudioConfig;

/// Number of audio channels the host feeds to and reads back from a plugin.
pub const HOST_CHANNELS: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInfo {
    pub index: u32,
    pub name: String,
    pub min: f32,
    pub max: f32,
    pub default: f32,
}

/// A parameter value change delivered alongside an audio block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamChange {
    pub index: u32,
    pub value: f32,
}

/// Failure reported by a plugin for a single block.
///
/// `Copy` so the audio thread can report it without allocating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("plugin audio processor is not active")]
    Inactive,
    #[error("block of {frames} frames exceeds prepared maximum of {max}")]
    BlockTooLarge { frames: usize, max: usize },
    #[error("plugin rejected the block (status {0})")]
    Rejected(i32),
}

/// Everything a format needs to instantiate a plugin from a file.
///
/// Only lives for the duration of a load.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub format: &'static str,
    pub path: PathBuf,
    /// Format-specific class identifier (CLAP plugin ID, VST3 class ID in hex).
    pub id: String,
    pub name: String,
}

/// A running native plugin instance.
///
/// Created by [`PluginFormat::instantiate`], configured with `prepare`, and
/// released/dropped by the host. `process` is the only method called from the
/// audio thread.
pub trait Plugin: Send {
    fn name(&self) -> &str;
    fn format(&self) -> &'static str;
    fn parameters(&self) -> &[ParameterInfo];
    fn get_parameter(&mut self, index: u32) -> Option<f32>;
    /// Queue a value change; applied on the next processed block.
    fn set_parameter(&mut self, index: u32, value: f32) -> anyhow::Result<()>;

    /// Configure 2-in/2-out at `config` and allocate processing resources.
    /// Called again after `release` when the device configuration changes.
    fn prepare(&mut self, config: AudioConfig) -> anyhow::Result<()>;

    /// Transform `buffer` in place. Must not allocate or block.
    fn process(
        &mut self,
        buffer: &mut [&mut [f32]],
        events: &[ParamChange],
    ) -> Result<(), ProcessError>;

    /// Drop prepared resources but keep the instance.
    fn release(&mut self);
}

/// A native plugin format that can recognise and instantiate plugin files.
pub trait PluginFormat: Send + Sync {
    fn name(&self) -> &'static str;

    /// Inspect `path` and return a descriptor if this format can load it.
    /// Runs on the control thread and may perform file I/O.
    fn describe(&self, path: &Path) -> Option<PluginDescriptor>;

    fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        config: AudioConfig,
    ) -> anyhow::Result<Box<dyn Plugin>>;
}

/// The enclosing `*.{extension}` bundle directory of `path`, if there is one.
pub fn bundle_root<'a>(path: &'a Path, extension: &str) -> Option<&'a Path> {
    path.ancestors().skip(1).find(|dir| {
        dir.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
    })
}

/// Resolve a `.vst3`/`.clap` bundle directory to its platform shared library.
///
/// Anything that is not a bundle directory is returned unchanged.
pub fn bundle_binary_path(path: &Path) -> PathBuf {
    let Some(ext) = path
        .extension()
        .filter(|_| path.is_dir())
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
    else {
        return path.to_path_buf();
    };
    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let contents = path.join("Contents");

    match ext.as_str() {
        "vst3" if cfg!(target_os = "macos") => contents.join("MacOS").join(stem),
        "vst3" if cfg!(target_os = "windows") => {
            contents.join("x86_64-win").join(format!("{stem}.vst3"))
        }
        "vst3" => contents
            .join(format!("{}-linux", std::env::consts::ARCH))
            .join(format!("{stem}.so")),
        "clap" => contents.join("MacOS").join(stem),
        _ => path.to_path_buf(),
    }
}

/// Recursively collect bundle directories and files with `extension` under `dir`.
pub fn find_bundles(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let mut bundles = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
            {
                bundles.push(path);
            } else if path.is_dir() {
                stack.push(path);
            }
        }
    }
    bundles.sort();
    bundles
}

/// The native formats compiled into this build, in probe order.
pub fn native_formats() -> Vec<Box<dyn PluginFormat>> {
    let mut formats: Vec<Box<dyn PluginFormat>> = vec![Box::new(clap::ClapFormat)];
    #[cfg(feature = "vst3")]
    formats.push(Box::new(vst3::Vst3Format));
    formats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_root_finds_enclosing_bundle() {
        let binary = Path::new("/plugins/Reverb.vst3/Contents/x86_64-linux/Reverb.so");
        assert_eq!(
            bundle_root(binary, "vst3"),
            Some(Path::new("/plugins/Reverb.vst3"))
        );
        assert_eq!(bundle_root(binary, "clap"), None);
        assert_eq!(bundle_root(Path::new("/plugins/Reverb.vst3"), "vst3"), None);
    }

    #[test]
    fn bundle_binary_path_leaves_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Delay.clap");
        std::fs::write(&file, b"").unwrap();
        assert_eq!(bundle_binary_path(&file), file);
    }

    #[test]
    fn bundle_binary_path_resolves_vst3_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Reverb.vst3");
        std::fs::create_dir(&bundle).unwrap();

        let binary = bundle_binary_path(&bundle);
        assert!(binary.starts_with(bundle.join("Contents")));
        assert_eq!(bundle_root(&binary, "vst3"), Some(bundle.as_path()));
    }

    #[test]
    fn find_bundles_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vendor/Synth.vst3/Contents")).unwrap();
        std::fs::create_dir(dir.path().join("Reverb.vst3")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let found = find_bundles(dir.path(), "vst3");
        assert_eq!(
            found,
            vec![
                dir.path().join("Reverb.vst3"),
                dir.path().join("vendor/Synth.vst3"),
            ]
        );
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-process stand-ins for native formats, shared by the host and bridge tests.

    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counters observed by tests after the instance has been moved into the host.
    #[derive(Default)]
    pub struct Calls {
        pub prepared: AtomicUsize,
        pub released: AtomicUsize,
        pub processed: AtomicUsize,
        pub dropped: AtomicUsize,
    }

    impl Calls {
        pub fn prepared(&self) -> usize {
            self.prepared.load(Ordering::SeqCst)
        }
        pub fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
        pub fn processed(&self) -> usize {
            self.processed.load(Ordering::SeqCst)
        }
        pub fn dropped(&self) -> usize {
            self.dropped.load(Ordering::SeqCst)
        }
    }

    /// Multiplies every sample by `gain`.
    pub struct GainPlugin {
        pub gain: f32,
        pub calls: Arc<Calls>,
        pub params: Vec<ParameterInfo>,
        pub active: Option<AudioConfig>,
        pub fail_prepare: bool,
    }

    impl GainPlugin {
        pub fn new(gain: f32, calls: Arc<Calls>) -> Self {
            Self {
                gain,
                calls,
                params: vec![ParameterInfo {
                    index: 0,
                    name: "Gain".into(),
                    min: 0.0,
                    max: 2.0,
                    default: 1.0,
                }],
                active: None,
                fail_prepare: false,
            }
        }
    }

    impl Drop for GainPlugin {
        fn drop(&mut self) {
            self.calls.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Plugin for GainPlugin {
        fn name(&self) -> &str {
            "Gain"
        }
        fn format(&self) -> &'static str {
            "mock"
        }
        fn parameters(&self) -> &[ParameterInfo] {
            &self.params
        }
        fn get_parameter(&mut self, index: u32) -> Option<f32> {
            (index == 0).then_some(self.gain)
        }
        fn set_parameter(&mut self, index: u32, value: f32) -> anyhow::Result<()> {
            if index != 0 {
                anyhow::bail!("no parameter {index}");
            }
            self.gain = value;
            Ok(())
        }
        fn prepare(&mut self, config: AudioConfig) -> anyhow::Result<()> {
            if self.fail_prepare {
                anyhow::bail!("refusing {} Hz", config.sample_rate);
            }
            self.calls.prepared.fetch_add(1, Ordering::SeqCst);
            self.active = Some(config);
            Ok(())
        }
        fn process(
            &mut self,
            buffer: &mut [&mut [f32]],
            events: &[ParamChange],
        ) -> Result<(), ProcessError> {
            let Some(config) = self.active else {
                return Err(ProcessError::Inactive);
            };
            let frames = buffer.first().map(|c| c.len()).unwrap_or(0);
            if frames > config.block_size {
                return Err(ProcessError::BlockTooLarge {
                    frames,
                    max: config.block_size,
                });
            }
            for change in events {
                if change.index == 0 {
                    self.gain = change.value;
                }
            }
            self.calls.processed.fetch_add(1, Ordering::SeqCst);
            for channel in buffer.iter_mut() {
                for sample in channel.iter_mut() {
                    *sample *= self.gain;
                }
            }
            Ok(())
        }
        fn release(&mut self) {
            self.calls.released.fetch_add(1, Ordering::SeqCst);
            self.active = None;
        }
    }

    /// Claims files with a given extension and builds [`GainPlugin`]s.
    pub struct MockFormat {
        pub name: &'static str,
        pub extension: &'static str,
        pub gain: f32,
        pub calls: Arc<Calls>,
        pub fail_instantiate: Option<&'static str>,
        pub fail_prepare: bool,
    }

    impl MockFormat {
        pub fn new(name: &'static str, extension: &'static str, calls: Arc<Calls>) -> Self {
            Self {
                name,
                extension,
                gain: 0.5,
                calls,
                fail_instantiate: None,
                fail_prepare: false,
            }
        }
    }

    impl PluginFormat for MockFormat {
        fn name(&self) -> &'static str {
            self.name
        }

        fn describe(&self, path: &Path) -> Option<PluginDescriptor> {
            let matches = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension));
            matches.then(|| PluginDescriptor {
                format: self.name,
                path: path.to_path_buf(),
                id: format!("{}:{}", self.name, path.display()),
                name: "Gain".into(),
            })
        }

        fn instantiate(
            &self,
            _descriptor: &PluginDescriptor,
            _config: AudioConfig,
        ) -> anyhow::Result<Box<dyn Plugin>> {
            if let Some(message) = self.fail_instantiate {
                anyhow::bail!("{message}");
            }
            let mut plugin = GainPlugin::new(self.gain, self.calls.clone());
            plugin.fail_prepare = self.fail_prepare;
            Ok(Box::new(plugin))
        }
    }
}
