use std::path::{Path, PathBuf};

use cpal::traits::{DeviceTrait, HostTrait};

use crate::config;
use crate::plugin::{self, PluginDescriptor};
use crate::probe::FormatProbe;

pub fn audio() -> anyhow::Result<()> {
    // Suppress ALSA/JACK noise on stderr during device enumeration
    let stderr_guard = suppress_stderr();

    let host = cpal::default_host();
    let default_output = host.default_output_device().and_then(|d| d.name().ok());
    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let outputs: Vec<_> = host
        .output_devices()?
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_output_config().ok()?;
            Some((name, config))
        })
        .collect();
    let inputs: Vec<_> = host
        .input_devices()?
        .filter_map(|device| {
            let name = device.name().ok()?;
            let config = device.default_input_config().ok()?;
            Some((name, config))
        })
        .collect();

    drop(stderr_guard);

    println!("=== Audio Input Devices ===");
    print_devices(&inputs, default_input.as_deref());
    println!();
    println!("=== Audio Output Devices ===");
    print_devices(&outputs, default_output.as_deref());
    Ok(())
}

fn print_devices(devices: &[(String, cpal::SupportedStreamConfig)], default_name: Option<&str>) {
    if devices.is_empty() {
        println!("  (none found)");
        return;
    }
    for (name, config) in devices {
        let marker = if default_name == Some(name.as_str()) {
            " *"
        } else {
            ""
        };
        println!(
            "  {name}{marker}  ({ch}ch, {rate}Hz, {fmt})",
            ch = config.channels(),
            rate = config.sample_rate().0,
            fmt = format_sample_fmt(config.sample_format()),
        );
    }
}

fn format_sample_fmt(fmt: cpal::SampleFormat) -> &'static str {
    match fmt {
        cpal::SampleFormat::I8 => "i8",
        cpal::SampleFormat::I16 => "i16",
        cpal::SampleFormat::I32 => "i32",
        cpal::SampleFormat::I64 => "i64",
        cpal::SampleFormat::U8 => "u8",
        cpal::SampleFormat::U16 => "u16",
        cpal::SampleFormat::U32 => "u32",
        cpal::SampleFormat::U64 => "u64",
        cpal::SampleFormat::F32 => "f32",
        cpal::SampleFormat::F64 => "f64",
        _ => "?",
    }
}

/// Temporarily redirect stderr to /dev/null to suppress ALSA/JACK library spam.
/// Returns a guard that restores stderr on drop. No-op on non-Unix platforms.
#[cfg(unix)]
fn suppress_stderr() -> Option<StderrGuard> {
    use std::os::unix::io::AsRawFd;
    let devnull = std::fs::File::open("/dev/null").ok()?;
    let stderr_fd = std::io::stderr().as_raw_fd();
    let saved = unsafe { libc::dup(stderr_fd) };
    if saved < 0 {
        return None;
    }
    unsafe { libc::dup2(devnull.as_raw_fd(), stderr_fd) };
    Some(StderrGuard { saved_fd: saved })
}

#[cfg(unix)]
struct StderrGuard {
    saved_fd: i32,
}

#[cfg(unix)]
impl Drop for StderrGuard {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let stderr_fd = std::io::stderr().as_raw_fd();
        unsafe {
            libc::dup2(self.saved_fd, stderr_fd);
            libc::close(self.saved_fd);
        }
    }
}

#[cfg(not(unix))]
fn suppress_stderr() -> Option<()> {
    None
}

pub fn plugins() -> anyhow::Result<()> {
    let probe = FormatProbe::native();

    println!("=== CLAP Plugins ===");
    let claps = plugin::clap::bundle_paths(config::extra_clap_paths());
    print_plugins(&resolve_all(&probe, &claps));

    println!();
    println!("=== VST3 Plugins ===");
    #[cfg(feature = "vst3")]
    {
        let vst3s = plugin::vst3::bundle_paths(config::extra_vst3_paths());
        print_plugins(&resolve_all(&probe, &vst3s));
    }
    #[cfg(not(feature = "vst3"))]
    println!("  (VST3 support not enabled)");

    Ok(())
}

/// Resolve each bundle through the probe, skipping anything no format claims.
fn resolve_all(probe: &FormatProbe, bundles: &[PathBuf]) -> Vec<PluginDescriptor> {
    let mut seen: Vec<PathBuf> = Vec::new();
    bundles
        .iter()
        .filter_map(|bundle| {
            let binary = plugin::bundle_binary_path(bundle);
            if seen.contains(&binary) {
                return None;
            }
            seen.push(binary.clone());
            match probe.resolve(&binary) {
                Ok(descriptor) => Some(descriptor),
                Err(e) => {
                    log::debug!("Skipping {}: {e}", bundle.display());
                    None
                }
            }
        })
        .collect()
}

fn print_plugins(descriptors: &[PluginDescriptor]) {
    if descriptors.is_empty() {
        println!("  (none found)");
    }
    for d in descriptors {
        println!("  [{}] {}", d.format, d.name);
        println!("          ID:      {}", d.id);
        println!("          Path:    {}", display_path(&d.path));
    }
}

/// Show the bundle directory rather than the binary inside it.
fn display_path(path: &Path) -> String {
    plugin::bundle_root(path, "vst3")
        .or_else(|| plugin::bundle_root(path, "clap"))
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::plugin::mock::{Calls, MockFormat};

    #[test]
    fn resolve_all_skips_unclaimed_and_duplicate_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("A.mock");
        let b = dir.path().join("B.other");
        std::fs::write(&a, b"").unwrap();
        std::fs::write(&b, b"").unwrap();
        let missing = dir.path().join("Missing.mock");

        let probe = FormatProbe::new(vec![Box::new(MockFormat::new(
            "mock",
            "mock",
            Arc::new(Calls::default()),
        ))]);
        let found = resolve_all(&probe, &[a.clone(), b, missing, a.clone()]);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, a);
        assert_eq!(found[0].format, "mock");
    }

    #[test]
    fn display_path_shows_bundle_root() {
        let binary = Path::new("/plugins/Delay.vst3/Contents/x86_64-linux/Delay.so");
        assert_eq!(display_path(binary), "/plugins/Delay.vst3");
        assert_eq!(display_path(Path::new("/plugins/Gain.clap")), "/plugins/Gain.clap");
    }

    #[test]
    fn sample_format_names() {
        assert_eq!(format_sample_fmt(cpal::SampleFormat::F32), "f32");
        assert_eq!(format_sample_fmt(cpal::SampleFormat::I16), "i16");
    }
}
