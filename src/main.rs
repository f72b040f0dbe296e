#![allow(clippy::collapsible_if)]

mod audio;
mod bridge;
mod bypass;
mod cli;
mod config;
mod enumerate;
mod error;
mod host;
mod meter;
mod metrics;
mod plugin;
mod probe;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use clap::Parser;
use cli::{Cli, Command, DescribeArgs, EnumerateTarget, RunArgs};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ringbuf::HeapRb;
use ringbuf::traits::Split;

use crate::audio::{AudioEngine, AudioOptions};
use crate::bridge::AudioBridge;
use crate::bypass::BypassController;
use crate::config::Config;
use crate::error::HostError;
use crate::host::{AudioConfig, PluginHost};
use crate::meter::{Meter, MeterStatus};
use crate::metrics::MetricsChannel;
use crate::probe::FormatProbe;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Enumerate(target) => {
            env_logger::init();
            let config = Config::load(None)?;
            config::init(config.plugin_paths);
            match target {
                EnumerateTarget::Audio => enumerate::audio(),
                EnumerateTarget::Plugins => enumerate::plugins(),
            }
        }
        Command::Describe(args) => {
            env_logger::init();
            describe(args)
        }
        Command::Run(args) => run(args),
    }
}

fn describe(args: DescribeArgs) -> anyhow::Result<()> {
    let mut host = PluginHost::new(FormatProbe::native());
    let path = plugin::bundle_binary_path(&args.plugin);
    host.load(&path, args.sample_rate as f64, args.buffer_size as usize)?;

    let status = host.status();
    let handle = host
        .handle()
        .ok_or_else(|| anyhow::anyhow!("no plugin loaded"))?;
    println!("{}", handle.name());
    println!("  Format:        {}", handle.format());
    println!("  Path:          {}", path.display());
    println!("  State:         {status:?}");
    let params = handle.parameters();
    println!("  Parameters:    {}", params.len());
    for param in params {
        println!(
            "    [{}] {} (min={}, max={}, default={})",
            param.index, param.name, param.min, param.max, param.default
        );
    }
    Ok(())
}

/// Custom logger that writes to stderr with \r\n line endings for raw mode.
struct RawModeLogger;

impl log::Log for RawModeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            let secs = now.as_secs() % 86400; // time of day
            let h = secs / 3600;
            let m = (secs % 3600) / 60;
            let s = secs % 60;
            let ms = now.subsec_millis();
            // Clear the meter line first so the message is not interleaved with it.
            let _ = write!(
                std::io::stderr(),
                "\r\x1b[2K[{h:02}:{m:02}:{s:02}.{ms:03} {}] {}\r\n",
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static RAW_MODE_LOGGER: RawModeLogger = RawModeLogger;

fn run(args: RunArgs) -> anyhow::Result<()> {
    // Set up raw mode logger early so plugin loading messages are visible
    log::set_logger(&RAW_MODE_LOGGER).ok();
    log::set_max_level(
        std::env::var("RUST_LOG")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
    );

    let mut config = Config::load(args.config.as_deref())?;
    if args.output_device.is_some() {
        config.audio.output_device = args.output_device;
    }
    if args.input_device.is_some() {
        config.audio.input_device = args.input_device;
    }
    if let Some(rate) = args.sample_rate {
        config.audio.sample_rate = rate;
    }
    if let Some(size) = args.buffer_size {
        config.audio.buffer_size = size;
    }
    config.plugin.bypass |= args.bypass;
    config.validate()?;

    // Start audio engine (silent until a bridge is attached)
    let engine = AudioEngine::start(&AudioOptions {
        output_device: config.audio.output_device.clone(),
        input_device: config.audio.input_device.clone(),
        sample_rate: config.audio.sample_rate,
        buffer_size: config.audio.buffer_size,
    })?;
    let audio_config = engine.config();
    if !engine.has_input() {
        log::warn!("No audio input; the plugin is fed silence");
    }

    let bypass = Arc::new(BypassController::new(config.plugin.bypass));
    let metrics = Arc::new(MetricsChannel::new());
    let capacity = config.meter.waveform_capacity;
    let (waveform_tx, waveform_rx) = HeapRb::<f32>::new(capacity).split();
    let mut bridge = AudioBridge::new(
        PluginHost::new(FormatProbe::native()),
        bypass.clone(),
        metrics.clone(),
    )
    .with_waveform_sink(waveform_tx);
    let mut meter = Meter::new(metrics.clone(), waveform_rx, capacity);

    // Load on the control thread before the bridge moves to the audio thread
    let params = &config.plugin.params;
    let current = match args.plugin.or_else(|| config.plugin.path.clone()) {
        Some(path) => {
            let path = plugin::bundle_binary_path(&path);
            if let Err(e) = load_plugin(bridge.host_mut(), &path, audio_config, params) {
                log::error!("Failed to load {}: {e}", path.display());
            }
            Some(path)
        }
        None => auto_load(bridge.host_mut(), &config.plugin.candidates, audio_config, params),
    };

    let mut session = Session {
        engine: &engine,
        status: MeterStatus {
            host: bridge.host().status(),
            bypassed: bypass.is_bypassed(),
        },
        bypass,
        current,
        audio_config,
        params,
        announced_running: false,
    };
    engine.attach(bridge)?;

    crossterm::terminal::enable_raw_mode()?;
    log::info!("Running. b: bypass, r: reload, u: unload, q: quit");
    let result = session.control_loop(&mut meter, config.meter.refresh_hz);
    crossterm::terminal::disable_raw_mode()?;
    println!();

    log::info!("Stopping...");

    // Shutdown order matters: take the bridge back so the callback can't call the
    // plugin, release and unload on this thread, then stop the streams. A bridge the
    // callback did not hand back in time is reclaimed once the stream is gone.
    let detached = match engine.detach() {
        Ok(bridge) => Some(bridge),
        Err(e) => {
            log::warn!("{e}; reclaiming it after the stream stops");
            None
        }
    };
    let reclaimed = engine.stop();
    match detached.or(reclaimed) {
        Some(mut bridge) => {
            bridge.host_mut().release();
            bridge.host_mut().unload();
        }
        None => log::warn!("Plugin bridge was not returned by the audio thread"),
    }
    log::info!(
        "Processed {} blocks ({} failed)",
        metrics.blocks(),
        metrics.failed_blocks()
    );

    result
}

/// Control-thread view of a running host.
struct Session<'a> {
    engine: &'a AudioEngine,
    bypass: Arc<BypassController>,
    status: MeterStatus,
    current: Option<PathBuf>,
    audio_config: AudioConfig,
    params: &'a BTreeMap<String, f64>,
    announced_running: bool,
}

impl Session<'_> {
    fn control_loop(&mut self, meter: &mut Meter, refresh_hz: u32) -> anyhow::Result<()> {
        let refresh = Duration::from_secs_f64(1.0 / refresh_hz as f64);
        let mut last_draw = Instant::now();

        loop {
            // Poll crossterm events with 10ms timeout
            if event::poll(Duration::from_millis(10))? {
                if let Event::Key(key_event) = event::read()? {
                    if key_event.kind != KeyEventKind::Press {
                        continue;
                    }
                    let ctrl = key_event.modifiers.contains(KeyModifiers::CONTROL);
                    match key_event.code {
                        KeyCode::Char('c') if ctrl => break,
                        KeyCode::Char('q') | KeyCode::Esc => break,
                        KeyCode::Char('b') => self.toggle_bypass(),
                        KeyCode::Char('r') => self.reload()?,
                        KeyCode::Char('u') => self.unload()?,
                        _ => {}
                    }
                }
            }

            if !self.announced_running && self.engine.is_running() {
                log::info!("Audio callback running");
                self.announced_running = true;
            }

            if last_draw.elapsed() >= refresh {
                draw(&meter.poll(self.status))?;
                last_draw = Instant::now();
            }
        }
        Ok(())
    }

    fn toggle_bypass(&mut self) {
        self.status.bypassed = self.bypass.toggle();
        log::info!(
            "Bypass {}",
            if self.status.bypassed { "on" } else { "off" }
        );
    }

    /// Detach, release, load the current path again, reattach.
    fn reload(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.current.clone() else {
            log::warn!("No plugin path to reload");
            return Ok(());
        };
        let mut bridge = self.engine.detach()?;
        bridge.host_mut().release();
        if let Err(e) = load_plugin(bridge.host_mut(), &path, self.audio_config, self.params) {
            log::error!("Failed to load {}: {e}", path.display());
        }
        self.status.host = bridge.host().status();
        self.engine.attach(bridge)
    }

    fn unload(&mut self) -> anyhow::Result<()> {
        let mut bridge = self.engine.detach()?;
        bridge.host_mut().unload();
        self.status.host = bridge.host().status();
        self.engine.attach(bridge)
    }
}

/// Redraw the meter in place, clipped to the terminal width.
fn draw(line: &str) -> anyhow::Result<()> {
    use crossterm::cursor::MoveToColumn;
    use crossterm::style::Print;
    use crossterm::terminal::{Clear, ClearType};

    let width = crossterm::terminal::size().map(|(w, _)| w).unwrap_or(80);
    let clipped: String = line.chars().take(width.saturating_sub(1) as usize).collect();
    let mut stdout = std::io::stdout();
    crossterm::queue!(
        stdout,
        MoveToColumn(0),
        Clear(ClearType::CurrentLine),
        Print(clipped)
    )?;
    stdout.flush()?;
    Ok(())
}

/// Load `path` and apply configured parameter values by name.
fn load_plugin(
    host: &mut PluginHost,
    path: &Path,
    config: AudioConfig,
    params: &BTreeMap<String, f64>,
) -> Result<(), HostError> {
    host.load(path, config.sample_rate, config.block_size)?;
    apply_params(host, params);
    Ok(())
}

fn apply_params(host: &mut PluginHost, params: &BTreeMap<String, f64>) {
    let Some(handle) = host.handle() else {
        return;
    };
    let mut resolved = Vec::with_capacity(params.len());
    for (name, &value) in params {
        if let Some(info) = handle.parameter_by_name(name) {
            resolved.push((info.index, (value as f32).clamp(info.min, info.max), name));
        } else {
            log::warn!(
                "Unknown parameter '{}' (available: {})",
                name,
                handle
                    .parameters()
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
    }

    for (index, value, name) in resolved {
        match host.set_parameter(index, value) {
            Ok(()) => log::info!("Set '{name}' = {value}"),
            Err(e) => log::warn!("Failed to set '{name}': {e:#}"),
        }
    }
}

/// Try each configured candidate next to the executable, in its Resources
/// directory, then in the working directory. The first one that loads wins.
fn auto_load(
    host: &mut PluginHost,
    candidates: &[String],
    config: AudioConfig,
    params: &BTreeMap<String, f64>,
) -> Option<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    for candidate in config::candidate_paths(candidates, exe_dir.as_deref(), &cwd) {
        let path = plugin::bundle_binary_path(&candidate);
        match load_plugin(host, &path, config, params) {
            Ok(()) => return Some(path),
            Err(e) => log::warn!("Skipping {}: {e}", candidate.display()),
        }
    }
    log::warn!("No plugin loaded; output is silent unless bypassed");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::mock::{Calls, MockFormat};

    fn host() -> (PluginHost, tempfile::TempDir) {
        let probe = FormatProbe::new(vec![Box::new(MockFormat::new(
            "mock",
            "mock",
            Arc::new(Calls::default()),
        ))]);
        (PluginHost::new(probe), tempfile::tempdir().unwrap())
    }

    #[test]
    fn configured_params_are_applied_by_name() {
        let (mut host, dir) = host();
        let path = dir.path().join("Gain.mock");
        std::fs::write(&path, b"").unwrap();

        let params = BTreeMap::from([("Gain".to_string(), 1.5), ("Missing".to_string(), 0.1)]);
        load_plugin(&mut host, &path, AudioConfig::new(48000.0, 64), &params).unwrap();

        assert!(host.is_prepared());
        assert_eq!(host.get_parameter(0), Some(1.5));
    }

    #[test]
    fn configured_params_are_clamped() {
        let (mut host, dir) = host();
        let path = dir.path().join("Gain.mock");
        std::fs::write(&path, b"").unwrap();

        let params = BTreeMap::from([("Gain".to_string(), 9.0)]);
        load_plugin(&mut host, &path, AudioConfig::new(48000.0, 64), &params).unwrap();
        assert_eq!(host.get_parameter(0), Some(2.0));
    }

    #[test]
    fn load_failure_leaves_host_unloaded() {
        let (mut host, dir) = host();
        let err = load_plugin(
            &mut host,
            &dir.path().join("Missing.mock"),
            AudioConfig::new(48000.0, 64),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, HostError::FileNotFound(_)));
        assert!(!host.is_loaded());
    }
}
