use std::ffi::CString;
use std::path::{Path, PathBuf};

use clack_extensions::audio_ports::{
    AudioPortInfoBuffer, HostAudioPorts, HostAudioPortsImpl, PluginAudioPorts, RescanType,
};
use clack_extensions::params::{
    HostParams, HostParamsImplMainThread, HostParamsImplShared, ParamClearFlags, ParamInfoBuffer,
    ParamRescanFlags, PluginParams,
};
use clack_host::events::event_types::ParamValueEvent;
use clack_host::prelude::*;
use clack_host::process::StartedPluginAudioProcessor;
use clack_host::process::audio_buffers::InputChannel;
use clack_host::utils::Cookie;

use super::{
    HOST_CHANNELS, ParamChange, ParameterInfo, Plugin, PluginDescriptor, PluginFormat,
    ProcessError,
};
use crate::host::AudioConfig;

/// `CLAP_PROCESS_ERROR`, reported when the plugin fails a block.
const CLAP_PROCESS_ERROR: i32 = 0;

const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Host handler types (minimal, no-op callbacks)
// ---------------------------------------------------------------------------

struct MonoHost;
struct MonoHostShared;
struct MonoHostMainThread;

impl HostHandlers for MonoHost {
    type Shared<'a> = MonoHostShared;
    type MainThread<'a> = MonoHostMainThread;
    type AudioProcessor<'a> = ();

    fn declare_extensions(builder: &mut HostExtensions<Self>, _shared: &Self::Shared<'_>) {
        builder.register::<HostAudioPorts>();
        builder.register::<HostParams>();
    }
}

impl<'a> SharedHandler<'a> for MonoHostShared {
    fn request_restart(&self) {
        log::debug!("CLAP plugin requested restart (ignored)");
    }
    fn request_process(&self) {
        log::debug!("CLAP plugin requested process (ignored)");
    }
    fn request_callback(&self) {
        log::debug!("CLAP plugin requested callback (ignored)");
    }
}

impl<'a> MainThreadHandler<'a> for MonoHostMainThread {}

impl HostParamsImplShared for MonoHostShared {
    fn request_flush(&self) {
        log::debug!("CLAP params: request_flush (ignored)");
    }
}

impl HostParamsImplMainThread for MonoHostMainThread {
    fn rescan(&mut self, _flags: ParamRescanFlags) {
        log::debug!("CLAP params: rescan (ignored)");
    }
    fn clear(&mut self, _param_id: ClapId, _flags: ParamClearFlags) {
        log::debug!("CLAP params: clear (ignored)");
    }
}

impl HostAudioPortsImpl for MonoHostMainThread {
    fn is_rescan_flag_supported(&self, _flag: RescanType) -> bool {
        false
    }
    fn rescan(&mut self, _flag: RescanType) {
        log::debug!("CLAP audio_ports: rescan (ignored)");
    }
}

fn host_info() -> anyhow::Result<HostInfo> {
    Ok(HostInfo::new(
        "monohost",
        "monohost",
        "",
        env!("CARGO_PKG_VERSION"),
    )?)
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// CLAP plugins: `.clap` shared libraries, or the binary inside a macOS `.clap` bundle.
pub struct ClapFormat;

impl PluginFormat for ClapFormat {
    fn name(&self) -> &'static str {
        "clap"
    }

    fn describe(&self, path: &Path) -> Option<PluginDescriptor> {
        let bundle_path = bundle_path(path)?;
        let bundle = match unsafe { PluginBundle::load(&bundle_path) } {
            Ok(bundle) => bundle,
            Err(e) => {
                log::debug!("Not a CLAP bundle: {} ({e})", path.display());
                return None;
            }
        };
        match first_plugin(&bundle, &bundle_path) {
            Ok((id, name)) => Some(PluginDescriptor {
                format: "clap",
                path: path.to_path_buf(),
                id,
                name,
            }),
            Err(e) => {
                log::debug!("{e}");
                None
            }
        }
    }

    fn instantiate(
        &self,
        descriptor: &PluginDescriptor,
        _config: AudioConfig,
    ) -> anyhow::Result<Box<dyn Plugin>> {
        Ok(Box::new(ClapPlugin::instantiate(descriptor)?))
    }
}

/// The path clack should load for `path`, if it looks like a CLAP plugin at all.
fn bundle_path(path: &Path) -> Option<PathBuf> {
    if let Some(root) = super::bundle_root(path, "clap") {
        return Some(root.to_path_buf());
    }
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("clap"))
        .then(|| path.to_path_buf())
}

/// ID and display name of the first plugin in the bundle.
fn first_plugin(bundle: &PluginBundle, path: &Path) -> anyhow::Result<(String, String)> {
    let factory = bundle
        .get_plugin_factory()
        .ok_or_else(|| anyhow::anyhow!("CLAP bundle has no plugin factory: {}", path.display()))?;
    let descriptor = factory
        .plugin_descriptors()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No plugins in CLAP bundle: {}", path.display()))?;

    let id = descriptor
        .id()
        .ok_or_else(|| anyhow::anyhow!("CLAP plugin has no ID"))?
        .to_str()
        .map_err(|_| anyhow::anyhow!("CLAP plugin ID is not valid UTF-8"))?
        .to_string();
    let name = descriptor
        .name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| id.clone());
    Ok((id, name))
}

/// Every CLAP bundle in the standard search paths plus `extra` directories.
pub fn bundle_paths(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = clack_finder::ClapFinder::from_standard_paths()
        .into_iter()
        .collect();
    for dir in extra {
        paths.extend(super::find_bundles(dir, "clap"));
    }
    paths
}

// ---------------------------------------------------------------------------
// ClapPlugin
// ---------------------------------------------------------------------------

pub struct ClapPlugin {
    name: String,
    params_ext: Option<PluginParams>,
    params_cache: Vec<ParameterInfo>,
    param_ids: Vec<ClapId>,
    pending_param_changes: Vec<(ClapId, f64)>,
    _bundle: PluginBundle,
    instance: PluginInstance<MonoHost>,
    audio_processor: Option<StartedPluginAudioProcessor<MonoHost>>,
    max_frames: usize,
    // Channel buffers per port, sized to `max_frames` by `prepare`.
    input_port_channels: Vec<u32>,
    input_ports: AudioPorts,
    input_bufs: Vec<Vec<Vec<f32>>>,
    output_port_channels: Vec<u32>,
    output_ports: AudioPorts,
    output_bufs: Vec<Vec<Vec<f32>>>,
    event_buffer: EventBuffer,
}

// Safety: PluginInstance is !Send because CLAP enforces main-thread affinity for
// init, activate, deactivate and destroy. The instance is created and activated on
// the control thread, moved by value into the audio callback inside the bridge,
// and only process() runs there. It is handed back to the control thread before
// release() or drop. Single owner, no concurrent access.
unsafe impl Send for ClapPlugin {}

impl Drop for ClapPlugin {
    fn drop(&mut self) {
        self.release();
    }
}

impl ClapPlugin {
    fn instantiate(descriptor: &PluginDescriptor) -> anyhow::Result<Self> {
        let host_info = host_info()?;
        let bundle_path = bundle_path(&descriptor.path).ok_or_else(|| {
            anyhow::anyhow!("Not a CLAP plugin: {}", descriptor.path.display())
        })?;

        // Safety: loading external dynamic libraries is inherently unsafe
        let bundle = unsafe { PluginBundle::load(&bundle_path) }.map_err(|e| {
            anyhow::anyhow!("Failed to load CLAP bundle {}: {e}", bundle_path.display())
        })?;
        let plugin_id = CString::new(descriptor.id.as_str())
            .map_err(|_| anyhow::anyhow!("CLAP plugin ID contains NUL"))?;

        let mut instance = PluginInstance::<MonoHost>::new(
            |_| MonoHostShared,
            |_shared| MonoHostMainThread,
            &bundle,
            &plugin_id,
            &host_info,
        )
        .map_err(|e| anyhow::anyhow!("Failed to instantiate CLAP plugin: {e}"))?;

        let mut output_port_channels = port_channels(&mut instance, false);
        if output_port_channels.iter().sum::<u32>() == 0 {
            log::warn!("CLAP plugin reports no output channels, assuming stereo");
            output_port_channels = vec![HOST_CHANNELS as u32];
        }
        let input_port_channels = port_channels(&mut instance, true);

        let params_ext: Option<PluginParams> = instance.plugin_shared_handle().get_extension();
        let (params_cache, param_ids) = match params_ext {
            Some(ext) => {
                let mut handle = instance.plugin_handle();
                let mut info_buf = ParamInfoBuffer::new();
                let count = ext.count(&mut handle);
                let mut params = Vec::with_capacity(count as usize);
                let mut ids = Vec::with_capacity(count as usize);
                for i in 0..count {
                    if let Some(info) = ext.get_info(&mut handle, i, &mut info_buf) {
                        params.push(ParameterInfo {
                            index: ids.len() as u32,
                            name: String::from_utf8_lossy(info.name).to_string(),
                            min: info.min_value as f32,
                            max: info.max_value as f32,
                            default: info.default_value as f32,
                        });
                        ids.push(info.id);
                    }
                }
                (params, ids)
            }
            None => {
                log::info!("CLAP plugin does not support params extension");
                (Vec::new(), Vec::new())
            }
        };

        log::info!(
            "Instantiated CLAP plugin: {} (inputs={:?}, outputs={:?}, params={})",
            descriptor.name,
            input_port_channels,
            output_port_channels,
            params_cache.len(),
        );

        let total_in = input_port_channels.iter().sum::<u32>() as usize;
        let total_out = output_port_channels.iter().sum::<u32>() as usize;
        Ok(ClapPlugin {
            name: descriptor.name.clone(),
            params_ext,
            pending_param_changes: Vec::with_capacity(params_cache.len()),
            params_cache,
            param_ids,
            _bundle: bundle,
            instance,
            audio_processor: None,
            max_frames: 0,
            input_ports: AudioPorts::with_capacity(total_in, input_port_channels.len()),
            input_port_channels,
            input_bufs: Vec::new(),
            output_ports: AudioPorts::with_capacity(total_out, output_port_channels.len()),
            output_port_channels,
            output_bufs: Vec::new(),
            event_buffer: EventBuffer::with_capacity(EVENT_CAPACITY),
        })
    }
}

/// Channel count of each audio port in one direction.
fn port_channels(instance: &mut PluginInstance<MonoHost>, is_input: bool) -> Vec<u32> {
    let audio_ports_ext: Option<PluginAudioPorts> =
        instance.plugin_shared_handle().get_extension();
    let Some(ext) = audio_ports_ext else {
        log::warn!("CLAP plugin does not support audio-ports extension");
        return Vec::new();
    };

    let mut handle = instance.plugin_handle();
    let mut buf = AudioPortInfoBuffer::new();
    let count = ext.count(&mut handle, is_input);
    let mut channels = Vec::with_capacity(count as usize);
    for i in 0..count {
        if let Some(info) = ext.get(&mut handle, i, is_input, &mut buf) {
            log::debug!(
                "CLAP audio {} port {i}: channels={}, name={}",
                if is_input { "input" } else { "output" },
                info.channel_count,
                String::from_utf8_lossy(info.name),
            );
            channels.push(info.channel_count);
        }
    }
    channels
}

fn port_buffers(port_channels: &[u32], frames: usize) -> Vec<Vec<Vec<f32>>> {
    port_channels
        .iter()
        .map(|&n| vec![vec![0.0; frames]; n as usize])
        .collect()
}

// ---------------------------------------------------------------------------
// Plugin trait implementation
// ---------------------------------------------------------------------------

impl Plugin for ClapPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn format(&self) -> &'static str {
        "clap"
    }

    fn parameters(&self) -> &[ParameterInfo] {
        &self.params_cache
    }

    fn get_parameter(&mut self, index: u32) -> Option<f32> {
        let param_id = *self.param_ids.get(index as usize)?;
        let ext = self.params_ext?;
        let mut handle = self.instance.plugin_handle();
        ext.get_value(&mut handle, param_id).map(|v| v as f32)
    }

    fn set_parameter(&mut self, index: u32, value: f32) -> anyhow::Result<()> {
        let param_id = *self
            .param_ids
            .get(index as usize)
            .ok_or_else(|| anyhow::anyhow!("Parameter index out of range: {index}"))?;
        self.pending_param_changes.push((param_id, value as f64));
        Ok(())
    }

    fn prepare(&mut self, config: AudioConfig) -> anyhow::Result<()> {
        self.release();

        let audio_config = PluginAudioConfiguration {
            sample_rate: config.sample_rate,
            min_frames_count: 1,
            max_frames_count: config.block_size as u32,
        };
        let stopped = self
            .instance
            .activate(|_, _| (), audio_config)
            .map_err(|e| anyhow::anyhow!("Failed to activate CLAP plugin: {e}"))?;
        let started = stopped
            .start_processing()
            .map_err(|e| anyhow::anyhow!("Failed to start CLAP processing: {e}"))?;

        self.input_bufs = port_buffers(&self.input_port_channels, config.block_size);
        self.output_bufs = port_buffers(&self.output_port_channels, config.block_size);
        self.max_frames = config.block_size;
        self.audio_processor = Some(started);
        Ok(())
    }

    fn process(
        &mut self,
        buffer: &mut [&mut [f32]],
        events: &[ParamChange],
    ) -> Result<(), ProcessError> {
        let processor = self
            .audio_processor
            .as_mut()
            .ok_or(ProcessError::Inactive)?;

        let frames = buffer.first().map(|c| c.len()).unwrap_or(0);
        if frames == 0 {
            return Ok(());
        }
        if frames > self.max_frames {
            return Err(ProcessError::BlockTooLarge {
                frames,
                max: self.max_frames,
            });
        }

        self.event_buffer.clear();
        for (param_id, value) in self.pending_param_changes.drain(..) {
            let event =
                ParamValueEvent::new(0, param_id, Pckn::match_all(), value, Cookie::empty());
            self.event_buffer.push(&event);
        }
        for change in events {
            if let Some(&param_id) = self.param_ids.get(change.index as usize) {
                let event = ParamValueEvent::new(
                    0,
                    param_id,
                    Pckn::match_all(),
                    change.value as f64,
                    Cookie::empty(),
                );
                self.event_buffer.push(&event);
            }
        }

        // Host channels feed the plugin's input channels in order; extra plugin
        // channels read silence.
        for (ch, dst) in self.input_bufs.iter_mut().flatten().enumerate() {
            let dst = &mut dst[..frames];
            match buffer.get(ch) {
                Some(src) => copy_into(dst, src),
                None => dst.fill(0.0),
            }
        }
        for dst in self.output_bufs.iter_mut().flatten() {
            dst[..frames].fill(0.0);
        }

        {
            let input_audio = if self.input_bufs.is_empty() {
                InputAudioBuffers::empty()
            } else {
                self.input_ports
                    .with_input_buffers(self.input_bufs.iter_mut().map(|port| AudioPortBuffer {
                        latency: 0,
                        channels: AudioPortBufferType::f32_input_only(
                            port.iter_mut()
                                .map(|c| InputChannel::variable(&mut c[..frames])),
                        ),
                    }))
            };
            let mut output_audio =
                self.output_ports
                    .with_output_buffers(self.output_bufs.iter_mut().map(|port| {
                        AudioPortBuffer {
                            latency: 0,
                            channels: AudioPortBufferType::f32_output_only(
                                port.iter_mut().map(|c| &mut c[..frames]),
                            ),
                        }
                    }));

            let input_events = self.event_buffer.as_input();
            let mut output_events = OutputEvents::void();
            processor
                .process(
                    &input_audio,
                    &mut output_audio,
                    &input_events,
                    &mut output_events,
                    None,
                    None,
                )
                .map_err(|_| ProcessError::Rejected(CLAP_PROCESS_ERROR))?;
        }

        // A mono output feeds both host channels.
        let mut outputs = self.output_bufs.iter().flatten();
        let left = outputs.next();
        let right = outputs.next().or(left);
        for (dst, src) in buffer.iter_mut().zip([left, right]) {
            match src {
                Some(src) => copy_into(dst, &src[..frames]),
                None => dst.fill(0.0),
            }
        }

        Ok(())
    }

    fn release(&mut self) {
        if let Some(processor) = self.audio_processor.take() {
            let stopped = processor.stop_processing();
            self.instance.deactivate(stopped);
            log::debug!("CLAP plugin deactivated");
        }
    }
}

#[inline]
fn copy_into(dst: &mut [f32], src: &[f32]) {
    let len = dst.len().min(src.len());
    dst[..len].copy_from_slice(&src[..len]);
    dst[len..].fill(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_clap_paths_are_considered() {
        assert_eq!(
            bundle_path(Path::new("/p/Delay.clap")),
            Some(PathBuf::from("/p/Delay.clap"))
        );
        assert_eq!(
            bundle_path(Path::new("/p/Delay.CLAP")),
            Some(PathBuf::from("/p/Delay.CLAP"))
        );
        assert_eq!(
            bundle_path(Path::new("/p/Delay.clap/Contents/MacOS/Delay")),
            Some(PathBuf::from("/p/Delay.clap"))
        );
        assert_eq!(bundle_path(Path::new("/p/Delay.so")), None);
    }

    #[test]
    fn describe_rejects_non_clap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"text").unwrap();
        assert!(ClapFormat.describe(&path).is_none());
    }

    #[test]
    fn describe_rejects_garbage_clap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Broken.clap");
        std::fs::write(&path, b"not a shared library").unwrap();
        assert!(ClapFormat.describe(&path).is_none());
    }

    #[test]
    fn copy_into_pads_with_silence() {
        let mut dst = [1.0f32; 4];
        copy_into(&mut dst, &[0.5, 0.25]);
        assert_eq!(dst, [0.5, 0.25, 0.0, 0.0]);
    }

    #[test]
    fn port_buffers_match_layout() {
        let bufs = port_buffers(&[2, 1], 8);
        assert_eq!(bufs.len(), 2);
        assert_eq!(bufs[0].len(), 2);
        assert_eq!(bufs[1].len(), 1);
        assert!(bufs.iter().flatten().all(|c| c.len() == 8));
    }
}
