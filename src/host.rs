//! Single-instance plugin lifecycle.
//!
//! ```text
//!            load ──► Instantiated ──prepare──► Prepared
//!   Unloaded ◄──────── unload (from any state) ◄─────┘
//!                      Instantiated ◄──release── Prepared
//! ```
//!
//! `load` always tears down the current instance first. A failed load leaves the
//! host `Unloaded`; the previous instance is not restored.

use std::mem;
use std::path::Path;

use crate::error::HostError;
use crate::plugin::{ParamChange, ParameterInfo, Plugin};
use crate::probe::FormatProbe;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: f64,
    pub block_size: usize,
}

impl AudioConfig {
    pub fn new(sample_rate: f64, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0.0 && self.block_size > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Unloaded,
    Instantiated,
    Prepared,
}

/// Tagged lifecycle state. The instance lives inside the state it belongs to, so
/// "prepared" can never drift apart from "loaded".
enum HostState {
    Unloaded,
    Instantiated(Box<dyn Plugin>),
    Prepared {
        plugin: Box<dyn Plugin>,
        config: AudioConfig,
    },
}

impl HostState {
    fn status(&self) -> HostStatus {
        match self {
            HostState::Unloaded => HostStatus::Unloaded,
            HostState::Instantiated(_) => HostStatus::Instantiated,
            HostState::Prepared { .. } => HostStatus::Prepared,
        }
    }

    fn plugin(&self) -> Option<&dyn Plugin> {
        match self {
            HostState::Unloaded => None,
            HostState::Instantiated(plugin) | HostState::Prepared { plugin, .. } => {
                Some(plugin.as_ref())
            }
        }
    }

    fn plugin_mut(&mut self) -> Option<&mut (dyn Plugin + 'static)> {
        match self {
            HostState::Unloaded => None,
            HostState::Instantiated(plugin) | HostState::Prepared { plugin, .. } => {
                Some(plugin.as_mut())
            }
        }
    }

    /// Prepared → Instantiated, calling the release hook. Other states are unchanged.
    fn released(self) -> HostState {
        match self {
            HostState::Prepared { mut plugin, .. } => {
                plugin.release();
                HostState::Instantiated(plugin)
            }
            other => other,
        }
    }

    /// Move to Prepared at `config`. On failure the instance is kept, unprepared.
    fn prepared(self, config: AudioConfig) -> (HostState, Option<HostError>) {
        let mut plugin = match self {
            HostState::Unloaded => return (HostState::Unloaded, None),
            HostState::Prepared {
                plugin,
                config: current,
            } if current == config => {
                return (
                    HostState::Prepared {
                        plugin,
                        config: current,
                    },
                    None,
                );
            }
            prepared @ HostState::Prepared { .. } => match prepared.released() {
                HostState::Instantiated(plugin) => plugin,
                other => return (other, None),
            },
            HostState::Instantiated(plugin) => plugin,
        };

        match plugin.prepare(config) {
            Ok(()) => (HostState::Prepared { plugin, config }, None),
            Err(e) => (
                HostState::Instantiated(plugin),
                Some(HostError::PrepareFailed(format!("{e:#}"))),
            ),
        }
    }
}

/// Read-only view of the loaded instance for parameter enumeration.
#[derive(Clone, Copy)]
pub struct PluginHandle<'a> {
    plugin: &'a dyn Plugin,
}

impl<'a> PluginHandle<'a> {
    pub fn name(&self) -> &'a str {
        self.plugin.name()
    }

    pub fn format(&self) -> &'static str {
        self.plugin.format()
    }

    pub fn parameters(&self) -> &'a [ParameterInfo] {
        self.plugin.parameters()
    }

    pub fn parameter_by_name(&self, name: &str) -> Option<&'a ParameterInfo> {
        self.parameters().iter().find(|p| p.name == name)
    }
}

/// Owns at most one plugin instance and drives it through its lifecycle.
pub struct PluginHost {
    probe: FormatProbe,
    state: HostState,
}

impl PluginHost {
    pub fn new(probe: FormatProbe) -> Self {
        Self {
            probe,
            state: HostState::Unloaded,
        }
    }

    pub fn status(&self) -> HostStatus {
        self.state.status()
    }

    pub fn is_loaded(&self) -> bool {
        self.status() != HostStatus::Unloaded
    }

    pub fn is_prepared(&self) -> bool {
        self.status() == HostStatus::Prepared
    }

    /// The config the instance is currently prepared with.
    pub fn config(&self) -> Option<AudioConfig> {
        match self.state {
            HostState::Prepared { config, .. } => Some(config),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<PluginHandle<'_>> {
        self.state.plugin().map(|plugin| PluginHandle { plugin })
    }

    /// Replace the current instance with the plugin at `path`.
    ///
    /// The current instance is destroyed before the new one is validated, so a
    /// failed load ends `Unloaded`. If `sample_rate`/`block_size` form a valid
    /// config the new instance is prepared immediately; a refused prepare is
    /// logged and leaves it `Instantiated`.
    pub fn load(
        &mut self,
        path: &Path,
        sample_rate: f64,
        block_size: usize,
    ) -> Result<(), HostError> {
        self.unload();

        let descriptor = self.probe.resolve(path)?;
        let config = AudioConfig::new(sample_rate, block_size);

        let format = self
            .probe
            .format(descriptor.format)
            .ok_or_else(|| HostError::UnsupportedFormat(path.to_path_buf()))?;
        let plugin = format
            .instantiate(&descriptor, config)
            .map_err(|e| HostError::InstantiationFailed(format!("{e:#}")))?;

        log::info!(
            "Loaded {} plugin '{}' from {}",
            descriptor.format,
            plugin.name(),
            descriptor.path.display()
        );
        self.state = HostState::Instantiated(plugin);

        if config.is_valid() {
            if let Err(e) = self.prepare(sample_rate, block_size) {
                log::warn!("{e}");
            }
        }
        Ok(())
    }

    /// Prepare the held instance for `sample_rate`/`block_size`.
    ///
    /// Idempotent for an unchanged config; a changed config releases and
    /// re-prepares. No-op when nothing is loaded.
    pub fn prepare(&mut self, sample_rate: f64, block_size: usize) -> Result<(), HostError> {
        let config = AudioConfig::new(sample_rate, block_size);
        if !config.is_valid() {
            return Err(HostError::InvalidConfig {
                sample_rate,
                block_size,
            });
        }

        let already = self.config() == Some(config);
        let (state, error) = mem::replace(&mut self.state, HostState::Unloaded).prepared(config);
        self.state = state;

        match error {
            Some(e) => Err(e),
            None => {
                if self.is_prepared() && !already {
                    log::info!("Prepared plugin: {sample_rate} Hz, {block_size} frames, 2 in/2 out");
                }
                Ok(())
            }
        }
    }

    /// Run the prepared instance over `buffer` in place.
    ///
    /// Calling this outside `Prepared` is a caller error and returns `NotPrepared`.
    pub fn process(
        &mut self,
        buffer: &mut [&mut [f32]],
        events: &[ParamChange],
    ) -> Result<(), HostError> {
        match &mut self.state {
            HostState::Prepared { plugin, .. } => Ok(plugin.process(buffer, events)?),
            _ => Err(HostError::NotPrepared),
        }
    }

    /// Prepared → Instantiated. The instance itself is kept.
    pub fn release(&mut self) {
        if self.is_prepared() {
            self.state = mem::replace(&mut self.state, HostState::Unloaded).released();
            log::info!("Released plugin resources");
        }
    }

    /// Destroy the held instance, if any.
    pub fn unload(&mut self) {
        let state = mem::replace(&mut self.state, HostState::Unloaded).released();
        if let HostState::Instantiated(plugin) = state {
            log::info!("Unloading plugin '{}'", plugin.name());
            drop(plugin);
        }
    }

    /// Queue a parameter change on the held instance.
    pub fn set_parameter(&mut self, index: u32, value: f32) -> anyhow::Result<()> {
        match self.state.plugin_mut() {
            Some(plugin) => plugin.set_parameter(index, value),
            None => anyhow::bail!("no plugin loaded"),
        }
    }

    pub fn get_parameter(&mut self, index: u32) -> Option<f32> {
        self.state.plugin_mut()?.get_parameter(index)
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.unload();
    }
}
