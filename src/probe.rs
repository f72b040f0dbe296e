use std::path::Path;

use crate::error::HostError;
use crate::plugin::{self, PluginDescriptor, PluginFormat};

/// Resolves plugin files to a descriptor using a fixed, ordered list of formats.
pub struct FormatProbe {
    formats: Vec<Box<dyn PluginFormat>>,
}

impl FormatProbe {
    pub fn new(formats: Vec<Box<dyn PluginFormat>>) -> Self {
        Self { formats }
    }

    /// Probe with every native format compiled into this build.
    pub fn native() -> Self {
        Self::new(plugin::native_formats())
    }

    pub fn formats(&self) -> impl Iterator<Item = &dyn PluginFormat> {
        self.formats.iter().map(|f| f.as_ref())
    }

    pub fn format(&self, name: &str) -> Option<&dyn PluginFormat> {
        self.formats().find(|f| f.name() == name)
    }

    /// Return the descriptor from the first format that claims `path`.
    ///
    /// The path must name an existing regular file.
    pub fn resolve(&self, path: &Path) -> Result<PluginDescriptor, HostError> {
        if !path.is_file() {
            return Err(HostError::FileNotFound(path.to_path_buf()));
        }

        for format in &self.formats {
            if let Some(descriptor) = format.describe(path) {
                log::debug!(
                    "{} claims {} ({})",
                    format.name(),
                    path.display(),
                    descriptor.id
                );
                return Ok(descriptor);
            }
        }

        Err(HostError::UnsupportedFormat(path.to_path_buf()))
    }
}
