use std::path::PathBuf;

use thiserror::Error;

use crate::plugin::ProcessError;

/// Errors returned by the plugin host to the control thread.
///
/// Lifecycle failures are shown to the user as-is and never retried.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("plugin file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("no compatible plugin format for file: {}", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("{0}")]
    InstantiationFailed(String),
    #[error("plugin failed to prepare: {0}")]
    PrepareFailed(String),
    #[error("invalid audio config: sample_rate={sample_rate}, block_size={block_size}")]
    InvalidConfig { sample_rate: f64, block_size: usize },
    #[error("plugin is not prepared for processing")]
    NotPrepared,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instantiation_message_is_passed_through_verbatim() {
        let err = HostError::InstantiationFailed("Failed to activate CLAP plugin: nope".into());
        assert_eq!(err.to_string(), "Failed to activate CLAP plugin: nope");
    }

    #[test]
    fn file_not_found_names_the_path() {
        let err = HostError::FileNotFound(PathBuf::from("/tmp/missing.clap"));
        assert_eq!(
            err.to_string(),
            "plugin file does not exist: /tmp/missing.clap"
        );
    }

    #[test]
    fn process_error_converts() {
        let err: HostError = ProcessError::Inactive.into();
        assert!(matches!(err, HostError::Process(ProcessError::Inactive)));
    }
}
