use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "monohost", about = "Single-plugin CLAP/VST3 effect host")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run audio input through a plugin to the output device
    Run(RunArgs),
    /// Describe a plugin (format, state, parameters)
    Describe(DescribeArgs),
    /// List available audio devices and plugins
    #[command(subcommand)]
    Enumerate(EnumerateTarget),
}

#[derive(Subcommand)]
pub enum EnumerateTarget {
    /// List available audio input and output devices
    Audio,
    /// List CLAP and VST3 plugins found in the search paths
    Plugins,
}

#[derive(clap::Args)]
pub struct RunArgs {
    /// Plugin file or bundle (default: configured path, then auto-load candidates)
    pub plugin: Option<PathBuf>,

    /// Config file (default: ./monohost.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Audio output device name filter (default: system default)
    #[arg(long)]
    pub output_device: Option<String>,

    /// Audio input device name filter, or "none" to disable capture
    #[arg(long)]
    pub input_device: Option<String>,

    /// Sample rate in Hz
    #[arg(long)]
    pub sample_rate: Option<u32>,

    /// Audio buffer size in frames
    #[arg(long)]
    pub buffer_size: Option<u32>,

    /// Start with the plugin bypassed
    #[arg(long)]
    pub bypass: bool,
}

#[derive(clap::Args)]
pub struct DescribeArgs {
    /// Plugin file or bundle
    pub plugin: PathBuf,

    /// Sample rate used to prepare the plugin
    #[arg(long, default_value = "48000")]
    pub sample_rate: u32,

    /// Block size used to prepare the plugin
    #[arg(long, default_value = "512")]
    pub buffer_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_without_plugin_parses() {
        let cli = Cli::try_parse_from(["monohost", "run"]).unwrap();
        match cli.command {
            Command::Run(args) => {
                assert!(args.plugin.is_none());
                assert!(args.sample_rate.is_none());
                assert!(!args.bypass);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "monohost",
            "run",
            "Delay.clap",
            "--input-device",
            "none",
            "--buffer-size",
            "128",
            "--bypass",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.plugin, Some(PathBuf::from("Delay.clap")));
                assert_eq!(args.input_device.as_deref(), Some("none"));
                assert_eq!(args.buffer_size, Some(128));
                assert!(args.bypass);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn describe_uses_default_config() {
        let cli = Cli::try_parse_from(["monohost", "describe", "Delay.vst3"]).unwrap();
        match cli.command {
            Command::Describe(args) => {
                assert_eq!(args.sample_rate, 48000);
                assert_eq!(args.buffer_size, 512);
            }
            _ => panic!("expected describe"),
        }
    }

    #[test]
    fn describe_requires_plugin() {
        assert!(Cli::try_parse_from(["monohost", "describe"]).is_err());
    }
}
