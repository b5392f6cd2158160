//! Defines the command line interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tagflush_config::OverridableConfig;
use tagflush_metrics::KeyFormat;

/// Forwards statsd flushes to SignalFx or a multi-dimensional Graphite backend.
///
/// Snapshots are read as JSON lines of the form `{"timestamp": <secs>, "metrics": {...}}`, where
/// `metrics` holds the aggregated `counters`, `gauges`, `sets`, `counter_rates`, `timers` and
/// `timer_data` of one flush interval.
#[derive(Debug, Parser)]
#[command(name = "tagflush", version, verbatim_doc_comment)]
pub struct Cli {
    /// The path to the config folder.
    #[arg(
        short,
        long,
        global = true,
        value_name = "CONFIG",
        default_value = ".tagflush"
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub overrides: OverrideArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options overriding values of the config file.
#[derive(Debug, Default, Args)]
pub struct OverrideArgs {
    /// The SignalFx ingest host, such as `ingest.us1.signalfx.com`.
    #[arg(long, global = true, value_name = "HOST", env = "TAGFLUSH_HOST")]
    pub host: Option<String>,

    /// The SignalFx API token.
    #[arg(
        long,
        global = true,
        value_name = "TOKEN",
        env = "TAGFLUSH_TOKEN",
        hide_env_values = true
    )]
    pub token: Option<String>,

    /// The prefix of all metric names.
    #[arg(long, global = true, value_name = "PREFIX", env = "TAGFLUSH_PREFIX")]
    pub prefix: Option<String>,

    /// Log payloads instead of sending them.
    #[arg(
        long,
        global = true,
        value_name = "BOOL",
        env = "TAGFLUSH_DRY_RUN",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    pub dry_run: Option<String>,
}

impl From<OverrideArgs> for OverridableConfig {
    fn from(args: OverrideArgs) -> Self {
        OverridableConfig {
            host: args.host,
            token: args.token,
            prefix: args.prefix,
            dry_run: args.dry_run,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Flush every snapshot read from the input through the configured backend.
    Run {
        /// Read snapshots from this file instead of stdin.
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Flush a single snapshot JSON document with the current time.
    Flush {
        /// Path to the snapshot.
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Print the metric name and tags of a raw metric key.
    ParseKey {
        /// The raw metric key.
        #[arg(value_name = "KEY")]
        key: String,

        /// The key format, defaults to the format of the config file.
        #[arg(long, value_enum)]
        format: Option<KeyFormatArg>,
    },

    /// Manage the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a config file with default values and the given overrides.
    Init {
        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration.
    Show,
}

/// Key formats accepted by `parse-key`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeyFormatArg {
    /// Dot-delimited keys with inline `name=value` tags.
    Delimited,
    /// JSON-tuple keys, falling back to delimited keys.
    MultiKey,
    /// Multi-dimensional Graphite names.
    Graphite,
}

impl From<KeyFormat> for KeyFormatArg {
    fn from(format: KeyFormat) -> Self {
        match format {
            KeyFormat::Delimited => Self::Delimited,
            KeyFormat::MultiKey => Self::MultiKey,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "tagflush",
            "--config",
            "/etc/tagflush",
            "run",
            "--input",
            "flushes.jsonl",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(cli.config, PathBuf::from("/etc/tagflush"));
        assert_eq!(cli.overrides.dry_run.as_deref(), Some("true"));
        assert!(matches!(
            cli.command,
            Command::Run { input: Some(ref path) } if path == &PathBuf::from("flushes.jsonl")
        ));
    }

    #[test]
    fn test_parse_key_format() {
        let cli =
            Cli::try_parse_from(["tagflush", "parse-key", "a.b=c", "--format", "multi-key"])
                .unwrap();

        assert_eq!(cli.config, PathBuf::from(".tagflush"));
        assert!(matches!(
            cli.command,
            Command::ParseKey {
                format: Some(KeyFormatArg::MultiKey),
                ..
            }
        ));
    }

    #[test]
    fn test_parse_config_init() {
        let cli = Cli::try_parse_from(["tagflush", "config", "init", "--prefix", "app"]).unwrap();

        assert_eq!(cli.overrides.prefix.as_deref(), Some("app"));
        assert!(matches!(
            cli.command,
            Command::Config(ConfigCommand::Init { force: false })
        ));
    }
}
