use std::fs;
use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tagflush_common::UnixTimestamp;
use tagflush_config::Config;
use tagflush_log::LogError;
use tagflush_metrics::{KeyFormat, ParsedKey, RawMetricsSnapshot, graphite_name};
use tagflush_server::Backend;

use crate::cliapp::{Cli, Command, ConfigCommand, KeyFormatArg, OverrideArgs};
use crate::setup;

/// A single flush read from the input of the `run` command.
#[derive(Debug, Deserialize)]
struct FlushRequest {
    /// Defaults to the time the line was read.
    timestamp: Option<UnixTimestamp>,
    #[serde(default)]
    metrics: RawMetricsSnapshot,
}

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let Cli {
        config: config_path,
        overrides,
        command,
    } = Cli::parse();

    let config = load_config(&config_path, overrides)?;
    tagflush_log::init(config.logging());

    match command {
        Command::Run { input } => {
            setup::check_config(&config)?;
            setup::dump_spawn_infos(&config);

            match input {
                Some(path) => {
                    let file = fs::File::open(&path)
                        .with_context(|| format!("failed to open input {}", path.display()))?;
                    run(&config, io::BufReader::new(file))
                }
                None => run(&config, io::stdin().lock()),
            }
        }
        Command::Flush { file } => {
            setup::check_config(&config)?;
            flush_file(&config, &file)
        }
        Command::ParseKey { key, format } => {
            let format = format.unwrap_or_else(|| config.shape_config().key_format.into());
            parse_key(&key, format, &mut io::stdout().lock())
        }
        Command::Config(ConfigCommand::Init { force }) => init_config(config, force),
        Command::Config(ConfigCommand::Show) => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(config.to_yaml_string()?.as_bytes())?;
            Ok(())
        }
    }
}

/// Loads the config folder if it exists, otherwise starts from defaults.
fn load_config(path: &Path, overrides: OverrideArgs) -> Result<Config> {
    let mut config = if Config::config_exists(path) {
        Config::from_path(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?
    } else {
        Config::from_defaults(path)
    };

    config.apply_override(overrides.into())?;
    Ok(config)
}

fn init_config(config: Config, force: bool) -> Result<()> {
    if Config::config_exists(config.path()) && !force {
        bail!(
            "config already exists in {}, pass --force to replace it",
            config.path().display()
        );
    }

    config.save()?;
    tagflush_log::info!("wrote config to {}", config.path().display());
    Ok(())
}

fn run(config: &Config, input: impl BufRead) -> Result<()> {
    let runtime = setup::create_runtime()?;
    let backend = tagflush_server::create_backend(config, runtime.handle())?;

    let flushed = flush_lines(backend.as_ref(), input)?;
    tagflush_log::info!("input closed after {flushed} flushes, shutting down");

    backend.shutdown(config.shutdown_timeout());
    Ok(())
}

fn flush_file(config: &Config, path: &Path) -> Result<()> {
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    let snapshot: RawMetricsSnapshot =
        serde_json::from_str(&json).context("failed to parse snapshot")?;

    let runtime = setup::create_runtime()?;
    let backend = tagflush_server::create_backend(config, runtime.handle())?;

    let summary = backend.flush(UnixTimestamp::now(), &snapshot)?;
    tagflush_log::info!(
        "flushed {} datapoints to {}",
        summary.datapoints,
        backend.name()
    );

    backend.shutdown(config.shutdown_timeout());
    Ok(())
}

/// Flushes every line of the input through the backend.
///
/// Malformed lines and rejected flushes are logged and skipped. Returns the number of successful
/// flushes.
fn flush_lines(backend: &dyn Backend, input: impl BufRead) -> Result<usize> {
    let mut flushed = 0;

    for (index, line) in input.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }

        let request = match serde_json::from_str::<FlushRequest>(&line) {
            Ok(request) => request,
            Err(error) => {
                tagflush_log::error!(
                    "skipping malformed snapshot on line {}: {}",
                    index + 1,
                    LogError(&error)
                );
                continue;
            }
        };

        let timestamp = request.timestamp.unwrap_or_else(UnixTimestamp::now);
        match backend.flush(timestamp, &request.metrics) {
            Ok(summary) => {
                tagflush_log::debug!(
                    "flush {timestamp} forwarded {} datapoints",
                    summary.datapoints
                );
                flushed += 1;
            }
            Err(error) => {
                tagflush_log::error!("flush {timestamp} failed: {}", LogError(&error));
            }
        }
    }

    Ok(flushed)
}

fn parse_key(key: &str, format: KeyFormatArg, output: &mut impl Write) -> Result<()> {
    let parsed = match format {
        KeyFormatArg::Delimited => ParsedKey::parse(key, KeyFormat::Delimited)?,
        KeyFormatArg::MultiKey => ParsedKey::parse(key, KeyFormat::MultiKey)?,
        KeyFormatArg::Graphite => ParsedKey {
            metric_name: graphite_name(key)?.into_owned(),
            ..Default::default()
        },
    };

    serde_json::to_writer_pretty(&mut *output, &parsed)?;
    writeln!(output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tagflush_server::{FlushError, FlushSummary};

    use super::*;

    #[derive(Default)]
    struct RecordingBackend {
        flushes: Mutex<Vec<(UnixTimestamp, usize)>>,
    }

    impl Backend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn flush(
            &self,
            timestamp: UnixTimestamp,
            snapshot: &RawMetricsSnapshot,
        ) -> Result<FlushSummary, FlushError> {
            self.flushes
                .lock()
                .unwrap()
                .push((timestamp, snapshot.len()));

            Ok(FlushSummary {
                timestamp,
                datapoints: snapshot.len(),
            })
        }
    }

    #[test]
    fn test_flush_lines() {
        let input = r#"{"timestamp": 10, "metrics": {"gauges": {"a": 1, "b": 2}}}

not json
{"timestamp": 20, "metrics": {"counters": {"c": 1}}}
{"timestamp": 30}
{"timestamp": 40, "metrics": {"gauges": {"a": null, "b": 1}}}
"#;

        let backend = RecordingBackend::default();
        let flushed = flush_lines(&backend, input.as_bytes()).unwrap();
        assert_eq!(flushed, 4);

        let flushes = backend.flushes.into_inner().unwrap();
        assert_eq!(
            flushes,
            [
                (UnixTimestamp::from_secs(10), 2),
                (UnixTimestamp::from_secs(20), 1),
                (UnixTimestamp::from_secs(30), 0),
                (UnixTimestamp::from_secs(40), 1),
            ]
        );
    }

    fn parse_key_output(key: &str, format: KeyFormatArg) -> String {
        let mut output = Vec::new();
        parse_key(key, format, &mut output).unwrap();
        String::from_utf8(output).unwrap()
    }

    #[test]
    fn test_parse_key_delimited() {
        let output = parse_key_output("this.is.my.rifle=gun", KeyFormatArg::Delimited);
        insta::assert_snapshot!(output.trim_end(), @r###"
        {
          "metric_name": "this.is.my",
          "tags": {
            "rifle": "gun"
          }
        }
        "###);
    }

    #[test]
    fn test_parse_key_graphite() {
        let key = r#"[["graphite_keys","host;port"],["host","h1"],["port","p1"],["metric_name","m"]]"#;
        let output = parse_key_output(key, KeyFormatArg::Graphite);
        insta::assert_snapshot!(output.trim_end(), @r###"
        {
          "metric_name": "m.host.h1.port.p1",
          "tags": {}
        }
        "###);
    }

    #[test]
    fn test_parse_key_error() {
        let mut output = Vec::new();
        let error = parse_key("start=with.equals", KeyFormatArg::Delimited, &mut output)
            .unwrap_err();
        assert_eq!(error.to_string(), "metric name must not start with a tag");
    }

    #[test]
    fn test_init_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tagflush");

        let config = load_config(
            &path,
            OverrideArgs {
                prefix: Some("app".to_owned()),
                ..Default::default()
            },
        )
        .unwrap();
        init_config(config, false).unwrap();

        let config = load_config(&path, OverrideArgs::default()).unwrap();
        assert_eq!(config.shape_config().global_prefix, "app");

        let error = init_config(config, false).unwrap_err();
        assert!(error.to_string().starts_with("config already exists"));
    }
}
