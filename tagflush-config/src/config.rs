use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tagflush_log::LogConfig;
use tagflush_metrics::ShapeConfig;
use url::Url;

/// Path of the SignalFx ingest endpoint.
const DATAPOINT_PATH: &str = "/v2/datapoint";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (from file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (overridden by field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner
            .as_ref()
            .map(|inner| inner.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// The SignalFx backend is not in dry-run mode but lacks a host or an API token.
    #[error("missing signalfx host or api token, configure both or enable dry-run mode")]
    MissingCredentials,
}

/// A configuration file stored within the config folder.
trait ConfigObject: DeserializeOwned + Serialize {
    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.yml", Self::name()))
    }

    /// Loads the config file from a file within the given directory location.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = fs::File::open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path))?;

        serde_yaml::from_reader(io::BufReader::new(f))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path))
    }

    /// Writes the configuration to a file within the given directory location.
    fn save(&self, base: &Path) -> Result<(), ConfigError> {
        let path = Self::path(base);
        let mut options = fs::OpenOptions::new();
        options.write(true).truncate(true).create(true);

        // The file holds the API token, remove all non-user permissions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut f = options
            .open(&path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&path))?;

        serde_yaml::to_writer(&mut f, self)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile).file(&path))?;
        f.write_all(b"\n").ok();

        Ok(())
    }
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The SignalFx ingest host.
    pub host: Option<String>,
    /// The SignalFx API token.
    pub token: Option<String>,
    /// The global prefix of all metric names.
    pub prefix: Option<String>,
    /// "true" to log payloads instead of sending them, "false" otherwise.
    pub dry_run: Option<String>,
}

/// The backend that receives the flushed snapshots.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Sends tagged data points to the SignalFx HTTP API.
    #[default]
    SignalFx,
    /// Rewrites keys into multi-dimensional Graphite names and forwards the snapshot.
    Graphite,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::SignalFx => f.write_str("signalfx"),
            BackendKind::Graphite => f.write_str("graphite"),
        }
    }
}

/// Settings of the SignalFx backend.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct SignalFx {
    /// The ingest host, optionally including a scheme, such as `ingest.signalfx.com`.
    pub host: Option<String>,
    /// The API token sent in the `X-SF-Token` header.
    pub token: Option<String>,
    /// Logs payloads instead of sending them.
    pub dry_run: bool,
}

/// Settings of the multi-dimensional Graphite backend.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
pub struct Graphite {
    /// File to append the remapped snapshots to, one JSON document per line.
    ///
    /// Defaults to standard output.
    pub output: Option<PathBuf>,
}

/// Controls HTTP requests to the SignalFx API.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Http {
    /// Timeout for a single send in seconds.
    pub timeout: u64,
}

impl Default for Http {
    fn default() -> Self {
        Http { timeout: 5 }
    }
}

/// Controls internal limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
pub struct Limits {
    /// The maximum number of seconds to wait for pending sends after receiving a shutdown
    /// signal.
    pub shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            shutdown_timeout: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct ConfigValues {
    backend: BackendKind,
    signalfx: SignalFx,
    graphite: Graphite,
    metrics: ShapeConfig,
    http: Http,
    limits: Limits,
    logging: LogConfig,
}

impl ConfigObject for ConfigValues {
    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Loads a config from a given config folder.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = absolute_path(path.as_ref());

        Ok(Config {
            values: ConfigValues::load(&path)?,
            path,
        })
    }

    /// Creates the default config for the given config folder without reading any files.
    pub fn from_defaults<P: AsRef<Path>>(path: P) -> Config {
        Config {
            values: ConfigValues::default(),
            path: absolute_path(path.as_ref()),
        }
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters)
    pub fn apply_override(&mut self, overrides: OverridableConfig) -> Result<&mut Self, ConfigError> {
        let signalfx = &mut self.values.signalfx;

        if let Some(host) = overrides.host {
            signalfx.host = Some(host);
        }

        if let Some(token) = overrides.token {
            signalfx.token = Some(token);
        }

        if let Some(dry_run) = overrides.dry_run {
            signalfx.dry_run = match dry_run.to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" | "" => false,
                _ => return Err(ConfigError::new(ConfigErrorKind::InvalidValue).field("dry_run")),
            };
        }

        if let Some(prefix) = overrides.prefix {
            self.values.metrics.global_prefix = prefix;
        }

        Ok(self)
    }

    /// Checks that the configuration can be used to start the configured backend.
    ///
    /// The SignalFx backend requires a valid host and an API token unless dry-run mode is
    /// enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend() != BackendKind::SignalFx || self.dry_run() {
            return Ok(());
        }

        if self.signalfx_token().is_none() {
            return Err(ConfigError::new(ConfigErrorKind::MissingCredentials).field("token"));
        }

        self.signalfx_endpoint().map(|_| ())
    }

    /// Checks if the config is already initialized.
    pub fn config_exists<P: AsRef<Path>>(path: P) -> bool {
        fs::metadata(ConfigValues::path(path.as_ref())).is_ok()
    }

    /// Saves the config in its config folder as `config.yml`.
    pub fn save(&self) -> Result<(), ConfigError> {
        if fs::metadata(&self.path).is_err() {
            fs::create_dir_all(&self.path).map_err(|e| {
                ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&self.path)
            })?;
        }

        self.values.save(&self.path)
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the backend that receives flushed snapshots.
    pub fn backend(&self) -> BackendKind {
        self.values.backend
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the configuration of the metric shaper.
    pub fn shape_config(&self) -> &ShapeConfig {
        &self.values.metrics
    }

    /// Returns `true` if payloads are logged instead of sent.
    pub fn dry_run(&self) -> bool {
        self.values.signalfx.dry_run
    }

    /// Returns the API token of the SignalFx backend.
    pub fn signalfx_token(&self) -> Option<&str> {
        self.values.signalfx.token.as_deref()
    }

    /// Returns the URL of the SignalFx datapoint endpoint.
    ///
    /// Hosts without a scheme are reached via `https`.
    pub fn signalfx_endpoint(&self) -> Result<Url, ConfigError> {
        let host = self
            .values
            .signalfx
            .host
            .as_deref()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::new(ConfigErrorKind::MissingCredentials).field("host"))?;

        let base = if host.contains("://") {
            host.trim_end_matches('/').to_owned()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };

        Url::parse(&format!("{base}{DATAPOINT_PATH}"))
            .map_err(|e| ConfigError::for_field(e, "host"))
    }

    /// Returns the timeout of a single send to the SignalFx API.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.timeout)
    }

    /// Returns the file the Graphite backend writes to, or `None` for standard output.
    pub fn graphite_output(&self) -> Option<&Path> {
        self.values.graphite.output.as_deref()
    }

    /// Returns the maximum time to wait for pending sends on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    env::current_dir()
        .map(|x| x.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use tagflush_metrics::KeyFormat;

    use super::*;

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r###"
signalfx:
  host: ingest.us1.signalfx.com
  token: secret
metrics:
  global_prefix: sfx_test
  key_format: multi_key
  flush_counts: false
  namespaces:
    counter: null
    gauge: gauges
logging:
  level: debug
"###;
        fs::write(dir.path().join("config.yml"), yaml).unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.backend(), BackendKind::SignalFx);
        assert_eq!(config.signalfx_token(), Some("secret"));
        assert_eq!(
            config.signalfx_endpoint().unwrap().as_str(),
            "https://ingest.us1.signalfx.com/v2/datapoint"
        );

        let shape = config.shape_config();
        assert_eq!(shape.global_prefix, "sfx_test");
        assert_eq!(shape.key_format, KeyFormat::MultiKey);
        assert!(!shape.flush_counts);
        assert_eq!(shape.flush_interval, 10);
        assert_eq!(shape.namespaces.counter, None);
        assert_eq!(shape.namespaces.gauge.as_deref(), Some("gauges"));

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Config::config_exists(dir.path()));

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
        assert!(error.source().is_some());
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yml"), "metrics: [1, 2").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.to_string().starts_with("could not parse yaml config file (from file "));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join(".tagflush");

        let mut config = Config::from_defaults(&folder);
        config
            .apply_override(OverridableConfig {
                prefix: Some("app".to_owned()),
                ..Default::default()
            })
            .unwrap();
        config.save().unwrap();
        assert!(Config::config_exists(&folder));

        let reloaded = Config::from_path(&folder).unwrap();
        assert_eq!(reloaded.shape_config().global_prefix, "app");
        assert_eq!(reloaded.shape_config().namespaces.counter.as_deref(), Some("counters"));
        assert_eq!(reloaded.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::from_json_value(serde_json::json!({})).unwrap();
        config
            .apply_override(OverridableConfig {
                host: Some("http://localhost:8080/".to_owned()),
                token: Some("abc".to_owned()),
                prefix: Some("sfx".to_owned()),
                dry_run: Some("TRUE".to_owned()),
            })
            .unwrap();

        assert!(config.dry_run());
        assert_eq!(config.signalfx_token(), Some("abc"));
        assert_eq!(config.shape_config().global_prefix, "sfx");
        assert_eq!(
            config.signalfx_endpoint().unwrap().as_str(),
            "http://localhost:8080/v2/datapoint"
        );
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::from_json_value(serde_json::json!({})).unwrap();
        let error = config
            .apply_override(OverridableConfig {
                dry_run: Some("maybe".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        assert_eq!(error.to_string(), "invalid config value (overridden by field dry_run)");
    }

    #[test]
    fn test_validate_credentials() {
        let config = Config::from_json_value(serde_json::json!({
            "signalfx": {"host": "ingest.signalfx.com"}
        }))
        .unwrap();
        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::MissingCredentials);

        let config = Config::from_json_value(serde_json::json!({
            "signalfx": {"token": "abc"}
        }))
        .unwrap();
        let error = config.validate().unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::MissingCredentials);

        let config = Config::from_json_value(serde_json::json!({
            "signalfx": {"dry_run": true}
        }))
        .unwrap();
        assert!(config.validate().is_ok());

        let config = Config::from_json_value(serde_json::json!({
            "backend": "graphite"
        }))
        .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_json() {
        let error = Config::from_json_value(serde_json::json!({"backend": "carbon"})).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadJson);
    }
}
