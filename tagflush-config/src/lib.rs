//! Configuration for the tagflush CLI and backends.
//!
//! The configuration is read from `config.yml` in a config folder, `.tagflush` by default. All
//! sections are optional:
//!
//! ```yaml
//! backend: signalfx
//! signalfx:
//!   host: ingest.us1.signalfx.com
//!   token: <api token>
//! metrics:
//!   global_prefix: myapp
//!   key_format: delimited
//! logging:
//!   level: info
//! ```
//!
//! Host, token, prefix and dry-run mode can be overridden from the command line or the environment
//! through [`OverridableConfig`].
#![warn(missing_docs)]

mod config;

pub use crate::config::*;
