use anyhow::{Context, Result};
use tagflush_config::{BackendKind, Config};
use tokio::runtime::{Builder, Runtime};

/// Validates the configuration before any backend is started.
pub fn check_config(config: &Config) -> Result<()> {
    config.validate()?;

    if config.backend() == BackendKind::Graphite
        && let Some(parent) = config.graphite_output().and_then(|path| path.parent())
        && !parent.as_os_str().is_empty()
        && !parent.is_dir()
    {
        anyhow::bail!(
            "the directory of the graphite output {} does not exist",
            parent.display()
        );
    }

    Ok(())
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if Config::config_exists(config.path()) {
        tagflush_log::info!(
            "launching tagflush from config folder {}",
            config.path().display()
        );
    } else {
        tagflush_log::info!("launching tagflush without config file");
    }

    tagflush_log::info!("  backend: {}", config.backend());

    let shape = config.shape_config();
    match shape.global_prefix.as_str() {
        "" => tagflush_log::info!("  prefix: -"),
        prefix => tagflush_log::info!("  prefix: {prefix}"),
    }
    tagflush_log::info!("  key format: {:?}", shape.key_format);
    tagflush_log::info!("  dry run: {}", config.dry_run());
    tagflush_log::info!("  log level: {}", config.logging().level);
}

/// Creates the runtime that performs HTTP requests in the background.
pub fn create_runtime() -> Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("tagflush-http")
        .enable_all()
        .build()
        .context("failed to start the http runtime")
}
