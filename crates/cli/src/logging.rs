//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The filter comes from `--log-level` if given, else from the
//! `WORKFLOW_LOG` environment variable (any `EnvFilter` directive, e.g.
//! `info` or `engine=debug,queue=info`), else `info`.
//!
//! Logs go to stderr; stdout carries command output only.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_ENV: &str = "WORKFLOW_LOG";

pub fn init_logging(cli_level: Option<&str>) -> Result<()> {
    let filter = match cli_level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))?,
        None => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
