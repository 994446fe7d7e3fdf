//! `verso-api` binary entrypoint.
//!
//! Loads configuration from environment variables and starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use anyhow::Result;

use verso_api::config::Config;
use verso_api::server::Server;
use verso_core::observability::{LogFormat, init_logging};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(choose_log_format(&config));

    if config.debug {
        tracing::warn!("debug mode: identity is read from X-Workspace-Id / X-User-Name headers");
    }

    let server = Server::new(config);
    server.serve().await?;
    Ok(())
}
