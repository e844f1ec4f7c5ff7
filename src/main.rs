//! mcpconn - MCP tool-server connection manager CLI

use anyhow::Result;

use mcpconn::cli::Cli;
use mcpconn::commands;
use mcpconn::config::Config;
use mcpconn::logging::{default_directive, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(default_directive(cli.verbose), cli.json_logs)?;

    let config = Config::load(cli.config_path(), &cli)?;
    config.validate()?;

    if let Some(user) = &cli.user {
        tracing::debug!(user = %user, "Using per-user connections");
    }

    commands::run(&cli, config).await
}
