//! Command handlers for the CLI
//!
//! Every handler connects the selected servers through the
//! [`ConnectionRegistry`] first, so one unreachable server is reported
//! without hiding the others. Connections are torn down when the command
//! finishes.

use std::collections::BTreeMap;
use std::sync::Arc;

use colored::Colorize;

use crate::cli::{Cli, Commands};
use crate::config::{Config, ServerConfig};
use crate::error::{McpConnError, Result};
use crate::mcp::connection::Connection;
use crate::mcp::registry::{ConnectOutcomes, ConnectionRegistry};

/// Run the command selected on the command line.
///
/// # Errors
///
/// Returns error if the registry cannot be built or the command fails.
pub async fn run(cli: &Cli, config: Config) -> Result<()> {
    let registry = ConnectionRegistry::from_config(&config)?;
    let user = cli.user.as_deref();
    let result = execute(&cli.command, &registry, &config.servers, user).await;
    registry.disconnect_all(user).await;
    result
}

/// Execute `command` against `servers` using `registry`.
///
/// # Errors
///
/// - [`McpConnError::Config`] for an unknown server or malformed arguments
/// - [`McpConnError::NotConnected`] when no selected server could be reached
/// - the classified error of a failed tool call
pub async fn execute(
    command: &Commands,
    registry: &ConnectionRegistry,
    servers: &BTreeMap<String, ServerConfig>,
    user: Option<&str>,
) -> Result<()> {
    match command {
        Commands::Servers => {
            let connected = connect(registry, servers, user).await;
            print_servers(&connected);
            Ok(())
        }
        Commands::Tools { server } => {
            let connected = connect_selected(registry, servers, server.as_deref(), user).await?;
            for connection in &connected {
                let tools = connection.fetch_tools().await;
                print_header(connection, tools.len(), "tools");
                for tool in tools {
                    let description = tool.description.unwrap_or_default();
                    println!("  {}  {}", tool.name.cyan(), description);
                }
            }
            Ok(())
        }
        Commands::Resources { server } => {
            let connected = connect_selected(registry, servers, server.as_deref(), user).await?;
            for connection in &connected {
                let resources = connection.fetch_resources().await;
                print_header(connection, resources.len(), "resources");
                for resource in resources {
                    println!("  {}  {}", resource.uri.cyan(), resource.name);
                }
            }
            Ok(())
        }
        Commands::Prompts { server } => {
            let connected = connect_selected(registry, servers, server.as_deref(), user).await?;
            for connection in &connected {
                let prompts = connection.fetch_prompts().await;
                print_header(connection, prompts.len(), "prompts");
                for prompt in prompts {
                    let description = prompt.description.unwrap_or_default();
                    println!("  {}  {}", prompt.name.cyan(), description);
                }
            }
            Ok(())
        }
        Commands::Ping { server } => {
            let selected = select(servers, server.as_deref())?;
            let connected = connect(registry, &selected, user).await;
            for (connection, outcome) in &connected {
                let alive = outcome.is_ok() && connection.is_connected().await;
                let status = if alive { "alive".green() } else { "unreachable".red() };
                println!("{:<24} {}", connection.server_name().bold(), status);
            }
            Ok(())
        }
        Commands::Call { server, tool, args } => {
            let arguments = parse_arguments(args.as_deref())?;
            let selected = select(servers, Some(server.as_str()))?;
            let connected = connect_selected(registry, &selected, None, user).await?;
            let Some(connection) = connected.first() else {
                return Err(McpConnError::NotConnected(server.clone()).into());
            };

            let response = connection.call_tool(tool, arguments).await?;
            let text = response.text();
            if response.is_error.unwrap_or(false) {
                eprintln!("{}", text.red());
                return Err(McpConnError::Rpc {
                    code: 0,
                    message: format!("tool {tool} reported an error"),
                }
                .into());
            }
            match response.structured_content {
                Some(structured) if text.is_empty() => {
                    println!("{}", serde_json::to_string_pretty(&structured)?)
                }
                _ => println!("{}", text),
            }
            Ok(())
        }
    }
}

fn select(
    servers: &BTreeMap<String, ServerConfig>,
    name: Option<&str>,
) -> Result<BTreeMap<String, ServerConfig>> {
    match name {
        None => Ok(servers.clone()),
        Some(name) => {
            let config = servers
                .get(name)
                .ok_or_else(|| McpConnError::Config(format!("Unknown server: {}", name)))?;
            Ok(BTreeMap::from([(name.to_string(), config.clone())]))
        }
    }
}

fn parse_arguments(raw: Option<&str>) -> Result<Option<serde_json::Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| McpConnError::Config(format!("Invalid --args JSON: {}", e)))?;
    if !value.is_object() {
        return Err(McpConnError::Config("--args must be a JSON object".to_string()).into());
    }
    Ok(Some(value))
}

async fn connect(
    registry: &ConnectionRegistry,
    servers: &BTreeMap<String, ServerConfig>,
    user: Option<&str>,
) -> Vec<(Arc<Connection>, std::result::Result<(), McpConnError>)> {
    let outcomes: ConnectOutcomes = match user {
        Some(user) => registry.initialize_user_connections(user, servers).await,
        None => registry.connect_global(servers).await,
    };
    outcomes
        .into_iter()
        .filter_map(|(name, outcome)| registry.get(&name, user).map(|c| (c, outcome)))
        .collect()
}

/// Connected servers only; failures are reported on stderr.
async fn connect_selected(
    registry: &ConnectionRegistry,
    servers: &BTreeMap<String, ServerConfig>,
    name: Option<&str>,
    user: Option<&str>,
) -> Result<Vec<Arc<Connection>>> {
    let selected = select(servers, name)?;
    let mut connected = Vec::new();
    for (connection, outcome) in connect(registry, &selected, user).await {
        match outcome {
            Ok(()) => connected.push(connection),
            Err(e) => eprintln!(
                "{} {}: {}",
                "warning:".yellow(),
                connection.server_name(),
                e
            ),
        }
    }
    if connected.is_empty() && !selected.is_empty() {
        let names: Vec<&str> = selected.keys().map(String::as_str).collect();
        return Err(McpConnError::NotConnected(names.join(", ")).into());
    }
    Ok(connected)
}

fn print_servers(connected: &[(Arc<Connection>, std::result::Result<(), McpConnError>)]) {
    if connected.is_empty() {
        println!("No servers configured");
        return;
    }
    println!(
        "{:<24} {:<16} {}",
        "Server".bold(),
        "Transport".bold(),
        "State".bold()
    );
    for (connection, outcome) in connected {
        let transport = connection
            .config()
            .transport_kind()
            .map(|k| k.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let state = match outcome {
            Ok(()) => connection.state().to_string().green(),
            Err(e) => format!("{} ({})", connection.state(), e).red(),
        };
        println!("{:<24} {:<16} {}", connection.server_name(), transport, state);
    }
}

fn print_header(connection: &Connection, count: usize, what: &str) {
    println!(
        "{} {}",
        connection.server_name().bold(),
        format!("({} {})", count, what).dimmed()
    );
}
