use std::fs;
use std::path::PathBuf;

use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::{Request, Respond, ResponseTemplate};

use mcpconn::config::ServerConfig;

/// Path to the `mcp_test_server` helper binary.
#[allow(dead_code)]
pub fn test_server_exe() -> PathBuf {
    if let Ok(p) = std::env::var("CARGO_BIN_EXE_mcp_test_server") {
        return PathBuf::from(p);
    }
    if let Ok(manifest) = std::env::var("CARGO_MANIFEST_DIR") {
        let debug = PathBuf::from(manifest)
            .join("target")
            .join("debug")
            .join("mcp_test_server");
        if debug.exists() {
            return debug;
        }
    }
    PathBuf::from("mcp_test_server")
}

/// Stdio server config launching the helper binary.
#[allow(dead_code)]
pub fn stdio_server() -> ServerConfig {
    ServerConfig::stdio(test_server_exe().to_string_lossy(), Vec::new())
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("mcpconn.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Answers MCP JSON-RPC posts the way a streamable HTTP tool server does.
///
/// Requests get a JSON body echoing their id; notifications get `202`.
#[derive(Debug, Clone, Copy, Default)]
pub struct McpResponder;

impl Respond for McpResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let Ok(body) = serde_json::from_slice::<Value>(&request.body) else {
            return ResponseTemplate::new(400);
        };
        let Some(id) = body.get("id").cloned() else {
            return ResponseTemplate::new(202);
        };
        let result = match body["method"].as_str().unwrap_or("") {
            "initialize" => json!({
                "protocolVersion": "2025-03-26",
                "capabilities": { "tools": {} },
                "serverInfo": { "name": "wiremock-server", "version": "1.0.0" }
            }),
            "ping" => json!({}),
            "tools/list" => json!({
                "tools": [{ "name": "search", "inputSchema": { "type": "object" } }]
            }),
            "tools/call" => json!({
                "content": [{ "type": "text", "text": "found" }]
            }),
            other => {
                let reply = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": format!("Method not found: {}", other) }
                });
                return ResponseTemplate::new(200).set_body_json(reply);
            }
        };
        ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
    }
}
