//! Stdio tool server used by the integration tests
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and writes one
//! diagnostic line to stderr on startup.
//!
//! # Handled Methods
//!
//! - `initialize`, `ping`
//! - `tools/list` -- `echo`, `env` and `notify`
//! - `tools/call`
//!   - `echo` returns `arguments.text`
//!   - `env` returns the value of the environment variable `arguments.name`
//!   - `notify` first sends `notifications/resources/list_changed`
//! - `resources/list` -- one resource, `file:///readme`
//! - `prompts/list` -- one prompt, `greet`
//! - anything else -- `-32601 Method not found`

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

type Reply = Result<Value, (i64, String)>;

fn main() {
    eprintln!("mcp_test_server: ready");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let _ = write_line(&mut out, &error(&Value::Null, -32700, "Parse error"));
                continue;
            }
        };

        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let Some(id) = request.get("id").cloned() else {
            // Notifications need no answer.
            continue;
        };
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        if method == "tools/call" && params["name"] == "notify" {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "notifications/resources/list_changed"
            });
            if write_line(&mut out, &notification).is_err() {
                break;
            }
        }

        let response = match dispatch(method, &params) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => error(&id, code, &message),
        };
        if write_line(&mut out, &response).is_err() {
            break;
        }
    }
}

fn dispatch(method: &str, params: &Value) -> Reply {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "listChanged": true },
                "prompts": {}
            },
            "serverInfo": { "name": "mcp-test-server", "version": "0.1.0" }
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Echoes input",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "text": { "type": "string" } }
                    }
                },
                {
                    "name": "env",
                    "description": "Reads an environment variable",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "name": { "type": "string" } }
                    }
                },
                {
                    "name": "notify",
                    "description": "Announces a resource list change",
                    "inputSchema": { "type": "object" }
                }
            ]
        })),
        "tools/call" => call_tool(params),
        "resources/list" => Ok(json!({
            "resources": [
                { "uri": "file:///readme", "name": "readme", "mimeType": "text/plain" }
            ]
        })),
        "prompts/list" => Ok(json!({
            "prompts": [
                {
                    "name": "greet",
                    "description": "Say hello",
                    "arguments": [{ "name": "who", "required": true }]
                }
            ]
        })),
        other => Err((-32601, format!("Method not found: {}", other))),
    }
}

fn call_tool(params: &Value) -> Reply {
    let arguments = &params["arguments"];
    let text = match params["name"].as_str().unwrap_or("") {
        "echo" => arguments["text"].as_str().unwrap_or("").to_string(),
        "env" => {
            let name = arguments["name"].as_str().unwrap_or("");
            std::env::var(name).unwrap_or_default()
        }
        "notify" => "notified".to_string(),
        other => return Err((-32602, format!("Unknown tool: {}", other))),
    };
    Ok(json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false
    }))
}

fn error(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn write_line(out: &mut impl Write, value: &Value) -> io::Result<()> {
    writeln!(out, "{}", value)?;
    out.flush()
}
