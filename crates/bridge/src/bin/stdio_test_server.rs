//! Minimal MCP stdio server used only for bridge integration tests.
//!
//! This intentionally does not depend on the bridge's production code paths;
//! it speaks JSON-RPC over stdio directly (one JSON message per line).

use serde_json::json;
use std::io::{BufRead as _, Write};

fn main() -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout().lock();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if let Some(resp) = handle_line(&line) {
            write_json_line(&mut stdout, &resp)?;
        }
    }

    Ok(())
}

fn handle_line(line: &str) -> Option<serde_json::Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let msg: serde_json::Value = serde_json::from_str(line).ok()?;
    handle_message(&msg)
}

fn handle_message(msg: &serde_json::Value) -> Option<serde_json::Value> {
    let method = msg.get("method").and_then(serde_json::Value::as_str)?;

    // Ignore notifications (no `id`).
    let id = msg.get("id")?.clone();

    match method {
        "initialize" => {
            let result = initialize_result(msg);
            Some(jsonrpc_ok(&id, &result))
        }
        "ping" => Some(jsonrpc_ok(&id, &json!({}))),
        "tools/list" => Some(jsonrpc_ok(&id, &tools_list_result())),
        "tools/call" => match tools_call_result(msg) {
            Ok(result) => Some(jsonrpc_ok(&id, &result)),
            Err(error) => Some(jsonrpc_err(&id, &error)),
        },
        _ => {
            let error = json!({ "code": -32601, "message": "method not found" });
            Some(jsonrpc_err(&id, &error))
        }
    }
}

fn initialize_result(msg: &serde_json::Value) -> serde_json::Value {
    let protocol_version = msg
        .get("params")
        .and_then(|p| p.get("protocolVersion"))
        .and_then(serde_json::Value::as_str)
        .unwrap_or("2024-11-05")
        .to_string();

    json!({
        "protocolVersion": protocol_version,
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "bridge-stdio-test-server", "version": "0" }
    })
}

fn tools_list_result() -> serde_json::Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echo the call arguments back as JSON",
                "inputSchema": { "type": "object" }
            },
            {
                "name": "create_issue",
                "description": "Pretend to create an issue",
                "inputSchema": {
                    "type": "object",
                    "properties": { "title": { "type": "string" } },
                    "required": ["title"]
                }
            }
        ]
    })
}

fn tools_call_result(
    msg: &serde_json::Value,
) -> Result<serde_json::Value, serde_json::Value> {
    let params = msg.get("params").cloned().unwrap_or_default();
    let name = params
        .get("name")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let body = match name {
        "echo" => json!({ "echo": arguments }),
        "create_issue" => {
            let title = arguments
                .get("title")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            json!({ "created": title })
        }
        _ => return Err(json!({ "code": -32601, "message": "unknown tool" })),
    };

    Ok(json!({
        "content": [{ "type": "text", "text": body.to_string() }]
    }))
}

fn jsonrpc_ok(id: &serde_json::Value, result: &serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn jsonrpc_err(id: &serde_json::Value, error: &serde_json::Value) -> serde_json::Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn write_json_line(stdout: &mut dyn Write, v: &serde_json::Value) -> anyhow::Result<()> {
    writeln!(stdout, "{}", serde_json::to_string(v)?)?;
    stdout.flush()?;
    Ok(())
}
