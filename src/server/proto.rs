//! JSON-RPC 2.0 envelopes and the method surface of the tool server.

use crate::debugger::error::Error;
use crate::server::session::SessionManager;
use crate::server::tools;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PARSE_ERROR: i64 = -32700;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC request envelope.
#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// JSON-RPC response envelope.
#[derive(Debug, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }
}

/// Map a tool failure onto the wire. Every caller-visible failure carries
/// its kind tag next to the human readable message.
fn tool_failure(id: Value, e: Error) -> RpcResponse {
    let code = match e {
        Error::InvalidArguments(_) => INVALID_PARAMS,
        _ => SERVER_ERROR,
    };
    let data = json!({ "kind": e.tag() });
    RpcResponse::failure(id, code, e.to_string(), Some(data))
}

/// Handle one raw JSON-RPC request body, producing a response body.
pub fn handle_request(manager: &SessionManager, body: &[u8]) -> Vec<u8> {
    let response = match serde_json::from_slice::<RpcRequest>(body) {
        Ok(request) => dispatch(manager, request),
        Err(e) => RpcResponse::failure(Value::Null, PARSE_ERROR, format!("parse error: {e}"), None),
    };
    serde_json::to_vec(&response).expect("response serialization is infallible")
}

fn dispatch(manager: &SessionManager, request: RpcRequest) -> RpcResponse {
    debug!(target: "server", "rpc method {}", request.method);
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => RpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => RpcResponse::success(id, json!({ "tools": tools::descriptors() })),
        "tools/call" => {
            #[derive(Deserialize)]
            struct ToolCallParams {
                name: String,
                #[serde(default)]
                arguments: Value,
            }
            let params: ToolCallParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(e) => {
                    return RpcResponse::failure(
                        id,
                        INVALID_PARAMS,
                        format!("invalid params: {e}"),
                        None,
                    )
                }
            };
            match tools::call_tool(manager, &params.name, &params.arguments) {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => tool_failure(id, e),
            }
        }
        // tools are also addressable as plain methods
        name if tools::is_tool(name) => {
            match tools::call_tool(manager, name, &request.params) {
                Ok(result) => RpcResponse::success(id, result),
                Err(e) => tool_failure(id, e),
            }
        }
        other => RpcResponse::failure(
            id,
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
            None,
        ),
    }
}
