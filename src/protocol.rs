//! JSON-RPC 2.0 envelopes as spoken by MCP clients.

use rmcp::model::{
    ErrorCode, ErrorData, Implementation, InitializeResult, PromptsCapability, ProtocolVersion,
    ResourcesCapability, ServerCapabilities, ServerResult, ToolsCapability,
};
use serde::Serialize;
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion::V_2024_11_05;

const ENCODE_FAILURE: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Failed to encode response"}}"#;

pub fn server_info() -> Implementation {
    Implementation {
        name: env!("CARGO_PKG_NAME").to_string(),
        title: None,
        version: env!("CARGO_PKG_VERSION").to_string(),
        icons: None,
        website_url: None,
    }
}

pub fn capabilities() -> ServerCapabilities {
    ServerCapabilities {
        tools: Some(ToolsCapability {
            list_changed: Some(false),
        }),
        resources: Some(ResourcesCapability {
            subscribe: Some(false),
            list_changed: Some(false),
        }),
        prompts: Some(PromptsCapability::default()),
        ..ServerCapabilities::default()
    }
}

/// Names of the capability groups the server advertises, in wire order.
pub fn capability_names(capabilities: &ServerCapabilities) -> Vec<String> {
    [
        ("tools", capabilities.tools.is_some()),
        ("resources", capabilities.resources.is_some()),
        ("prompts", capabilities.prompts.is_some()),
        ("logging", capabilities.logging.is_some()),
        ("completions", capabilities.completions.is_some()),
    ]
    .into_iter()
    .filter(|(_, advertised)| *advertised)
    .map(|(name, _)| name.to_string())
    .collect()
}

pub fn initialize_result() -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION,
        capabilities: capabilities(),
        server_info: server_info(),
        instructions: None,
    }
}

/// A message that passed envelope validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// `None` marks a notification.
    pub id: Option<Value>,
    pub method: Option<String>,
    pub params: Value,
}

impl Message {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// One reply frame. `id` stays a raw value because parse errors answer with `null`.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    jsonrpc: &'static str,
    pub id: Value,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(ServerResult),
    Error(ErrorData),
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    /// Wire text of the frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| ENCODE_FAILURE.to_string())
    }
}

/// Envelope checks that come before routing. On failure, returns the id to
/// answer with (`null` when none could be recovered) and the error.
pub fn parse_message(value: Value) -> Result<Message, (Value, ErrorData)> {
    let Value::Object(mut object) = value else {
        return Err((Value::Null, invalid_request("Invalid Request")));
    };
    let id = object.remove("id");
    let reply_id = id.clone().unwrap_or(Value::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err((reply_id, invalid_request("Invalid Request: jsonrpc must be \"2.0\"")));
    }
    let method = match object.remove("method") {
        None => None,
        Some(Value::String(method)) => Some(method),
        Some(_) => {
            return Err((reply_id, invalid_request("Invalid Request: method must be a string")))
        }
    };
    if method.is_none() && id.is_none() {
        return Err((reply_id, invalid_request("Invalid Request: missing method and id")));
    }
    let params = match object.remove("params") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(params) => params,
    };
    Ok(Message { id, method, params })
}

pub fn success(id: Value, result: impl Into<ServerResult>) -> Response {
    Response {
        jsonrpc: JSONRPC_VERSION,
        id,
        outcome: Outcome::Result(result.into()),
    }
}

pub fn failure(id: Value, error: ErrorData) -> Response {
    Response {
        jsonrpc: JSONRPC_VERSION,
        id,
        outcome: Outcome::Error(error),
    }
}

pub fn parse_error(detail: impl std::fmt::Display) -> Response {
    failure(
        Value::Null,
        ErrorData::new(ErrorCode::PARSE_ERROR, format!("Parse error: {detail}"), None),
    )
}

pub fn invalid_request(message: impl Into<String>) -> ErrorData {
    ErrorData::new(ErrorCode::INVALID_REQUEST, message.into(), None)
}

pub fn method_not_found(method: &str) -> ErrorData {
    ErrorData::new(ErrorCode::METHOD_NOT_FOUND, format!("Method not found: {method}"), None)
}

pub fn invalid_params(message: impl Into<String>) -> ErrorData {
    ErrorData::new(ErrorCode::INVALID_PARAMS, message.into(), None)
}

pub fn internal_error(message: impl Into<String>) -> ErrorData {
    ErrorData::new(ErrorCode::INTERNAL_ERROR, message.into(), None)
}
