//! Routes JSON-RPC messages to MCP handlers. Transports only hand it text or
//! parsed values plus the connection's [`Session`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use rmcp::model::{
    AnnotateAble, CallToolResult, Content, ErrorData, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, RawResource, ReadResourceResult, ResourceContents,
    ServerResult,
};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::executor::ProcessRunner;
use crate::protocol::{self, Message, Response};
use crate::registry::SharedRegistry;
use crate::session::Session;
use crate::tools;

const RESOURCE_MIME_TYPE: &str = "application/json";

const RESOURCES: &[(&str, &str, &str)] = &[
    ("config://main", "Server configuration", "Active tool settings with secrets redacted"),
    ("version://info", "Version information", "Server name, version and protocol"),
    ("tools://list", "Available tools", "Names of the registered MCP tools"),
];

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<SharedRegistry>,
    runner: ProcessRunner,
}

impl Dispatcher {
    pub fn new(registry: Arc<SharedRegistry>, runner: ProcessRunner) -> Self {
        Self { registry, runner }
    }

    pub fn registry(&self) -> &Arc<SharedRegistry> {
        &self.registry
    }

    /// Handle one raw frame. `None` means nothing goes back on the wire.
    pub async fn handle_text(&self, session: &mut Session, text: &str) -> Option<Response> {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.handle_value(session, value).await,
            Err(e) => {
                warn!(session = session.id(), error = %e, "unparseable message");
                Some(protocol::parse_error(e))
            }
        }
    }

    pub async fn handle_value(&self, session: &mut Session, value: Value) -> Option<Response> {
        let message = match protocol::parse_message(value) {
            Ok(message) => message,
            Err((id, err)) => return Some(protocol::failure(id, err)),
        };
        let notification = message.is_notification();
        let id = message.id.clone().unwrap_or_default();
        let method = message.method.clone().unwrap_or_default();
        let result = guarded(self.route(session, message)).await;

        // Notifications are processed but never answered.
        if notification {
            if let Err(err) = &result {
                debug!(session = session.id(), method, error = %err.message, "notification failed");
            }
            return None;
        }
        Some(match result {
            Ok(result) => protocol::success(id, result),
            Err(err) => protocol::failure(id, err),
        })
    }

    async fn route(
        &self,
        session: &mut Session,
        message: Message,
    ) -> Result<ServerResult, ErrorData> {
        let method = message.method.as_deref().unwrap_or_default();
        debug!(session = session.id(), transport = %session.transport(), method, "dispatch");
        match method {
            "initialize" => Ok(initialize(session, &message.params).into()),
            "tools/list" => Ok(self.list_tools().await.into()),
            "tools/call" => self.call_tool(&message.params).await.map(Into::into),
            "resources/list" => Ok(list_resources().into()),
            "resources/read" => self.read_resource(&message.params).await.map(Into::into),
            "prompts/list" => Ok(ListPromptsResult::default().into()),
            "ping" => Ok(ServerResult::empty(())),
            "notifications/initialized" => {
                debug!(session = session.id(), "client initialized");
                Ok(ServerResult::empty(()))
            }
            "notifications/cancelled" => {
                // Commands are not interrupted; they finish or hit their timeout.
                let request_id = message.params.get("requestId").cloned().unwrap_or_default();
                info!(session = session.id(), request_id = %request_id, "cancellation requested");
                Ok(ServerResult::empty(()))
            }
            other => Err(protocol::method_not_found(other)),
        }
    }

    async fn list_tools(&self) -> ListToolsResult {
        let registry = self.registry.snapshot().await;
        ListToolsResult::with_all_items(registry.tools())
    }

    async fn call_tool(&self, params: &Value) -> Result<CallToolResult, ErrorData> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| protocol::invalid_params("Missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        // One snapshot for both steps so a reload cannot split them.
        let (call, invocation) = {
            let registry = self.registry.snapshot().await;
            let call = registry.validate(name, arguments).map_err(|e| {
                warn!(tool = name, error = %e, "rejected tool call");
                ErrorData::from(e)
            })?;
            let invocation = registry.build(&call);
            (call, invocation)
        };

        info!(tool = call.kind.name(), "calling tool");
        let started = Instant::now();
        let value = tools::execute(invocation, &call.options, &self.runner).await;
        let success = value.get("success").and_then(Value::as_bool);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(tool = name, success, elapsed_ms, "tool finished");

        let text = serde_json::to_string_pretty(&value)
            .map_err(|e| protocol::internal_error(format!("Failed to encode result: {e}")))?;
        let content = vec![Content::text(text)];
        Ok(match success {
            Some(false) => CallToolResult::error(content),
            _ => CallToolResult::success(content),
        })
    }

    async fn read_resource(&self, params: &Value) -> Result<ReadResourceResult, ErrorData> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| protocol::invalid_params("Missing resource uri"))?;
        let registry = self.registry.snapshot().await;
        let body = match uri {
            "config://main" => serde_json::to_value(registry.settings())
                .map_err(|e| protocol::internal_error(e.to_string()))?,
            "version://info" => json!({
                "server": protocol::server_info(),
                "protocolVersion": protocol::PROTOCOL_VERSION,
                "dryRun": self.runner.is_dry_run(),
            }),
            "tools://list" => json!({ "tools": registry.names() }),
            other => return Err(protocol::internal_error(format!("Unknown resource: {other}"))),
        };
        let text = serde_json::to_string_pretty(&body)
            .map_err(|e| protocol::internal_error(e.to_string()))?;
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::TextResourceContents {
                uri: uri.to_string(),
                mime_type: Some(RESOURCE_MIME_TYPE.to_string()),
                text,
                meta: None,
            }],
        })
    }
}

fn initialize(session: &mut Session, params: &Value) -> InitializeResult {
    let result = protocol::initialize_result();
    session.initialize(
        params.get("clientInfo").cloned(),
        params.get("capabilities").cloned(),
        protocol::capability_names(&result.capabilities),
    );

    let client = session
        .client_info()
        .and_then(|info| info.get("name"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let client_capabilities: Vec<&str> = session
        .client_capabilities()
        .and_then(Value::as_object)
        .map(|caps| caps.keys().map(String::as_str).collect())
        .unwrap_or_default();
    info!(session = session.id(), client, ?client_capabilities, "session initialized");
    result
}

fn list_resources() -> ListResourcesResult {
    let resources = RESOURCES
        .iter()
        .map(|(uri, name, description)| {
            RawResource {
                uri: uri.to_string(),
                name: name.to_string(),
                title: None,
                description: Some(description.to_string()),
                mime_type: Some(RESOURCE_MIME_TYPE.to_string()),
                size: None,
                icons: None,
            }
            .no_annotation()
        })
        .collect();
    ListResourcesResult::with_all_items(resources)
}

/// A panicking handler becomes `-32603` instead of taking the connection down.
async fn guarded<F>(handler: F) -> Result<ServerResult, ErrorData>
where
    F: Future<Output = Result<ServerResult, ErrorData>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            error!(reason, "handler panicked");
            Err(protocol::internal_error(format!("Internal error: {reason}")))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
