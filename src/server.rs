use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigLoader, ToolSettings};
use crate::dispatcher::Dispatcher;
use crate::executor::ProcessRunner;
use crate::protocol;
use crate::registry::{SharedRegistry, ToolRegistry};
use crate::rest;
use crate::session::{Session, Transport};

/// Everything the handlers share. One per process.
#[derive(Debug)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub registry: Arc<SharedRegistry>,
    pub runner: ProcessRunner,
    pub loader: ConfigLoader,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Loads the config file once and builds the initial registry from it.
    pub async fn load(loader: ConfigLoader, runner: ProcessRunner) -> Result<Self, ConfigError> {
        let settings = loader.load().await?;
        Ok(Self::with_settings(loader, settings, runner))
    }

    pub fn with_settings(
        loader: ConfigLoader,
        settings: ToolSettings,
        runner: ProcessRunner,
    ) -> Self {
        let registry = Arc::new(SharedRegistry::new(ToolRegistry::new(settings)));
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&registry), runner.clone()),
            registry,
            runner,
            loader,
        }
    }

    /// Re-read the config file and swap in a fresh registry. On error the
    /// current registry stays in place.
    pub async fn reload(&self) -> Result<Arc<ToolRegistry>, ConfigError> {
        let settings = self.loader.load().await?;
        Ok(self.registry.reload(settings).await)
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/mcp", get(mcp_ws))
        .route("/mcp/http", post(mcp_http))
        .merge(rest::routes())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: SharedState) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutting down");
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "protocol": "MCP",
        "server_info": protocol::server_info(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn mcp_ws(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One session per connection. Frames are handled strictly in order.
async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    let mut session = Session::new(Transport::WebSocket);
    info!(session = session.id(), "websocket session opened");

    while let Some(frame) = socket.recv().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = state.dispatcher.handle_text(&mut session, text.as_str()).await;
                let Some(response) = reply else {
                    continue;
                };
                if let Err(e) = socket.send(Message::Text(response.encode().into())).await {
                    debug!(session = session.id(), error = %e, "send failed");
                    break;
                }
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                warn!(session = session.id(), "binary frame, closing");
                break;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(session = session.id(), error = %e, "websocket error");
                break;
            }
        }
    }
    info!(session = session.id(), "websocket session closed");
}

async fn mcp_http(State(state): State<SharedState>, body: Bytes) -> Response {
    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => return (StatusCode::BAD_REQUEST, Json(protocol::parse_error(e))).into_response(),
    };
    let mut session = Session::stateless();
    match state.dispatcher.handle_value(&mut session, value).await {
        Some(response) => Json(response).into_response(),
        None => Json(json!({ "status": "notification_processed" })).into_response(),
    }
}

/// Newline-delimited JSON-RPC on stdin/stdout. Logs stay on stderr.
pub async fn serve_stdio(state: SharedState) -> std::io::Result<()> {
    info!("serving MCP on stdio");
    serve_lines(
        &state.dispatcher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

async fn serve_lines<R, W>(dispatcher: &Dispatcher, reader: R, mut writer: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut session = Session::new(Transport::Stdio);
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = dispatcher.handle_text(&mut session, &line).await {
            let mut out = response.encode();
            out.push('\n');
            writer.write_all(out.as_bytes()).await?;
            writer.flush().await?;
        }
    }
    debug!(session = session.id(), "stdin closed");
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_state(dry_run: bool) -> SharedState {
    test_state_with(ToolSettings::default(), dry_run)
}

#[cfg(test)]
pub(crate) fn test_state_with(settings: ToolSettings, dry_run: bool) -> SharedState {
    let loader = ConfigLoader::new(settings.clone(), "/nonexistent/config.yaml");
    Arc::new(AppState::with_settings(loader, settings, ProcessRunner::new(dry_run, 4)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use futures_util::{SinkExt, StreamExt};
    use http_body_util::BodyExt;
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = router(test_state(true))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["protocol"], "MCP");
        assert_eq!(json["server_info"]["name"], "ai-sre-mcp-server");
    }

    #[tokio::test]
    async fn test_http_rpc() {
        let response = router(test_state(true))
            .oneshot(post_json(
                "/mcp/http",
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["id"], 1);
        assert_eq!(json["result"]["tools"].as_array().unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_http_malformed_json() {
        let response = router(test_state(true))
            .oneshot(post_json("/mcp/http", "{oops"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_http_notification() {
        let response = router(test_state(true))
            .oneshot(post_json(
                "/mcp/http",
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "status": "notification_processed" })
        );
    }

    #[tokio::test]
    async fn test_stdio_lines() {
        let state = test_state(true);
        let input = concat!(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            "\n\n",
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            "\n",
            "not json\n",
        );
        let mut output = Vec::new();
        serve_lines(&state.dispatcher, input.as_bytes(), &mut output)
            .await
            .unwrap();

        let responses: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["result"], json!({}));
        assert_eq!(responses[1]["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_websocket_survives_parse_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(test_state(true));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/mcp"))
            .await
            .unwrap();

        async fn next_json(
            ws: &mut tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        ) -> Value {
            let frame = ws.next().await.unwrap().unwrap();
            serde_json::from_str(frame.to_text().unwrap()).unwrap()
        }

        ws.send(tungstenite::Message::text("{this is not json"))
            .await
            .unwrap();
        let response = next_json(&mut ws).await;
        assert_eq!(response["error"]["code"], -32700);
        assert_eq!(response["id"], Value::Null);

        let initialize = json!({
            "jsonrpc": "2.0",
            "id": "init",
            "method": "initialize",
            "params": { "clientInfo": { "name": "t" } }
        });
        ws.send(tungstenite::Message::text(initialize.to_string()))
        .await
        .unwrap();
        let response = next_json(&mut ws).await;
        assert_eq!(response["id"], "init");
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");

        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":2,"method":"bogus"}"#,
        ))
        .await
        .unwrap();
        let response = next_json(&mut ws).await;
        assert_eq!(response["id"], 2);
        assert_eq!(response["error"]["code"], -32601);

        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"format_disk"}}"#,
        ))
        .await
        .unwrap();
        let response = next_json(&mut ws).await;
        assert_eq!(response["id"], 3);
        assert_eq!(response["error"]["code"], -32603);
        assert_eq!(response["error"]["message"], "Unknown tool: format_disk");

        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/list"}"#,
        ))
        .await
        .unwrap();
        let response = next_json(&mut ws).await;
        assert_eq!(response["id"], 4);
        assert_eq!(response["result"]["tools"].as_array().unwrap().len(), 11);
    }

    #[tokio::test]
    async fn test_websocket_binary_frame_ends_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(test_state(true));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/mcp"))
            .await
            .unwrap();
        ws.send(tungstenite::Message::text(
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
        ))
        .await
        .unwrap();
        let frame = ws.next().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert_eq!(response["result"], json!({}));

        ws.send(tungstenite::Message::binary(vec![0x7b, 0x7d]))
            .await
            .unwrap();
        // The server drops the socket; no reply frame may arrive.
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("server should close the connection");
        match next {
            None | Some(Err(_)) | Some(Ok(tungstenite::Message::Close(_))) => {}
            Some(Ok(other)) => panic!("unexpected frame after binary: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reload_keeps_registry_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "tools:\n  disabled_tools: [sops]\n").unwrap();
        let loader = ConfigLoader::new(ToolSettings::default(), &path);
        let state = AppState::load(loader, ProcessRunner::new(true, 1)).await.unwrap();
        assert!(state.registry.snapshot().await.lookup("sops").is_none());

        std::fs::write(&path, "tools: [unclosed\n").unwrap();
        assert!(state.reload().await.is_err());
        assert!(state.registry.snapshot().await.lookup("sops").is_none());

        std::fs::write(&path, "").unwrap();
        let registry = state.reload().await.unwrap();
        assert!(registry.lookup("sops").is_some());
    }
}
