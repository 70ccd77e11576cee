//! Plain HTTP endpoints over the same execution layer the MCP tools use.
//!
//! Command failures still answer 200 with `success: false` in `result`;
//! only rejected input maps to an error status.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::HttpError;
use crate::executor::Command;
use crate::protocol;
use crate::request::OutputOptions;
use crate::server::SharedState;
use crate::tools::cli::CliCatalog;
use crate::tools::{self, cli, flux, git, health, kubectl, ExecutionContext};

/// CLI tools whose `--version` output `/version` reports when they are active.
const VERSIONED_CLI_TOOLS: &[&str] = &["curl", "jq", "yq", "tree"];

/// Environment variables whose names contain any of these are never echoed.
const SENSITIVE_ENV_MARKERS: &[&str] = &["PASSWORD", "SECRET", "TOKEN", "KEY", "CREDENTIAL"];

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/ready", get(ready))
        .route("/version", get(version))
        .route("/env", get(environment))
        .route("/kubectl/{action}", post(kubectl_action))
        .route("/flux/{action}", post(flux_action))
        .route("/git/{action}", post(git_action))
        .route("/cli/tools", get(cli_tools))
        .route("/cli/chain", post(cli_chain))
        .route("/cli/{tool}", post(cli_run))
        .route("/config", get(config))
        .route("/config/reload", post(reload_config))
        .route("/config/tools", get(config_tools))
        .route("/services", get(services))
        .route("/services/{service}", get(service_health))
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// An empty body counts as `{}`.
fn parse_body(body: &Bytes) -> Result<Value, HttpError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| HttpError::BadRequest(format!("Invalid JSON body: {e}")))
}

fn decode<T: DeserializeOwned>(parameters: &Value) -> Result<T, HttpError> {
    serde_json::from_value(parameters.clone()).map_err(|e| HttpError::BadRequest(e.to_string()))
}

fn envelope(
    command: &str,
    key: &str,
    name: &str,
    parameters: Value,
    result: Value,
) -> Json<Value> {
    let mut body = json!({
        "command": command,
        "parameters": parameters,
        "result": result,
        "timestamp": timestamp(),
    });
    body[key] = json!(name);
    Json(body)
}

/// Ready once `kubectl` can be run at all; the cluster itself is not contacted.
async fn ready(State(state): State<SharedState>) -> (StatusCode, Json<Value>) {
    let command = {
        let registry = state.registry.snapshot().await;
        let options = OutputOptions::default();
        kubectl::client_version(&ExecutionContext::new(registry.settings(), &options))
    };
    let result = state.runner.run(&command).await;
    if result.succeeded() {
        return (
            StatusCode::OK,
            Json(json!({ "status": "ready", "timestamp": timestamp() })),
        );
    }
    let error = result.stderr_text();
    warn!(exit_code = result.exit_code(), %error, "readiness check failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": "not ready", "error": error, "timestamp": timestamp() })),
    )
}

/// Client versions of the wrapped CLIs. A tool that fails to report is left out.
async fn version(State(state): State<SharedState>) -> Json<Value> {
    let registry = state.registry.snapshot().await;
    let options = OutputOptions::default();
    let ctx = ExecutionContext::new(registry.settings(), &options);

    let mut commands: Vec<(&str, Command)> = vec![
        ("kubectl", kubectl::client_version(&ctx).args(["-o", "json"])),
        ("flux", ctx.command("flux").args(["version", "--client"])),
        ("git", ctx.command("git").arg("--version")),
    ];
    commands.extend(
        VERSIONED_CLI_TOOLS
            .iter()
            .filter(|tool| registry.catalog().contains(tool))
            .map(|tool| (*tool, ctx.command(tool).arg("--version"))),
    );

    let results = join_all(commands.iter().map(|(_, cmd)| state.runner.run(cmd))).await;
    let mut versions = Map::new();
    for ((name, _), result) in commands.iter().zip(results) {
        if !result.succeeded() {
            continue;
        }
        let stdout = result.stdout_text();
        let stdout = stdout.trim();
        let reported: Value = serde_json::from_str(stdout).unwrap_or_else(|_| json!(stdout));
        versions.insert(name.to_string(), reported);
    }

    let server = protocol::server_info();
    Json(json!({
        "service": server.name,
        "version": server.version,
        "protocol_version": protocol::PROTOCOL_VERSION,
        "tools": versions,
        "cli_tools_count": registry.catalog().names().len(),
        "service_endpoints_count": registry.settings().services.len(),
        "dry_run": state.runner.is_dry_run(),
        "timestamp": timestamp(),
    }))
}

fn is_sensitive(name: &str) -> bool {
    let name = name.to_ascii_uppercase();
    SENSITIVE_ENV_MARKERS.iter().any(|marker| name.contains(marker))
}

async fn environment(State(state): State<SharedState>) -> Json<Value> {
    let variables: BTreeMap<String, String> = std::env::vars()
        .filter(|(name, _)| !is_sensitive(name))
        .collect();
    let registry = state.registry.snapshot().await;
    Json(json!({
        "environment_variables": variables,
        "service_endpoints": registry.settings().services,
        "cli_tools": registry.catalog().names(),
        "timestamp": timestamp(),
    }))
}

async fn kubectl_action(
    State(state): State<SharedState>,
    Path(action): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let parameters = parse_body(&body)?;
    let req: kubectl::ActionRequest = decode(&parameters)?;
    req.validate_for(&action)?;

    let options = OutputOptions::default();
    let invocation = {
        let registry = state.registry.snapshot().await;
        kubectl::action(&action, &req, &ExecutionContext::new(registry.settings(), &options))
    };
    let result = tools::execute(invocation, &options, &state.runner).await;
    Ok(envelope("kubectl", "action", &action, parameters, result))
}

async fn flux_action(
    State(state): State<SharedState>,
    Path(action): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let parameters = parse_body(&body)?;
    let req: flux::ActionRequest = decode(&parameters)?;
    req.validate_for(&action)?;

    let options = OutputOptions::default();
    let invocation = {
        let registry = state.registry.snapshot().await;
        flux::action(&action, &req, &ExecutionContext::new(registry.settings(), &options))
    };
    let result = tools::execute(invocation, &options, &state.runner).await;
    Ok(envelope("flux", "action", &action, parameters, result))
}

async fn git_action(
    State(state): State<SharedState>,
    Path(action): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let parameters = parse_body(&body)?;
    let req: git::ActionRequest = decode(&parameters)?;
    req.validate_for(&action)?;

    let options = OutputOptions::default();
    let invocation = {
        let registry = state.registry.snapshot().await;
        git::action(&action, &req, &ExecutionContext::new(registry.settings(), &options))
    };
    let result = tools::execute(invocation, &options, &state.runner).await;
    Ok(envelope("git", "action", &action, parameters, result))
}

async fn cli_run(
    State(state): State<SharedState>,
    Path(tool): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let parameters = parse_body(&body)?;
    let req: cli::RunRequest = decode(&parameters)?;

    let options = OutputOptions::default();
    let invocation = {
        let registry = state.registry.snapshot().await;
        req.validate_for(&tool, registry.catalog())?;
        cli::run(&tool, &req, &ExecutionContext::new(registry.settings(), &options))
    };
    let result = tools::execute(invocation, &options, &state.runner).await;
    Ok(envelope("cli", "tool", &tool, parameters, result))
}

async fn cli_chain(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<Value>, HttpError> {
    let parameters = parse_body(&body)?;
    let req: cli::ChainRequest = decode(&parameters)?;

    let registry = state.registry.snapshot().await;
    req.validate_for(registry.catalog())?;
    let options = OutputOptions::default();
    let ctx = ExecutionContext::new(registry.settings(), &options);
    let result = cli::chain(&req, &ctx, &state.runner).await;
    Ok(envelope("cli", "tool", "chain", parameters, result))
}

async fn cli_tools(State(state): State<SharedState>) -> Json<Value> {
    Json(state.registry.snapshot().await.catalog().to_json())
}

async fn config(State(state): State<SharedState>) -> Result<Json<Value>, HttpError> {
    let registry = state.registry.snapshot().await;
    let settings = serde_json::to_value(registry.settings())
        .map_err(|e| HttpError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "config_file": state.loader.path().display().to_string(),
        "settings": settings,
        "dry_run": state.runner.is_dry_run(),
    })))
}

async fn reload_config(State(state): State<SharedState>) -> Result<Json<Value>, HttpError> {
    let registry = state.reload().await?;
    info!(path = %state.loader.path().display(), "configuration reloaded");
    Ok(Json(json!({
        "status": "reloaded",
        "tools": registry.names(),
        "cli_tools": registry.catalog().names(),
        "timestamp": timestamp(),
    })))
}

async fn config_tools(State(state): State<SharedState>) -> Json<Value> {
    let registry = state.registry.snapshot().await;
    let settings = registry.settings();
    Json(json!({
        "tool_configuration": {
            "enabled_categories": settings.enabled_categories,
            "enabled_tools": settings.enabled_tools,
            "disabled_tools": settings.disabled_tools,
            "blocked_commands": settings.blocked_commands,
        },
        "mcp_tools": registry.names(),
        "available_categories": CliCatalog::categories(),
        "active_tools": registry.catalog().names(),
        "timestamp": timestamp(),
    }))
}

async fn services(State(state): State<SharedState>) -> Json<Value> {
    let registry = state.registry.snapshot().await;
    let services = &registry.settings().services;
    Json(json!({
        "services": services,
        "count": services.len(),
        "timestamp": timestamp(),
    }))
}

/// Only services named in the configuration can be checked here.
async fn service_health(
    State(state): State<SharedState>,
    Path(service): Path<String>,
) -> Result<Json<Value>, HttpError> {
    let check = {
        let registry = state.registry.snapshot().await;
        let settings = registry.settings();
        if !settings.services.contains_key(&service) {
            let available: Vec<&str> = settings.services.keys().map(String::as_str).collect();
            return Err(HttpError::NotFound(format!(
                "Unknown service: {}. Available services: {}",
                service,
                available.join(", ")
            )));
        }
        let options = OutputOptions::default();
        health::service_check(&service, &ExecutionContext::new(settings, &options))
    };
    info!(service = %service, url = check.url(), "checking service");
    let mut body = check.run(&state.runner).await;
    body["timestamp"] = json!(timestamp());
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSettings;
    use crate::server::{router, test_state, test_state_with};
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn post(uri: &str, body: &str) -> Response {
        router(test_state(true))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn get(uri: &str) -> Response {
        router(test_state(true))
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    fn settings_with_services() -> ToolSettings {
        let mut settings = ToolSettings::default();
        settings
            .services
            .insert("prometheus".to_string(), "http://prometheus:9090/-/healthy".to_string());
        settings
    }

    #[tokio::test]
    async fn test_ready() {
        let response = get("/ready").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ready");
    }

    #[tokio::test]
    async fn test_ready_unavailable_when_kubectl_cannot_run() {
        let settings = ToolSettings {
            workdir: std::path::PathBuf::from("/nonexistent/workdir"),
            ..ToolSettings::default()
        };
        let response = router(test_state_with(settings, false))
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "not ready");
        assert!(!json["error"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_reports_client_tools() {
        let response = get("/version").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"], "ai-sre-mcp-server");
        assert_eq!(json["protocol_version"], "2024-11-05");
        assert_eq!(json["tools"]["git"], "DRY RUN: git --version");
        assert_eq!(json["tools"]["flux"], "DRY RUN: flux version --client");
        assert_eq!(json["tools"]["kubectl"], "DRY RUN: kubectl version --client -o json");
        assert_eq!(json["tools"]["jq"], "DRY RUN: jq --version");
        assert!(json["tools"].get("helm").is_none());
    }

    #[tokio::test]
    async fn test_env_hides_sensitive_variables() {
        assert!(is_sensitive("SOPS_AGE_KEY"));
        assert!(is_sensitive("github_token"));
        assert!(!is_sensitive("KUBE_NAMESPACE"));

        let json = body_json(get("/env").await).await;
        let variables = json["environment_variables"].as_object().unwrap();
        assert!(variables.keys().all(|name| !is_sensitive(name)));
        assert!(json["cli_tools"].as_array().unwrap().iter().any(|t| t == "jq"));
    }

    #[tokio::test]
    async fn test_git_action_log() {
        let response = post("/git/log", r#"{"limit":3}"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["command"], "git");
        assert_eq!(json["action"], "log");
        assert_eq!(json["result"]["stdout"], "DRY RUN: git log --oneline -n 3");
    }

    #[tokio::test]
    async fn test_git_commit_runs_workflow() {
        let response = post("/git/commit", r#"{"message":"Bump api","all":true}"#).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["result"]["success"], true);
        assert_eq!(json["result"]["message"], "Successfully committed: Bump api");
    }

    #[tokio::test]
    async fn test_git_rejects_bad_requests() {
        let response = post("/git/commit", "").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = post("/git/clone", r#"{"repo":"https://example.com/x.git"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("not allowed"));
    }

    #[tokio::test]
    async fn test_config_tools() {
        let json = body_json(get("/config/tools").await).await;
        assert_eq!(json["tool_configuration"]["enabled_categories"], json!(["all"]));
        assert_eq!(json["mcp_tools"].as_array().unwrap().len(), 11);
        assert!(json["available_categories"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "kubernetes"));
        assert!(json["active_tools"].as_array().unwrap().iter().any(|t| t == "jq"));
    }

    #[tokio::test]
    async fn test_services_listing_and_check() {
        let state = test_state_with(settings_with_services(), true);

        let response = router(state.clone())
            .oneshot(Request::builder().uri("/services").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["services"]["prometheus"], "http://prometheus:9090/-/healthy");

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/services/prometheus")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["service"], "prometheus");
        assert_eq!(json["url"], "http://prometheus:9090/-/healthy");
        assert_eq!(json["status"], "unhealthy");
        assert!(json["timestamp"].is_string());

        let response = router(state)
            .oneshot(Request::builder().uri("/services/loki").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("prometheus"));
    }

    #[tokio::test]
    async fn test_kubectl_action_envelope() {
        let response = post(
            "/kubectl/get",
            r#"{"resource":"pods","namespace":"monitoring","flags":{"selector":"app=loki"}}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["command"], "kubectl");
        assert_eq!(json["action"], "get");
        assert_eq!(json["parameters"]["namespace"], "monitoring");
        assert_eq!(json["result"]["success"], true);
        assert!(json["result"]["stdout"]
            .as_str()
            .unwrap()
            .starts_with("DRY RUN: kubectl get"));
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_kubectl_empty_body() {
        let response = post("/kubectl/version", "").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["action"], "version");
    }

    #[tokio::test]
    async fn test_kubectl_rejects_mutating_action() {
        let response = post("/kubectl/delete", r#"{"resource":"pods","name":"api-0"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["status"], 400);
        assert!(json["error"].as_str().unwrap().contains("delete"));
    }

    #[tokio::test]
    async fn test_invalid_json_body() {
        let response = post("/flux/get", "{nope").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_flux_action() {
        let response = post("/flux/get", r#"{"resource":"kustomizations"}"#).await;
        let json = body_json(response).await;
        assert_eq!(json["command"], "flux");
        assert_eq!(
            json["result"]["stdout"],
            "DRY RUN: flux get kustomizations -n flux-system"
        );
    }

    #[tokio::test]
    async fn test_flux_rejects_mutating_action() {
        let response = post("/flux/suspend", r#"{"resource":"kustomization","name":"apps"}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("not allowed")
        );
    }

    #[tokio::test]
    async fn test_cli_run() {
        let response = post(
            "/cli/jq",
            r#"{"args":["-r",".name"],"input":"{\"name\":\"x\"}"}"#,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["tool"], "jq");
        assert_eq!(json["result"]["stdout"], "DRY RUN: jq -r .name");
    }

    #[tokio::test]
    async fn test_cli_unknown_tool() {
        let response = post("/cli/rm", r#"{"args":["-rf","/"]}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("Unknown CLI tool: rm"));
    }

    #[tokio::test]
    async fn test_cli_chain_rejects_empty() {
        let response = post("/cli/chain", r#"{"commands":[]}"#).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cli_chain_pipes_output() {
        let state = test_state(false);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/cli/chain")
                    .body(Body::from(
                        r#"{"commands":[
                            {"tool":"cat","input":"b\na\nb\n"},
                            {"tool":"sort"},
                            {"tool":"uniq"}
                        ]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["tool"], "chain");
        assert_eq!(json["result"]["success"], true);
        assert_eq!(json["result"]["final_output"], "a\nb\n");
        assert_eq!(json["result"]["results"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cli_tools_catalog() {
        let json = body_json(get("/cli/tools").await).await;
        let active = json["active_tools"].as_array().unwrap();
        assert!(active.iter().any(|t| t == "jq"));
        assert!(json["categories"].is_array());
    }

    #[tokio::test]
    async fn test_config_and_reload() {
        let state = test_state(true);

        let response = router(state.clone())
            .oneshot(Request::builder().uri("/config").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["settings"]["kube_namespace"], "default");
        assert_eq!(json["dry_run"], true);

        let response = router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/config/reload")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "reloaded");
        assert_eq!(json["tools"].as_array().unwrap().len(), 11);
    }
}
