use rmcp::schemars;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ExecutionContext, Invocation};
use crate::executor::{Command, ProcessRunner};
use crate::protocol::server_info;
use crate::security::{validate_host, Validatable, ValidationError};

/// Request parameters for health_check
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct HealthCheckRequest {
    /// Service name to check (optional). Without it the server reports on itself.
    #[serde(default)]
    pub service: Option<String>,
}

impl Validatable for HealthCheckRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        match &self.service {
            Some(service) => validate_host("service", service),
            None => Ok(()),
        }
    }
}

/// An HTTP status check of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCheck {
    service: String,
    url: String,
    command: Command,
}

impl ServiceCheck {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn run(self, runner: &ProcessRunner) -> Value {
        let result = runner.run(&self.command).await;
        let code = result.stdout_text().trim().to_string();
        let healthy = result.succeeded() && code.len() == 3 && code.starts_with('2');
        json!({
            "service": self.service,
            "url": self.url,
            "status": if healthy { "healthy" } else { "unhealthy" },
            "response_code": code,
        })
    }
}

pub fn check(req: &HealthCheckRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    match &req.service {
        Some(service) => Invocation::Service(service_check(service, ctx)),
        None => Invocation::SelfCheck,
    }
}

/// Status check of `service`, resolved through the configured `services` map.
pub fn service_check(service: &str, ctx: &ExecutionContext<'_>) -> ServiceCheck {
    let url = match ctx.settings.services.get(service) {
        Some(url) => url.clone(),
        None if service.contains(':') => format!("http://{service}/health"),
        None => format!("http://{service}:8080/health"),
    };
    let max_time = ctx.timeout.as_secs().max(1).to_string();
    let command = ctx
        .command("curl")
        .args(["-s", "-o", "/dev/null", "-w", "%{http_code}", "--max-time"])
        .args([max_time, url.clone()]);
    ServiceCheck {
        service: service.to_string(),
        url,
        command,
    }
}

/// The server's own health, no process involved.
pub fn self_check() -> Value {
    json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "server": server_info(),
    })
}
