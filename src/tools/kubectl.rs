use rmcp::schemars;
use serde::Deserialize;

use super::{flags_to_args, validate_flags, ExecutionContext, Flags, Invocation};
use crate::executor::Command;
use crate::security::{validate_kube_name, Validatable, ValidationError};

/// Output formats kubectl understands for `-o`
const OUTPUT_FORMATS: &[&str] = &["json", "yaml", "wide", "name"];

/// Actions reachable through the REST mapping
const ALLOWED_ACTIONS: &[&str] = &[
    "get",
    "describe",
    "logs",
    "top",
    "events",
    "explain",
    "api-resources",
    "rollout",
    "version",
    "cluster-info",
];

/// Request parameters for kubectl_get
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct GetRequest {
    /// Kubernetes resource type (pods, nodes, services, etc.)
    pub resource: String,
    /// Kubernetes namespace (default: configured namespace)
    #[serde(default)]
    pub namespace: Option<String>,
    /// Specific resource name (optional)
    #[serde(default)]
    pub name: Option<String>,
    /// Output format (json, yaml, wide, name)
    #[serde(default = "default_output")]
    pub output: String,
}

fn default_output() -> String {
    "json".to_string()
}

/// Request parameters for kubectl_describe
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct DescribeRequest {
    /// Kubernetes resource type
    pub resource: String,
    /// Resource name
    pub name: String,
    /// Kubernetes namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Request parameters for kubectl_logs
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LogsRequest {
    /// Pod name
    pub pod: String,
    /// Kubernetes namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Container name (optional)
    #[serde(default)]
    pub container: Option<String>,
    /// Number of lines to retrieve
    #[serde(default = "default_lines")]
    pub lines: u32,
}

fn default_lines() -> u32 {
    100
}

/// Body of `POST /kubectl/{action}`
#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub flags: Flags,
}

fn validate_namespace(namespace: Option<&str>) -> Result<(), ValidationError> {
    namespace.map_or(Ok(()), |ns| validate_kube_name("namespace", ns))
}

fn validate_output(output: &str) -> Result<(), ValidationError> {
    if OUTPUT_FORMATS.contains(&output) {
        Ok(())
    } else {
        Err(ValidationError::NotAllowed(format!(
            "Output format '{}' is not allowed. Allowed formats: {}",
            output,
            OUTPUT_FORMATS.join(", ")
        )))
    }
}

impl Validatable for GetRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_kube_name("resource", &self.resource)?;
        validate_namespace(self.namespace.as_deref())?;
        if let Some(name) = &self.name {
            validate_kube_name("name", name)?;
        }
        validate_output(&self.output)
    }
}

impl Validatable for DescribeRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_kube_name("resource", &self.resource)?;
        validate_kube_name("name", &self.name)?;
        validate_namespace(self.namespace.as_deref())
    }
}

impl Validatable for LogsRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_kube_name("pod", &self.pod)?;
        validate_namespace(self.namespace.as_deref())?;
        if let Some(container) = &self.container {
            validate_kube_name("container", container)?;
        }
        Ok(())
    }
}

impl ActionRequest {
    pub fn validate_for(&self, action: &str) -> Result<(), ValidationError> {
        if !ALLOWED_ACTIONS.contains(&action) {
            return Err(ValidationError::NotAllowed(format!(
                "kubectl action '{}' is not allowed. Allowed actions: {}",
                action,
                ALLOWED_ACTIONS.join(", ")
            )));
        }
        if let Some(resource) = &self.resource {
            validate_kube_name("resource", resource)?;
        }
        if let Some(name) = &self.name {
            validate_kube_name("name", name)?;
        }
        validate_namespace(self.namespace.as_deref())?;
        if let Some(output) = &self.output {
            validate_output(output)?;
        }
        validate_flags(&self.flags)
    }
}

/// `kubectl [--context C] <subcommand>`
fn kubectl(ctx: &ExecutionContext<'_>, subcommand: &str) -> Command {
    let cmd = ctx.command("kubectl");
    let cmd = match &ctx.settings.kube_context {
        Some(context) => cmd.args(["--context", context.as_str()]),
        None => cmd,
    };
    cmd.arg(subcommand)
}

fn namespace<'a>(ctx: &'a ExecutionContext<'_>, requested: Option<&'a str>) -> &'a str {
    requested.unwrap_or(ctx.settings.kube_namespace.as_str())
}

pub fn get(req: &GetRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let mut cmd = kubectl(ctx, "get")
        .args(["-n", namespace(ctx, req.namespace.as_deref())])
        .arg(&req.resource);
    if let Some(name) = &req.name {
        cmd = cmd.arg(name);
    }
    Invocation::Command {
        command: cmd.args(["-o", req.output.as_str()]),
        parse_json: req.output == "json",
    }
}

pub fn describe(req: &DescribeRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let cmd = kubectl(ctx, "describe")
        .args(["-n", namespace(ctx, req.namespace.as_deref())])
        .args([req.resource.as_str(), req.name.as_str()]);
    Invocation::command(cmd)
}

pub fn logs(req: &LogsRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let mut cmd = kubectl(ctx, "logs")
        .args(["-n", namespace(ctx, req.namespace.as_deref())])
        .args(["--tail".to_string(), req.lines.to_string()]);
    if let Some(container) = &req.container {
        cmd = cmd.args(["-c", container.as_str()]);
    }
    Invocation::command(cmd.arg(&req.pod))
}

/// `kubectl version --client`: needs the binary and kubeconfig parsing, not the cluster.
pub fn client_version(ctx: &ExecutionContext<'_>) -> Command {
    kubectl(ctx, "version").arg("--client")
}

/// Generic action used by the REST mapping. Validate with [`ActionRequest::validate_for`] first.
pub fn action(action: &str, req: &ActionRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let mut cmd = kubectl(ctx, action);
    if let Some(resource) = &req.resource {
        cmd = cmd.arg(resource);
    }
    if let Some(name) = &req.name {
        cmd = cmd.arg(name);
    }
    if !matches!(action, "version" | "cluster-info" | "api-resources" | "explain") {
        cmd = cmd.args(["-n", namespace(ctx, req.namespace.as_deref())]);
    }
    if let Some(output) = &req.output {
        cmd = cmd.args(["-o", output.as_str()]);
    }
    Invocation::Command {
        command: cmd.args(flags_to_args("--", &req.flags)),
        parse_json: req.output.as_deref() == Some("json"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSettings;
    use crate::request::OutputOptions;
    use serde_json::json;
    use std::time::Duration;

    fn argv(invocation: &Invocation) -> Vec<String> {
        match invocation {
            Invocation::Command { command, .. } => command.argv().to_vec(),
            other => panic!("expected a command, got {other:?}"),
        }
    }

    fn settings() -> ToolSettings {
        ToolSettings {
            kube_namespace: "monitoring".to_string(),
            ..ToolSettings::default()
        }
    }

    #[test]
    fn test_client_version_keeps_context() {
        let settings = ToolSettings {
            kube_context: Some("staging".to_string()),
            ..ToolSettings::default()
        };
        let ctx = ExecutionContext::new(&settings, &OutputOptions::default());
        assert_eq!(
            client_version(&ctx).argv(),
            ["kubectl", "--context", "staging", "version", "--client"]
        );
    }

    #[test]
    fn test_get_defaults() {
        let settings = settings();
        let ctx = ExecutionContext::new(&settings, &OutputOptions::default());
        let req: GetRequest = serde_json::from_value(json!({ "resource": "pods" })).unwrap();
        assert!(req.validate().is_ok());

        let invocation = get(&req, &ctx);
        assert_eq!(
            argv(&invocation),
            vec!["kubectl", "get", "-n", "monitoring", "pods", "-o", "json"]
        );
        assert!(matches!(invocation, Invocation::Command { parse_json: true, .. }));
    }

    #[test]
    fn test_get_with_context_and_name() {
        let settings = ToolSettings {
            kube_context: Some("prod".to_string()),
            ..settings()
        };
        let ctx = ExecutionContext::new(&settings, &OutputOptions::default());
        let req = GetRequest {
            resource: "deployments".to_string(),
            namespace: Some("web".to_string()),
            name: Some("frontend".to_string()),
            output: "wide".to_string(),
        };
        let invocation = get(&req, &ctx);
        assert_eq!(
            argv(&invocation),
            vec![
                "kubectl",
                "--context",
                "prod",
                "get",
                "-n",
                "web",
                "deployments",
                "frontend",
                "-o",
                "wide"
            ]
        );
        assert!(matches!(invocation, Invocation::Command { parse_json: false, .. }));
    }

    #[test]
    fn test_get_rejects_unknown_output() {
        let req: GetRequest =
            serde_json::from_value(json!({ "resource": "pods", "output": "go-template" })).unwrap();
        assert!(matches!(req.validate(), Err(ValidationError::NotAllowed(_))));
    }

    #[test]
    fn test_describe() {
        let settings = settings();
        let ctx = ExecutionContext::new(&settings, &OutputOptions::default());
        let req = DescribeRequest {
            resource: "pod".to_string(),
            name: "api-0".to_string(),
            namespace: None,
        };
        assert_eq!(
            argv(&describe(&req, &ctx)),
            vec!["kubectl", "describe", "-n", "monitoring", "pod", "api-0"]
        );
    }

    #[test]
    fn test_logs_with_container_and_timeout() {
        let settings = settings();
        let options = OutputOptions {
            timeout_ms: Some(1500),
            ..OutputOptions::default()
        };
        let ctx = ExecutionContext::new(&settings, &options);
        let req: LogsRequest = serde_json::from_value(json!({
            "pod": "api-0",
            "container": "sidecar",
            "lines": 20
        }))
        .unwrap();
        let invocation = logs(&req, &ctx);
        assert_eq!(
            argv(&invocation),
            vec!["kubectl", "logs", "-n", "monitoring", "--tail", "20", "-c", "sidecar", "api-0"]
        );
        let Invocation::Command { command, .. } = invocation else {
            unreachable!()
        };
        assert_eq!(command.time_limit(), Duration::from_millis(1500));
    }

    #[test]
    fn test_logs_default_lines() {
        let req: LogsRequest = serde_json::from_value(json!({ "pod": "api-0" })).unwrap();
        assert_eq!(req.lines, 100);
    }

    #[test]
    fn test_logs_rejects_flag_as_pod() {
        let req: LogsRequest =
            serde_json::from_value(json!({ "pod": "--all-containers" })).unwrap();
        assert!(matches!(
            req.validate(),
            Err(ValidationError::FlagInjection { field: "pod", .. })
        ));
    }

    #[test]
    fn test_action_with_flags() {
        let settings = settings();
        let ctx = ExecutionContext::new(&settings, &OutputOptions::default());
        let req: ActionRequest = serde_json::from_value(json!({
            "resource": "pods",
            "flags": { "all-namespaces": true, "selector": "app=api" }
        }))
        .unwrap();
        assert!(req.validate_for("get").is_ok());
        assert_eq!(
            argv(&action("get", &req, &ctx)),
            vec![
                "kubectl",
                "get",
                "pods",
                "-n",
                "monitoring",
                "--all-namespaces",
                "--selector",
                "app=api"
            ]
        );
    }

    #[test]
    fn test_action_not_allowed() {
        let req = ActionRequest::default();
        assert!(req.validate_for("delete").is_err());
        assert!(req.validate_for("exec").is_err());
        assert!(req.validate_for("version").is_ok());
    }

    #[test]
    fn test_action_version_has_no_namespace() {
        let settings = settings();
        let ctx = ExecutionContext::new(&settings, &OutputOptions::default());
        assert_eq!(
            argv(&action("version", &ActionRequest::default(), &ctx)),
            vec!["kubectl", "version"]
        );
    }
}
