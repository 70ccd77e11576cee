use rmcp::schemars;
use serde::Deserialize;

use super::{flags_to_args, validate_flags, ExecutionContext, Flags, Invocation};
use crate::security::{validate_kube_name, Validatable, ValidationError};

/// Read-only flux subcommands reachable through the REST mapping
const ALLOWED_ACTIONS: &[&str] = &["get", "check", "stats", "tree", "events", "logs", "version"];

/// Request parameters for flux_status
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StatusRequest {
    /// Flux namespace (default: configured flux namespace)
    #[serde(default)]
    pub namespace: Option<String>,
    /// Flux resource type (sources, kustomizations, etc.)
    #[serde(default = "default_resource")]
    pub resource: String,
}

fn default_resource() -> String {
    "all".to_string()
}

/// Body of `POST /flux/{action}`
#[derive(Debug, Default, Deserialize)]
pub struct ActionRequest {
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub flags: Flags,
}

impl Validatable for StatusRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_kube_name("resource", &self.resource)?;
        if let Some(namespace) = &self.namespace {
            validate_kube_name("namespace", namespace)?;
        }
        Ok(())
    }
}

impl ActionRequest {
    pub fn validate_for(&self, action: &str) -> Result<(), ValidationError> {
        if !ALLOWED_ACTIONS.contains(&action) {
            return Err(ValidationError::NotAllowed(format!(
                "flux action '{}' is not allowed. Allowed actions: {}",
                action,
                ALLOWED_ACTIONS.join(", ")
            )));
        }
        for (field, value) in [
            ("resource", &self.resource),
            ("name", &self.name),
            ("namespace", &self.namespace),
        ] {
            if let Some(value) = value {
                validate_kube_name(field, value)?;
            }
        }
        validate_flags(&self.flags)
    }
}

pub fn status(req: &StatusRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let namespace = req
        .namespace
        .as_deref()
        .unwrap_or(ctx.settings.flux_namespace.as_str());
    let cmd = ctx
        .command("flux")
        .args(["get", "-n", namespace, req.resource.as_str()]);
    Invocation::command(cmd)
}

/// Generic action used by the REST mapping. Validate with [`ActionRequest::validate_for`] first.
pub fn action(action: &str, req: &ActionRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let mut cmd = ctx.command("flux").arg(action);
    if let Some(resource) = &req.resource {
        cmd = cmd.arg(resource);
    }
    if let Some(name) = &req.name {
        cmd = cmd.arg(name);
    }
    let namespace = req
        .namespace
        .as_deref()
        .unwrap_or(ctx.settings.flux_namespace.as_str());
    Invocation::command(cmd.args(["-n", namespace]).args(flags_to_args("--", &req.flags)))
}
