pub mod cli;
pub mod flux;
pub mod git;
pub mod health;
pub mod kubectl;
pub mod sops;

use std::collections::BTreeMap;
use std::time::Duration;

use rmcp::model::JsonObject;
use rmcp::schemars::{self, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::ToolSettings;
use crate::error::ToolError;
use crate::executor::{Command, ExecutionResult, ProcessRunner};
use crate::request::{OutputOptions, ToolRequest};
use crate::security::{validate_argument, validate_flag_name, Validatable, ValidationError};

/// Extra options passed straight through to a CLI, e.g. `{"all-namespaces": true}`.
pub type Flags = BTreeMap<String, Value>;

/// What a command is built from: the active settings and the per-call timeout.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub settings: &'a ToolSettings,
    pub timeout: Duration,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(settings: &'a ToolSettings, options: &OutputOptions) -> Self {
        Self {
            settings,
            timeout: options.timeout(settings.command_timeout),
        }
    }

    pub fn command(&self, program: &str) -> Command {
        self.settings.command(program).timeout(self.timeout)
    }
}

/// Every tool the server exposes over MCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    KubectlGet,
    KubectlDescribe,
    KubectlLogs,
    FluxStatus,
    GitStatus,
    CliTool,
    HealthCheck,
    GitPull,
    GitCommit,
    GitPush,
    Sops,
}

impl ToolKind {
    pub const ALL: [ToolKind; 11] = [
        ToolKind::KubectlGet,
        ToolKind::KubectlDescribe,
        ToolKind::KubectlLogs,
        ToolKind::FluxStatus,
        ToolKind::GitStatus,
        ToolKind::CliTool,
        ToolKind::HealthCheck,
        ToolKind::GitPull,
        ToolKind::GitCommit,
        ToolKind::GitPush,
        ToolKind::Sops,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ToolKind::KubectlGet => "kubectl_get",
            ToolKind::KubectlDescribe => "kubectl_describe",
            ToolKind::KubectlLogs => "kubectl_logs",
            ToolKind::FluxStatus => "flux_status",
            ToolKind::GitStatus => "git_status",
            ToolKind::CliTool => "cli_tool",
            ToolKind::HealthCheck => "health_check",
            ToolKind::GitPull => "git_pull",
            ToolKind::GitCommit => "git_commit",
            ToolKind::GitPush => "git_push",
            ToolKind::Sops => "sops",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            ToolKind::KubectlGet => "Execute kubectl get commands",
            ToolKind::KubectlDescribe => "Execute kubectl describe commands",
            ToolKind::KubectlLogs => "Get pod logs",
            ToolKind::FluxStatus => "Get Flux GitOps status",
            ToolKind::GitStatus => "Get git repository status",
            ToolKind::CliTool => "Execute CLI tools (jq, grep, sed, etc.)",
            ToolKind::HealthCheck => "Check system and service health",
            ToolKind::GitPull => "Pull latest changes from the Kubernetes Git repository",
            ToolKind::GitCommit => "Commit changes to the Kubernetes Git repository",
            ToolKind::GitPush => "Push changes to the Kubernetes Git repository",
            ToolKind::Sops => "Encrypt or decrypt secrets with SOPS using the configured AGE key",
        }
    }

    pub fn input_schema(self) -> JsonObject {
        match self {
            ToolKind::KubectlGet => schema::<kubectl::GetRequest>(),
            ToolKind::KubectlDescribe => schema::<kubectl::DescribeRequest>(),
            ToolKind::KubectlLogs => schema::<kubectl::LogsRequest>(),
            ToolKind::FluxStatus => schema::<flux::StatusRequest>(),
            ToolKind::GitStatus => schema::<git::StatusRequest>(),
            ToolKind::CliTool => schema::<cli::CliToolRequest>(),
            ToolKind::HealthCheck => schema::<health::HealthCheckRequest>(),
            ToolKind::GitPull => schema::<git::PullRequest>(),
            ToolKind::GitCommit => schema::<git::CommitRequest>(),
            ToolKind::GitPush => schema::<git::PushRequest>(),
            ToolKind::Sops => schema::<sops::SopsRequest>(),
        }
    }

    /// Deserialize and validate `arguments` in one step.
    pub fn parse(self, arguments: Value) -> Result<ToolCall, ToolError> {
        let (options, args) = match self {
            ToolKind::KubectlGet => split(parse(self, arguments)?, ToolArgs::KubectlGet),
            ToolKind::KubectlDescribe => split(parse(self, arguments)?, ToolArgs::KubectlDescribe),
            ToolKind::KubectlLogs => split(parse(self, arguments)?, ToolArgs::KubectlLogs),
            ToolKind::FluxStatus => split(parse(self, arguments)?, ToolArgs::FluxStatus),
            ToolKind::GitStatus => split(parse(self, arguments)?, ToolArgs::GitStatus),
            ToolKind::CliTool => split(parse(self, arguments)?, ToolArgs::CliTool),
            ToolKind::HealthCheck => split(parse(self, arguments)?, ToolArgs::HealthCheck),
            ToolKind::GitPull => split(parse(self, arguments)?, ToolArgs::GitPull),
            ToolKind::GitCommit => split(parse(self, arguments)?, ToolArgs::GitCommit),
            ToolKind::GitPush => split(parse(self, arguments)?, ToolArgs::GitPush),
            ToolKind::Sops => split(parse(self, arguments)?, ToolArgs::Sops),
        };
        Ok(ToolCall {
            kind: self,
            options,
            args,
        })
    }
}

/// Flattened JSON schema of a tool's request, with the root `$schema`/`title` noise removed.
fn schema<T: JsonSchema>() -> JsonObject {
    let schema = schemars::schema_for!(ToolRequest<T>);
    let mut object = match serde_json::to_value(schema) {
        Ok(Value::Object(object)) => object,
        _ => JsonObject::from_iter([("type".to_string(), json!("object"))]),
    };
    object.remove("$schema");
    object.remove("title");
    object
}

fn parse<T>(kind: ToolKind, arguments: Value) -> Result<ToolRequest<T>, ToolError>
where
    T: DeserializeOwned + Validatable,
{
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    let request: ToolRequest<T> =
        serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
            tool: kind.name().to_string(),
            message: e.to_string(),
        })?;
    request.validate()?;
    Ok(request)
}

fn split<T>(request: ToolRequest<T>, wrap: fn(T) -> ToolArgs) -> (OutputOptions, ToolArgs) {
    (request.options, wrap(request.inner))
}

/// A validated `tools/call`.
#[derive(Debug)]
pub struct ToolCall {
    pub kind: ToolKind,
    pub options: OutputOptions,
    pub args: ToolArgs,
}

#[derive(Debug)]
pub enum ToolArgs {
    KubectlGet(kubectl::GetRequest),
    KubectlDescribe(kubectl::DescribeRequest),
    KubectlLogs(kubectl::LogsRequest),
    FluxStatus(flux::StatusRequest),
    GitStatus(git::StatusRequest),
    CliTool(cli::CliToolRequest),
    HealthCheck(health::HealthCheckRequest),
    GitPull(git::PullRequest),
    GitCommit(git::CommitRequest),
    GitPush(git::PushRequest),
    Sops(sops::SopsRequest),
}

/// What a validated call turns into. Building one performs no I/O.
#[derive(Debug)]
pub enum Invocation {
    Command { command: Command, parse_json: bool },
    Git(git::GitWorkflow),
    Service(health::ServiceCheck),
    SelfCheck,
    Sops(sops::SopsInvocation),
}

impl Invocation {
    pub fn command(command: Command) -> Self {
        Invocation::Command {
            command,
            parse_json: false,
        }
    }
}

/// Run an invocation. Failures come back as `success: false` in the value.
pub async fn execute(
    invocation: Invocation,
    options: &OutputOptions,
    runner: &ProcessRunner,
) -> Value {
    match invocation {
        Invocation::Command {
            command,
            parse_json,
        } => {
            let result = runner.run(&command).await;
            command_output(&result, options, parse_json)
        }
        Invocation::Git(workflow) => workflow.run(runner).await,
        Invocation::Service(check) => check.run(runner).await,
        Invocation::SelfCheck => health::self_check(),
        Invocation::Sops(sops) => sops.run(runner, options).await,
    }
}

/// Wire form of a single command's result with output shaping applied to stdout.
pub fn command_output(
    result: &ExecutionResult,
    options: &OutputOptions,
    parse_json: bool,
) -> Value {
    let mut value = result.to_json();
    if parse_json && result.succeeded() {
        let stdout = result.stdout_text();
        value["data"] = serde_json::from_str(&stdout).unwrap_or(Value::String(stdout));
    }
    if options.shapes_output() {
        value["stdout"] = Value::String(options.transform_output(&result.stdout_text()));
    }
    value
}

pub fn validate_flags(flags: &Flags) -> Result<(), ValidationError> {
    for (name, value) in flags {
        validate_flag_name(name)?;
        match value {
            Value::String(s) => validate_argument("flags", s)?,
            Value::Bool(_) | Value::Number(_) | Value::Null => {}
            Value::Array(_) | Value::Object(_) => {
                return Err(ValidationError::NotAllowed(format!(
                    "flag '{name}' must be a string, number or boolean"
                )))
            }
        }
    }
    Ok(())
}

/// `true` becomes a bare switch, `false`/`null` are dropped, anything else is
/// passed as the following argument.
pub fn flags_to_args(prefix: &str, flags: &Flags) -> Vec<String> {
    let mut args = Vec::new();
    for (name, value) in flags {
        match value {
            Value::Bool(false) | Value::Null => {}
            Value::Bool(true) => args.push(format!("{prefix}{name}")),
            Value::String(s) => args.extend([format!("{prefix}{name}"), s.clone()]),
            other => args.extend([format!("{prefix}{name}"), other.to_string()]),
        }
    }
    args
}
