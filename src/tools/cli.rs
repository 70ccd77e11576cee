use std::collections::BTreeMap;

use rmcp::schemars;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{command_output, flags_to_args, validate_flags, ExecutionContext, Flags, Invocation};
use crate::config::ToolSettings;
use crate::executor::{Command, ProcessRunner};
use crate::request::OutputOptions;
use crate::security::{validate_argument, Validatable, ValidationError};

/// Every CLI the server knows how to run, with its category.
/// Interactive pagers and TUIs are left out since they need a terminal.
const CATALOG: &[(&str, &str)] = &[
    ("sed", "text"),
    ("curl", "network"),
    ("cat", "text"),
    ("tree", "filesystem"),
    ("find", "filesystem"),
    ("grep", "text"),
    ("awk", "text"),
    ("sort", "text"),
    ("uniq", "text"),
    ("wc", "text"),
    ("head", "text"),
    ("tail", "text"),
    ("jq", "json"),
    ("yq", "yaml"),
    ("base64", "encoding"),
    ("tr", "text"),
    ("cut", "text"),
    ("paste", "text"),
    ("diff", "text"),
    ("tar", "archive"),
    ("gzip", "archive"),
    ("ps", "system"),
    ("top", "system"),
    ("df", "system"),
    ("du", "system"),
    ("free", "system"),
    ("netstat", "network"),
    ("ss", "network"),
    ("lsof", "system"),
    ("tcpdump", "network"),
    ("ping", "network"),
    ("nslookup", "network"),
    ("dig", "network"),
    ("age", "security"),
    ("kustomize", "kubernetes"),
    ("helm", "kubernetes"),
    ("kubectx", "kubernetes"),
    ("kubens", "kubernetes"),
];

/// The CLI tools enabled by the current settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliCatalog {
    active: BTreeMap<&'static str, &'static str>,
}

impl CliCatalog {
    /// Explicitly disabled and blocked tools are always excluded; explicitly
    /// enabled tools are always included; the rest follow their category.
    pub fn from_settings(settings: &ToolSettings) -> Self {
        let all_categories = listed(&settings.enabled_categories, "all");
        let active = CATALOG
            .iter()
            .filter(|(name, _)| !listed(&settings.disabled_tools, name))
            .filter(|(name, _)| !listed(&settings.blocked_commands, name))
            .filter(|(name, category)| {
                listed(&settings.enabled_tools, name)
                    || all_categories
                    || listed(&settings.enabled_categories, category)
            })
            .map(|(name, category)| (*name, *category))
            .collect();
        Self { active }
    }

    pub fn contains(&self, tool: &str) -> bool {
        self.active.contains_key(tool)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.active.keys().copied().collect()
    }

    pub fn check(&self, tool: &str) -> Result<(), ValidationError> {
        if self.contains(tool) {
            Ok(())
        } else {
            Err(ValidationError::NotAllowed(format!(
                "Unknown CLI tool: {}. Available tools: {}",
                tool,
                self.names().join(", ")
            )))
        }
    }

    /// Every category in the catalog, sorted.
    pub fn categories() -> Vec<&'static str> {
        let mut categories: Vec<&str> = CATALOG.iter().map(|(_, category)| *category).collect();
        categories.sort_unstable();
        categories.dedup();
        categories
    }

    /// Body of `GET /cli/tools`
    pub fn to_json(&self) -> Value {
        let available: BTreeMap<&str, &str> = CATALOG.iter().copied().collect();
        json!({
            "active_tools": self.names(),
            "available_tools": available,
            "categories": Self::categories(),
        })
    }
}

fn listed(list: &[String], name: &str) -> bool {
    list.iter().any(|entry| entry == name)
}

/// Request parameters for cli_tool
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CliToolRequest {
    /// CLI tool name (jq, grep, sed, curl, etc.)
    pub tool: String,
    /// Command line arguments
    #[serde(default)]
    pub args: Vec<String>,
    /// Input data to process, written to the tool's stdin
    #[serde(default)]
    pub input: Option<String>,
}

/// Arguments given either as a list or as one whitespace-separated line.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArgList {
    List(Vec<String>),
    Line(String),
}

impl Default for ArgList {
    fn default() -> Self {
        ArgList::List(Vec::new())
    }
}

impl ArgList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ArgList::List(args) => args.clone(),
            ArgList::Line(line) => line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// Body of `POST /cli/{tool}`
#[derive(Debug, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub args: ArgList,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub flags: Flags,
}

/// Body of `POST /cli/chain`
#[derive(Debug, Deserialize)]
pub struct ChainRequest {
    pub commands: Vec<ChainStep>,
}

#[derive(Debug, Deserialize)]
pub struct ChainStep {
    pub tool: String,
    #[serde(default)]
    pub args: ArgList,
    #[serde(default)]
    pub input: Option<String>,
}

/// No shell is involved, so arguments may start with '-'. NUL can't be passed to exec.
fn validate_cli_args(args: &[String]) -> Result<(), ValidationError> {
    match args.iter().find(|arg| arg.contains('\0')) {
        Some(arg) => Err(ValidationError::InvalidCharacters {
            field: "args",
            value: arg.escape_default().to_string(),
        }),
        None => Ok(()),
    }
}

impl Validatable for CliToolRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_argument("tool", &self.tool)?;
        validate_cli_args(&self.args)
    }
}

impl RunRequest {
    pub fn validate_for(&self, tool: &str, catalog: &CliCatalog) -> Result<(), ValidationError> {
        catalog.check(tool)?;
        validate_cli_args(&self.args.to_vec())?;
        if let Some(cwd) = &self.cwd {
            validate_argument("cwd", cwd)?;
        }
        validate_flags(&self.flags)
    }
}

impl ChainRequest {
    pub fn validate_for(&self, catalog: &CliCatalog) -> Result<(), ValidationError> {
        if self.commands.is_empty() {
            return Err(ValidationError::Empty("commands"));
        }
        for step in &self.commands {
            catalog.check(&step.tool)?;
            validate_cli_args(&step.args.to_vec())?;
        }
        Ok(())
    }
}

fn with_input(cmd: Command, input: Option<&str>) -> Command {
    match input {
        Some(input) => cmd.stdin(input),
        None => cmd,
    }
}

pub fn tool(req: &CliToolRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let cmd = ctx.command(&req.tool).args(req.args.iter().cloned());
    Invocation::command(with_input(cmd, req.input.as_deref()))
}

/// `POST /cli/{tool}`: single-dash flags follow the positional arguments.
pub fn run(tool: &str, req: &RunRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let mut cmd = ctx
        .command(tool)
        .args(req.args.to_vec())
        .args(flags_to_args("-", &req.flags));
    if let Some(cwd) = &req.cwd {
        cmd = cmd.working_dir(cwd);
    }
    Invocation::command(with_input(cmd, req.input.as_deref()))
}

/// Run the steps in order, feeding each step's stdout to the next one's stdin.
/// Stops at the first failing step.
pub async fn chain(
    req: &ChainRequest,
    ctx: &ExecutionContext<'_>,
    runner: &ProcessRunner,
) -> Value {
    let options = OutputOptions::default();
    let mut results = Vec::with_capacity(req.commands.len());
    let mut piped: Option<String> = None;

    for (index, step) in req.commands.iter().enumerate() {
        let input = piped.take().or_else(|| step.input.clone());
        let cmd = with_input(ctx.command(&step.tool).args(step.args.to_vec()), input.as_deref());
        let result = runner.run(&cmd).await;
        results.push(command_output(&result, &options, false));

        if !result.succeeded() {
            return json!({
                "success": false,
                "error": format!("Command {index} failed: {}", result.stderr_text()),
                "results": results,
            });
        }
        piped = Some(result.stdout_text());
    }

    json!({
        "success": true,
        "results": results,
        "final_output": piped.unwrap_or_default(),
    })
}
