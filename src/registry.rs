use std::sync::Arc;

use rmcp::model::Tool;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::ToolSettings;
use crate::error::ToolError;
use crate::tools::cli::{self, CliCatalog};
use crate::tools::{
    flux, git, health, kubectl, sops, ExecutionContext, Invocation, ToolArgs, ToolCall, ToolKind,
};

/// A registered tool: what `tools/list` reports plus the kind that runs it.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub kind: ToolKind,
    pub tool: Tool,
}

impl ToolDescriptor {
    fn new(kind: ToolKind) -> Self {
        Self {
            kind,
            tool: Tool::new(kind.name(), kind.description(), kind.input_schema()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Immutable set of tools built from one [`ToolSettings`] value.
#[derive(Debug)]
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    settings: Arc<ToolSettings>,
    catalog: CliCatalog,
}

impl ToolRegistry {
    pub fn new(settings: ToolSettings) -> Self {
        let descriptors = ToolKind::ALL
            .into_iter()
            .filter(|kind| !settings.is_disabled(kind.name()))
            .map(ToolDescriptor::new)
            .collect();
        let catalog = CliCatalog::from_settings(&settings);
        Self {
            descriptors,
            settings: Arc::new(settings),
            catalog,
        }
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.iter().map(ToolDescriptor::name).collect()
    }

    /// The `tools/list` entries, in registration order.
    pub fn tools(&self) -> Vec<Tool> {
        self.descriptors.iter().map(|d| d.tool.clone()).collect()
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &CliCatalog {
        &self.catalog
    }

    pub fn lookup(&self, name: &str) -> Option<&ToolDescriptor> {
        let kind = ToolKind::from_name(name)?;
        self.descriptors.iter().find(|d| d.kind == kind)
    }

    /// Resolve, deserialize and validate a call against this registry.
    pub fn validate(&self, name: &str, arguments: Value) -> Result<ToolCall, ToolError> {
        let descriptor = self
            .lookup(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let call = descriptor.kind.parse(arguments)?;
        if let ToolArgs::CliTool(req) = &call.args {
            self.catalog.check(&req.tool)?;
        }
        Ok(call)
    }

    /// Turn a validated call into an invocation. Pure: nothing is spawned or read.
    pub fn build(&self, call: &ToolCall) -> Invocation {
        let ctx = ExecutionContext::new(&self.settings, &call.options);
        match &call.args {
            ToolArgs::KubectlGet(req) => kubectl::get(req, &ctx),
            ToolArgs::KubectlDescribe(req) => kubectl::describe(req, &ctx),
            ToolArgs::KubectlLogs(req) => kubectl::logs(req, &ctx),
            ToolArgs::FluxStatus(req) => flux::status(req, &ctx),
            ToolArgs::GitStatus(req) => git::status(req, &ctx),
            ToolArgs::CliTool(req) => cli::tool(req, &ctx),
            ToolArgs::HealthCheck(req) => health::check(req, &ctx),
            ToolArgs::GitPull(req) => git::pull(req, &ctx),
            ToolArgs::GitCommit(req) => git::commit(req, &ctx),
            ToolArgs::GitPush(req) => git::push(req, &ctx),
            ToolArgs::Sops(req) => sops::invocation(req, &ctx),
        }
    }
}

/// The live registry. Readers take an `Arc` snapshot; reload swaps the whole thing.
#[derive(Debug)]
pub struct SharedRegistry {
    current: RwLock<Arc<ToolRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub async fn snapshot(&self) -> Arc<ToolRegistry> {
        Arc::clone(&*self.current.read().await)
    }

    pub async fn replace(&self, registry: ToolRegistry) -> Arc<ToolRegistry> {
        let registry = Arc::new(registry);
        *self.current.write().await = Arc::clone(&registry);
        registry
    }

    /// Build a registry from `settings` and make it current.
    pub async fn reload(&self, settings: ToolSettings) -> Arc<ToolRegistry> {
        let registry = self.replace(ToolRegistry::new(settings)).await;
        info!(
            tools = registry.descriptors().len(),
            cli_tools = registry.catalog().names().len(),
            "tool registry reloaded"
        );
        registry
    }
}
