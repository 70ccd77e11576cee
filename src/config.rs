use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::executor::Command;

/// Command-line arguments. Every option can also come from the environment.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ai-sre-mcp-server",
    version,
    about = "MCP gateway for kubectl, flux, git and CLI diagnostics"
)]
pub struct Args {
    /// Address to bind the HTTP/WebSocket listener to
    #[arg(long, env = "MCP_SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "MCP_SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Optional YAML file overlaid on the environment settings
    #[arg(long, env = "CONFIG_FILE", default_value = "/app/config/config.yaml")]
    pub config: PathBuf,

    /// Log commands instead of running them
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Default working directory for spawned commands
    #[arg(long, env = "AGENT_WORKDIR", default_value = ".")]
    pub workdir: PathBuf,

    /// Default per-command timeout in seconds
    #[arg(long, env = "COMMAND_TIMEOUT", default_value_t = 60)]
    pub timeout_secs: u64,

    /// Maximum number of processes running at once
    #[arg(long, env = "MAX_CONCURRENT_COMMANDS", default_value_t = 16)]
    pub max_concurrent: usize,

    #[arg(long, env = "AGENT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Serve JSON-RPC over stdin/stdout instead of HTTP
    #[arg(long)]
    pub stdio: bool,

    #[arg(long, env = "KUBE_CONTEXT")]
    pub kube_context: Option<String>,

    #[arg(long, env = "KUBE_NAMESPACE", default_value = "default")]
    pub kube_namespace: String,

    #[arg(long, env = "FLUX_NAMESPACE", default_value = "flux-system")]
    pub flux_namespace: String,

    /// Local checkout used by the git tools
    #[arg(long, env = "K8S_REPO_PATH", default_value = "/app/k8s-repo")]
    pub repo_path: PathBuf,

    #[arg(long, env = "TOOLS_ENABLED_CATEGORIES", value_delimiter = ',', default_value = "all")]
    pub enabled_categories: Vec<String>,

    #[arg(long, env = "TOOLS_ENABLED", value_delimiter = ',')]
    pub enabled_tools: Vec<String>,

    #[arg(long, env = "TOOLS_DISABLED", value_delimiter = ',')]
    pub disabled_tools: Vec<String>,

    #[arg(long, env = "BLOCKED_COMMANDS", value_delimiter = ',')]
    pub blocked_commands: Vec<String>,

    #[arg(long, env = "SOPS_AGE_KEY", hide_env_values = true, hide = true)]
    pub sops_age_key: Option<String>,
}

/// Process-level settings that stay fixed for the lifetime of the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub dry_run: bool,
    pub max_concurrent: usize,
    pub log_level: String,
    pub stdio: bool,
}

/// Settings the tools are built from. Replaced wholesale on reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSettings {
    pub workdir: PathBuf,
    #[serde(serialize_with = "seconds")]
    pub command_timeout: Duration,
    pub kube_context: Option<String>,
    pub kube_namespace: String,
    pub flux_namespace: String,
    pub repo_path: PathBuf,
    pub enabled_categories: Vec<String>,
    pub enabled_tools: Vec<String>,
    pub disabled_tools: Vec<String>,
    pub blocked_commands: Vec<String>,
    /// Health check targets by service name
    pub services: BTreeMap<String, String>,
    #[serde(serialize_with = "redacted")]
    pub sops_age_key: Option<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            command_timeout: crate::executor::DEFAULT_TIMEOUT,
            kube_context: None,
            kube_namespace: "default".to_string(),
            flux_namespace: "flux-system".to_string(),
            repo_path: PathBuf::from("/app/k8s-repo"),
            enabled_categories: vec!["all".to_string()],
            enabled_tools: Vec::new(),
            disabled_tools: Vec::new(),
            blocked_commands: Vec::new(),
            services: BTreeMap::new(),
            sops_age_key: None,
        }
    }
}

impl ToolSettings {
    /// A command seeded with the configured working directory and timeout
    pub fn command(&self, program: &str) -> Command {
        Command::new(program)
            .working_dir(&self.workdir)
            .timeout(self.command_timeout)
    }

    pub fn is_disabled(&self, tool: &str) -> bool {
        self.disabled_tools.iter().any(|t| t == tool)
    }
}

fn seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_secs())
}

fn redacted<S: Serializer>(secret: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match secret {
        Some(_) => serializer.serialize_str("<redacted>"),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Re-reads the YAML file on top of the settings captured at startup.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base: ToolSettings,
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(base: ToolSettings, path: impl Into<PathBuf>) -> Self {
        Self {
            base,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file yields the startup settings unchanged.
    pub async fn load(&self) -> Result<ToolSettings, ConfigError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let path = self.path.display();
                tracing::debug!(%path, "no config file, using environment only");
                return Ok(self.base.clone());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if contents.trim().is_empty() {
            return Ok(self.base.clone());
        }
        let file: FileConfig =
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.apply(self.base.clone()))
    }
}

impl Args {
    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            host: self.host.clone(),
            port: self.port,
            dry_run: self.dry_run,
            max_concurrent: self.max_concurrent,
            log_level: self.log_level.clone(),
            stdio: self.stdio,
        }
    }

    pub fn tool_settings(&self) -> ToolSettings {
        ToolSettings {
            workdir: self.workdir.clone(),
            command_timeout: Duration::from_secs(self.timeout_secs),
            kube_context: self.kube_context.clone().filter(|c| !c.is_empty()),
            kube_namespace: self.kube_namespace.clone(),
            flux_namespace: self.flux_namespace.clone(),
            repo_path: self.repo_path.clone(),
            enabled_categories: non_empty(&self.enabled_categories),
            enabled_tools: non_empty(&self.enabled_tools),
            disabled_tools: non_empty(&self.disabled_tools),
            blocked_commands: non_empty(&self.blocked_commands),
            services: BTreeMap::new(),
            sops_age_key: self.sops_age_key.clone().filter(|k| !k.is_empty()),
        }
    }

    pub fn loader(&self) -> ConfigLoader {
        ConfigLoader::new(self.tool_settings(), &self.config)
    }
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

/// On-disk layout. Every field is optional and only overrides what it names.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    workdir: Option<PathBuf>,
    command_timeout: Option<u64>,
    kubernetes: KubernetesSection,
    flux: FluxSection,
    git: GitSection,
    tools: ToolsSection,
    security: SecuritySection,
    services: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KubernetesSection {
    context: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FluxSection {
    namespace: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GitSection {
    repo_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolsSection {
    enabled_categories: Option<Vec<String>>,
    enabled_tools: Option<Vec<String>>,
    disabled_tools: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SecuritySection {
    blocked_commands: Option<Vec<String>>,
}

impl FileConfig {
    fn apply(self, mut settings: ToolSettings) -> ToolSettings {
        if let Some(workdir) = self.workdir {
            settings.workdir = workdir;
        }
        if let Some(secs) = self.command_timeout {
            settings.command_timeout = Duration::from_secs(secs);
        }
        if let Some(context) = self.kubernetes.context {
            settings.kube_context = Some(context).filter(|c| !c.is_empty());
        }
        if let Some(namespace) = self.kubernetes.namespace {
            settings.kube_namespace = namespace;
        }
        if let Some(namespace) = self.flux.namespace {
            settings.flux_namespace = namespace;
        }
        if let Some(repo_path) = self.git.repo_path {
            settings.repo_path = repo_path;
        }
        if let Some(categories) = self.tools.enabled_categories {
            settings.enabled_categories = categories;
        }
        if let Some(enabled) = self.tools.enabled_tools {
            settings.enabled_tools = enabled;
        }
        if let Some(disabled) = self.tools.disabled_tools {
            settings.disabled_tools = disabled;
        }
        if let Some(blocked) = self.security.blocked_commands {
            settings.blocked_commands = blocked;
        }
        settings.services.extend(self.services);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_args_defaults() {
        let args =
            Args::try_parse_from(["ai-sre-mcp-server", "--config", "/nonexistent.yaml"]).unwrap();
        let settings = args.tool_settings();
        assert_eq!(settings.command_timeout, Duration::from_secs(args.timeout_secs));
        assert!(!settings.flux_namespace.is_empty());
        assert!(!args.stdio);
    }

    #[test]
    fn test_args_comma_separated_lists() {
        let args = Args::try_parse_from([
            "ai-sre-mcp-server",
            "--enabled-categories",
            "text,json",
            "--blocked-commands",
            "curl, ,tar",
        ])
        .unwrap();
        let settings = args.tool_settings();
        assert_eq!(settings.enabled_categories, vec!["text", "json"]);
        assert_eq!(settings.blocked_commands, vec!["curl", "tar"]);
    }

    #[tokio::test]
    async fn test_missing_file_keeps_base() {
        let loader = ConfigLoader::new(ToolSettings::default(), "/nonexistent/config.yaml");
        assert_eq!(loader.load().await.unwrap(), ToolSettings::default());
    }

    #[tokio::test]
    async fn test_empty_file_keeps_base() {
        let file = write_config("\n");
        let loader = ConfigLoader::new(ToolSettings::default(), file.path());
        assert_eq!(loader.load().await.unwrap(), ToolSettings::default());
    }

    #[tokio::test]
    async fn test_file_overlays_base() {
        let file = write_config(
            r#"
command_timeout: 5
kubernetes:
  context: staging
tools:
  disabled_tools: [kubectl_logs, curl]
security:
  blocked_commands: [tcpdump]
services:
  prometheus: http://prometheus:9090/-/healthy
"#,
        );
        let loader = ConfigLoader::new(ToolSettings::default(), file.path());
        let settings = loader.load().await.unwrap();

        assert_eq!(settings.command_timeout, Duration::from_secs(5));
        assert_eq!(settings.kube_context.as_deref(), Some("staging"));
        assert_eq!(settings.kube_namespace, "default");
        assert_eq!(settings.disabled_tools, vec!["kubectl_logs", "curl"]);
        assert_eq!(settings.blocked_commands, vec!["tcpdump"]);
        assert_eq!(
            settings.services.get("prometheus").map(String::as_str),
            Some("http://prometheus:9090/-/healthy")
        );
        assert!(settings.is_disabled("kubectl_logs"));
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let file = write_config("tools: [unclosed");
        let loader = ConfigLoader::new(ToolSettings::default(), file.path());
        assert!(matches!(loader.load().await, Err(ConfigError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_unreadable_path_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::new(ToolSettings::default(), dir.path());
        assert!(matches!(loader.load().await, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_secret_is_redacted_when_serialized() {
        let settings = ToolSettings {
            sops_age_key: Some("AGE-SECRET-KEY-1XYZ".to_string()),
            ..ToolSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("AGE-SECRET-KEY"));
        assert!(json.contains("<redacted>"));
    }

    #[test]
    fn test_command_seeded_from_settings() {
        let settings = ToolSettings {
            workdir: PathBuf::from("/srv"),
            command_timeout: Duration::from_secs(7),
            ..ToolSettings::default()
        };
        let cmd = settings.command("kubectl");
        assert_eq!(cmd.cwd(), Path::new("/srv"));
        assert_eq!(cmd.time_limit(), Duration::from_secs(7));
    }
}
