use std::fmt;
use std::io::Write;

use rmcp::schemars::{self, JsonSchema};
use serde::Deserialize;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tracing::warn;

use super::{command_output, ExecutionContext, Invocation};
use crate::executor::{Command, ProcessRunner};
use crate::request::OutputOptions;
use crate::security::{validate_argument, Validatable, ValidationError};

const FORMATS: &[&str] = &["yaml", "json", "dotenv", "ini", "binary"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SopsOperation {
    Encrypt,
    Decrypt,
    Version,
}

impl SopsOperation {
    fn as_str(self) -> &'static str {
        match self {
            SopsOperation::Encrypt => "encrypt",
            SopsOperation::Decrypt => "decrypt",
            SopsOperation::Version => "version",
        }
    }

    fn needs_key(self) -> bool {
        !matches!(self, SopsOperation::Version)
    }
}

/// Request parameters for sops
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SopsRequest {
    /// Operation to run (encrypt, decrypt, version)
    pub operation: SopsOperation,
    /// File to encrypt or decrypt, relative to the working directory
    #[serde(default)]
    pub file: Option<String>,
    /// Inline document to encrypt or decrypt, passed on stdin
    #[serde(default)]
    pub data: Option<String>,
    /// Document format (yaml, json, dotenv, ini, binary). Defaults to yaml for inline data.
    #[serde(default)]
    pub format: Option<String>,
}

impl Validatable for SopsRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        if let Some(format) = &self.format {
            if !FORMATS.contains(&format.as_str()) {
                return Err(ValidationError::NotAllowed(format!(
                    "Format '{}' is not supported. Supported formats: {}",
                    format,
                    FORMATS.join(", ")
                )));
            }
        }
        if !self.operation.needs_key() {
            return Ok(());
        }
        match (&self.file, &self.data) {
            (Some(file), None) => validate_argument("file", file),
            (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(ValidationError::NotAllowed(
                "Provide either 'file' or 'data', not both".to_string(),
            )),
            (None, None) => Err(ValidationError::NotAllowed(format!(
                "'{}' needs a 'file' or 'data'",
                self.operation.as_str()
            ))),
        }
    }
}

pub fn invocation(req: &SopsRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let mut cmd = ctx.command("sops");
    match req.operation {
        SopsOperation::Version => cmd = cmd.arg("--version"),
        operation => {
            cmd = cmd.arg(format!("--{}", operation.as_str()));
            let format = req
                .format
                .as_deref()
                .or(req.data.as_ref().map(|_| "yaml"));
            if let Some(format) = format {
                cmd = cmd.args(["--input-type", format, "--output-type", format]);
            }
            cmd = match (&req.file, &req.data) {
                (Some(file), _) => cmd.arg(file),
                (None, Some(data)) => cmd.arg("/dev/stdin").stdin(data.as_str()),
                (None, None) => cmd,
            };
        }
    }
    Invocation::Sops(SopsInvocation {
        operation: req.operation,
        command: cmd,
        age_key: ctx.settings.sops_age_key.clone(),
    })
}

/// A sops command plus the key it must be able to read.
pub struct SopsInvocation {
    operation: SopsOperation,
    command: Command,
    age_key: Option<String>,
}

impl fmt::Debug for SopsInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SopsInvocation")
            .field("operation", &self.operation)
            .field("command", &self.command)
            .field("age_key", &self.age_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SopsInvocation {
    /// The key is written to a private temp file that only lives for this call.
    pub async fn run(self, runner: &ProcessRunner, options: &OutputOptions) -> Value {
        let operation = self.operation.as_str();
        let key_file = match (&self.age_key, self.operation.needs_key()) {
            (None, true) => {
                return json!({
                    "success": false,
                    "error": "AGE key not provided. Set the SOPS_AGE_KEY environment variable.",
                    "operation": operation,
                })
            }
            (Some(key), true) if !runner.is_dry_run() => match write_key(key).await {
                Ok(file) => Some(file),
                Err(e) => {
                    warn!(error = %e, "failed to write AGE key file");
                    return json!({
                        "success": false,
                        "error": format!("SOPS operation failed: {e}"),
                        "operation": operation,
                    });
                }
            },
            _ => None,
        };

        let command = match &key_file {
            Some(file) => self
                .command
                .env("SOPS_AGE_KEY_FILE", file.path().to_string_lossy()),
            None => self.command,
        };
        let result = runner.run(&command).await;
        drop(key_file);

        let mut value = command_output(&result, options, false);
        value["operation"] = json!(operation);
        value
    }
}

/// Runs on the blocking pool; the file is created with mode 0600.
async fn write_key(key: &str) -> std::io::Result<NamedTempFile> {
    let key = key.to_string();
    tokio::task::spawn_blocking(move || -> std::io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().prefix("sops-age-").tempfile()?;
        file.write_all(key.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(file)
    })
    .await
    .map_err(std::io::Error::other)?
}
