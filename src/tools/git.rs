use std::path::PathBuf;
use std::time::Duration;

use rmcp::schemars;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ExecutionContext, Invocation};
use crate::executor::{Command, ExecutionResult, ProcessRunner};
use crate::security::{validate_argument, validate_git_ref, Validatable, ValidationError};

/// Request parameters for git_status
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct StatusRequest {
    /// Git repository path (default: the configured Kubernetes repository)
    #[serde(default)]
    pub path: Option<String>,
}

/// Request parameters for git_pull
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct PullRequest {
    /// Branch to pull (default: current branch)
    #[serde(default)]
    pub branch: Option<String>,
    /// Force pull even if there are local changes
    #[serde(default)]
    pub force: bool,
}

/// Request parameters for git_commit
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CommitRequest {
    /// Commit message
    pub message: String,
    /// Specific files to commit (optional)
    #[serde(default)]
    pub files: Vec<String>,
    /// Commit all changes
    #[serde(default)]
    pub all: bool,
}

/// Request parameters for git_push
#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct PushRequest {
    /// Branch to push (default: current branch)
    #[serde(default)]
    pub branch: Option<String>,
    /// Force push
    #[serde(default)]
    pub force: bool,
}

impl Validatable for StatusRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        match &self.path {
            Some(path) => validate_argument("path", path),
            None => Ok(()),
        }
    }
}

impl Validatable for PullRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_branch(self.branch.as_deref())
    }
}

impl Validatable for PushRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        validate_branch(self.branch.as_deref())
    }
}

impl Validatable for CommitRequest {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.message.trim().is_empty() {
            return Err(ValidationError::Empty("message"));
        }
        if self.message.contains('\0') {
            return Err(ValidationError::InvalidCharacters {
                field: "message",
                value: self.message.escape_default().to_string(),
            });
        }
        for file in &self.files {
            validate_argument("files", file)?;
        }
        Ok(())
    }
}

fn validate_branch(branch: Option<&str>) -> Result<(), ValidationError> {
    branch.map_or(Ok(()), |b| validate_git_ref("branch", b))
}

pub fn status(req: &StatusRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let repo = req
        .path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| ctx.settings.repo_path.clone());
    let cmd = ctx
        .command("git")
        .args(["status", "--porcelain"])
        .working_dir(repo);
    Invocation::command(cmd)
}

pub fn pull(req: &PullRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    workflow(
        ctx,
        GitAction::Pull {
            branch: req.branch.clone(),
            force: req.force,
        },
    )
}

pub fn commit(req: &CommitRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    workflow(
        ctx,
        GitAction::Commit {
            message: req.message.clone(),
            files: req.files.clone(),
            all: req.all,
        },
    )
}

pub fn push(req: &PushRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    workflow(
        ctx,
        GitAction::Push {
            branch: req.branch.clone(),
            force: req.force,
        },
    )
}

/// Actions `POST /git/{action}` accepts. The first four run a single read-only
/// command; the rest go through the workflows.
const ALLOWED_ACTIONS: &[&str] = &["status", "diff", "log", "branch", "pull", "commit", "push"];

const DEFAULT_LOG_LIMIT: u32 = 20;

/// Body of `POST /git/{action}`. Each action reads only the fields it uses.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ActionRequest {
    pub branch: Option<String>,
    pub force: bool,
    pub message: Option<String>,
    pub files: Vec<String>,
    pub all: bool,
    /// Commits listed by `log`
    pub limit: Option<u32>,
}

impl ActionRequest {
    pub fn validate_for(&self, action: &str) -> Result<(), ValidationError> {
        match action {
            "pull" => self.pull_request().validate(),
            "push" => self.push_request().validate(),
            "commit" => self.commit_request().validate(),
            _ if ALLOWED_ACTIONS.contains(&action) => Ok(()),
            _ => Err(ValidationError::NotAllowed(format!(
                "git action '{}' is not allowed. Allowed actions: {}",
                action,
                ALLOWED_ACTIONS.join(", ")
            ))),
        }
    }

    fn pull_request(&self) -> PullRequest {
        PullRequest {
            branch: self.branch.clone(),
            force: self.force,
        }
    }

    fn push_request(&self) -> PushRequest {
        PushRequest {
            branch: self.branch.clone(),
            force: self.force,
        }
    }

    fn commit_request(&self) -> CommitRequest {
        CommitRequest {
            message: self.message.clone().unwrap_or_default(),
            files: self.files.clone(),
            all: self.all,
        }
    }
}

/// Generic action used by the REST mapping. Validate with [`ActionRequest::validate_for`] first.
pub fn action(action: &str, req: &ActionRequest, ctx: &ExecutionContext<'_>) -> Invocation {
    let args = match action {
        "pull" => return pull(&req.pull_request(), ctx),
        "push" => return push(&req.push_request(), ctx),
        "commit" => return commit(&req.commit_request(), ctx),
        "diff" => vec!["diff".to_string(), "--stat".to_string()],
        "log" => {
            let limit = req.limit.unwrap_or(DEFAULT_LOG_LIMIT).to_string();
            vec!["log".to_string(), "--oneline".to_string(), "-n".to_string(), limit]
        }
        "branch" => vec!["branch".to_string(), "-vv".to_string()],
        _ => vec!["status".to_string(), "--porcelain".to_string()],
    };
    let cmd = ctx
        .command("git")
        .args(args)
        .working_dir(ctx.settings.repo_path.clone());
    Invocation::command(cmd)
}

fn workflow(ctx: &ExecutionContext<'_>, action: GitAction) -> Invocation {
    Invocation::Git(GitWorkflow {
        repo: ctx.settings.repo_path.clone(),
        timeout: ctx.timeout,
        action,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitAction {
    Pull { branch: Option<String>, force: bool },
    Commit { message: String, files: Vec<String>, all: bool },
    Push { branch: Option<String>, force: bool },
}

/// A multi-step git operation against the configured repository.
/// Each step is a separate process; the first failing step ends the workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitWorkflow {
    repo: PathBuf,
    timeout: Duration,
    action: GitAction,
}

impl GitWorkflow {
    pub async fn run(self, runner: &ProcessRunner) -> Value {
        // Dry-run must not touch the filesystem, so the checkout is assumed.
        if !runner.is_dry_run() && !self.has_checkout().await {
            return json!({
                "success": false,
                "error": format!(
                    "Git repository not found at {}. Make sure K8S_REPO_PATH points at a checkout.",
                    self.repo.display()
                ),
            });
        }
        match &self.action {
            GitAction::Pull { branch, force } => self.pull(runner, branch.as_deref(), *force).await,
            GitAction::Commit {
                message,
                files,
                all,
            } => self.commit(runner, message, files, *all).await,
            GitAction::Push { branch, force } => self.push(runner, branch.as_deref(), *force).await,
        }
    }

    async fn has_checkout(&self) -> bool {
        tokio::fs::try_exists(self.repo.join(".git"))
            .await
            .unwrap_or(false)
    }

    fn git<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command::new("git")
            .args(args)
            .working_dir(&self.repo)
            .timeout(self.timeout)
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    async fn step<I, S>(&self, runner: &ProcessRunner, args: I) -> ExecutionResult
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cmd = self.git(args);
        let result = runner.run(&cmd).await;
        debug!(command = %cmd, exit_code = result.exit_code(), "git step finished");
        result
    }

    async fn current_branch(&self, runner: &ProcessRunner, requested: Option<&str>) -> String {
        if let Some(branch) = requested {
            return branch.to_string();
        }
        if runner.is_dry_run() {
            return "main".to_string();
        }
        let result = self.step(runner, ["branch", "--show-current"]).await;
        let branch = result.stdout_text().trim().to_string();
        if result.succeeded() && !branch.is_empty() {
            branch
        } else {
            "main".to_string()
        }
    }

    async fn pull(&self, runner: &ProcessRunner, branch: Option<&str>, force: bool) -> Value {
        let branch = self.current_branch(runner, branch).await;

        let fetch = self.step(runner, ["fetch", "origin"]).await;
        if !fetch.succeeded() {
            return failure(format!("Failed to fetch from origin: {}", fetch.stderr_text()));
        }

        let upstream = format!("origin/{branch}");
        if force {
            let reset = self.step(runner, ["reset", "--hard", upstream.as_str()]).await;
            if !reset.succeeded() {
                return failure(format!("Failed to reset to {upstream}: {}", reset.stderr_text()));
            }
        } else {
            let pull = self.step(runner, ["pull", "origin", branch.as_str()]).await;
            if !pull.succeeded() {
                return failure(format!("Failed to pull from {upstream}: {}", pull.stderr_text()));
            }
        }

        let status = self.step(runner, ["status", "--porcelain"]).await;
        let latest = self.step(runner, ["log", "--oneline", "-1"]).await;
        json!({
            "success": true,
            "branch": branch,
            "force": force,
            "status": trimmed_stdout(&status),
            "latest_commit": trimmed_stdout(&latest),
            "message": format!("Successfully pulled latest changes from {upstream}"),
        })
    }

    async fn commit(
        &self,
        runner: &ProcessRunner,
        message: &str,
        files: &[String],
        all: bool,
    ) -> Value {
        let status = self.step(runner, ["status", "--porcelain"]).await;
        if !status.succeeded() || status.stdout_text().trim().is_empty() {
            return json!({
                "success": true,
                "message": "No changes to commit",
                "status": status.stdout_text().trim(),
            });
        }

        let add = if all {
            self.git(["add", "-A"])
        } else if files.is_empty() {
            self.git(["add", "-u"])
        } else {
            self.git(["add", "--"]).args(files.iter().cloned())
        };
        let add = runner.run(&add).await;
        if !add.succeeded() {
            return failure(format!("Failed to stage files: {}", add.stderr_text()));
        }

        let commit = self.step(runner, ["commit", "-m", message]).await;
        if !commit.succeeded() {
            return failure(format!("Failed to commit: {}", commit.stderr_text()));
        }

        let hash = self.step(runner, ["rev-parse", "HEAD"]).await;
        let files_committed = if files.is_empty() {
            json!("all modified files")
        } else {
            json!(files)
        };
        json!({
            "success": true,
            "message": format!("Successfully committed: {message}"),
            "commit_hash": trimmed_stdout(&hash),
            "files_committed": files_committed,
        })
    }

    async fn push(&self, runner: &ProcessRunner, branch: Option<&str>, force: bool) -> Value {
        let branch = self.current_branch(runner, branch).await;
        let upstream = format!("origin/{branch}");

        let pending = self
            .step(runner, ["log", format!("{upstream}..HEAD").as_str(), "--oneline"])
            .await;
        // A missing upstream makes the range invalid; push anyway in that case.
        if pending.succeeded() && pending.stdout_text().trim().is_empty() {
            return json!({
                "success": true,
                "message": format!("No commits to push to {upstream}"),
                "branch": branch,
            });
        }

        let mut args = vec!["push", "origin", branch.as_str()];
        if force {
            args.push("--force");
        }
        let push = self.step(runner, args).await;
        if !push.succeeded() {
            return failure(format!("Failed to push to {upstream}: {}", push.stderr_text()));
        }
        json!({
            "success": true,
            "message": format!("Successfully pushed to {upstream}"),
            "branch": branch,
            "force": force,
            "commits_pushed": trimmed_stdout(&pending),
        })
    }
}

fn trimmed_stdout(result: &ExecutionResult) -> String {
    if result.succeeded() {
        result.stdout_text().trim().to_string()
    } else {
        String::new()
    }
}

fn failure(error: String) -> Value {
    json!({ "success": false, "error": error })
}
