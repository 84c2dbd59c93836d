use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Body of `POST /api/kill`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum KillRequest {
    Process {
        pid: i64,
    },
    #[serde(rename = "ollama")]
    Model {
        name: String,
        #[serde(default, rename = "server")]
        endpoint: Option<String>,
    },
}

impl KillRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            KillRequest::Process { .. } => "process",
            KillRequest::Model { .. } => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KillOutcome {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid kill request: {0}")]
    Validation(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Runs the OS-level termination commands. Each call is independent: no
/// queue, no retry.
#[derive(Debug, Clone)]
pub struct ControlDispatcher {
    ollama_program: PathBuf,
    default_endpoint: Option<String>,
}

impl ControlDispatcher {
    pub fn new(ollama_program: impl Into<PathBuf>, default_endpoint: Option<String>) -> Self {
        Self {
            ollama_program: ollama_program.into(),
            default_endpoint,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            &cfg.ollama_path,
            cfg.default_endpoint().map(|e| e.url.clone()),
        )
    }

    pub async fn kill_by_pid(&self, pid: i64) -> Result<(), ControlError> {
        if pid <= 0 {
            return Err(ControlError::Validation(format!(
                "pid must be positive, got {pid}"
            )));
        }
        run(terminate_command(pid)).await
    }

    pub async fn kill_by_model(
        &self,
        model: &str,
        endpoint: Option<&str>,
    ) -> Result<(), ControlError> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ControlError::Validation(
                "model name is required".to_string(),
            ));
        }
        let host = endpoint
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .or(self.default_endpoint.as_deref())
            .ok_or_else(|| {
                ControlError::Validation("no endpoint given and none configured".to_string())
            })?;

        let mut cmd = Command::new(&self.ollama_program);
        cmd.arg("stop").arg(model).env("OLLAMA_HOST", host);
        run(cmd).await
    }

    /// Executes a request and folds every failure into the outcome.
    pub async fn dispatch(&self, request: &KillRequest) -> KillOutcome {
        let result = match request {
            KillRequest::Process { pid } => self.kill_by_pid(*pid).await,
            KillRequest::Model { name, endpoint } => {
                self.kill_by_model(name, endpoint.as_deref()).await
            }
        };

        match result {
            Ok(()) => {
                info!(request = ?request, "kill request executed");
                KillOutcome {
                    success: true,
                    message: "ok".to_string(),
                }
            }
            Err(err) => {
                warn!(request = ?request, error = %err, "kill request failed");
                KillOutcome {
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }
}

fn terminate_command(pid: i64) -> Command {
    let pid = pid.to_string();
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("taskkill");
        cmd.args(["/F", "/PID", pid.as_str()]);
        cmd
    } else {
        let mut cmd = Command::new("kill");
        cmd.args(["-9", pid.as_str()]);
        cmd
    }
}

async fn run(mut cmd: Command) -> Result<(), ControlError> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let output = cmd
        .output()
        .await
        .map_err(|source| ControlError::Spawn {
            program: program.clone(),
            source,
        })?;

    if output.status.success() {
        return Ok(());
    }
    Err(ControlError::Exit {
        program,
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
