mod docker;
mod process;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    config::{AppConfig, SandboxBackendKind},
    models::ExecutionLimits,
};

pub use docker::DockerSandbox;
pub use process::ProcessSandbox;

/// Everything one sandbox run receives. The session token is the only
/// credential inside the sandbox; it is scoped to exactly one session.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub id: Uuid,
    pub code: String,
    pub limits: ExecutionLimits,
    pub session_id: Uuid,
    pub session_token: String,
    pub api_url: String,
}

/// Raw outcome of one run, before the pipeline classifies it.
#[derive(Debug, Clone)]
pub struct SandboxRun {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u128,
    pub timed_out: bool,
    pub resource_exceeded: bool,
}

#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, spec: RunSpec) -> anyhow::Result<SandboxRun>;
}

pub struct SandboxFactory;

impl SandboxFactory {
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Arc<dyn SandboxBackend>> {
        match config.sandbox_backend {
            SandboxBackendKind::Docker => Ok(Arc::new(DockerSandbox::new(
                config.sandbox_image.clone(),
            ))),
            SandboxBackendKind::Process => Ok(Arc::new(ProcessSandbox::new(
                config.sandbox_interpreter.clone(),
            ))),
        }
    }
}
