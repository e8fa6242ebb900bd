use std::{process::Stdio, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{io::AsyncReadExt, process::Command, time::Instant};

use crate::sandbox::{RunSpec, SandboxBackend, SandboxRun};

/// Development backend: runs the interpreter directly on the host with
/// a wall-clock timeout and capped output, and nothing else. No
/// isolation is provided; never select this outside local development.
pub struct ProcessSandbox {
    interpreter: String,
}

impl ProcessSandbox {
    pub fn new(interpreter: String) -> Self {
        Self { interpreter }
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandbox {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, spec: RunSpec) -> anyhow::Result<SandboxRun> {
        let work_dir = std::env::temp_dir().join(format!("unsafe-process-{}", spec.id.as_simple()));
        tokio::fs::create_dir_all(&work_dir).await?;
        let source_path = work_dir.join("solver.py");
        tokio::fs::write(&source_path, spec.code.as_bytes()).await?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&source_path);
        cmd.env("SESSION_ID", spec.session_id.to_string());
        cmd.env("SESSION_TOKEN", &spec.session_token);
        cmd.env("API_URL", &spec.api_url);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .context("failed to spawn process backend command")?;

        let stdout = child.stdout.take().context("missing stdout pipe")?;
        let stderr = child.stderr.take().context("missing stderr pipe")?;
        let limit = spec.limits.max_output_bytes;
        let stdout_task = tokio::spawn(async move { read_limited(stdout, limit).await });
        let stderr_task = tokio::spawn(async move { read_limited(stderr, limit).await });

        let wait_result =
            tokio::time::timeout(Duration::from_millis(spec.limits.timeout_ms), child.wait()).await;

        let (exit_code, timed_out) = match wait_result {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(err)) => {
                cleanup_dir(&work_dir).await;
                return Err(err).context("process backend command wait failed");
            }
            Err(_) => {
                let _ = child.kill().await;
                (-1, true)
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        cleanup_dir(&work_dir).await;

        Ok(SandboxRun {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code,
            duration_ms: started.elapsed().as_millis(),
            timed_out,
            // a bare process cannot tell an OOM kill from a crash
            resource_exceeded: false,
        })
    }
}

async fn cleanup_dir(path: &std::path::Path) {
    let _ = tokio::fs::remove_dir_all(path).await;
}

async fn read_limited<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                }
            }
            Err(_) => break,
        }
    }
    out
}
