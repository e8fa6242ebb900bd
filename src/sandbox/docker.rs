use std::{process::Stdio, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{process::Command, sync::OnceCell, time::Instant};

use crate::sandbox::{RunSpec, SandboxBackend, SandboxRun};

const NETWORK_NAME: &str = "labyrinth-sandbox-net";
/// Exit code docker reports when the kernel OOM-kills the container.
const OOM_EXIT_CODE: i32 = 137;
/// Slack on top of the run's wall clock for container start/teardown.
const CONTAINER_OVERHEAD: Duration = Duration::from_secs(5);

/// Production backend: one single-tenant container per run, internal-only
/// network (the session API is the sole reachable endpoint), read-only
/// rootfs with an ephemeral noexec scratch mount, all capabilities
/// dropped. The container, not the code's cooperation, enforces every
/// ceiling.
pub struct DockerSandbox {
    image: String,
    network_ready: OnceCell<()>,
}

impl DockerSandbox {
    pub fn new(image: String) -> Self {
        Self {
            image,
            network_ready: OnceCell::new(),
        }
    }

    /// Create the internal bridge network on first use. `--internal`
    /// removes the default outbound route; only the published session
    /// API alias is reachable from inside.
    async fn ensure_network(&self) -> anyhow::Result<()> {
        self.network_ready
            .get_or_try_init(|| async {
                let inspect = Command::new("docker")
                    .args(["network", "inspect", NETWORK_NAME])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .context("docker not runnable")?;
                if inspect.success() {
                    return Ok(());
                }

                let created = Command::new("docker")
                    .args(["network", "create", "--internal", NETWORK_NAME])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await?;
                anyhow::ensure!(created.success(), "failed to create sandbox network");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn kill_container(name: &str) {
        let _ = Command::new("docker")
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[async_trait]
impl SandboxBackend for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn execute(&self, spec: RunSpec) -> anyhow::Result<SandboxRun> {
        self.ensure_network().await?;

        let container = format!("sandbox-{}", spec.id.as_simple());
        let scratch = std::env::temp_dir().join(&container);
        tokio::fs::create_dir_all(&scratch).await?;
        let code_path = scratch.join("solver.py");
        tokio::fs::write(&code_path, spec.code.as_bytes()).await?;

        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm"])
            .arg(format!("--name={container}"))
            // ceilings enforced by the container, not by cooperation
            .arg(format!("--memory={}m", spec.limits.memory_mb))
            .arg(format!("--memory-swap={}m", spec.limits.memory_mb))
            .arg(format!("--cpus={}", spec.limits.cpu_cores))
            .arg(format!("--pids-limit={}", spec.limits.max_pids))
            .arg(format!("--network={NETWORK_NAME}"))
            .args([
                "--read-only",
                "--tmpfs=/tmp:size=10m,noexec",
                "--security-opt=no-new-privileges:true",
                "--cap-drop=ALL",
            ])
            .arg("-e")
            .arg(format!("SESSION_ID={}", spec.session_id))
            .arg("-e")
            .arg(format!("SESSION_TOKEN={}", spec.session_token))
            .arg("-e")
            .arg(format!("API_URL={}", spec.api_url))
            .arg("-v")
            .arg(format!("{}:/app/solver.py:ro", code_path.display()))
            .arg(&self.image);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let started = Instant::now();
        let child = cmd.spawn().context("failed to spawn sandbox container")?;

        let wall_clock = Duration::from_millis(spec.limits.timeout_ms) + CONTAINER_OVERHEAD;
        let waited = tokio::time::timeout(wall_clock, child.wait_with_output()).await;

        let run = match waited {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                SandboxRun {
                    stdout: truncated(&output.stdout, spec.limits.max_output_bytes),
                    stderr: truncated(&output.stderr, spec.limits.max_output_bytes),
                    exit_code,
                    duration_ms: started.elapsed().as_millis(),
                    timed_out: false,
                    resource_exceeded: exit_code == OOM_EXIT_CODE,
                }
            }
            Ok(Err(err)) => {
                cleanup(&scratch).await;
                return Err(err).context("sandbox container wait failed");
            }
            Err(_) => {
                Self::kill_container(&container).await;
                SandboxRun {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: -1,
                    duration_ms: started.elapsed().as_millis(),
                    timed_out: true,
                    resource_exceeded: false,
                }
            }
        };

        cleanup(&scratch).await;
        Ok(run)
    }
}

fn truncated(bytes: &[u8], limit: usize) -> String {
    let end = bytes.len().min(limit);
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

async fn cleanup(path: &std::path::Path) {
    let _ = tokio::fs::remove_dir_all(path).await;
}
