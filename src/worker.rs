use std::{sync::Arc, time::Duration};

use tokio::sync::{Mutex, mpsc::Receiver};

use crate::{
    leaderboard::Leaderboard,
    maze::MazeCatalog,
    metrics::MetricsRegistry,
    models::{SessionStatus, SubmissionStatus},
    queue::QueuedJob,
    sandbox::{RunSpec, SandboxBackend, SandboxRun},
    screen,
    session::SessionRegistry,
    store::SubmissionStore,
};

const STDERR_TAIL_BYTES: usize = 512;
const LEADERBOARD_ATTEMPTS: u32 = 3;
const LEADERBOARD_BACKOFF_MS: u64 = 100;

pub struct WorkerDeps {
    pub store: Arc<SubmissionStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub sandbox: Arc<dyn SandboxBackend>,
    pub sessions: Arc<SessionRegistry>,
    pub mazes: Arc<MazeCatalog>,
    pub leaderboard: Leaderboard,
    pub api_url: String,
}

/// The pool size is the admission bound: each worker supervises at most
/// one sandbox, so at most `workers` sandboxes run concurrently and
/// everything else waits in the queue.
pub fn spawn_worker_pool(workers: usize, receiver: Arc<Mutex<Receiver<QueuedJob>>>, deps: WorkerDeps) {
    let deps = Arc::new(deps);
    for worker_id in 0..workers {
        let receiver = receiver.clone();
        let deps = deps.clone();
        tokio::spawn(async move {
            worker_loop(worker_id, receiver, deps).await;
        });
    }
}

async fn worker_loop(worker_id: usize, receiver: Arc<Mutex<Receiver<QueuedJob>>>, deps: Arc<WorkerDeps>) {
    loop {
        let job = {
            let mut locked = receiver.lock().await;
            locked.recv().await
        };
        let Some(job) = job else {
            tracing::info!(worker_id, "submission queue closed, worker exiting");
            break;
        };

        tracing::info!(worker_id, submission_id = %job.id, user = %job.user, "starting submission");
        deps.metrics.started();
        deps.store.mark_running(job.id);
        run_one(&deps, job).await;
    }
}

async fn run_one(deps: &WorkerDeps, job: QueuedJob) {
    let Some(maze) = deps.mazes.get(&job.maze_id) else {
        deps.metrics.failed();
        deps.store
            .mark_finished(
                job.id,
                SubmissionStatus::Failed,
                None,
                Some(format!("maze not found: {}", job.maze_id)),
            )
            .await;
        return;
    };

    // The static screen runs before a sandbox slot is spent; a hit is a
    // security classification, not a plain crash, and is logged for
    // audit.
    if let Some(violation) = screen::screen(&job.code) {
        tracing::warn!(
            submission_id = %job.id,
            user = %job.user,
            security_violation = true,
            reason = %violation.reason,
            "submission rejected by code screen"
        );
        deps.metrics.failed();
        deps.store
            .mark_finished(
                job.id,
                SubmissionStatus::Failed,
                None,
                Some(format!("security violation: {}", violation.reason)),
            )
            .await;
        return;
    }

    // Every run gets a fresh session; prior session state is never
    // reused between submissions.
    let (session_id, session_token) = deps.sessions.create(&job.user, &job.maze_id, maze);

    let spec = RunSpec {
        id: job.id,
        code: job.code.clone(),
        limits: job.limits.clone(),
        session_id,
        session_token,
        api_url: deps.api_url.clone(),
    };

    tracing::debug!(submission_id = %job.id, backend = deps.sandbox.name(), "dispatching to sandbox");
    let outcome = deps.sandbox.execute(spec).await;
    let (status, score, error) = classify(deps, &job, &session_id, outcome).await;

    if let (SubmissionStatus::Completed, Some(score)) = (status, score) {
        record_best_score(deps, &job, score).await;
    }

    deps.store.mark_finished(job.id, status, score, error).await;

    // a run that did not complete leaves its session abandoned, never
    // reusable by a later submission
    if let Some(session) = deps.sessions.get(&session_id) {
        let _ = session.lock().await.abandon();
    }
    deps.sessions.remove(&session_id);
    tracing::info!(
        submission_id = %job.id,
        status = ?status,
        score = score,
        "submission finished"
    );
}

/// Map a raw sandbox outcome to a terminal submission state. A clean
/// program exit is not enough to complete: the session itself must have
/// reached the exit cell.
async fn classify(
    deps: &WorkerDeps,
    job: &QueuedJob,
    session_id: &uuid::Uuid,
    outcome: anyhow::Result<SandboxRun>,
) -> (SubmissionStatus, Option<u32>, Option<String>) {
    let run = match outcome {
        Ok(run) => run,
        Err(err) => {
            // isolation-layer details stay in the logs, not the record
            tracing::error!(submission_id = %job.id, error = %err, "sandbox infrastructure failure");
            deps.metrics.failed();
            return (
                SubmissionStatus::Failed,
                None,
                Some("sandbox execution failed".to_string()),
            );
        }
    };

    if run.timed_out {
        deps.metrics.timed_out();
        return (
            SubmissionStatus::Timeout,
            None,
            Some("execution timed out".to_string()),
        );
    }
    if run.resource_exceeded {
        deps.metrics.failed();
        return (
            SubmissionStatus::Failed,
            None,
            Some("resource limit exceeded".to_string()),
        );
    }

    let session_result = match deps.sessions.get(session_id) {
        Some(session) => {
            let session = session.lock().await;
            (session.status(), session.turns())
        }
        None => (SessionStatus::Abandoned, 0),
    };

    match session_result {
        (SessionStatus::Completed, turns) => {
            deps.metrics.completed();
            (SubmissionStatus::Completed, Some(turns), None)
        }
        _ if run.exit_code != 0 => {
            deps.metrics.failed();
            let mut detail = format!("program exited with status {}", run.exit_code);
            let tail = stderr_tail(&run.stderr);
            if !tail.is_empty() {
                detail.push_str(": ");
                detail.push_str(&tail);
            }
            (SubmissionStatus::Failed, None, Some(detail))
        }
        _ => {
            deps.metrics.failed();
            (
                SubmissionStatus::Failed,
                None,
                Some("maze not solved".to_string()),
            )
        }
    }
}

/// Leaderboard hand-off happens before the terminal record is
/// persisted. A store hiccup is retried with backoff; the sandbox is
/// never re-run to recover from it.
async fn record_best_score(deps: &WorkerDeps, job: &QueuedJob, score: u32) {
    for attempt in 0..LEADERBOARD_ATTEMPTS {
        match deps.leaderboard.submit(&job.user, &job.maze_id, score).await {
            Ok(accepted) => {
                if accepted {
                    tracing::info!(
                        submission_id = %job.id,
                        user = %job.user,
                        maze_id = %job.maze_id,
                        score,
                        "new best score"
                    );
                }
                return;
            }
            Err(err) if attempt + 1 < LEADERBOARD_ATTEMPTS => {
                let backoff = LEADERBOARD_BACKOFF_MS << attempt;
                tracing::warn!(
                    submission_id = %job.id,
                    error = %err,
                    backoff_ms = backoff,
                    "leaderboard update failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            Err(err) => {
                tracing::error!(
                    submission_id = %job.id,
                    error = %err,
                    "leaderboard update failed after retries"
                );
            }
        }
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let start = trimmed.len() - STDERR_TAIL_BYTES;
    // keep the tail on a char boundary
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::{WorkerDeps, run_one, stderr_tail};
    use crate::{
        leaderboard::{Leaderboard, in_memory::InMemoryLeaderboard},
        maze::MazeCatalog,
        metrics::MetricsRegistry,
        models::{Direction, ExecutionLimits, SubmissionStatus},
        queue::QueuedJob,
        sandbox::{RunSpec, SandboxBackend, SandboxRun},
        session::SessionRegistry,
        store::SubmissionStore,
    };

    /// Stand-in for a sandboxed program: drives the job's own session
    /// through the registry, then exits cleanly.
    struct ScriptedSandbox {
        sessions: Arc<SessionRegistry>,
        moves: Vec<Direction>,
        timed_out: bool,
    }

    #[async_trait]
    impl SandboxBackend for ScriptedSandbox {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn execute(&self, spec: RunSpec) -> anyhow::Result<SandboxRun> {
            if let Some(session) = self.sessions.authorize(&spec.session_id, &spec.session_token) {
                let mut session = session.lock().await;
                for direction in &self.moves {
                    let _ = session.move_(*direction);
                }
            }
            Ok(SandboxRun {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 1,
                timed_out: self.timed_out,
                resource_exceeded: false,
            })
        }
    }

    fn deps_with(moves: Vec<Direction>, timed_out: bool) -> (WorkerDeps, Arc<SubmissionStore>) {
        let sessions = Arc::new(SessionRegistry::new());
        let store = Arc::new(SubmissionStore::new(None));
        let metrics = Arc::new(MetricsRegistry::new());
        let deps = WorkerDeps {
            store: store.clone(),
            metrics: metrics.clone(),
            sandbox: Arc::new(ScriptedSandbox {
                sessions: sessions.clone(),
                moves,
                timed_out,
            }),
            sessions,
            mazes: Arc::new(MazeCatalog::builtin()),
            leaderboard: Leaderboard::new(Arc::new(InMemoryLeaderboard::new()), metrics),
            api_url: "http://localhost:0".to_string(),
        };
        (deps, store)
    }

    fn job_for(store: &SubmissionStore, maze_id: &str, code: &str) -> QueuedJob {
        let id = uuid::Uuid::new_v4();
        store.insert(store.create_record(id, "tester".to_string(), maze_id.to_string()));
        QueuedJob {
            id,
            user: "tester".to_string(),
            maze_id: maze_id.to_string(),
            code: code.to_string(),
            limits: ExecutionLimits {
                cpu_cores: 0.5,
                memory_mb: 256,
                timeout_ms: 5000,
                max_pids: 16,
                max_output_bytes: 4096,
            },
        }
    }

    // tutorial maze: east along the top corridor, south down the right
    // side, then one step east into the exit
    fn tutorial_solution() -> Vec<Direction> {
        let mut moves = vec![Direction::East; 7];
        moves.extend(vec![Direction::South; 7]);
        moves.push(Direction::East);
        moves
    }

    #[tokio::test]
    async fn completed_session_scores_the_submission() {
        let (deps, store) = deps_with(tutorial_solution(), false);
        let job = job_for(&store, "tutorial", "solve()");
        let id = job.id;

        run_one(&deps, job).await;

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, SubmissionStatus::Completed);
        assert_eq!(record.score, Some(15));
        let top = deps.leaderboard.top("tutorial", 1).await.unwrap();
        assert_eq!(top[0].score, 15);
    }

    #[tokio::test]
    async fn clean_exit_without_solving_fails() {
        let (deps, store) = deps_with(vec![Direction::East], false);
        let job = job_for(&store, "tutorial", "solve()");
        let id = job.id;

        run_one(&deps, job).await;

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, SubmissionStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("maze not solved"));
        assert!(deps.leaderboard.top("tutorial", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn timeout_discards_partial_progress() {
        let (deps, store) = deps_with(tutorial_solution(), true);
        let job = job_for(&store, "tutorial", "solve()");
        let id = job.id;

        run_one(&deps, job).await;

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, SubmissionStatus::Timeout);
        assert!(record.score.is_none());
    }

    #[tokio::test]
    async fn screened_code_fails_as_security_violation() {
        let (deps, store) = deps_with(Vec::new(), false);
        let job = job_for(&store, "tutorial", "import socket\n");
        let id = job.id;

        run_one(&deps, job).await;

        let record = store.get(&id).unwrap();
        assert_eq!(record.status, SubmissionStatus::Failed);
        assert!(record.error.unwrap().starts_with("security violation:"));
    }

    #[tokio::test]
    async fn unknown_maze_fails_cleanly() {
        let (deps, store) = deps_with(Vec::new(), false);
        let job = job_for(&store, "no-such-maze", "solve()");
        let id = job.id;

        run_one(&deps, job).await;

        assert_eq!(store.get(&id).unwrap().status, SubmissionStatus::Failed);
    }

    /// Sandbox that parks until released, to hold a worker slot open.
    struct GatedSandbox {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl SandboxBackend for GatedSandbox {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn execute(&self, _spec: RunSpec) -> anyhow::Result<SandboxRun> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(SandboxRun {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 1,
                timed_out: false,
                resource_exceeded: false,
            })
        }
    }

    #[tokio::test]
    async fn admission_bound_keeps_excess_submissions_pending() {
        let sessions = Arc::new(SessionRegistry::new());
        let store = Arc::new(SubmissionStore::new(None));
        let metrics = Arc::new(MetricsRegistry::new());
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let deps = WorkerDeps {
            store: store.clone(),
            metrics: metrics.clone(),
            sandbox: Arc::new(GatedSandbox {
                started: started.clone(),
                release: release.clone(),
            }),
            sessions,
            mazes: Arc::new(MazeCatalog::builtin()),
            leaderboard: Leaderboard::new(Arc::new(InMemoryLeaderboard::new()), metrics.clone()),
            api_url: "http://localhost:0".to_string(),
        };

        let scheduler = crate::queue::Scheduler::new(8, metrics);
        super::spawn_worker_pool(1, scheduler.receiver(), deps);

        let first = job_for(&store, "tutorial", "solve()");
        let second = job_for(&store, "tutorial", "solve()");
        scheduler.submit(first.clone()).unwrap();
        scheduler.submit(second.clone()).unwrap();

        // the single slot is busy with the first job; the second stays
        // pending and observable as such
        started.notified().await;
        assert_eq!(
            store.get(&second.id).unwrap().status,
            SubmissionStatus::Pending
        );

        // freeing the slot lets the second job in
        release.notify_one();
        started.notified().await;
        assert_ne!(
            store.get(&second.id).unwrap().status,
            SubmissionStatus::Pending
        );
        release.notify_one();
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let short = stderr_tail("boom\n");
        assert_eq!(short, "boom");

        let long = "x".repeat(2000) + "TRACEBACK";
        let tail = stderr_tail(&long);
        assert!(tail.ends_with("TRACEBACK"));
        assert!(tail.len() <= 512);
    }
}
