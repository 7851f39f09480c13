//! Bounded concurrency executor: a semaphore-gated worker pool that turns a
//! list of per-repository `Task`s into `TaskResult`s, emitting progress
//! events as it goes (`spec.md` §4.6, §5).
//!
//! Submission order is preserved in the returned `Vec<TaskResult>` even
//! though tasks complete out of order — callers that only care about
//! aggregate counts can ignore this, but `clone-all`/`pull-all` output is
//! expected to read top-to-bottom in submission order.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use crate::error::MgitError;
use crate::git::{self, CancelFlag, CloneOptions};
use crate::provider::Repository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Clone if missing; leave an existing working tree untouched.
    Skip,
    /// Clone if missing; otherwise fetch and fast-forward.
    Pull,
    /// Always end up at a fresh clone — destructively removes an existing
    /// directory first. See `DESIGN.md`'s Open Question decisions.
    Force,
}

impl std::str::FromStr for UpdateMode {
    type Err = MgitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(UpdateMode::Skip),
            "pull" => Ok(UpdateMode::Pull),
            "force" => Ok(UpdateMode::Force),
            other => Err(MgitError::ConfigError(format!("unknown update mode {other:?}"))),
        }
    }
}

impl std::fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpdateMode::Skip => "skip",
            UpdateMode::Pull => "pull",
            UpdateMode::Force => "force",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: usize,
    pub repository: Repository,
    pub dest_dir: PathBuf,
    pub clone_url: String,
    pub update_mode: UpdateMode,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum TaskOutcome {
    Cloned,
    Pulled,
    /// `reason` is `already_present` for `update_mode=skip`, `not_cloned`
    /// when `pull-all` encounters a repository that has never been cloned
    /// (`pull-all` never clones on the caller's behalf), or `up_to_date`
    /// when a fast-forward pull found nothing new. The Result taxonomy
    /// (`spec.md` §3) has no separate "up to date" outcome, only `skipped`.
    Skipped { reason: String },
    Failed { message: String, retryable: bool },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: usize,
    pub repository_name: String,
    pub outcome: TaskOutcome,
    #[serde(rename = "duration_ms", serialize_with = "duration_as_millis")]
    pub duration: Duration,
}

fn duration_as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl TaskResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    TaskStarted { task_id: usize, name: String },
    TaskCompleted { result: TaskResult },
    Progress { completed: usize, total: usize },
}

pub struct Executor {
    concurrency: usize,
    cancel: CancelFlag,
}

impl Executor {
    pub fn new(concurrency: usize) -> Self {
        Executor {
            concurrency: concurrency.max(1),
            cancel: git::new_cancel_flag(),
        }
    }

    /// A handle callers can flip from another task to request cancellation
    /// of every in-flight and not-yet-started worker.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Runs every task with at most `concurrency` running concurrently,
    /// streaming `ExecutorEvent`s to `events` as work starts/finishes.
    /// Returns all results ordered by `task.id` (submission order).
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        secrets: Arc<Vec<String>>,
        events: mpsc::UnboundedSender<ExecutorEvent>,
    ) -> Vec<TaskResult> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let total = tasks.len();
        let completed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let semaphore = semaphore.clone();
            let events = events.clone();
            let completed = completed.clone();
            let cancel = self.cancel.clone();
            let secrets = secrets.clone();

            handles.push(tokio::spawn(async move {
                let permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed while tasks are outstanding");
                let name = task.repository.name.clone();
                let _ = events.send(ExecutorEvent::TaskStarted {
                    task_id: task.id,
                    name: name.clone(),
                });

                let start = Instant::now();
                let outcome = run_task(&task, &cancel, &secrets).await;
                let result = TaskResult {
                    task_id: task.id,
                    repository_name: name,
                    outcome,
                    duration: start.elapsed(),
                };

                let _ = events.send(ExecutorEvent::TaskCompleted { result: result.clone() });
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = events.send(ExecutorEvent::Progress { completed: done, total });
                drop(permit);
                result
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }
        results.sort_by_key(|r| r.task_id);
        results
    }
}

/// Runs one task's git work on a blocking-pool thread. `git::clone`/`fetch`/
/// `pull_fast_forward` poll and sleep synchronously while the subprocess
/// runs, so this must not execute directly on an async worker thread — a
/// handful of concurrent clones would otherwise starve the whole runtime.
async fn run_task(task: &Task, cancel: &CancelFlag, secrets: &[String]) -> TaskOutcome {
    if cancel.load(Ordering::SeqCst) {
        return TaskOutcome::Cancelled;
    }

    let task = task.clone();
    let cancel = cancel.clone();
    let secrets = secrets.to_vec();
    tokio::task::spawn_blocking(move || run_task_blocking(&task, &cancel, &secrets))
        .await
        .unwrap_or(TaskOutcome::Failed {
            message: "git worker thread panicked".to_string(),
            retryable: true,
        })
}

fn run_task_blocking(task: &Task, cancel: &CancelFlag, secrets: &[String]) -> TaskOutcome {
    let already_present = git::is_git_repo(&task.dest_dir);

    let outcome = match (task.update_mode, already_present) {
        (UpdateMode::Skip, true) => Ok(TaskOutcome::Skipped {
            reason: "already_present".to_string(),
        }),
        (UpdateMode::Skip, false) | (UpdateMode::Pull, false) | (UpdateMode::Force, false) => {
            clone(task, cancel, secrets)
        }
        (UpdateMode::Pull, true) => pull(task, cancel, secrets),
        (UpdateMode::Force, true) => match std::fs::remove_dir_all(&task.dest_dir) {
            Ok(()) => clone(task, cancel, secrets),
            Err(e) => Err(MgitError::Io(e)),
        },
    };

    match outcome {
        Ok(o) => o,
        Err(MgitError::Cancelled) => TaskOutcome::Cancelled,
        Err(e) => TaskOutcome::Failed {
            retryable: e.is_retryable(),
            message: e.to_string(),
        },
    }
}

fn clone(task: &Task, cancel: &CancelFlag, secrets: &[String]) -> Result<TaskOutcome, MgitError> {
    let options = CloneOptions {
        branch: Some(task.repository.default_branch.clone()),
        depth: None,
        single_branch: false,
    };
    git::clone(&task.clone_url, &task.dest_dir, &options, cancel, secrets)?;
    Ok(TaskOutcome::Cloned)
}

fn pull(task: &Task, cancel: &CancelFlag, secrets: &[String]) -> Result<TaskOutcome, MgitError> {
    git::fetch(&task.dest_dir, cancel, secrets)?;
    let output = git::pull_fast_forward(&task.dest_dir, cancel, secrets)?;
    if output.contains("Already up to date") || output.contains("up-to-date") {
        Ok(TaskOutcome::Skipped {
            reason: "up_to_date".to_string(),
        })
    } else {
        Ok(TaskOutcome::Pulled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use std::process::Command;
    use tempfile::tempdir;

    fn sample_repository(name: &str) -> Repository {
        Repository {
            name: name.to_string(),
            clone_url: String::new(),
            ssh_url: None,
            default_branch: "main".to_string(),
            is_private: false,
            is_disabled: false,
            size: None,
            description: None,
            created_at: None,
            updated_at: None,
            provider_kind: ProviderKind::GitHub,
            organization: "acme".to_string(),
            project: None,
            metadata: Default::default(),
        }
    }

    fn init_bare_repo(dir: &std::path::Path) {
        Command::new("git").arg("init").arg("-q").arg(dir).status().unwrap();
        Command::new("git")
            .args(["-C", dir.to_str().unwrap(), "config", "user.email", "t@example.com"])
            .status()
            .unwrap();
        Command::new("git")
            .args(["-C", dir.to_str().unwrap(), "config", "user.name", "t"])
            .status()
            .unwrap();
        std::fs::write(dir.join("README.md"), "hi").unwrap();
        Command::new("git").args(["-C", dir.to_str().unwrap(), "add", "."]).status().unwrap();
        Command::new("git")
            .args(["-C", dir.to_str().unwrap(), "commit", "-q", "-m", "init"])
            .status()
            .unwrap();
        Command::new("git")
            .args(["-C", dir.to_str().unwrap(), "branch", "-M", "main"])
            .status()
            .unwrap();
    }

    #[tokio::test]
    async fn clones_missing_repository() {
        let src = tempdir().unwrap();
        init_bare_repo(src.path());
        let work = tempdir().unwrap();
        let dest_dir = work.path().join("widgets");

        let mut repo = sample_repository("widgets");
        repo.clone_url = src.path().to_string_lossy().to_string();
        let task = Task {
            id: 0,
            clone_url: repo.clone_url.clone(),
            repository: repo,
            dest_dir: dest_dir.clone(),
            update_mode: UpdateMode::Skip,
        };

        let executor = Executor::new(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let results = executor.run(vec![task], Arc::new(vec![]), tx).await;
        drop(rx.recv().await);
        while rx.try_recv().is_ok() {}

        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, TaskOutcome::Cloned));
        assert!(git::is_git_repo(&dest_dir));
    }

    #[tokio::test]
    async fn skip_mode_leaves_existing_clone_untouched() {
        let src = tempdir().unwrap();
        init_bare_repo(src.path());
        let work = tempdir().unwrap();
        let dest_dir = work.path().join("widgets");
        git::clone(
            src.path().to_str().unwrap(),
            &dest_dir,
            &CloneOptions::default(),
            &git::new_cancel_flag(),
            &[],
        )
        .unwrap();

        let mut repo = sample_repository("widgets");
        repo.clone_url = src.path().to_string_lossy().to_string();
        let task = Task {
            id: 0,
            clone_url: repo.clone_url.clone(),
            repository: repo,
            dest_dir: dest_dir.clone(),
            update_mode: UpdateMode::Skip,
        };

        let executor = Executor::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let results = executor.run(vec![task], Arc::new(vec![]), tx).await;
        assert!(matches!(results[0].outcome, TaskOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn results_are_ordered_by_submission_even_if_completion_order_differs() {
        let work = tempdir().unwrap();
        let mut tasks = Vec::new();
        for i in 0..5 {
            let repo = sample_repository(&format!("repo-{i}"));
            tasks.push(Task {
                id: i,
                clone_url: "file:///definitely/does/not/exist/mgit-test".to_string(),
                repository: repo,
                dest_dir: work.path().join(format!("repo-{i}")),
                update_mode: UpdateMode::Skip,
            });
        }

        let executor = Executor::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let results = executor.run(tasks, Arc::new(vec![]), tx).await;
        let ids: Vec<usize> = results.iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn cancellation_flag_short_circuits_not_yet_started_tasks() {
        let work = tempdir().unwrap();
        let mut tasks = Vec::new();
        for i in 0..3 {
            let repo = sample_repository(&format!("repo-{i}"));
            tasks.push(Task {
                id: i,
                clone_url: "file:///definitely/does/not/exist/mgit-test".to_string(),
                repository: repo,
                dest_dir: work.path().join(format!("repo-{i}")),
                update_mode: UpdateMode::Skip,
            });
        }

        let executor = Executor::new(1);
        executor.cancel();
        let (tx, _rx) = mpsc::unbounded_channel();
        let results = executor.run(tasks, Arc::new(vec![]), tx).await;
        assert!(results.iter().all(|r| matches!(r.outcome, TaskOutcome::Cancelled)));
    }
}
