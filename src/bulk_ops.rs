//! `clone-all` / `pull-all`: resolves repositories through a provider,
//! derives a filesystem destination and per-repository task for each, and
//! drives them through the executor (`spec.md` §4.7).
//!
//! `update_mode=force` is destructive by design: when the destination
//! already exists it is removed entirely before cloning fresh, with no
//! attempt to stash or preserve uncommitted local changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{MgitError, Result};
use crate::executor::{Executor, ExecutorEvent, Task, TaskOutcome, TaskResult, UpdateMode};
use crate::provider::{Provider, Repository};
use crate::resolver::QueryPattern;
use crate::urlutil::sanitize_repo_name;

pub struct BulkRunOptions {
    pub dest_root: PathBuf,
    pub update_mode: UpdateMode,
    pub concurrency: usize,
}

pub struct BulkRunSummary {
    pub results: Vec<TaskResult>,
    pub cancelled: bool,
}

impl BulkRunSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| !r.is_failure()).count()
    }

    /// Count of tasks whose outcome was `created` (a fresh clone).
    pub fn created(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Cloned))
            .count()
    }

    /// Count of tasks whose outcome was `updated` (a fast-forward pull that
    /// moved the branch).
    pub fn updated(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Pulled))
            .count()
    }

    /// Count of tasks whose outcome was `skipped`, for any reason
    /// (`already_present`, `not_cloned`, `up_to_date`).
    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, TaskOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }

    /// Exit code per `spec.md` §6: 0 all succeeded, 1 partial failure,
    /// 4 the run was cancelled before completion.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            4
        } else if self.failed() > 0 {
            1
        } else {
            0
        }
    }
}

/// Pulls every `Repository` matching `query` out of `provider`'s stream,
/// collecting them so destination collisions can be detected before any
/// task is submitted. Order is not guaranteed by the provider, so this
/// function makes no ordering promise either.
async fn collect_repositories(provider: &dyn Provider, query: QueryPattern) -> Result<Vec<Repository>> {
    let mut stream = provider.list_repositories(query);
    let mut repos = Vec::new();
    while let Some(item) = stream.next().await {
        repos.push(item?);
    }
    Ok(repos)
}

/// Sanitizes every repository's name into its destination-directory name and
/// rejects the batch outright on `NameCollision` (two repositories sanitizing
/// to the same name) — the one submission-time failure that aborts the whole
/// run, per `spec.md` §7.
fn sanitize_and_check_collisions(repositories: Vec<Repository>) -> Result<Vec<(Repository, String)>> {
    let mut by_dest_name: HashMap<String, Vec<String>> = HashMap::new();
    let mut sanitized: Vec<(Repository, String)> = Vec::with_capacity(repositories.len());
    for repo in repositories {
        let name = sanitize_repo_name(&repo.name)?;
        by_dest_name.entry(name.clone()).or_default().push(repo.name.clone());
        sanitized.push((repo, name));
    }
    for (dest_name, original_names) in &by_dest_name {
        if original_names.len() > 1 {
            return Err(MgitError::NameCollision(original_names.clone(), dest_name.clone()));
        }
    }
    Ok(sanitized)
}

fn obstructed_result(id: usize, repo: &Repository, dest_dir: &std::path::Path) -> TaskResult {
    TaskResult {
        task_id: id,
        repository_name: repo.name.clone(),
        outcome: TaskOutcome::Failed {
            message: MgitError::DestinationObstructed(dest_dir.display().to_string()).to_string(),
            retryable: false,
        },
        duration: Duration::ZERO,
    }
}

/// Builds one `Task` per matched repository that can actually run, plus an
/// immediate `TaskResult` for every repository whose destination is
/// obstructed (per-task, never blocks the rest of the batch).
fn plan_tasks(
    repositories: Vec<Repository>,
    provider: &dyn Provider,
    options: &BulkRunOptions,
) -> Result<(Vec<Task>, Vec<TaskResult>)> {
    let sanitized = sanitize_and_check_collisions(repositories)?;

    let mut tasks = Vec::with_capacity(sanitized.len());
    let mut obstructed = Vec::new();
    for (id, (repo, dest_name)) in sanitized.into_iter().enumerate() {
        let dest_dir = options.dest_root.join(&dest_name);
        if dest_dir.exists() && !crate::git::is_git_repo(&dest_dir) && options.update_mode != UpdateMode::Force {
            obstructed.push(obstructed_result(id, &repo, &dest_dir));
            continue;
        }
        let clone_url = provider.authenticated_clone_url(&repo)?;
        tasks.push(Task {
            id,
            repository: repo,
            dest_dir,
            clone_url,
            update_mode: options.update_mode,
        });
    }
    Ok((tasks, obstructed))
}

/// Like `plan_tasks`, but for `pull-all`: every task is `update_mode=pull`
/// and a repository not already present on disk is never cloned on the
/// caller's behalf — it yields an immediate `Skipped{reason: not_cloned}`
/// result instead (`spec.md` §4.7).
fn plan_pull_tasks(
    repositories: Vec<Repository>,
    provider: &dyn Provider,
    dest_root: &std::path::Path,
) -> Result<(Vec<Task>, Vec<TaskResult>)> {
    let sanitized = sanitize_and_check_collisions(repositories)?;

    let mut tasks = Vec::with_capacity(sanitized.len());
    let mut pre_resolved = Vec::new();
    for (id, (repo, dest_name)) in sanitized.into_iter().enumerate() {
        let dest_dir = dest_root.join(&dest_name);
        if !dest_dir.exists() {
            pre_resolved.push(TaskResult {
                task_id: id,
                repository_name: repo.name.clone(),
                outcome: TaskOutcome::Skipped {
                    reason: "not_cloned".to_string(),
                },
                duration: Duration::ZERO,
            });
            continue;
        }
        if !crate::git::is_git_repo(&dest_dir) {
            pre_resolved.push(obstructed_result(id, &repo, &dest_dir));
            continue;
        }
        let clone_url = provider.authenticated_clone_url(&repo)?;
        tasks.push(Task {
            id,
            repository: repo,
            dest_dir,
            clone_url,
            update_mode: UpdateMode::Pull,
        });
    }
    Ok((tasks, pre_resolved))
}

async fn merge_and_run(
    concurrency: usize,
    tasks: Vec<Task>,
    pre_resolved: Vec<TaskResult>,
    secrets: Arc<Vec<String>>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
) -> BulkRunSummary {
    for result in &pre_resolved {
        let _ = events.send(ExecutorEvent::TaskCompleted { result: result.clone() });
    }

    let executor = Executor::new(concurrency);
    let mut results = executor.run(tasks, secrets, events).await;
    results.extend(pre_resolved);
    results.sort_by_key(|r| r.task_id);
    let cancelled = results
        .iter()
        .any(|r| matches!(r.outcome, crate::executor::TaskOutcome::Cancelled));
    BulkRunSummary { results, cancelled }
}

/// `mgit clone-all`: every matched repository is cloned if missing. An
/// existing destination is left untouched unless `update_mode=force`.
pub async fn clone_all(
    provider: &dyn Provider,
    query: QueryPattern,
    options: BulkRunOptions,
    secrets: Arc<Vec<String>>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
) -> Result<BulkRunSummary> {
    std::fs::create_dir_all(&options.dest_root)?;
    let repositories = collect_repositories(provider, query).await?;
    let (tasks, obstructed) = plan_tasks(repositories, provider, &options)?;
    Ok(merge_and_run(options.concurrency, tasks, obstructed, secrets, events).await)
}

/// `mgit pull-all`: fast-forward-pulls every matched repository already
/// present on disk; repositories never cloned are reported as skipped
/// rather than cloned automatically (`spec.md` §4.7).
pub async fn pull_all(
    provider: &dyn Provider,
    query: QueryPattern,
    dest_root: PathBuf,
    concurrency: usize,
    secrets: Arc<Vec<String>>,
    events: mpsc::UnboundedSender<ExecutorEvent>,
) -> Result<BulkRunSummary> {
    std::fs::create_dir_all(&dest_root)?;
    let repositories = collect_repositories(provider, query).await?;
    let (tasks, pre_resolved) = plan_pull_tasks(repositories, provider, &dest_root)?;
    Ok(merge_and_run(concurrency, tasks, pre_resolved, secrets, events).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{OrgLike, ProviderKind, RepoStream};
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FakeProvider {
        repos: Vec<Repository>,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            ProviderKind::GitHub
        }

        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }

        async fn list_organizations(&self) -> Result<Vec<OrgLike>> {
            Ok(vec![])
        }

        fn list_repositories(&self, _query: QueryPattern) -> RepoStream {
            let repos = self.repos.clone();
            Box::pin(futures::stream::iter(repos.into_iter().map(Ok)))
        }

        fn authenticated_clone_url(&self, repo: &Repository) -> Result<String> {
            Ok(repo.clone_url.clone())
        }
    }

    fn repo(name: &str) -> Repository {
        Repository {
            name: name.to_string(),
            clone_url: format!("file:///tmp/{name}"),
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

    #[test]
    fn plan_tasks_detects_name_collision() {
        let provider = FakeProvider {
            repos: vec![repo("Widgets"), repo("widgets")],
        };
        let options = BulkRunOptions {
            dest_root: PathBuf::from("/tmp/mgit-test-collision"),
            update_mode: UpdateMode::Skip,
            concurrency: 4,
        };
        let repos = vec![repo("Widgets"), repo("widgets")];
        let err = plan_tasks(repos, &provider, &options).unwrap_err();
        assert!(matches!(err, MgitError::NameCollision(..)));
    }

    #[test]
    fn plan_tasks_reports_destination_obstructed_as_per_task_failure() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("widgets")).unwrap();
        std::fs::write(dir.path().join("widgets").join("stray.txt"), "not a repo").unwrap();

        let provider = FakeProvider { repos: vec![repo("widgets")] };
        let options = BulkRunOptions {
            dest_root: dir.path().to_path_buf(),
            update_mode: UpdateMode::Skip,
            concurrency: 4,
        };
        let (tasks, obstructed) = plan_tasks(vec![repo("widgets")], &provider, &options).unwrap();
        assert!(tasks.is_empty());
        assert_eq!(obstructed.len(), 1);
        assert!(matches!(obstructed[0].outcome, TaskOutcome::Failed { .. }));
    }

    #[test]
    fn plan_tasks_does_not_abort_remaining_repositories_when_one_is_obstructed() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("widgets")).unwrap();
        std::fs::write(dir.path().join("widgets").join("stray.txt"), "not a repo").unwrap();

        let provider = FakeProvider {
            repos: vec![repo("widgets"), repo("gadgets")],
        };
        let options = BulkRunOptions {
            dest_root: dir.path().to_path_buf(),
            update_mode: UpdateMode::Skip,
            concurrency: 4,
        };
        let (tasks, obstructed) =
            plan_tasks(vec![repo("widgets"), repo("gadgets")], &provider, &options).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].repository.name, "gadgets");
        assert_eq!(obstructed.len(), 1);
    }

    #[test]
    fn plan_tasks_allows_obstructed_destination_under_force() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("widgets")).unwrap();
        std::fs::write(dir.path().join("widgets").join("stray.txt"), "not a repo").unwrap();

        let provider = FakeProvider { repos: vec![repo("widgets")] };
        let options = BulkRunOptions {
            dest_root: dir.path().to_path_buf(),
            update_mode: UpdateMode::Force,
            concurrency: 4,
        };
        let (tasks, obstructed) = plan_tasks(vec![repo("widgets")], &provider, &options).unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(obstructed.is_empty());
    }

    #[tokio::test]
    async fn clone_all_end_to_end_with_fake_provider() {
        let src = tempdir().unwrap();
        std::process::Command::new("git").arg("init").arg("-q").arg(src.path()).status().unwrap();
        std::process::Command::new("git")
            .args(["-C", src.path().to_str().unwrap(), "config", "user.email", "t@example.com"])
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["-C", src.path().to_str().unwrap(), "config", "user.name", "t"])
            .status()
            .unwrap();
        std::fs::write(src.path().join("README.md"), "hi").unwrap();
        std::process::Command::new("git").args(["-C", src.path().to_str().unwrap(), "add", "."]).status().unwrap();
        std::process::Command::new("git")
            .args(["-C", src.path().to_str().unwrap(), "commit", "-q", "-m", "init"])
            .status()
            .unwrap();

        let mut r = repo("widgets");
        r.clone_url = src.path().to_string_lossy().to_string();
        let provider = FakeProvider { repos: vec![r] };

        let work = tempdir().unwrap();
        let options = BulkRunOptions {
            dest_root: work.path().to_path_buf(),
            update_mode: UpdateMode::Skip,
            concurrency: 2,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let query = QueryPattern::parse("acme", [false, false, false]).unwrap();
        let summary = clone_all(&provider, query, options, Arc::new(vec![]), tx).await.unwrap();
        handle.await.unwrap();

        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.succeeded(), 1);
        assert!(crate::git::is_git_repo(&work.path().join("widgets")));
    }

    #[test]
    fn plan_pull_tasks_skips_repositories_never_cloned() {
        let dir = tempdir().unwrap();
        let provider = FakeProvider { repos: vec![repo("widgets")] };
        let (tasks, pre_resolved) =
            plan_pull_tasks(vec![repo("widgets")], &provider, dir.path()).unwrap();
        assert!(tasks.is_empty());
        assert_eq!(pre_resolved.len(), 1);
        assert!(matches!(
            &pre_resolved[0].outcome,
            TaskOutcome::Skipped { reason } if reason == "not_cloned"
        ));
    }

    #[tokio::test]
    async fn pull_all_fast_forwards_an_existing_clone_and_skips_a_missing_one() {
        let src = tempdir().unwrap();
        std::process::Command::new("git").arg("init").arg("-q").arg(src.path()).status().unwrap();
        std::process::Command::new("git")
            .args(["-C", src.path().to_str().unwrap(), "config", "user.email", "t@example.com"])
            .status()
            .unwrap();
        std::process::Command::new("git")
            .args(["-C", src.path().to_str().unwrap(), "config", "user.name", "t"])
            .status()
            .unwrap();
        std::fs::write(src.path().join("README.md"), "hi").unwrap();
        std::process::Command::new("git").args(["-C", src.path().to_str().unwrap(), "add", "."]).status().unwrap();
        std::process::Command::new("git")
            .args(["-C", src.path().to_str().unwrap(), "commit", "-q", "-m", "init"])
            .status()
            .unwrap();

        let work = tempdir().unwrap();
        crate::git::clone(
            src.path().to_str().unwrap(),
            &work.path().join("widgets"),
            &crate::git::CloneOptions::default(),
            &crate::git::new_cancel_flag(),
            &[],
        )
        .unwrap();

        let mut widgets = repo("widgets");
        widgets.clone_url = src.path().to_string_lossy().to_string();
        let gadgets = repo("gadgets");
        let provider = FakeProvider {
            repos: vec![widgets, gadgets],
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let query = QueryPattern::parse("acme", [false, false, false]).unwrap();
        let summary = pull_all(&provider, query, work.path().to_path_buf(), 2, Arc::new(vec![]), tx)
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(summary.exit_code(), 0);
        assert_eq!(summary.results.len(), 2);
        let widgets_result = summary.results.iter().find(|r| r.repository_name == "widgets").unwrap();
        assert!(matches!(
            &widgets_result.outcome,
            TaskOutcome::Skipped { reason } if reason == "up_to_date"
        ) || matches!(widgets_result.outcome, TaskOutcome::Pulled));
        let gadgets_result = summary.results.iter().find(|r| r.repository_name == "gadgets").unwrap();
        assert!(matches!(&gadgets_result.outcome, TaskOutcome::Skipped { reason } if reason == "not_cloned"));
    }
}
