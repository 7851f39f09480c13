//! Git subprocess driver: shells out to the system `git` binary for exactly
//! three operations — clone, fetch, pull-fast-forward (`spec.md` §4.3). The
//! driver mutates no global state; every call is independent and every
//! invocation is given a working directory explicitly.

use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{GitOperationKind, MgitError, Result};
use crate::urlutil::redact;

/// Output is capped before being attached to any error so a misbehaving
/// remote can't blow up memory or log volume.
const CAPTURED_OUTPUT_CAP: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    pub branch: Option<String>,
    pub depth: Option<u32>,
    pub single_branch: bool,
}

/// Shared cancellation flag: flipped by `Executor::cancel()`, checked
/// before spawning a subprocess and polled while one is running so it can
/// be killed mid-flight (`spec.md` §4.6 cancellation semantics).
pub type CancelFlag = Arc<AtomicBool>;

pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

fn is_git_working_tree(dir: &Path) -> bool {
    dir.join(".git").exists()
}

/// True if `dir` exists and is a git working tree's root.
pub fn is_git_repo(dir: &Path) -> bool {
    dir.is_dir() && is_git_working_tree(dir)
}

fn truncate(s: &str) -> String {
    if s.len() <= CAPTURED_OUTPUT_CAP {
        s.to_string()
    } else {
        format!("{}... [truncated]", &s[..CAPTURED_OUTPUT_CAP])
    }
}

fn classify_stderr(stderr: &str) -> GitOperationKind {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("authentication failed") || lower.contains("access denied") || lower.contains("403") {
        GitOperationKind::AuthRefused
    } else if lower.contains("non-fast-forward") || lower.contains("not possible to fast-forward") {
        GitOperationKind::NonFastForward
    } else if lower.contains("could not resolve host")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
    {
        GitOperationKind::Other
    } else if lower.contains("not a git repository") || lower.contains("broken ref") || lower.contains("unable to resolve reference") {
        GitOperationKind::BrokenRef
    } else {
        GitOperationKind::Other
    }
}

/// Runs `git <args>` with `cwd` as the working directory, honoring
/// `cancel`. Captured stdout/stderr are redacted with `secrets` before
/// being attached to any error.
fn run_git(args: &[&str], cwd: Option<&Path>, cancel: &CancelFlag, secrets: &[String]) -> Result<Output> {
    if cancel.load(Ordering::SeqCst) {
        return Err(MgitError::Cancelled);
    }

    let mut cmd = Command::new("git");
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|e| MgitError::GitOperationError {
        kind: GitOperationKind::Other,
        detail: redact(&format!("failed to spawn git: {e}"), secrets),
    })?;

    // Poll for completion so an in-flight clone/fetch can be cancelled.
    loop {
        if cancel.load(Ordering::SeqCst) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(MgitError::Cancelled);
        }
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => std::thread::sleep(std::time::Duration::from_millis(50)),
            Err(e) => {
                return Err(MgitError::GitOperationError {
                    kind: GitOperationKind::Other,
                    detail: redact(&format!("waiting on git: {e}"), secrets),
                })
            }
        }
    }

    child.wait_with_output().map_err(|e| MgitError::GitOperationError {
        kind: GitOperationKind::Other,
        detail: redact(&format!("collecting git output: {e}"), secrets),
    })
}

fn check_output(op: &str, output: Output, secrets: &[String]) -> Result<String> {
    let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
    let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
    if output.status.success() {
        tracing::debug!(op, "git operation succeeded");
        return Ok(redact(&stdout, secrets));
    }
    let kind = classify_stderr(&stderr);
    tracing::warn!(op, ?kind, "git operation failed");
    Err(MgitError::GitOperationError {
        kind,
        detail: redact(&format!("git {op}: {stderr}"), secrets),
    })
}

/// `git clone <url> <dest_dir>` with optional `--branch`, `--depth`,
/// `--single-branch`.
pub fn clone(
    url: &str,
    dest_dir: &Path,
    options: &CloneOptions,
    cancel: &CancelFlag,
    secrets: &[String],
) -> Result<()> {
    let depth_str;
    let mut args: Vec<&str> = vec!["clone"];
    if let Some(branch) = &options.branch {
        args.push("--branch");
        args.push(branch);
    }
    if let Some(depth) = options.depth {
        depth_str = depth.to_string();
        args.push("--depth");
        args.push(&depth_str);
    }
    if options.single_branch {
        args.push("--single-branch");
    }
    let dest = dest_dir.to_string_lossy();
    args.push(url);
    args.push(&dest);

    let output = run_git(&args, None, cancel, secrets)?;
    check_output("clone", output, secrets).map(|_| ())
}

/// `git -C <repo_dir> fetch --all --prune`.
pub fn fetch(repo_dir: &Path, cancel: &CancelFlag, secrets: &[String]) -> Result<()> {
    let output = run_git(&["fetch", "--all", "--prune"], Some(repo_dir), cancel, secrets)?;
    check_output("fetch", output, secrets).map(|_| ())
}

/// `git -C <repo_dir> pull --ff-only`.
pub fn pull_fast_forward(repo_dir: &Path, cancel: &CancelFlag, secrets: &[String]) -> Result<String> {
    let output = run_git(&["pull", "--ff-only"], Some(repo_dir), cancel, secrets)?;
    check_output("pull", output, secrets)
}
