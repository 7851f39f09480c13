//! CLI chrome: argument parsing and subcommand dispatch. All engine logic
//! lives in the library crate; this module only translates flags into
//! calls against it and formats output (`spec.md` §6).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::bulk_ops::{self, BulkRunOptions, BulkRunSummary};
use crate::config::{ConfigFile, ProviderProfile};
use crate::error::{MgitError, Result};
use crate::executor::{ExecutorEvent, TaskOutcome, UpdateMode};
use crate::provider::{self, ProviderKind};
use crate::resolver::QueryPattern;

#[derive(Parser, Debug)]
#[command(
    name = "mgit",
    about = "Bulk clone/pull orchestrator across Azure DevOps, GitHub and BitBucket",
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Print shell completions to stdout and exit (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL", global = true)]
    pub completions: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Save or update a provider profile's credentials
    Login {
        /// Profile name to save under
        name: String,
        #[arg(long, value_parser = parse_provider_kind)]
        kind: ProviderKind,
        /// Base API/organization URL
        #[arg(long)]
        url: String,
        /// Username (BitBucket only)
        #[arg(long)]
        user: Option<String>,
        /// Personal access token, app password, or `env:VAR_NAME`
        #[arg(long)]
        token: String,
        /// Workspace (BitBucket only)
        #[arg(long)]
        workspace: Option<String>,
        /// Mark this profile as the default
        #[arg(long)]
        default: bool,
    },
    /// Inspect or edit stored configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List repositories matching a query
    List {
        /// `organization[/project[/repository]]` glob query
        query: String,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Clone every repository matching a query that isn't already present
    CloneAll {
        query: String,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, default_value = ".")]
        dest: PathBuf,
        #[arg(long, short = 'c', env = "MGIT_DEFAULT_CONCURRENCY")]
        concurrency: Option<usize>,
        #[arg(long, value_parser = parse_update_mode, default_value = "skip")]
        mode: UpdateMode,
    },
    /// Fast-forward-pull every matched repository already present on disk;
    /// repositories never cloned are reported as skipped, not cloned.
    PullAll {
        query: String,
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, default_value = ".")]
        dest: PathBuf,
        #[arg(long, short = 'c', env = "MGIT_DEFAULT_CONCURRENCY")]
        concurrency: Option<usize>,
    },
    /// Write a commented default config template and exit
    GenerateEnv,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// List stored profile names, kinds and URLs (secrets always masked)
    List,
    /// Remove a stored profile
    Remove { name: String },
    /// Read or write a global setting (`default_concurrency`, `default_update_mode`, `default_provider`)
    Get { key: String },
    Set { key: String, value: String },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

fn parse_provider_kind(s: &str) -> std::result::Result<ProviderKind, String> {
    s.parse().map_err(|e: MgitError| e.to_string())
}

fn parse_update_mode(s: &str) -> std::result::Result<UpdateMode, String> {
    s.parse().map_err(|e: MgitError| e.to_string())
}

/// Maps a finished run to the exit codes from `spec.md` §6: 0 success,
/// 1 partial failure, 2 usage error, 3 auth error, 4 cancelled.
pub fn exit_code_for_error(e: &MgitError) -> i32 {
    e.fatal_exit_code()
}

pub fn exit_code_for_summary(summary: &BulkRunSummary) -> i32 {
    summary.exit_code()
}

pub async fn run(cli: Cli) -> i32 {
    if let Some(shell) = &cli.completions {
        return match generate_completions(shell) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e}");
                2
            }
        };
    }

    let Some(command) = cli.command else {
        eprintln!("no subcommand given; run with --help");
        return 2;
    };

    match dispatch(command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            exit_code_for_error(&e)
        }
    }
}

async fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Login {
            name,
            kind,
            url,
            user,
            token,
            workspace,
            default,
        } => {
            let mut cfg = ConfigFile::load()?;
            let profile = ProviderProfile {
                name: name.clone(),
                kind,
                base_url: url,
                user,
                secret: token,
                workspace,
                extras: Default::default(),
            };
            provider::build(profile.clone())?.test_connection().await?;
            cfg.save_profile(profile)?;
            if default {
                cfg.set_global("default_provider", &name)?;
            }
            println!("saved profile {name:?}");
            Ok(0)
        }

        Command::Config { action } => {
            let mut cfg = ConfigFile::load()?;
            match action {
                ConfigAction::List => {
                    for profile in cfg.list_profiles() {
                        println!(
                            "{:<16} {:<12} {:<40} {}",
                            profile.name,
                            profile.kind,
                            profile.base_url,
                            profile.masked_secret()
                        );
                    }
                    Ok(0)
                }
                ConfigAction::Remove { name } => {
                    cfg.remove_profile(&name)?;
                    println!("removed profile {name:?}");
                    Ok(0)
                }
                ConfigAction::Get { key } => {
                    match cfg.get_global(&key) {
                        Some(value) => println!("{value}"),
                        None => println!("(unset)"),
                    }
                    Ok(0)
                }
                ConfigAction::Set { key, value } => {
                    cfg.set_global(&key, &value)?;
                    println!("{key} = {value}");
                    Ok(0)
                }
            }
        }

        Command::List { query, profile, format } => {
            let cfg = ConfigFile::load()?;
            let profile = resolve_profile(&cfg, profile, None)?.clone();
            let provider = provider::build(profile)?;
            let query = QueryPattern::parse(&query, [false, false, false])?;

            let mut stream = provider.list_repositories(query);
            let mut first = true;
            if matches!(format, OutputFormat::Table) {
                println!("{:<30} {:<20} {:<10} {}", "NAME", "ORGANIZATION/PROJECT", "PRIVATE", "BRANCH");
            }
            while let Some(item) = stream.next().await {
                let repo = item?;
                match format {
                    OutputFormat::Json => {
                        let line = serde_json::to_string(&repo)
                            .map_err(|e| MgitError::ConfigError(format!("serializing repository: {e}")))?;
                        println!("{line}");
                    }
                    OutputFormat::Table => {
                        let scope = match &repo.project {
                            Some(p) => format!("{}/{p}", repo.organization),
                            None => repo.organization.clone(),
                        };
                        println!(
                            "{:<30} {:<20} {:<10} {}",
                            repo.name,
                            scope,
                            repo.is_private,
                            repo.default_branch
                        );
                    }
                }
                first = false;
            }
            if first && matches!(format, OutputFormat::Table) {
                println!("(no repositories matched)");
            }
            Ok(0)
        }

        Command::CloneAll {
            query,
            profile,
            dest,
            concurrency,
            mode,
        } => run_clone_all(query, profile, dest, concurrency, mode).await,

        Command::PullAll {
            query,
            profile,
            dest,
            concurrency,
        } => run_pull_all(query, profile, dest, concurrency).await,

        Command::GenerateEnv => {
            let path = ConfigFile::write_default_if_missing()?;
            println!("config template written to {}", path.display());
            Ok(0)
        }
    }
}

/// Resolves the profile and a rate-limit-friendly concurrency for either
/// bulk operation: explicit `--concurrency`, else the configured global
/// default, else 4, capped by the provider's recommended ceiling (§4.6).
fn resolve_bulk_concurrency(cfg: &ConfigFile, profile: &ProviderProfile, concurrency: Option<usize>) -> usize {
    let ceiling = profile.kind.recommended_concurrency_ceiling();
    concurrency.or(cfg.global.default_concurrency).unwrap_or(4).min(ceiling)
}

fn spawn_event_printer(mut rx: mpsc::UnboundedReceiver<ExecutorEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_executor_event(&event);
        }
    })
}

/// Default cap on how many failed tasks the completion summary lists in
/// full, per `spec.md` §7; the complete list is always available via
/// `--format json`.
const DEFAULT_FAILURE_DISPLAY_LIMIT: usize = 20;

fn print_bulk_summary(summary: &BulkRunSummary) {
    println!(
        "\ncreated={} updated={} skipped={} failed={}{}",
        summary.created(),
        summary.updated(),
        summary.skipped(),
        summary.failed(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );

    if summary.failed() > 0 {
        let failures = summary.results.iter().filter(|r| r.is_failure());
        println!("\nfailed tasks (showing up to {DEFAULT_FAILURE_DISPLAY_LIMIT}):");
        for result in failures.take(DEFAULT_FAILURE_DISPLAY_LIMIT) {
            if let TaskOutcome::Failed { message, .. } = &result.outcome {
                println!("  {} — {message}", result.repository_name);
            }
        }
    }
}

async fn run_clone_all(
    query: String,
    profile: Option<String>,
    dest: PathBuf,
    concurrency: Option<usize>,
    mode: UpdateMode,
) -> Result<i32> {
    let cfg = ConfigFile::load()?;
    let profile = resolve_profile(&cfg, profile, None)?.clone();
    let concurrency = resolve_bulk_concurrency(&cfg, &profile, concurrency);

    let secrets = Arc::new(vec![profile.secret.clone()]);
    let provider_impl = provider::build(profile)?;
    let query = QueryPattern::parse(&query, [false, false, false])?;

    let options = BulkRunOptions {
        dest_root: dest,
        update_mode: mode,
        concurrency,
    };

    let (tx, rx) = mpsc::unbounded_channel::<ExecutorEvent>();
    let printer = spawn_event_printer(rx);

    let summary = bulk_ops::clone_all(provider_impl.as_ref(), query, options, secrets, tx).await?;
    let _ = printer.await;

    print_bulk_summary(&summary);
    Ok(exit_code_for_summary(&summary))
}

async fn run_pull_all(
    query: String,
    profile: Option<String>,
    dest: PathBuf,
    concurrency: Option<usize>,
) -> Result<i32> {
    let cfg = ConfigFile::load()?;
    let profile = resolve_profile(&cfg, profile, None)?.clone();
    let concurrency = resolve_bulk_concurrency(&cfg, &profile, concurrency);

    let secrets = Arc::new(vec![profile.secret.clone()]);
    let provider_impl = provider::build(profile)?;
    let query = QueryPattern::parse(&query, [false, false, false])?;

    let (tx, rx) = mpsc::unbounded_channel::<ExecutorEvent>();
    let printer = spawn_event_printer(rx);

    let summary = bulk_ops::pull_all(provider_impl.as_ref(), query, dest, concurrency, secrets, tx).await?;
    let _ = printer.await;

    print_bulk_summary(&summary);
    Ok(exit_code_for_summary(&summary))
}

fn print_executor_event(event: &ExecutorEvent) {
    match event {
        ExecutorEvent::TaskStarted { name, .. } => {
            tracing::debug!(repository = %name, "task started");
        }
        ExecutorEvent::TaskCompleted { result } => match &result.outcome {
            TaskOutcome::Cloned => println!("  cloned    {}", result.repository_name),
            TaskOutcome::Pulled => println!("  pulled    {}", result.repository_name),
            TaskOutcome::Skipped { reason } => {
                println!("  skipped   {} ({reason})", result.repository_name)
            }
            TaskOutcome::Cancelled => println!("  cancelled {}", result.repository_name),
            TaskOutcome::Failed { message, .. } => println!("  failed    {} — {message}", result.repository_name),
        },
        ExecutorEvent::Progress { completed, total } => {
            tracing::debug!(completed, total, "progress");
        }
    }
}

fn resolve_profile<'a>(
    cfg: &'a ConfigFile,
    explicit_name: Option<String>,
    kind: Option<ProviderKind>,
) -> Result<&'a ProviderProfile> {
    match explicit_name {
        Some(name) => cfg.load_profile(&name),
        None => cfg.resolve_default_profile(kind),
    }
}

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{generate, Shell};

    let shell = match shell_name.to_lowercase().as_str() {
        "bash" => Shell::Bash,
        "zsh" => Shell::Zsh,
        "fish" => Shell::Fish,
        "elvish" => Shell::Elvish,
        other => {
            return Err(MgitError::ConfigError(format!(
                "unknown shell {other:?}; supported: bash, zsh, fish, elvish"
            )))
        }
    };

    let mut cmd = <Cli as clap::CommandFactory>::command();
    generate(shell, &mut cmd, "mgit", &mut std::io::stdout());
    Ok(())
}
