//! Provider abstraction: a polymorphic contract implemented by three
//! concrete adapters (Azure DevOps, GitHub, BitBucket). Dispatch is by
//! compile-time enum tag at construction time (`ProviderKind` + `build()`),
//! trait-object dispatch thereafter — adding a fourth provider means adding
//! an enum variant and an impl, never touching the resolver or executor.

pub mod azure_devops;
pub mod bitbucket;
pub mod github;
pub mod retry;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::ProviderProfile;
use crate::error::{MgitError, Result};
use crate::resolver::QueryPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "azuredevops")]
    AzureDevOps,
    #[serde(rename = "github")]
    GitHub,
    #[serde(rename = "bitbucket")]
    BitBucket,
}

impl ProviderKind {
    /// Documented rate-limit-friendly concurrency ceiling (`spec.md` §4.6).
    pub fn recommended_concurrency_ceiling(&self) -> usize {
        match self {
            ProviderKind::GitHub => 20,
            ProviderKind::AzureDevOps => 10,
            ProviderKind::BitBucket => 5,
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = MgitError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "azuredevops" | "azure-devops" | "ado" => Ok(ProviderKind::AzureDevOps),
            "github" | "gh" => Ok(ProviderKind::GitHub),
            "bitbucket" | "bb" => Ok(ProviderKind::BitBucket),
            other => Err(MgitError::ConfigError(format!("unknown provider kind {other:?}"))),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderKind::AzureDevOps => "azuredevops",
            ProviderKind::GitHub => "github",
            ProviderKind::BitBucket => "bitbucket",
        };
        write!(f, "{s}")
    }
}

/// Semantic container one level above a repository: an Azure DevOps project,
/// a GitHub org/user, or a BitBucket workspace/project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgLike {
    pub name: String,
    pub kind: ProviderKind,
}

/// A repository as produced by a provider adapter. Immutable after creation;
/// `(provider_kind, organization, project, name)` uniquely identifies one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub clone_url: String,
    pub ssh_url: Option<String>,
    pub default_branch: String,
    pub is_private: bool,
    pub is_disabled: bool,
    pub size: Option<u64>,
    pub description: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub provider_kind: ProviderKind,
    pub organization: String,
    pub project: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Repository {
    /// `(provider_kind, organization, project, name)` identity tuple.
    pub fn identity(&self) -> (ProviderKind, &str, Option<&str>, &str) {
        (
            self.provider_kind,
            &self.organization,
            self.project.as_deref(),
            &self.name,
        )
    }
}

pub type RepoStream = Pin<Box<dyn Stream<Item = Result<Repository>> + Send>>;

/// The polymorphic provider contract from `spec.md` §4.4. Every adapter
/// owns its own `reqwest::Client`, pagination scheme, rate limiting and
/// transient-error retry (via `retry.rs`), and re-applies the query glob
/// client-side even when a server-side filter already narrowed results.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// One cheap authenticated call used both at `login` time and before a
    /// bulk run to fail fast on bad credentials.
    async fn test_connection(&self) -> Result<()>;

    async fn list_organizations(&self) -> Result<Vec<OrgLike>>;

    /// Hierarchical listing honoring `query`'s glob segments and excludes.
    /// Order is unspecified but stable within one call; pages are fetched
    /// lazily as the stream is polled.
    fn list_repositories(&self, query: QueryPattern) -> RepoStream;

    /// Delegates to `urlutil::embed_credential` using this provider's
    /// profile.
    fn authenticated_clone_url(&self, repo: &Repository) -> Result<String>;
}

/// Constructs the concrete adapter for a profile's `kind`. The single enum
/// dispatch point called out in `spec.md` §9's redesign note.
pub fn build(profile: ProviderProfile) -> Result<Box<dyn Provider>> {
    match profile.kind {
        ProviderKind::AzureDevOps => Ok(Box::new(azure_devops::AzureDevOpsProvider::new(profile)?)),
        ProviderKind::GitHub => Ok(Box::new(github::GitHubProvider::new(profile)?)),
        ProviderKind::BitBucket => Ok(Box::new(bitbucket::BitBucketProvider::new(profile)?)),
    }
}
