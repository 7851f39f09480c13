//! BitBucket adapter (`spec.md` §4.4.3).

use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::config::ProviderProfile;
use crate::error::{MgitError, Result};
use crate::provider::retry::{retry_with_backoff, Attempt, RetryConfig};
use crate::provider::{OrgLike, Provider, ProviderKind, RepoStream, Repository};
use crate::resolver::QueryPattern;
use crate::urlutil::embed_credential;

const DEFAULT_BASE_URL: &str = "https://api.bitbucket.org/2.0";
const PAGE_LEN: u32 = 100;

pub struct BitBucketProvider {
    client: reqwest::Client,
    profile: ProviderProfile,
    base_url: String,
    workspace: String,
}

#[derive(Deserialize)]
struct ProjectsPage {
    values: Vec<ProjectItem>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct ProjectItem {
    key: String,
}

#[derive(Deserialize)]
struct ReposPage {
    values: Vec<RepoItem>,
    next: Option<String>,
}

#[derive(Deserialize)]
struct RepoItem {
    name: String,
    slug: String,
    size: Option<u64>,
    description: Option<String>,
    is_private: bool,
    project: Option<ProjectItem>,
    mainbranch: Option<MainBranch>,
    links: Links,
}

#[derive(Deserialize)]
struct MainBranch {
    name: String,
}

#[derive(Deserialize)]
struct Links {
    clone: Vec<CloneLink>,
}

#[derive(Deserialize)]
struct CloneLink {
    name: String,
    href: String,
}

/// Issues `GET url` with Basic auth, retrying transient failures. Takes
/// owned `client`/`auth` so it can be called from inside a `'static`
/// stream body as well as from plain `&self` methods.
async fn get_retrying(client: &reqwest::Client, auth: &str, url: &str) -> Result<reqwest::Response> {
    retry_with_backoff(&RetryConfig::for_api(), || async {
        let resp = match client.get(url).header("Authorization", auth).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Attempt::Retryable {
                    error: MgitError::NetworkError(e.to_string()),
                    retry_after: None,
                }
            }
            Err(e) => return Attempt::Fatal(MgitError::NetworkError(e.to_string())),
        };

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Attempt::Fatal(MgitError::AuthError(format!("bitbucket rejected credentials ({status})")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Attempt::Retryable {
                error: MgitError::RateLimited("bitbucket rate limit exceeded".into()),
                retry_after,
            };
        }
        if status.is_server_error() {
            return Attempt::Retryable {
                error: MgitError::NetworkError(format!("bitbucket returned {status}")),
                retry_after: None,
            };
        }
        if !status.is_success() {
            return Attempt::Fatal(MgitError::NotFound(format!("bitbucket returned {status} for {url}")));
        }
        Attempt::Ok(resp)
    })
    .await
}

impl BitBucketProvider {
    pub fn new(profile: ProviderProfile) -> Result<Self> {
        let base_url = if profile.base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            profile.base_url.trim_end_matches('/').to_string()
        };
        let workspace = profile
            .workspace
            .clone()
            .ok_or_else(|| MgitError::ConfigError("bitbucket profile missing workspace".into()))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MgitError::ConfigError(format!("building http client: {e}")))?;
        Ok(BitBucketProvider {
            client,
            profile,
            base_url,
            workspace,
        })
    }

    fn auth_header(&self) -> Result<String> {
        let user = self
            .profile
            .user
            .as_deref()
            .ok_or_else(|| MgitError::ConfigError("bitbucket profile missing user".into()))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{}", self.profile.secret));
        Ok(format!("Basic {encoded}"))
    }
}

fn clone_urls(links: &Links) -> (Option<String>, Option<String>) {
    let https = links.clone.iter().find(|l| l.name == "https").map(|l| l.href.clone());
    let ssh = links.clone.iter().find(|l| l.name == "ssh").map(|l| l.href.clone());
    (https, ssh)
}

#[async_trait]
impl Provider for BitBucketProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BitBucket
    }

    async fn test_connection(&self) -> Result<()> {
        let auth = self.auth_header()?;
        let url = format!("{}/workspaces/{}", self.base_url, self.workspace);
        get_retrying(&self.client, &auth, &url).await?;
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<OrgLike>> {
        Ok(vec![OrgLike {
            name: self.workspace.clone(),
            kind: ProviderKind::BitBucket,
        }])
    }

    fn list_repositories(&self, query: QueryPattern) -> RepoStream {
        let base_url = self.base_url.clone();
        let workspace = self.workspace.clone();
        let client = self.client.clone();
        let auth = match self.auth_header() {
            Ok(a) => a,
            Err(e) => {
                return Box::pin(async_stream::try_stream! {
                    Err(e)?;
                });
            }
        };

        let stream = try_stream! {
            if !query.organization.matches(&workspace) {
                return;
            }

            let wants_none_project = query.project.is_none_literal();
            let wants_all_projects = query.project.include.len() == 1
                && query.project.include[0] == "*"
                && query.project.exclude.is_empty();

            // Server-side `q=project.key="KEY"` filtering is only worth doing
            // when the query names specific projects; wildcard/NONE fall back
            // to listing every repository and filtering client-side.
            let mut repo_urls: Vec<String> = Vec::new();
            if wants_all_projects || wants_none_project {
                repo_urls.push(format!("{base_url}/repositories/{workspace}?pagelen={PAGE_LEN}"));
            } else {
                let mut projects_url = format!("{base_url}/workspaces/{workspace}/projects?pagelen={PAGE_LEN}");
                loop {
                    let resp = get_retrying(&client, &auth, &projects_url).await?;
                    let page: ProjectsPage = resp
                        .json()
                        .await
                        .map_err(|e| MgitError::NetworkError(format!("parsing projects: {e}")))?;
                    for project in page.values {
                        if query.project.matches(&project.key) {
                            let q = format!("project.key=\"{}\"", project.key);
                            repo_urls.push(format!(
                                "{base_url}/repositories/{workspace}?pagelen={PAGE_LEN}&q={}",
                                urlencode(&q)
                            ));
                        }
                    }
                    match page.next {
                        Some(n) => projects_url = n,
                        None => break,
                    }
                }
            }

            for mut url in repo_urls {
                loop {
                    let resp = get_retrying(&client, &auth, &url).await?;
                    let page: ReposPage = resp
                        .json()
                        .await
                        .map_err(|e| MgitError::NetworkError(format!("parsing repositories: {e}")))?;

                    for r in page.values {
                        if !query.repository.matches(&r.slug) {
                            continue;
                        }
                        let project_key = r.project.as_ref().map(|p| p.key.clone());
                        if wants_none_project && project_key.is_some() {
                            continue;
                        }
                        let (https_url, ssh_url) = clone_urls(&r.links);
                        let clone_url = match https_url {
                            Some(u) => u,
                            None => continue,
                        };
                        yield Repository {
                            name: r.slug,
                            clone_url,
                            ssh_url,
                            default_branch: r.mainbranch.map(|b| b.name).unwrap_or_else(|| "main".to_string()),
                            is_private: r.is_private,
                            is_disabled: false,
                            size: r.size,
                            description: r.description,
                            created_at: None,
                            updated_at: None,
                            provider_kind: ProviderKind::BitBucket,
                            organization: workspace.clone(),
                            project: project_key,
                            metadata: Default::default(),
                        };
                    }
                    match page.next {
                        Some(n) => url = n,
                        None => break,
                    }
                }
            }
        };
        Box::pin(stream)
    }

    fn authenticated_clone_url(&self, repo: &Repository) -> Result<String> {
        embed_credential(&repo.clone_url, &self.profile)
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
