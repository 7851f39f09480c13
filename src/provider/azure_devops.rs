//! Azure DevOps adapter (`spec.md` §4.4.1).

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::config::ProviderProfile;
use crate::error::{MgitError, Result};
use crate::provider::retry::{retry_with_backoff, Attempt, RateLimiter, RetryConfig};
use crate::provider::{OrgLike, Provider, ProviderKind, RepoStream, Repository};
use crate::resolver::QueryPattern;
use crate::urlutil::embed_credential;

const API_VERSION: &str = "7.1";

/// Azure DevOps' paging cursor header (`spec.md` §4.4 "Azure DevOps
/// continuation tokens"); echoed back as the `continuationToken` query
/// parameter to fetch the next page.
const CONTINUATION_HEADER: &str = "x-ms-continuationtoken";

pub struct AzureDevOpsProvider {
    client: reqwest::Client,
    profile: ProviderProfile,
    org: String,
    rate_limiter: Arc<RateLimiter>,
}

#[derive(Deserialize)]
struct ProjectsResponse {
    value: Vec<ProjectItem>,
}

#[derive(Deserialize)]
struct ProjectItem {
    name: String,
}

#[derive(Deserialize)]
struct ReposResponse {
    value: Vec<RepoItem>,
}

#[derive(Deserialize)]
struct RepoItem {
    name: String,
    #[serde(rename = "remoteUrl")]
    remote_url: String,
    #[serde(rename = "sshUrl")]
    ssh_url: Option<String>,
    #[serde(rename = "defaultBranch")]
    default_branch: Option<String>,
    size: Option<u64>,
    #[serde(rename = "isDisabled")]
    is_disabled: Option<bool>,
}

impl AzureDevOpsProvider {
    pub fn new(profile: ProviderProfile) -> Result<Self> {
        let org = profile
            .base_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .ok_or_else(|| MgitError::ConfigError("azure devops profile url missing org segment".into()))?
            .to_string();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MgitError::ConfigError(format!("building http client: {e}")))?;
        Ok(AzureDevOpsProvider {
            client,
            profile,
            org,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    fn auth_header(&self) -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!(":{}", self.profile.secret));
        format!("Basic {encoded}")
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let (value, _continuation) = get_json(&self.client, &self.auth_header(), &self.rate_limiter, url).await?;
        Ok(value)
    }
}

/// Issues `GET url` with Basic auth, preemptive rate-limit backoff and
/// transient-failure retry, returning the decoded body alongside the
/// `x-ms-continuationtoken` cursor for the next page, if any. Takes owned
/// handles so it can run from inside a `'static` stream body as well as
/// from `AzureDevOpsProvider::get_json`.
async fn get_json<T: serde::de::DeserializeOwned>(
    client: &reqwest::Client,
    auth_header: &str,
    rate_limiter: &RateLimiter,
    url: &str,
) -> Result<(T, Option<String>)> {
    rate_limiter.acquire().await;
    retry_with_backoff(&RetryConfig::for_api(), || async {
        let resp = match client.get(url).header("Authorization", auth_header).send().await {
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
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Attempt::Fatal(MgitError::AuthError(format!("azure devops rejected credentials ({status})")));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Attempt::Retryable {
                error: MgitError::RateLimited("azure devops rate limit exceeded".into()),
                retry_after,
            };
        }
        if status.is_server_error() {
            return Attempt::Retryable {
                error: MgitError::NetworkError(format!("azure devops returned {status}")),
                retry_after: None,
            };
        }
        if !status.is_success() {
            return Attempt::Fatal(MgitError::NotFound(format!("azure devops returned {status} for {url}")));
        }

        let continuation = resp
            .headers()
            .get(CONTINUATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        match resp.json::<T>().await {
            Ok(v) => Attempt::Ok((v, continuation)),
            Err(e) => Attempt::Fatal(MgitError::NetworkError(format!("parsing response: {e}"))),
        }
    })
    .await
}

fn with_continuation_token(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}continuationToken={token}")
}

#[async_trait]
impl Provider for AzureDevOpsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureDevOps
    }

    async fn test_connection(&self) -> Result<()> {
        let url = format!("{}/_apis/projects?api-version={API_VERSION}&$top=1", self.profile.base_url);
        self.get_json::<ProjectsResponse>(&url).await?;
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<OrgLike>> {
        Ok(vec![OrgLike {
            name: self.org.clone(),
            kind: ProviderKind::AzureDevOps,
        }])
    }

    fn list_repositories(&self, query: QueryPattern) -> RepoStream {
        let base_url = self.profile.base_url.clone();
        let auth_header = self.auth_header();
        let client = self.client.clone();
        let org = self.org.clone();
        let rate_limiter = self.rate_limiter.clone();

        let stream = try_stream! {
            if !query.organization.matches(&org) {
                return;
            }
            if query.project.is_none_literal() {
                Err(MgitError::InvalidQuery {
                    query: "NONE".to_string(),
                    reason: "Azure DevOps requires a project; NONE is invalid".to_string(),
                })?;
            }

            let mut projects = Vec::new();
            let mut projects_url = format!("{base_url}/_apis/projects?api-version={API_VERSION}&$top=1000");
            loop {
                let (page, continuation): (ProjectsResponse, Option<String>) =
                    get_json(&client, &auth_header, &rate_limiter, &projects_url).await?;
                projects.extend(page.value);
                match continuation {
                    Some(token) => projects_url = with_continuation_token(&projects_url, &token),
                    None => break,
                }
            }

            for project in projects {
                if !query.project.matches(&project.name) {
                    continue;
                }
                let mut repos = Vec::new();
                let mut repos_url = format!(
                    "{base_url}/{}/_apis/git/repositories?api-version={API_VERSION}",
                    project.name
                );
                loop {
                    let (page, continuation): (ReposResponse, Option<String>) =
                        get_json(&client, &auth_header, &rate_limiter, &repos_url).await?;
                    repos.extend(page.value);
                    match continuation {
                        Some(token) => repos_url = with_continuation_token(&repos_url, &token),
                        None => break,
                    }
                }

                for r in repos {
                    if !query.repository.matches(&r.name) {
                        continue;
                    }
                    let default_branch = r
                        .default_branch
                        .unwrap_or_else(|| "refs/heads/main".to_string())
                        .trim_start_matches("refs/heads/")
                        .to_string();
                    yield Repository {
                        name: r.name,
                        clone_url: r.remote_url,
                        ssh_url: r.ssh_url,
                        default_branch,
                        is_private: true,
                        is_disabled: r.is_disabled.unwrap_or(false),
                        size: r.size,
                        description: None,
                        created_at: None,
                        updated_at: None,
                        provider_kind: ProviderKind::AzureDevOps,
                        organization: org.clone(),
                        project: Some(project.name.clone()),
                        metadata: Default::default(),
                    };
                }
            }
        };
        Box::pin(stream)
    }

    fn authenticated_clone_url(&self, repo: &Repository) -> Result<String> {
        embed_credential(&repo.clone_url, &self.profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn profile() -> ProviderProfile {
        ProviderProfile {
            name: "az1".into(),
            kind: ProviderKind::AzureDevOps,
            base_url: "https://dev.azure.com/acme".into(),
            user: None,
            secret: "PAT_X".into(),
            workspace: None,
            extras: HashMap::new(),
        }
    }

    #[test]
    fn extracts_org_from_base_url() {
        let provider = AzureDevOpsProvider::new(profile()).unwrap();
        assert_eq!(provider.org, "acme");
    }

    #[test]
    fn auth_header_is_basic_with_empty_username() {
        let provider = AzureDevOpsProvider::new(profile()).unwrap();
        let header = provider.auth_header();
        assert!(header.starts_with("Basic "));
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header.trim_start_matches("Basic "))
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), ":PAT_X");
    }

    #[test]
    fn continuation_token_appends_with_correct_separator() {
        assert_eq!(
            with_continuation_token("https://x/_apis/projects?api-version=7.1", "abc"),
            "https://x/_apis/projects?api-version=7.1&continuationToken=abc"
        );
        assert_eq!(
            with_continuation_token("https://x/_apis/git/repositories", "abc"),
            "https://x/_apis/git/repositories?continuationToken=abc"
        );
    }
}
