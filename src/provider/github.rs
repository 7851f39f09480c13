//! GitHub adapter (`spec.md` §4.4.2).

use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;

use crate::config::ProviderProfile;
use crate::error::{MgitError, Result};
use crate::provider::retry::{retry_with_backoff, Attempt, RateLimiter, RetryConfig};
use crate::provider::{OrgLike, Provider, ProviderKind, RepoStream, Repository};
use crate::resolver::QueryPattern;
use crate::urlutil::embed_credential;

const DEFAULT_BASE_URL: &str = "https://api.github.com";
const PER_PAGE: u32 = 100;

pub struct GitHubProvider {
    client: reqwest::Client,
    profile: ProviderProfile,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

#[derive(Deserialize)]
struct OrgItem {
    login: String,
}

#[derive(Deserialize)]
struct RepoItem {
    name: String,
    clone_url: String,
    ssh_url: String,
    default_branch: String,
    private: bool,
    archived: bool,
    size: Option<u64>,
    description: Option<String>,
}

impl GitHubProvider {
    pub fn new(profile: ProviderProfile) -> Result<Self> {
        let base_url = if profile.base_url.trim().is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            profile.base_url.trim_end_matches('/').to_string()
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MgitError::ConfigError(format!("building http client: {e}")))?;
        Ok(GitHubProvider {
            client,
            profile,
            base_url,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = format!("token {}", self.profile.secret);
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&value).expect("token bytes form a valid header value"),
        );
        headers.insert("Accept", HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("User-Agent", HeaderValue::from_static("mgit"));
        headers
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response> {
        send(&self.client, &self.auth_headers(), &self.rate_limiter, url).await
    }

    /// `Link: <url>; rel="next"` cursor for the next page, if any.
    fn next_page_url(resp: &reqwest::Response) -> Option<String> {
        let link = resp.headers().get("Link")?.to_str().ok()?;
        for part in link.split(',') {
            let mut segments = part.split(';');
            let url_part = segments.next()?.trim();
            let rel_part = segments.next()?.trim();
            if rel_part == "rel=\"next\"" {
                return Some(url_part.trim_start_matches('<').trim_end_matches('>').to_string());
            }
        }
        None
    }
}

fn header_as_u32(resp: &reqwest::Response, name: &str) -> Option<u32> {
    resp.headers().get(name)?.to_str().ok()?.parse().ok()
}

/// Picks which org/user names to fetch repos for and whether each one
/// should fall back from `/orgs/<name>/repos` to `/users/<name>/repos` on
/// a 404. A literal org glob (`acme`) is queried directly and may actually
/// name a personal account, so it gets the fallback; a wildcard glob only
/// ever sees names already confirmed by `/user/orgs`, so it doesn't
/// (`spec.md` §4.4.2).
fn org_targets(query_org: &crate::resolver::Segment, enumerated_orgs: Vec<String>) -> Vec<(String, bool)> {
    if let Some(org) = query_org.as_literal() {
        vec![(org.to_string(), true)]
    } else {
        enumerated_orgs
            .into_iter()
            .filter(|name| query_org.matches(name))
            .map(|name| (name, false))
            .collect()
    }
}

/// Issues `GET url` with auth headers, preemptive rate-limit backoff and
/// transient-failure retry. Takes owned handles so it can run from inside a
/// `'static` stream body as well as from `GitHubProvider::send`.
async fn send(client: &reqwest::Client, headers: &HeaderMap, rate_limiter: &RateLimiter, url: &str) -> Result<reqwest::Response> {
    rate_limiter.acquire().await;
    retry_with_backoff(&RetryConfig::for_api(), || async {
        let resp = match client.get(url).headers(headers.clone()).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return Attempt::Retryable {
                    error: MgitError::NetworkError(e.to_string()),
                    retry_after: None,
                }
            }
            Err(e) => return Attempt::Fatal(MgitError::NetworkError(e.to_string())),
        };

        let remaining = header_as_u32(&resp, "x-ratelimit-remaining");
        let limit = header_as_u32(&resp, "x-ratelimit-limit");
        rate_limiter.observe(remaining, limit).await;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            if remaining == Some(0) {
                return Attempt::Retryable {
                    error: MgitError::RateLimited("github rate limit exhausted".into()),
                    retry_after: Some(std::time::Duration::from_secs(60)),
                };
            }
            return Attempt::Fatal(MgitError::AuthError(format!("github rejected credentials ({status})")));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Attempt::Fatal(MgitError::NotFound(format!("github returned 404 for {url}")));
        }
        if status.is_server_error() {
            return Attempt::Retryable {
                error: MgitError::NetworkError(format!("github returned {status}")),
                retry_after: None,
            };
        }
        if !status.is_success() {
            return Attempt::Fatal(MgitError::NetworkError(format!("github returned {status} for {url}")));
        }
        Attempt::Ok(resp)
    })
    .await
}

#[async_trait]
impl Provider for GitHubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    async fn test_connection(&self) -> Result<()> {
        let url = format!("{}/user", self.base_url);
        self.send(&url).await?;
        Ok(())
    }

    async fn list_organizations(&self) -> Result<Vec<OrgLike>> {
        let mut orgs = Vec::new();
        let mut url = format!("{}/user/orgs?per_page={PER_PAGE}", self.base_url);
        loop {
            let resp = self.send(&url).await?;
            let next = GitHubProvider::next_page_url(&resp);
            let items: Vec<OrgItem> = resp
                .json()
                .await
                .map_err(|e| MgitError::NetworkError(format!("parsing orgs: {e}")))?;
            orgs.extend(items.into_iter().map(|o| OrgLike {
                name: o.login,
                kind: ProviderKind::GitHub,
            }));
            match next {
                Some(n) => url = n,
                None => break,
            }
        }
        Ok(orgs)
    }

    fn list_repositories(&self, query: QueryPattern) -> RepoStream {
        let base_url = self.base_url.clone();
        let auth_headers = self.auth_headers();
        let client = self.client.clone();
        let rate_limiter = self.rate_limiter.clone();

        let stream = try_stream! {
            let project_ok = query.project.is_none_literal()
                || (query.project.include.len() == 1
                    && query.project.include[0] == "*"
                    && query.project.exclude.is_empty());
            if !project_ok {
                Err(MgitError::InvalidQuery {
                    query: "project".to_string(),
                    reason: "github has no project level; the project segment must be '*' or 'NONE'".to_string(),
                })?;
            }
            if query.project.is_none_literal() {
                return;
            }

            let enumerated_orgs = if query.organization.as_literal().is_some() {
                Vec::new()
            } else {
                let mut names = Vec::new();
                let mut url = format!("{base_url}/user/orgs?per_page={PER_PAGE}");
                loop {
                    let resp = send(&client, &auth_headers, &rate_limiter, &url).await?;
                    let next = GitHubProvider::next_page_url(&resp);
                    let items: Vec<OrgItem> = resp
                        .json()
                        .await
                        .map_err(|e| MgitError::NetworkError(format!("parsing orgs: {e}")))?;
                    names.extend(items.into_iter().map(|o| o.login));
                    match next {
                        Some(n) => url = n,
                        None => break,
                    }
                }
                names
            };

            for (org, allow_user_fallback) in org_targets(&query.organization, enumerated_orgs) {
                let org_url = format!("{base_url}/orgs/{org}/repos?per_page={PER_PAGE}");
                let mut resp = match send(&client, &auth_headers, &rate_limiter, &org_url).await {
                    Ok(resp) => resp,
                    Err(MgitError::NotFound(_)) if allow_user_fallback => {
                        let user_url = format!("{base_url}/users/{org}/repos?per_page={PER_PAGE}");
                        send(&client, &auth_headers, &rate_limiter, &user_url).await?
                    }
                    Err(MgitError::NotFound(_)) => continue,
                    Err(e) => Err(e)?,
                };

                loop {
                    let next = GitHubProvider::next_page_url(&resp);
                    let repos: Vec<RepoItem> = resp
                        .json()
                        .await
                        .map_err(|e| MgitError::NetworkError(format!("parsing repos: {e}")))?;

                    for r in repos {
                        if r.archived || !query.repository.matches(&r.name) {
                            continue;
                        }
                        yield Repository {
                            name: r.name,
                            clone_url: r.clone_url,
                            ssh_url: Some(r.ssh_url),
                            default_branch: r.default_branch,
                            is_private: r.private,
                            is_disabled: r.archived,
                            size: r.size,
                            description: r.description,
                            created_at: None,
                            updated_at: None,
                            provider_kind: ProviderKind::GitHub,
                            organization: org.clone(),
                            project: None,
                            metadata: Default::default(),
                        };
                    }
                    match next {
                        Some(n) => resp = send(&client, &auth_headers, &rate_limiter, &n).await?,
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn profile() -> ProviderProfile {
        ProviderProfile {
            name: "gh1".into(),
            kind: ProviderKind::GitHub,
            base_url: "https://api.github.com".into(),
            user: None,
            secret: "ghp_xyz".into(),
            workspace: None,
            extras: HashMap::new(),
        }
    }

    #[test]
    fn defaults_base_url_when_blank() {
        let mut p = profile();
        p.base_url = "".into();
        let provider = GitHubProvider::new(p).unwrap();
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn auth_header_uses_token_scheme() {
        let provider = GitHubProvider::new(profile()).unwrap();
        let headers = provider.auth_headers();
        assert_eq!(headers.get("Authorization").unwrap(), "token ghp_xyz");
    }

    #[test]
    fn trims_trailing_slash_from_base_url() {
        let mut p = profile();
        p.base_url = "https://api.github.com/".into();
        let provider = GitHubProvider::new(p).unwrap();
        assert_eq!(provider.base_url, "https://api.github.com");
    }

    #[test]
    fn literal_org_is_queried_directly_with_user_fallback_allowed() {
        let q = QueryPattern::parse("acme", [false, false, false]).unwrap();
        let targets = org_targets(&q.organization, vec!["unrelated".to_string()]);
        assert_eq!(targets, vec![("acme".to_string(), true)]);
    }

    #[test]
    fn wildcard_org_filters_enumerated_candidates_without_fallback() {
        let q = QueryPattern::parse("acme-*", [false, false, false]).unwrap();
        let targets = org_targets(&q.organization, vec!["acme-eng".to_string(), "other".to_string()]);
        assert_eq!(targets, vec![("acme-eng".to_string(), false)]);
    }
}
