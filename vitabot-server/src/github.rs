use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::logging::LoggingMiddleware;
use crate::remote::{
    Branch, Comment, Installation, InstallationSource, NewPullRequest, PullRequest,
    RemoteRepository, RemoteRepositoryApi,
};

pub const GITHUB_API: &str = "https://api.github.com";

const PER_PAGE: usize = 100;

const ACCEPT: &str = "application/vnd.github+json";

/// Cached tokens expiring sooner than this are minted again.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// GitHub App client. Authenticates as the app with a JWT and as each
/// installation with a cached installation access token.
#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_base: String,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, InstallationToken>>>,
}

#[derive(Debug, Serialize)]
struct AppClaims {
    iss: u64,
    iat: i64,
    exp: i64,
}

/// Installation access token as minted by `POST .../access_tokens`.
#[derive(Debug, Clone, Deserialize)]
struct InstallationToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositoriesResponse {
    repositories: Vec<RemoteRepository>,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String) -> Result<Self> {
        Self::with_api_base(app_id, private_key, GITHUB_API)
    }

    pub fn with_api_base(app_id: u64, private_key: String, api_base: &str) -> Result<Self> {
        Ok(Self {
            client: create_github_client()?,
            api_base: api_base.trim_end_matches('/').to_string(),
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// An API handle acting as one installation.
    pub fn installation(&self, installation_id: u64) -> InstallationClient {
        InstallationClient {
            client: self.clone(),
            installation_id,
        }
    }

    /// Short-lived RS256 token identifying the app itself.
    fn app_jwt(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        // iat is backdated for clock skew; GitHub rejects exp beyond 10 minutes.
        let claims = AppClaims {
            iss: self.app_id,
            iat: now - 60,
            exp: now + 9 * 60,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("App private key is not an RSA PEM key")?;
        encode(&Header::new(Algorithm::RS256), &claims, &key).context("Failed to sign app JWT")
    }

    async fn cached_token(&self, installation_id: u64) -> Option<String> {
        let margin = Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);
        self.token_cache
            .read()
            .await
            .get(&installation_id)
            .filter(|cached| cached.expires_at - Utc::now() > margin)
            .map(|cached| cached.token.clone())
    }

    async fn installation_token(&self, installation_id: u64) -> Result<String> {
        if let Some(token) = self.cached_token(installation_id).await {
            return Ok(token);
        }

        debug!("Minting access token for installation {}", installation_id);
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base, installation_id
        );
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.app_jwt()?))
            .header("Accept", ACCEPT)
            .send()
            .await
            .with_context(|| format!("No access token for installation {}", installation_id))?;
        let minted: InstallationToken = error_for_status(response, &url)
            .await?
            .json()
            .await
            .context("Malformed access token response")?;

        self.token_cache
            .write()
            .await
            .insert(installation_id, minted.clone());
        Ok(minted.token)
    }

    async fn invalidate_token(&self, installation_id: u64) {
        let mut cache = self.token_cache.write().await;
        cache.remove(&installation_id);
    }

    /// Send a request as `installation_id`. A 401 is retried once with a
    /// fresh token; any other status is returned to the caller.
    async fn send(
        &self,
        installation_id: u64,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.installation_token(installation_id).await?;
        let response = self
            .request(method.clone(), url, &token, body)
            .send()
            .await
            .with_context(|| format!("Failed to send {} {}", method, url))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Got 401 from {} {}, retrying with fresh token", method, url);
        self.invalidate_token(installation_id).await;
        let fresh_token = self.installation_token(installation_id).await?;

        self.request(method.clone(), url, &fresh_token, body)
            .send()
            .await
            .with_context(|| format!("Failed to send retry of {} {}", method, url))
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        token: &str,
        body: Option<&serde_json::Value>,
    ) -> reqwest_middleware::RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", ACCEPT);
        match body {
            Some(body) => builder.json(body),
            None => builder,
        }
    }

    async fn send_json<T: DeserializeOwned + Send>(
        &self,
        installation_id: u64,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<T> {
        let response = self.send(installation_id, method, url, body).await?;
        let response = error_for_status(response, url).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// GET every page of a list endpoint. `extract` pulls the items out of
    /// one page's body; a page shorter than `per_page` is the last one.
    async fn get_all_pages<P, T, F>(
        &self,
        installation_id: u64,
        url: &str,
        extract: F,
    ) -> Result<Vec<T>>
    where
        P: DeserializeOwned + Send,
        T: Send,
        F: Fn(P) -> Vec<T> + Send + Sync,
    {
        let separator = if url.contains('?') { '&' } else { '?' };
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let page_url = format!(
                "{}{}page={}&per_page={}",
                url, separator, page, PER_PAGE
            );
            let body: P = self
                .send_json(installation_id, Method::GET, &page_url, None)
                .await?;
            let items = extract(body);
            let count = items.len();
            all.extend(items);

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(all)
    }

    async fn app_get_all_pages<T: DeserializeOwned + Send>(&self, url: &str) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let mut page = 1;

        loop {
            let jwt = self.app_jwt()?;
            let page_url = format!("{}?page={}&per_page={}", url, page, PER_PAGE);
            let response = self
                .client
                .get(&page_url)
                .header("Authorization", format!("Bearer {}", jwt))
                .header("Accept", ACCEPT)
                .send()
                .await
                .with_context(|| format!("Failed to send GET {}", page_url))?;
            let response = error_for_status(response, &page_url).await?;
            let items: Vec<T> = response
                .json()
                .await
                .with_context(|| format!("Failed to parse response from {}", page_url))?;
            let count = items.len();
            all.extend(items);

            if count < PER_PAGE {
                break;
            }
            page += 1;
        }

        Ok(all)
    }
}

#[async_trait]
impl InstallationSource for GitHubClient {
    async fn list_installations(&self) -> Result<Vec<Installation>> {
        let url = format!("{}/app/installations", self.api_base);
        let installations: Vec<Installation> = self.app_get_all_pages(&url).await?;
        info!("Found {} installations", installations.len());
        Ok(installations)
    }

    async fn list_installation_repositories(
        &self,
        installation_id: u64,
    ) -> Result<Vec<RemoteRepository>> {
        let url = format!("{}/installation/repositories", self.api_base);
        let repos = self
            .get_all_pages(installation_id, &url, |page: InstallationRepositoriesResponse| {
                page.repositories
            })
            .await?;
        info!(
            "Installation {} has access to {} repositories",
            installation_id,
            repos.len()
        );
        Ok(repos)
    }

    fn installation_api(&self, installation_id: u64) -> Arc<dyn RemoteRepositoryApi> {
        Arc::new(self.installation(installation_id))
    }
}

/// [`GitHubClient`] bound to one installation.
#[derive(Clone)]
pub struct InstallationClient {
    client: GitHubClient,
    installation_id: u64,
}

impl InstallationClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.client.api_base, path)
    }
}

#[async_trait]
impl RemoteRepositoryApi for InstallationClient {
    async fn get_repository(&self, owner: &str, repo: &str) -> Result<Option<RemoteRepository>> {
        let url = self.url(&format!("/repos/{}/{}", owner, repo));
        let response = self
            .client
            .send(self.installation_id, Method::GET, &url, None)
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = error_for_status(response, &url).await?;
        let repository = response
            .json()
            .await
            .context("Failed to parse repository response")?;
        Ok(Some(repository))
    }

    async fn create_fork(
        &self,
        owner: &str,
        repo: &str,
        organization: &str,
    ) -> Result<RemoteRepository> {
        info!("Forking {}/{} into {}", owner, repo, organization);
        let url = self.url(&format!("/repos/{}/{}/forks", owner, repo));
        let body = json!({ "organization": organization });
        self.client
            .send_json(self.installation_id, Method::POST, &url, Some(&body))
            .await
    }

    async fn list_organization_forks(&self, org: &str) -> Result<Vec<RemoteRepository>> {
        let url = self.url(&format!("/orgs/{}/repos?type=forks", org));
        self.client
            .get_all_pages(self.installation_id, &url, |page: Vec<RemoteRepository>| page)
            .await
    }

    async fn list_branches(&self, owner: &str, repo: &str) -> Result<Vec<Branch>> {
        let url = self.url(&format!("/repos/{}/{}/branches", owner, repo));
        self.client
            .get_all_pages(self.installation_id, &url, |page: Vec<Branch>| page)
            .await
    }

    async fn list_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        state: &str,
    ) -> Result<Vec<PullRequest>> {
        let url = self.url(&format!("/repos/{}/{}/pulls?state={}", owner, repo, state));
        self.client
            .get_all_pages(self.installation_id, &url, |page: Vec<PullRequest>| page)
            .await
    }

    async fn create_pull_request(
        &self,
        owner: &str,
        repo: &str,
        request: &NewPullRequest,
    ) -> Result<PullRequest> {
        let url = self.url(&format!("/repos/{}/{}/pulls", owner, repo));
        let body = serde_json::to_value(request)?;
        let pr: PullRequest = self
            .client
            .send_json(self.installation_id, Method::POST, &url, Some(&body))
            .await?;
        info!("Opened pull request #{} in {}/{}", pr.number, owner, repo);
        Ok(pr)
    }

    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
        body: &str,
    ) -> Result<Comment> {
        let url = self.url(&format!("/repos/{}/{}/issues/{}/comments", owner, repo, number));
        let body = json!({ "body": body });
        let comment: Comment = self
            .client
            .send_json(self.installation_id, Method::POST, &url, Some(&body))
            .await?;
        info!("Posted comment {} on #{} in {}/{}", comment.id, number, owner, repo);
        Ok(comment)
    }

    async fn push_url(&self, clone_url: &str) -> Result<String> {
        let token = self
            .client
            .installation_token(self.installation_id)
            .await?;
        Ok(with_token(clone_url, &token))
    }
}

/// `https://host/...` with `x-access-token:<token>@` as user info.
fn with_token(clone_url: &str, token: &str) -> String {
    match clone_url.strip_prefix("https://") {
        Some(rest) => format!("https://x-access-token:{}@{}", token, rest),
        None => clone_url.to_string(),
    }
}

async fn error_for_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    error!("GitHub API error for {}: {} - {}", url, status, error_text);
    Err(anyhow!(
        "GitHub API error for {}: {} - {}",
        url,
        status,
        error_text
    ))
}

pub fn create_github_client() -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(concat!("vitabot/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client).with(LoggingMiddleware).build())
}
