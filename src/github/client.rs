use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::cache::{self, CacheError, RemotePage, RemoteSource};
use crate::config::Config;
use crate::github::api_types::{
  parse_link_header, ApiSearchUsersResponse, ApiUser, ApiUserDetail,
};
use crate::github::cache::UsersQuery;
use crate::github::types::{User, UserDetail};

/// GitHub REST client
#[derive(Clone)]
pub struct GithubClient {
  http: reqwest::Client,
  /// API root, always ending in `/` so relative joins keep its path.
  base: Url,
}

impl GithubClient {
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_token(config, Config::get_api_token())
  }

  pub fn with_token(config: &Config, token: Option<String>) -> Result<Self> {
    let mut base = Url::parse(&config.github.api_url)
      .map_err(|e| eyre!("Invalid GitHub API url {}: {}", config.github.api_url, e))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
    headers.insert("x-github-api-version", HeaderValue::from_static("2022-11-28"));
    if let Some(token) = token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| eyre!("GitHub token contains invalid characters"))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .user_agent(config.github.user_agent.clone())
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base })
  }

  /// URL of the first page of `query`.
  fn first_page_url(&self, query: &UsersQuery, page_size: usize) -> cache::Result<Url> {
    let path = match query {
      UsersQuery::All => "users",
      UsersQuery::Search { .. } => "search/users",
    };
    let mut url = self.base.join(path).map_err(CacheError::transport)?;
    {
      let mut pairs = url.query_pairs_mut();
      if let UsersQuery::Search { q } = query {
        pairs.append_pair("q", q);
      }
      pairs.append_pair("per_page", &page_size.to_string());
    }
    Ok(url)
  }

  fn user_url(&self, login: &str) -> cache::Result<Url> {
    let mut url = self.base.join("users/").map_err(CacheError::transport)?;
    url
      .path_segments_mut()
      .map_err(|_| CacheError::transport("API url cannot have path segments"))?
      .pop_if_empty()
      .push(login);
    Ok(url)
  }

  async fn get(&self, url: Url) -> cache::Result<Response> {
    debug!(%url, "GET");
    self
      .http
      .get(url)
      .send()
      .await
      .map_err(|e| CacheError::transport(format!("request failed: {}", e)))
  }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> cache::Result<T> {
  let status = response.status();
  let url = response.url().clone();
  let body = response
    .bytes()
    .await
    .map_err(|e| CacheError::transport(format!("failed to read {}: {}", url, e)))?;

  if !status.is_success() {
    return Err(CacheError::transport(format!(
      "{} returned {}: {}",
      url,
      status,
      api_message(&body)
    )));
  }

  serde_json::from_slice(&body)
    .map_err(|e| CacheError::transport(format!("failed to parse {}: {}", url, e)))
}

/// The `message` of a GitHub error body, or the raw text.
fn api_message(body: &[u8]) -> String {
  serde_json::from_slice::<serde_json::Value>(body)
    .ok()
    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
    .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

#[async_trait]
impl RemoteSource for GithubClient {
  type Query = UsersQuery;
  type Summary = User;
  type Detail = UserDetail;

  async fn fetch_page(
    &self,
    query: &UsersQuery,
    token: Option<&str>,
    page_size: usize,
  ) -> cache::Result<RemotePage<User>> {
    let url = match token {
      Some(link) => Url::parse(link)
        .map_err(|e| CacheError::transport(format!("bad page link {}: {}", link, e)))?,
      None => self.first_page_url(query, page_size)?,
    };

    let response = self.get(url).await?;
    let links = response
      .headers()
      .get(LINK)
      .and_then(|v| v.to_str().ok())
      .map(parse_link_header)
      .unwrap_or_default();

    let users: Vec<ApiUser> = match query {
      UsersQuery::All => read_json(response).await?,
      UsersQuery::Search { .. } => {
        let found: ApiSearchUsersResponse = read_json(response).await?;
        debug!(total_count = found.total_count, "search page fetched");
        found.items
      }
    };

    Ok(RemotePage {
      records: users.into_iter().map(ApiUser::into_user).collect(),
      next_token: links.next,
      prev_token: links.prev,
    })
  }

  async fn fetch_detail(&self, login: &str) -> cache::Result<Option<UserDetail>> {
    let response = self.get(self.user_url(login)?).await?;
    if response.status() == StatusCode::NOT_FOUND {
      debug!(login, "user not found");
      return Ok(None);
    }

    let detail: ApiUserDetail = read_json(response).await?;
    Ok(Some(detail.into_detail()))
  }
}
