//! Serde-deserializable types matching GitHub REST responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use super::types::{User, UserDetail};

// ============================================================================
// Users list and search endpoints
// ============================================================================

/// Entry of `GET /users` and of `items` in `GET /search/users`.
#[derive(Debug, Deserialize)]
pub struct ApiUser {
  pub id: u64,
  pub login: String,
  #[serde(default)]
  pub avatar_url: String,
  #[serde(default)]
  pub html_url: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiSearchUsersResponse {
  #[serde(default)]
  pub total_count: u64,
  #[serde(default)]
  pub items: Vec<ApiUser>,
}

// ============================================================================
// Single user endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUserDetail {
  pub id: u64,
  pub login: String,
  pub name: Option<String>,
  #[serde(default)]
  pub avatar_url: String,
  #[serde(default)]
  pub html_url: String,
  pub company: Option<String>,
  pub blog: Option<String>,
  pub location: Option<String>,
  pub bio: Option<String>,
  #[serde(default)]
  pub public_repos: u32,
  #[serde(default)]
  pub followers: u32,
  #[serde(default)]
  pub following: u32,
  pub updated_at: Option<String>,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl ApiUser {
  pub fn into_user(self) -> User {
    User {
      id: self.id,
      login: self.login,
      avatar_url: self.avatar_url,
      html_url: self.html_url,
    }
  }
}

impl ApiUserDetail {
  pub fn into_detail(self) -> UserDetail {
    UserDetail {
      id: self.id,
      login: self.login,
      name: self.name.filter(|n| !n.is_empty()),
      avatar_url: self.avatar_url,
      html_url: self.html_url,
      company: self.company.filter(|c| !c.is_empty()),
      blog: self.blog.filter(|b| !b.is_empty()),
      location: self.location.filter(|l| !l.is_empty()),
      bio: self.bio.filter(|b| !b.is_empty()),
      public_repos: self.public_repos,
      followers: self.followers,
      following: self.following,
      updated_at: self.updated_at,
    }
  }
}

// ============================================================================
// Link header
// ============================================================================

/// Page links advertised in a response's `Link` header.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageLinks {
  pub next: Option<String>,
  pub prev: Option<String>,
}

/// Parse an RFC 8288 `Link` header value such as
/// `<https://api.github.com/users?since=46>; rel="next", <...>; rel="first"`.
pub fn parse_link_header(value: &str) -> PageLinks {
  let mut links = PageLinks::default();

  for entry in value.split(',') {
    let mut parts = entry.split(';');
    let target = match parts.next().map(str::trim) {
      Some(t) if t.starts_with('<') && t.ends_with('>') => &t[1..t.len() - 1],
      _ => continue,
    };

    for param in parts {
      let Some((name, rels)) = param.split_once('=') else {
        continue;
      };
      if name.trim() != "rel" {
        continue;
      }
      // rel may hold several space separated relation types
      for rel in rels.trim().trim_matches('"').split_whitespace() {
        match rel {
          "next" => links.next = Some(target.to_string()),
          "prev" => links.prev = Some(target.to_string()),
          _ => {}
        }
      }
    }
  }

  links
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_link_header_next_only() {
    let links = parse_link_header(
      r#"<https://api.github.com/users?per_page=20&since=46>; rel="next", <https://api.github.com/users{?since}>; rel="first""#,
    );
    assert_eq!(
      links.next.as_deref(),
      Some("https://api.github.com/users?per_page=20&since=46")
    );
    assert_eq!(links.prev, None);
  }

  #[test]
  fn test_parse_link_header_search() {
    let links = parse_link_header(
      r#"<https://api.github.com/search/users?q=rust&page=1>; rel="prev", <https://api.github.com/search/users?q=rust&page=3>; rel="next", <https://api.github.com/search/users?q=rust&page=34>; rel="last""#,
    );
    assert_eq!(
      links.prev.as_deref(),
      Some("https://api.github.com/search/users?q=rust&page=1")
    );
    assert_eq!(
      links.next.as_deref(),
      Some("https://api.github.com/search/users?q=rust&page=3")
    );
  }

  #[test]
  fn test_parse_link_header_garbage() {
    assert_eq!(parse_link_header(""), PageLinks::default());
    assert_eq!(parse_link_header("not a link"), PageLinks::default());
    assert_eq!(
      parse_link_header(r#"<https://x>; title="next""#),
      PageLinks::default()
    );
  }

  #[test]
  fn test_user_list_deserializes() {
    let json = r#"[{"login":"mojombo","id":1,"avatar_url":"https://a/1","html_url":"https://github.com/mojombo","type":"User"}]"#;
    let users: Vec<ApiUser> = serde_json::from_str(json).unwrap();
    let user = users.into_iter().next().unwrap().into_user();
    assert_eq!(user.login, "mojombo");
    assert_eq!(user.id, 1);
  }

  #[test]
  fn test_search_response_deserializes() {
    let json = r#"{"total_count":2,"incomplete_results":false,"items":[{"login":"tom","id":748,"avatar_url":"","html_url":"https://github.com/tom","score":1.0}]}"#;
    let found: ApiSearchUsersResponse = serde_json::from_str(json).unwrap();
    assert_eq!(found.total_count, 2);
    assert_eq!(found.items.len(), 1);
    assert_eq!(found.items[0].login, "tom");

    let empty: ApiSearchUsersResponse = serde_json::from_str("{}").unwrap();
    assert_eq!(empty.total_count, 0);
    assert!(empty.items.is_empty());
  }

  #[test]
  fn test_detail_blank_strings_become_none() {
    let json = r#"{"login":"octocat","id":583231,"name":"The Octocat","company":"","blog":"https://github.blog","location":"San Francisco","bio":null,"public_repos":8,"followers":10,"following":9,"updated_at":"2024-01-22T12:13:38Z"}"#;
    let detail: ApiUserDetail = serde_json::from_str(json).unwrap();
    let detail = detail.into_detail();
    assert_eq!(detail.name.as_deref(), Some("The Octocat"));
    assert_eq!(detail.company, None);
    assert_eq!(detail.bio, None);
    assert_eq!(detail.followers, 10);
    assert_eq!(detail.avatar_url, "");
  }
}
