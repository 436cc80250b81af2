use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User summary for list views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub login: String,
  pub avatar_url: String,
  pub html_url: String,
}

/// Full user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDetail {
  pub id: u64,
  pub login: String,
  pub name: Option<String>,
  pub avatar_url: String,
  pub html_url: String,
  pub company: Option<String>,
  pub blog: Option<String>,
  pub location: Option<String>,
  pub bio: Option<String>,
  pub public_repos: u32,
  pub followers: u32,
  pub following: u32,
  pub updated_at: Option<String>,
}

/// Profile as stored locally, with the list attributes when the user has been
/// seen in a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserWithDetail {
  pub summary: Option<User>,
  pub detail: UserDetail,
  /// When the profile was written to the local store.
  pub fetched_at: DateTime<Utc>,
}
