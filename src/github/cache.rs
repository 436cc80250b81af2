//! Caching implementations for GitHub types.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::cache::{Cacheable, Joined, QueryKey};

use super::types::{User, UserDetail, UserWithDetail};

// ============================================================================
// Cacheable implementations
// ============================================================================

/// Storage key for a login. GitHub logins are case-insensitive.
pub fn login_key(login: &str) -> String {
  login.to_lowercase()
}

// Both records are keyed by login, so a detail can be joined with the
// summary a list stored for the same user.
impl Cacheable for User {
  fn cache_key(&self) -> String {
    login_key(&self.login)
  }

  fn updated_at(&self) -> Option<&str> {
    // List entries carry no timestamp
    None
  }

  fn entity_type() -> &'static str {
    "user"
  }
}

impl Cacheable for UserDetail {
  fn cache_key(&self) -> String {
    login_key(&self.login)
  }

  fn updated_at(&self) -> Option<&str> {
    self.updated_at.as_deref()
  }

  fn entity_type() -> &'static str {
    "user_detail"
  }
}

impl Joined for UserWithDetail {
  type Summary = User;
  type Detail = UserDetail;

  fn join(summary: Option<User>, detail: UserDetail, fetched_at: DateTime<Utc>) -> Self {
    Self {
      summary,
      detail,
      fetched_at,
    }
  }
}

// ============================================================================
// Query key types
// ============================================================================

/// Paginated user listings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UsersQuery {
  /// Every user, in sign-up order
  All,
  /// Users matching a search expression
  Search { q: String },
}

impl UsersQuery {
  /// `All` for no or blank search text.
  pub fn from_search(q: Option<&str>) -> Self {
    match q.map(str::trim) {
      Some(q) if !q.is_empty() => Self::Search { q: q.to_string() },
      _ => Self::All,
    }
  }
}

impl QueryKey for UsersQuery {
  fn cache_hash(&self) -> String {
    let input = match self {
      Self::All => "users:all".to_string(),
      Self::Search { q } => format!("users:search:{}", normalize_search(q)),
    };

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  fn description(&self) -> String {
    match self {
      Self::All => "all users".to_string(),
      Self::Search { q } => format!("users matching {}", q),
    }
  }
}

/// Normalize search text for consistent hashing.
/// GitHub search is case-insensitive, and runs of whitespace are one separator.
fn normalize_search(q: &str) -> String {
  q.split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase()
}
