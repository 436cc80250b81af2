//! Subcommand handlers.

use color_eyre::{eyre::eyre, Result};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{LoadDirection, LoadState, PageWindow};
use crate::github::{User, UserWithDetail, UsersQuery, UsersRepository};

/// Longest wait for one load to finish.
const LOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Age after which an offline profile is flagged as stale.
const STALE_AFTER_HOURS: i64 = 24;

/// Print the users of a listing after loading `pages` pages.
pub async fn users(repo: &UsersRepository, search: Option<&str>, pages: usize) -> Result<()> {
  let query = UsersQuery::from_search(search);
  let mut windows = repo.users(&query);

  let mut window = next_matching(&mut windows, |w| w.load_states.refresh != LoadState::Loading).await?;
  if let LoadState::Error(e) = &window.load_states.refresh {
    warn!(error = %e, "refresh failed, retrying once");
    if repo.refresh(&query) {
      window = next_matching(&mut windows, |w| w.load_states.refresh != LoadState::Loading).await?;
    }
    if let LoadState::Error(e) = &window.load_states.refresh {
      warn!(error = %e, "refresh failed, showing cached users");
    }
  }

  for _ in 1..pages.max(1) {
    if window.reached_end || end_reached(window.load_states.get(LoadDirection::Append)) {
      break;
    }
    let shown = window.items.len();
    if !repo.request_load(&query, LoadDirection::Append) {
      break;
    }

    window = next_matching(&mut windows, |w| {
      let append = w.load_states.get(LoadDirection::Append);
      w.items.len() > shown || matches!(append, LoadState::Error(_)) || end_reached(append)
    })
    .await?;

    if let LoadState::Error(e) = window.load_states.get(LoadDirection::Append) {
      warn!(error = %e, "loading more users failed");
      break;
    }
  }

  info!(
    query = ?query,
    count = window.items.len(),
    generation = window.generation,
    from_start = window.reached_start,
    "listing done"
  );
  for user in &window.items {
    println!("{}", format_user(user));
  }
  Ok(())
}

/// Print a user's profile. Offline, print the stored copy instead of fetching.
pub async fn user(repo: &UsersRepository, login: &str, offline: bool) -> Result<()> {
  if !offline {
    let record = repo.get_user_detail(login).await?;
    println!("{}", format_detail(&record, false));
    return Ok(());
  }

  let cached = repo
    .cached_user_detail(login)
    .await?
    .ok_or_else(|| eyre!("No cached profile for {}", login))?;
  let stale = cached.is_stale(chrono::Duration::hours(STALE_AFTER_HOURS));
  println!("{}", format_detail(&cached.entity, stale));
  Ok(())
}

pub async fn clear_cache(repo: &UsersRepository) -> Result<()> {
  repo.clear_cache().await?;
  println!("Cache cleared");
  Ok(())
}

fn end_reached(state: &LoadState) -> bool {
  matches!(
    state,
    LoadState::NotLoading {
      end_of_pagination_reached: true
    }
  )
}

async fn next_matching<F>(
  windows: &mut BoxStream<'static, PageWindow<User>>,
  done: F,
) -> Result<PageWindow<User>>
where
  F: Fn(&PageWindow<User>) -> bool,
{
  let wait = async {
    while let Some(window) = windows.next().await {
      if done(&window) {
        return Some(window);
      }
    }
    None
  };

  tokio::time::timeout(LOAD_TIMEOUT, wait)
    .await
    .map_err(|_| eyre!("Timed out waiting for users"))?
    .ok_or_else(|| eyre!("User listing stopped unexpectedly"))
}

fn format_user(user: &User) -> String {
  format!("{:<39} {}", user.login, user.html_url)
}

fn format_detail(record: &UserWithDetail, stale: bool) -> String {
  let d = &record.detail;
  let mut lines = vec![match &d.name {
    Some(name) => format!("{} ({})", d.login, name),
    None => d.login.clone(),
  }];

  let optional = [
    ("bio", &d.bio),
    ("company", &d.company),
    ("location", &d.location),
    ("blog", &d.blog),
  ];
  for (label, value) in optional {
    if let Some(value) = value {
      lines.push(format!("  {:<10} {}", label, value));
    }
  }

  lines.push(format!("  {:<10} {}", "repos", d.public_repos));
  lines.push(format!(
    "  {:<10} {} followers, {} following",
    "network", d.followers, d.following
  ));
  lines.push(format!("  {:<10} {}", "profile", d.html_url));
  if record.summary.is_some() {
    lines.push(format!("  {:<10} yes", "listed"));
  }
  lines.push(format!(
    "  {:<10} {}{}",
    "fetched",
    record.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"),
    if stale { " (stale)" } else { "" }
  ));
  lines.join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::github::types::UserDetail;
  use chrono::{TimeZone, Utc};

  fn detail() -> UserDetail {
    UserDetail {
      id: 583231,
      login: "octocat".to_string(),
      name: Some("The Octocat".to_string()),
      avatar_url: String::new(),
      html_url: "https://github.com/octocat".to_string(),
      company: None,
      blog: None,
      location: Some("San Francisco".to_string()),
      bio: None,
      public_repos: 8,
      followers: 10,
      following: 9,
      updated_at: None,
    }
  }

  #[test]
  fn test_format_detail() {
    let record = UserWithDetail {
      summary: None,
      detail: detail(),
      fetched_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    };
    let text = format_detail(&record, false);

    assert!(text.starts_with("octocat (The Octocat)"));
    assert!(text.contains("location   San Francisco"));
    assert!(!text.contains("company"));
    assert!(!text.contains("listed"));
    assert!(text.contains("10 followers, 9 following"));
    assert!(text.ends_with("2024-05-01 12:00:00 UTC"));

    assert!(format_detail(&record, true).ends_with("UTC (stale)"));
  }

  #[test]
  fn test_format_user() {
    let user = User {
      id: 1,
      login: "mojombo".to_string(),
      avatar_url: String::new(),
      html_url: "https://github.com/mojombo".to_string(),
    };
    assert!(format_user(&user).starts_with("mojombo "));
    assert!(format_user(&user).ends_with("https://github.com/mojombo"));
  }

  #[test]
  fn test_end_reached() {
    assert!(end_reached(&LoadState::NotLoading {
      end_of_pagination_reached: true
    }));
    assert!(!end_reached(&LoadState::Loading));
  }
}
