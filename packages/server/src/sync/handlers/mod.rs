//! Built-in sync handlers and their shared plumbing.

pub mod gitlab_commits;
pub mod gitlab_mrs;
pub mod svn;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use gitlab::{GitLabClient, GitLabError, GitLabOptions};

use super::executor::SyncDeps;
use super::payload::JobPayload;
use super::result::ErrorCategory;
use crate::artifacts::{scm_patch_relpath, sha256_hex};
use crate::store::{PatchBlob, Repo};

/// Map a protocol error onto the canonical category set.
pub(crate) fn map_gitlab_error(error: &GitLabError) -> ErrorCategory {
    ErrorCategory::from_str(error.category()).unwrap_or(ErrorCategory::Unknown)
}

/// `https://host[:port]` origin for a repo URL, preferring the normalized
/// payload instance key when present.
pub(crate) fn gitlab_base_url(payload: &JobPayload, repo: &Repo) -> Option<String> {
    if let Some(instance) = payload
        .gitlab_instance
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        return Some(format!("https://{instance}"));
    }
    let url = repo.url.trim();
    if url.is_empty() {
        return None;
    }
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("https", url),
    };
    let host = rest.split('/').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(format!("{scheme}://{host}"))
    }
}

/// The `group/project` path encoded in a GitLab repo URL.
pub(crate) fn project_path_from_url(url: &str) -> Option<String> {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let path = rest.split_once('/').map(|(_, p)| p)?;
    let path = path.trim_matches('/').trim_end_matches(".git").trim_matches('/');
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Build a client for this repo/payload pair, with the configured token.
pub(crate) fn build_gitlab_client(
    deps: &SyncDeps,
    repo: &Repo,
    payload: &JobPayload,
) -> Result<GitLabClient> {
    let base_url = gitlab_base_url(payload, repo)
        .ok_or_else(|| anyhow!("cannot derive instance url from repo `{}`", repo.repo_id))?;
    let mut options = GitLabOptions::new(base_url)
        .with_timeout(Duration::from_secs(deps.config.gitlab.timeout_seconds));
    options.per_page = deps.config.gitlab.per_page;
    if let Some(token) = deps.config.gitlab_token()? {
        options = options.with_token(token);
    }
    Ok(GitLabClient::new(options).map_err(|e| anyhow!("{e}"))?)
}

/// Compact ministat/diffstat text written when the full diff is
/// unavailable or deliberately skipped.
pub(crate) fn ministat_text(
    rev_label: &str,
    files_changed: Option<usize>,
    additions: i64,
    deletions: i64,
) -> String {
    match files_changed {
        Some(files) => format!(
            "{rev_label}: {files} files changed, {additions} insertions(+), {deletions} deletions(-)\n"
        ),
        None => format!("{rev_label}: {additions} insertions(+), {deletions} deletions(-)\n"),
    }
}

/// Write one patch artifact and its content-addressed fact row. Returns
/// the blob sha256 (row may already have existed; that is fine).
pub(crate) async fn write_patch_blob(
    deps: &Arc<SyncDeps>,
    repo: &Repo,
    rev_label: &str,
    source_id: &str,
    content: &str,
    ext: &str,
) -> Result<String> {
    let source_type = repo.repo_type.source_type();
    let sha256 = sha256_hex(content.as_bytes());
    let relpath = scm_patch_relpath(
        deps.config.project_key(),
        repo.repo_id,
        source_type,
        rev_label,
        &sha256,
        ext,
    )?;
    let stored = deps.artifacts.put_text(&relpath, content).await?;
    PatchBlob::upsert(
        &deps.pool,
        source_type,
        source_id,
        &sha256,
        &stored.uri,
        ext,
        stored.size_bytes as i64,
    )
    .await?;
    Ok(sha256)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_path_strips_host_and_git_suffix() {
        assert_eq!(
            project_path_from_url("https://gitlab.example.com/group/project.git").as_deref(),
            Some("group/project")
        );
        assert_eq!(
            project_path_from_url("https://gitlab.example.com/group/sub/project/").as_deref(),
            Some("group/sub/project")
        );
        assert_eq!(project_path_from_url("https://gitlab.example.com/"), None);
    }

    #[test]
    fn ministat_text_is_stable() {
        assert_eq!(
            ministat_text("abc1234", Some(3), 10, 2),
            "abc1234: 3 files changed, 10 insertions(+), 2 deletions(-)\n"
        );
        assert_eq!(
            ministat_text("r100", None, 1, 0),
            "r100: 1 insertions(+), 0 deletions(-)\n"
        );
    }

    #[test]
    fn gitlab_errors_map_to_canonical_categories() {
        let error = GitLabError::RateLimited {
            retry_after_seconds: None,
        };
        assert_eq!(map_gitlab_error(&error), ErrorCategory::RateLimit);
        assert_eq!(map_gitlab_error(&GitLabError::Timeout), ErrorCategory::Timeout);
    }
}
