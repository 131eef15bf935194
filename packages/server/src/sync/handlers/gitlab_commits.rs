//! GitLab commit synchronization.
//!
//! Pulls a batch of commits beyond the `(ts, sha)` cursor, writes commit
//! facts and patch blobs according to `diff_mode`, and reports the new
//! cursor position. Probe mode caps the batch at `probe_budget`.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use gitlab::{RepoCommit, RequestStats};
use serde_json::json;
use tracing::debug;

use crate::store::kv::{load_gitlab_cursor, save_gitlab_cursor};
use crate::store::{GitCommitRow, Repo};
use crate::sync::cursor::{filter_after_cursor, parse_cursor_ts, should_advance, GitlabCursor};
use crate::sync::executor::SyncDeps;
use crate::sync::payload::{DiffMode, JobPayload, SyncMode};
use crate::sync::result::SyncResult;

use super::{
    build_gitlab_client, map_gitlab_error, ministat_text, project_path_from_url, write_patch_blob,
};

/// Diffs touching more files than this bypass blob storage as bulk.
const DEFAULT_MAX_FILES_PER_COMMIT: i64 = 100;

pub async fn sync(
    deps: Arc<SyncDeps>,
    repo: Repo,
    mode: SyncMode,
    payload: JobPayload,
) -> Result<SyncResult> {
    let mut result = SyncResult::default();
    result.mode = Some(mode.as_str().to_string());
    result.dry_run = payload.dry_run.unwrap_or(false);

    let Some(project) = project_path_from_url(&repo.url) else {
        return Ok(SyncResult::for_error(
            format!("repo url `{}` carries no project path", repo.url),
            crate::sync::result::ErrorCategory::RepoNotFound,
        ));
    };

    let cursor = load_gitlab_cursor(&deps.pool, repo.repo_id).await?;
    let cursor_ts = cursor
        .as_ref()
        .and_then(|c| c.last_commit_ts.as_deref())
        .and_then(parse_cursor_ts);
    let cursor_sha = cursor.as_ref().and_then(|c| c.last_commit_sha.clone());

    let batch = if mode == SyncMode::Probe {
        payload
            .probe_budget
            .unwrap_or(deps.config.sync.probe_budget)
            .max(1)
    } else {
        payload.effective_batch_size(deps.config.sync.default_batch_size)
    } as usize;

    let client = build_gitlab_client(&deps, &repo, &payload)?;
    let mut stats = RequestStats::default();

    let since = payload
        .since
        .as_deref()
        .and_then(parse_cursor_ts)
        .or(cursor_ts);
    let until = payload.until.as_deref().and_then(parse_cursor_ts);

    let fetched = match client
        .list_commits(
            &project,
            repo.default_branch.as_deref(),
            since,
            until,
            1,
            &mut stats,
        )
        .await
    {
        Ok(commits) => commits,
        Err(e) => {
            let mut failed = SyncResult::for_error(e.to_string(), map_gitlab_error(&e));
            failed.request_stats = (&stats).into();
            return Ok(failed);
        }
    };

    let fetched_count = fetched.len();
    let full_page = fetched_count as u32 >= deps.config.gitlab.per_page;

    let mut kept = filter_after_cursor(
        fetched,
        commit_sort_key,
        cursor_ts,
        cursor_sha.as_deref(),
    );
    result.record_dedup((fetched_count - kept.len()) as i64);

    if kept.len() > batch {
        kept.truncate(batch);
        result.has_more = true;
    } else if full_page {
        result.has_more = true;
    }

    let diff_mode = payload.effective_diff_mode();
    let max_files = payload
        .max_files_per_commit
        .unwrap_or(DEFAULT_MAX_FILES_PER_COMMIT) as usize;

    let mut newest: Option<(Option<DateTime<Utc>>, String)> = None;

    for commit in &kept {
        result.scanned_count += 1;
        if result.dry_run {
            continue;
        }

        let inserted = GitCommitRow::upsert(
            &deps.pool,
            repo.repo_id,
            &commit.id,
            Some(&commit.author_name),
            Some(&commit.author_email),
            commit.committed_date,
            Some(&commit.message),
            &json!(commit.parent_ids),
            Some(&commit.web_url),
            commit
                .stats
                .as_ref()
                .map(|s| json!({"additions": s.additions, "deletions": s.deletions, "total": s.total}))
                .as_ref(),
        )
        .await?;

        if inserted {
            result.synced_count += 1;
            result.inserted_count += 1;
        } else {
            result.record_dedup(1);
        }

        newest = Some((commit.committed_date, commit.id.clone()));

        match diff_mode {
            DiffMode::None => result.record_diff_none(),
            DiffMode::Minimal => {
                let (additions, deletions) = line_stats(commit);
                let text = ministat_text(&commit.id, None, additions, deletions);
                write_patch_blob(
                    &deps,
                    &repo,
                    &commit.id,
                    &source_id(&repo, &commit.id),
                    &text,
                    crate::artifacts::SCM_EXT_MINISTAT,
                )
                .await?;
                result.record_diff_success();
            }
            DiffMode::Always | DiffMode::BestEffort => {
                match client.commit_diff(&project, &commit.id, &mut stats).await {
                    Ok(diffs) if diffs.len() > max_files => {
                        result.record_bulk();
                    }
                    Ok(diffs) => {
                        let text = render_diff(&diffs);
                        write_patch_blob(
                            &deps,
                            &repo,
                            &commit.id,
                            &source_id(&repo, &commit.id),
                            &text,
                            crate::artifacts::SCM_EXT_DIFF,
                        )
                        .await?;
                        result.record_diff_success();
                    }
                    Err(e) if diff_mode == DiffMode::BestEffort => {
                        let (additions, deletions) = line_stats(commit);
                        let text = ministat_text(&commit.id, None, additions, deletions);
                        write_patch_blob(
                            &deps,
                            &repo,
                            &commit.id,
                            &source_id(&repo, &commit.id),
                            &text,
                            crate::artifacts::SCM_EXT_MINISTAT,
                        )
                        .await?;
                        result.record_diff_degraded(map_gitlab_error(&e).as_str());
                    }
                    Err(e) => {
                        // diff_mode=always: a failed diff fails the batch.
                        result.success = false;
                        result.error = Some(e.to_string());
                        result.error_category = Some(map_gitlab_error(&e));
                        result
                            .unrecoverable_errors
                            .push(format!("diff {} failed: {}", commit.id, e));
                        break;
                    }
                }
            }
        }
    }

    if let Some((ts, sha)) = &newest {
        let ts_str = ts.map(|t| t.to_rfc3339());
        result.last_commit_sha = Some(sha.clone());
        result.last_commit_ts = ts_str.clone();
        result.cursor_after = Some(json!({"ts": ts_str, "sha": sha}));

        let update_watermark = payload.update_watermark.unwrap_or(true);
        if update_watermark && !result.dry_run && result.success {
            let old_ts = cursor.as_ref().and_then(|c| c.last_commit_ts.clone());
            let old_sha = cursor.as_ref().and_then(|c| c.last_commit_sha.clone());
            if should_advance(
                ts_str.as_deref(),
                sha,
                old_ts.as_deref(),
                old_sha.as_deref(),
            ) {
                let next = GitlabCursor {
                    last_commit_ts: ts_str,
                    last_commit_sha: Some(sha.clone()),
                    count: cursor.map(|c| c.count).unwrap_or(0) + result.synced_count,
                };
                save_gitlab_cursor(&deps.pool, repo.repo_id, &next).await?;
                result.cursor_persisted = true;
                result.watermark_updated = true;
            }
        }
    } else if let Some(cursor) = &cursor {
        result.cursor_after = Some(json!({
            "ts": cursor.last_commit_ts,
            "sha": cursor.last_commit_sha,
        }));
    }

    result.request_stats = (&stats).into();
    debug!(
        repo_id = repo.repo_id,
        synced = result.synced_count,
        skipped = result.skipped_count,
        diffs = result.diff_count,
        "gitlab commits batch done"
    );
    Ok(result)
}

fn commit_sort_key(commit: &RepoCommit) -> (Option<DateTime<Utc>>, String) {
    (commit.committed_date, commit.id.clone())
}

fn source_id(repo: &Repo, sha: &str) -> String {
    format!("{}:{}", repo.repo_id, sha)
}

fn line_stats(commit: &RepoCommit) -> (i64, i64) {
    commit
        .stats
        .as_ref()
        .map(|s| (s.additions, s.deletions))
        .unwrap_or((0, 0))
}

fn render_diff(diffs: &[gitlab::CommitDiff]) -> String {
    let mut out = String::new();
    for file in diffs {
        out.push_str(&format!("--- {}\n+++ {}\n", file.old_path, file.new_path));
        out.push_str(&file.diff);
        if !file.diff.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}
