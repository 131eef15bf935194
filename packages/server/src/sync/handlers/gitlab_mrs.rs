//! GitLab merge-request and review-event synchronization.
//!
//! Walks merge requests by `updated_at` beyond the stored cursor, writes
//! MR facts and their notes as review events, and advances the cursor to
//! the newest MR seen. Note writes are idempotent, so re-scanning an MR
//! only bumps the skipped-event counter.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use gitlab::RequestStats;
use serde_json::json;
use tracing::debug;

use crate::store::kv::{kv_get, kv_set};
use crate::store::Repo;
use crate::sync::cursor::CURSOR_NAMESPACE;
use crate::sync::executor::SyncDeps;
use crate::sync::payload::{JobPayload, SyncMode};
use crate::sync::result::SyncResult;

use super::{build_gitlab_client, map_gitlab_error, project_path_from_url};

fn mrs_cursor_key(repo_id: i64) -> String {
    format!("gitlab_mrs_cursor:{repo_id}")
}

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

    let cursor_key = mrs_cursor_key(repo.repo_id);
    let cursor = kv_get(&deps.pool, CURSOR_NAMESPACE, &cursor_key).await?;
    let updated_after: Option<DateTime<Utc>> = cursor
        .as_ref()
        .and_then(|v| v["last_updated_at"].as_str())
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let budget = if mode == SyncMode::Probe {
        payload
            .probe_budget
            .unwrap_or(deps.config.sync.probe_budget)
            .max(1)
    } else {
        payload.effective_batch_size(deps.config.sync.default_batch_size)
    } as usize;

    let client = build_gitlab_client(&deps, &repo, &payload)?;
    let mut stats = RequestStats::default();

    let mrs = match client
        .list_merge_requests(&project, updated_after, 1, &mut stats)
        .await
    {
        Ok(mrs) => mrs,
        Err(e) => {
            let mut failed = SyncResult::for_error(e.to_string(), map_gitlab_error(&e));
            failed.request_stats = (&stats).into();
            return Ok(failed);
        }
    };

    let full_page = mrs.len() as u32 >= deps.config.gitlab.per_page;
    let mut newest_updated_at = updated_after;
    let mut processed = 0usize;

    for mr in &mrs {
        if processed >= budget {
            result.has_more = true;
            break;
        }
        processed += 1;
        result.scanned_count += 1;

        if result.dry_run {
            continue;
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO merge_requests (
                repo_id, mr_iid, title, state, author, created_at, updated_at,
                merged_at, source_branch, target_branch, sha, web_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (repo_id, mr_iid) DO UPDATE
            SET title = EXCLUDED.title,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at,
                merged_at = EXCLUDED.merged_at,
                sha = EXCLUDED.sha
            "#,
        )
        .bind(repo.repo_id)
        .bind(mr.iid)
        .bind(&mr.title)
        .bind(&mr.state)
        .bind(mr.author.as_ref().map(|a| a.username.clone()))
        .bind(mr.created_at)
        .bind(mr.updated_at)
        .bind(mr.merged_at)
        .bind(&mr.source_branch)
        .bind(&mr.target_branch)
        .bind(&mr.sha)
        .bind(&mr.web_url)
        .execute(&deps.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            result.synced_mr_count += 1;
            result.inserted_count += 1;
        }

        match client.list_mr_notes(&project, mr.iid, 1, &mut stats).await {
            Ok(notes) => {
                for note in notes {
                    let written = sqlx::query(
                        r#"
                        INSERT INTO review_events (
                            repo_id, mr_iid, event_id, author, body, is_system, created_at
                        )
                        VALUES ($1, $2, $3, $4, $5, $6, $7)
                        ON CONFLICT (repo_id, mr_iid, event_id) DO NOTHING
                        "#,
                    )
                    .bind(repo.repo_id)
                    .bind(mr.iid)
                    .bind(note.id)
                    .bind(note.author.as_ref().map(|a| a.username.clone()))
                    .bind(&note.body)
                    .bind(note.system)
                    .bind(note.created_at)
                    .execute(&deps.pool)
                    .await?;

                    if written.rows_affected() > 0 {
                        result.synced_event_count += 1;
                    } else {
                        result.skipped_event_count += 1;
                    }
                }
            }
            Err(e) => {
                let mut failed = SyncResult::for_error(e.to_string(), map_gitlab_error(&e));
                failed.request_stats = (&stats).into();
                return Ok(result + failed);
            }
        }

        if let Some(updated) = mr.updated_at {
            if newest_updated_at.map(|n| updated > n).unwrap_or(true) {
                newest_updated_at = Some(updated);
            }
        }
    }

    if full_page {
        result.has_more = true;
    }

    if let Some(newest) = newest_updated_at {
        let moved = updated_after.map(|old| newest > old).unwrap_or(true);
        result.cursor_after = Some(json!({"last_updated_at": newest.to_rfc3339()}));
        if moved && !result.dry_run && result.success {
            let count = cursor
                .as_ref()
                .and_then(|v| v["count"].as_i64())
                .unwrap_or(0);
            let next = json!({
                "last_updated_at": newest.to_rfc3339(),
                "count": count + result.synced_mr_count,
            });
            kv_set(&deps.pool, CURSOR_NAMESPACE, &cursor_key, &next).await?;
            result.cursor_persisted = true;
            result.watermark_updated = true;
        }
    }

    result.request_stats = (&stats).into();
    debug!(
        repo_id = repo.repo_id,
        mrs = result.synced_mr_count,
        events = result.synced_event_count,
        "gitlab merge requests batch done"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_key_embeds_repo_id() {
        assert_eq!(mrs_cursor_key(42), "gitlab_mrs_cursor:42");
    }
}
