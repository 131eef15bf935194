//! SVN revision synchronization.
//!
//! Shells out to the `svn` client: `svn log --xml` for the revision
//! window, `svn diff -c` per revision for patch content. Revision windows
//! come from the payload (`start_rev`/`end_rev`) or continue past the
//! stored cursor.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::store::kv::{load_svn_cursor, save_svn_cursor};
use crate::store::{Repo, SvnRevisionRow};
use crate::sync::cursor::SvnCursor;
use crate::sync::executor::SyncDeps;
use crate::sync::payload::{DiffMode, JobPayload, SyncMode};
use crate::sync::result::{ErrorCategory, SyncResult};

use super::{ministat_text, write_patch_blob};

#[derive(Debug, Deserialize)]
struct SvnLog {
    #[serde(rename = "logentry", default)]
    entries: Vec<SvnLogEntry>,
}

#[derive(Debug, Deserialize)]
struct SvnLogEntry {
    #[serde(rename = "@revision")]
    revision: i64,
    author: Option<String>,
    date: Option<String>,
    msg: Option<String>,
    paths: Option<SvnPaths>,
}

#[derive(Debug, Deserialize)]
struct SvnPaths {
    #[serde(rename = "path", default)]
    paths: Vec<SvnPath>,
}

#[derive(Debug, Deserialize)]
struct SvnPath {
    #[serde(rename = "@action")]
    action: Option<String>,
    #[serde(rename = "$text")]
    value: Option<String>,
}

fn parse_svn_log(xml: &str) -> Result<Vec<SvnLogEntry>> {
    let log: SvnLog =
        quick_xml::de::from_str(xml).map_err(|e| anyhow!("svn log xml parse failed: {e}"))?;
    Ok(log.entries)
}

/// Classify svn client stderr into a canonical category.
fn classify_svn_error(stderr: &str) -> ErrorCategory {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("authorization failed") || lower.contains("authentication") {
        ErrorCategory::AuthError
    } else if lower.contains("timed out") || lower.contains("timeout") {
        ErrorCategory::Timeout
    } else if lower.contains("unable to connect") || lower.contains("connection refused") {
        ErrorCategory::Connection
    } else if lower.contains("no repository found") || lower.contains("doesn't exist") {
        ErrorCategory::RepoNotFound
    } else {
        ErrorCategory::Exception
    }
}

async fn run_svn(deps: &SyncDeps, args: &[String]) -> Result<Result<String, (String, ErrorCategory)>> {
    let mut cmd = Command::new("svn");
    cmd.args(args)
        .arg("--non-interactive")
        .arg("--no-auth-cache")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(username) = &deps.config.svn.username {
        cmd.arg("--username").arg(username);
    }
    if let Some(password) = deps.config.svn_password()? {
        cmd.arg("--password").arg(password);
    }

    let output = cmd.output().await?;
    if output.status.success() {
        Ok(Ok(String::from_utf8_lossy(&output.stdout).into_owned()))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let category = classify_svn_error(&stderr);
        Ok(Err((stderr, category)))
    }
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

    let cursor = load_svn_cursor(&deps.pool, repo.repo_id).await?;

    let start_rev = payload
        .start_rev
        .unwrap_or_else(|| cursor.as_ref().map(|c| c.last_rev + 1).unwrap_or(1));
    let end_spec = payload
        .end_rev
        .map(|r| r.to_string())
        .unwrap_or_else(|| "HEAD".to_string());

    let batch = if mode == SyncMode::Probe {
        payload
            .probe_budget
            .unwrap_or(deps.config.sync.probe_budget)
            .max(1)
    } else {
        payload.effective_batch_size(deps.config.sync.default_batch_size)
    };

    let log_args = vec![
        "log".to_string(),
        "--xml".to_string(),
        "--verbose".to_string(),
        "-r".to_string(),
        format!("{start_rev}:{end_spec}"),
        "--limit".to_string(),
        batch.to_string(),
        repo.url.clone(),
    ];

    let xml = match run_svn(&deps, &log_args).await? {
        Ok(xml) => xml,
        Err((stderr, category)) => {
            return Ok(SyncResult::for_error(stderr, category));
        }
    };

    let entries = parse_svn_log(&xml)?;
    result.has_more = entries.len() as i64 >= batch;

    let diff_mode = payload.effective_diff_mode();
    let mut last_rev = cursor.as_ref().map(|c| c.last_rev);

    for entry in &entries {
        result.scanned_count += 1;

        // Revisions at or below the watermark are replays.
        if let Some(cursor) = &cursor {
            if entry.revision <= cursor.last_rev && payload.start_rev.is_none() {
                result.record_dedup(1);
                continue;
            }
        }
        if let Some(end_rev) = payload.end_rev {
            if entry.revision > end_rev {
                result.skipped_by_controller += 1;
                continue;
            }
        }

        if result.dry_run {
            continue;
        }

        let committed_at = entry
            .date
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        let changed_paths: Vec<serde_json::Value> = entry
            .paths
            .as_ref()
            .map(|paths| {
                paths
                    .paths
                    .iter()
                    .map(|p| {
                        json!({
                            "action": p.action,
                            "path": p.value,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let inserted = SvnRevisionRow::upsert(
            &deps.pool,
            repo.repo_id,
            entry.revision,
            entry.author.as_deref(),
            committed_at,
            entry.msg.as_deref(),
            &json!(changed_paths),
        )
        .await?;

        if inserted {
            result.synced_count += 1;
            result.inserted_count += 1;
        } else {
            result.record_dedup(1);
        }

        let rev_label = crate::artifacts::svn_rev_label(entry.revision);
        let source_id = format!("{}:{}", repo.repo_id, rev_label);

        match diff_mode {
            DiffMode::None => result.record_diff_none(),
            DiffMode::Minimal => {
                let text = ministat_text(&rev_label, Some(changed_paths.len()), 0, 0);
                write_patch_blob(
                    &deps,
                    &repo,
                    &rev_label,
                    &source_id,
                    &text,
                    crate::artifacts::SCM_EXT_MINISTAT,
                )
                .await?;
                result.record_diff_success();
                result.patch_success += 1;
            }
            DiffMode::Always | DiffMode::BestEffort => {
                let diff_args = vec![
                    "diff".to_string(),
                    "-c".to_string(),
                    entry.revision.to_string(),
                    repo.url.clone(),
                ];
                match run_svn(&deps, &diff_args).await? {
                    Ok(diff_text) => {
                        write_patch_blob(
                            &deps,
                            &repo,
                            &rev_label,
                            &source_id,
                            &diff_text,
                            crate::artifacts::SCM_EXT_DIFF,
                        )
                        .await?;
                        result.record_diff_success();
                        result.patch_success += 1;
                    }
                    Err((stderr, category)) if diff_mode == DiffMode::BestEffort => {
                        let text = ministat_text(&rev_label, Some(changed_paths.len()), 0, 0);
                        write_patch_blob(
                            &deps,
                            &repo,
                            &rev_label,
                            &source_id,
                            &text,
                            crate::artifacts::SCM_EXT_MINISTAT,
                        )
                        .await?;
                        result.record_diff_degraded(category.as_str());
                        result.patch_failed += 1;
                        debug!(rev = entry.revision, error = %stderr, "svn diff degraded");
                    }
                    Err((stderr, category)) => {
                        result.success = false;
                        result.error = Some(stderr.clone());
                        result.error_category = Some(category);
                        result.patch_failed += 1;
                        result
                            .unrecoverable_errors
                            .push(format!("diff r{} failed", entry.revision));
                        break;
                    }
                }
            }
        }

        if last_rev.map(|r| entry.revision > r).unwrap_or(true) {
            last_rev = Some(entry.revision);
        }
    }

    if let Some(rev) = last_rev {
        result.last_rev = Some(rev);
        result.cursor_after = Some(json!({"last_rev": rev}));

        let advanced = cursor.as_ref().map(|c| rev > c.last_rev).unwrap_or(true);
        let update_watermark = payload.update_watermark.unwrap_or(true);
        if advanced && update_watermark && !result.dry_run && result.success {
            let next = SvnCursor {
                last_rev: rev,
                count: cursor.map(|c| c.count).unwrap_or(0) + result.synced_count,
            };
            save_svn_cursor(&deps.pool, repo.repo_id, &next).await?;
            result.cursor_persisted = true;
            result.watermark_updated = true;
        }
    }

    debug!(
        repo_id = repo.repo_id,
        synced = result.synced_count,
        patches = result.patch_success,
        "svn batch done"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LOG: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<log>
<logentry revision="101">
<author>alice</author>
<date>2024-01-15T12:00:00.000000Z</date>
<paths>
<path action="M">/trunk/src/main.c</path>
<path action="A">/trunk/src/util.c</path>
</paths>
<msg>fix checksum handling</msg>
</logentry>
<logentry revision="102">
<author>bob</author>
<date>2024-01-15T13:00:00.000000Z</date>
<msg>bump version</msg>
</logentry>
</log>"#;

    #[test]
    fn svn_log_xml_parses() {
        let entries = parse_svn_log(SAMPLE_LOG).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].revision, 101);
        assert_eq!(entries[0].author.as_deref(), Some("alice"));
        assert_eq!(entries[0].msg.as_deref(), Some("fix checksum handling"));
        let paths = entries[0].paths.as_ref().unwrap();
        assert_eq!(paths.paths.len(), 2);
        assert_eq!(paths.paths[0].action.as_deref(), Some("M"));
        assert_eq!(paths.paths[0].value.as_deref(), Some("/trunk/src/main.c"));
        assert!(entries[1].paths.is_none());
    }

    #[test]
    fn empty_log_parses() {
        let entries = parse_svn_log("<log></log>").unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn stderr_classification_matches_policy() {
        assert_eq!(
            classify_svn_error("svn: E170001: Authorization failed"),
            ErrorCategory::AuthError
        );
        assert_eq!(
            classify_svn_error("svn: E175012: Connection timed out"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify_svn_error("svn: E670002: Unable to connect to a repository"),
            ErrorCategory::Connection
        );
        assert_eq!(
            classify_svn_error("svn: E160013: path doesn't exist"),
            ErrorCategory::RepoNotFound
        );
        assert_eq!(classify_svn_error("boom"), ErrorCategory::Exception);
    }
}
