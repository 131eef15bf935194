//! Incremental cursors and watermark advancement.
//!
//! A cursor is the `(timestamp, sha|rev)` pair of the last ingested record.
//! Advancement is strictly monotonic under lexicographic `(ts, sha)` order;
//! ties on timestamp break on sha ascending. `Z` and `+00:00` timestamps
//! compare equal because comparison happens on parsed instants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// KV namespace holding cursors.
pub const CURSOR_NAMESPACE: &str = "scm.sync";

/// Stored cursor for a GitLab commit stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitlabCursor {
    pub last_commit_ts: Option<String>,
    pub last_commit_sha: Option<String>,
    #[serde(default)]
    pub count: i64,
}

/// Stored cursor for an SVN revision stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SvnCursor {
    pub last_rev: i64,
    #[serde(default)]
    pub count: i64,
}

pub fn gitlab_cursor_key(repo_id: i64) -> String {
    format!("gitlab_cursor:{repo_id}")
}

pub fn svn_cursor_key(repo_id: i64) -> String {
    format!("svn_cursor:{repo_id}")
}

/// Parse an ISO-8601 cursor timestamp. `Z` and `+00:00` suffixes yield the
/// same instant.
pub fn parse_cursor_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whether a `(new_ts, new_sha)` pair may advance past `(old_ts, old_sha)`.
///
/// No existing cursor always advances. With both timestamps parseable the
/// pair advances iff `(new_ts, new_sha) > (old_ts, old_sha)`. An
/// unparseable new timestamp never advances an existing cursor; an old
/// cursor with no timestamp advances on any sha change.
pub fn should_advance(
    new_ts: Option<&str>,
    new_sha: &str,
    old_ts: Option<&str>,
    old_sha: Option<&str>,
) -> bool {
    if old_ts.is_none() && old_sha.is_none() {
        return true;
    }

    let parsed_new = new_ts.and_then(parse_cursor_ts);
    let parsed_old = old_ts.and_then(parse_cursor_ts);

    match (parsed_new, parsed_old) {
        (Some(new), Some(old)) => {
            if new != old {
                new > old
            } else {
                match old_sha {
                    Some(old_sha) => new_sha > old_sha,
                    None => true,
                }
            }
        }
        // Old cursor carries no usable timestamp: sha change decides.
        (Some(_), None) => old_sha != Some(new_sha),
        (None, _) => false,
    }
}

/// Sort a batch by `(ts, sha)` ascending and drop entries at or below the
/// cursor watermark.
///
/// With a full `(cursor_ts, cursor_sha)` watermark, entries strictly beyond
/// it survive. With only a sha, exact sha matches are dropped (idempotent
/// re-run of an unbounded batch). Entries with no timestamp sort first.
pub fn filter_after_cursor<T, F>(
    mut items: Vec<T>,
    sort_key: F,
    cursor_ts: Option<DateTime<Utc>>,
    cursor_sha: Option<&str>,
) -> Vec<T>
where
    F: Fn(&T) -> (Option<DateTime<Utc>>, String),
{
    let epoch = DateTime::<Utc>::UNIX_EPOCH;
    items.sort_by(|a, b| {
        let (ts_a, sha_a) = sort_key(a);
        let (ts_b, sha_b) = sort_key(b);
        (ts_a.unwrap_or(epoch), sha_a).cmp(&(ts_b.unwrap_or(epoch), sha_b))
    });

    match (cursor_ts, cursor_sha) {
        (Some(cursor_ts), Some(cursor_sha)) => items
            .into_iter()
            .filter(|item| {
                let (ts, sha) = sort_key(item);
                let ts = ts.unwrap_or(epoch);
                (ts, sha.as_str()) > (cursor_ts, cursor_sha)
            })
            .collect(),
        (None, Some(cursor_sha)) => items
            .into_iter()
            .filter(|item| sort_key(item).1 != cursor_sha)
            .collect(),
        _ => items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap()
    }

    #[test]
    fn first_sync_always_advances() {
        assert!(should_advance(
            Some("2024-01-15T12:00:00Z"),
            "abc123",
            None,
            None
        ));
    }

    #[test]
    fn newer_ts_advances() {
        assert!(should_advance(
            Some("2024-01-15T13:00:00Z"),
            "abc123",
            Some("2024-01-15T12:00:00Z"),
            Some("xyz789")
        ));
    }

    #[test]
    fn older_ts_does_not_advance() {
        assert!(!should_advance(
            Some("2024-01-15T11:00:00Z"),
            "abc123",
            Some("2024-01-15T12:00:00Z"),
            Some("xyz789")
        ));
    }

    #[test]
    fn same_ts_breaks_on_sha() {
        assert!(should_advance(
            Some("2024-01-15T12:00:00Z"),
            "bbb222",
            Some("2024-01-15T12:00:00Z"),
            Some("aaa111")
        ));
        assert!(!should_advance(
            Some("2024-01-15T12:00:00Z"),
            "aaa111",
            Some("2024-01-15T12:00:00Z"),
            Some("bbb222")
        ));
        assert!(!should_advance(
            Some("2024-01-15T12:00:00Z"),
            "abc123",
            Some("2024-01-15T12:00:00Z"),
            Some("abc123")
        ));
    }

    #[test]
    fn z_and_offset_zero_are_equivalent() {
        // Same instant spelled two ways: a tie, broken on sha.
        assert!(should_advance(
            Some("2024-01-15T12:00:00+00:00"),
            "bbb222",
            Some("2024-01-15T12:00:00Z"),
            Some("aaa111")
        ));
        assert!(!should_advance(
            Some("2024-01-15T12:00:00+00:00"),
            "abc123",
            Some("2024-01-15T12:00:00Z"),
            Some("abc123")
        ));
    }

    #[test]
    fn unparseable_new_ts_never_advances_existing_cursor() {
        assert!(!should_advance(
            Some("not-a-timestamp"),
            "abc",
            Some("2024-01-15T12:00:00Z"),
            Some("xyz")
        ));
        assert!(!should_advance(None, "abc", Some("2024-01-15T12:00:00Z"), Some("xyz")));
    }

    fn items(entries: &[(&str, u32)]) -> Vec<(Option<DateTime<Utc>>, String)> {
        entries
            .iter()
            .map(|(sha, h)| (Some(ts(*h)), sha.to_string()))
            .collect()
    }

    fn key(item: &(Option<DateTime<Utc>>, String)) -> (Option<DateTime<Utc>>, String) {
        (item.0, item.1.clone())
    }

    #[test]
    fn batch_sorts_by_ts_then_sha() {
        let got = filter_after_cursor(
            items(&[("ccc333", 12), ("aaa111", 12), ("bbb222", 12)]),
            key,
            None,
            None,
        );
        let shas: Vec<_> = got.iter().map(|i| i.1.as_str()).collect();
        assert_eq!(shas, ["aaa111", "bbb222", "ccc333"]);
    }

    #[test]
    fn batch_sorts_ts_first() {
        let got = filter_after_cursor(
            items(&[("zzz999", 12), ("aaa111", 13), ("bbb222", 12)]),
            key,
            None,
            None,
        );
        let shas: Vec<_> = got.iter().map(|i| i.1.as_str()).collect();
        assert_eq!(shas, ["bbb222", "zzz999", "aaa111"]);
    }

    #[test]
    fn watermark_filters_at_and_below_cursor() {
        let got = filter_after_cursor(
            items(&[("aaa111", 12), ("bbb222", 12), ("ccc333", 12)]),
            key,
            Some(ts(12)),
            Some("bbb222"),
        );
        let shas: Vec<_> = got.iter().map(|i| i.1.as_str()).collect();
        assert_eq!(shas, ["ccc333"]);
    }

    #[test]
    fn older_ts_entries_are_all_dropped() {
        let got = filter_after_cursor(
            items(&[("zzz999", 11), ("aaa111", 11)]),
            key,
            Some(ts(12)),
            Some("bbb222"),
        );
        assert!(got.is_empty());
    }

    #[test]
    fn newer_ts_entries_are_all_kept() {
        let got = filter_after_cursor(
            items(&[("aaa111", 13), ("zzz999", 13)]),
            key,
            Some(ts(12)),
            Some("mmm555"),
        );
        let shas: Vec<_> = got.iter().map(|i| i.1.as_str()).collect();
        assert_eq!(shas, ["aaa111", "zzz999"]);
    }

    #[test]
    fn sha_only_cursor_drops_exact_match() {
        let got = filter_after_cursor(
            items(&[("aaa111", 12), ("bbb222", 12), ("ccc333", 12)]),
            key,
            None,
            Some("bbb222"),
        );
        let shas: Vec<_> = got.iter().map(|i| i.1.as_str()).collect();
        assert_eq!(shas, ["aaa111", "ccc333"]);
    }

    #[test]
    fn batch_order_is_stable_across_input_orders() {
        let a = filter_after_cursor(
            items(&[("sha_c", 12), ("sha_a", 12), ("sha_b", 12)]),
            key,
            None,
            None,
        );
        let b = filter_after_cursor(
            items(&[("sha_b", 12), ("sha_c", 12), ("sha_a", 12)]),
            key,
            None,
            None,
        );
        let order_a: Vec<_> = a.iter().map(|i| i.1.clone()).collect();
        let order_b: Vec<_> = b.iter().map(|i| i.1.clone()).collect();
        assert_eq!(order_a, order_b);
        assert_eq!(order_a, ["sha_a", "sha_b", "sha_c"]);
    }

    #[test]
    fn cursor_keys_embed_repo_id() {
        assert_eq!(gitlab_cursor_key(7), "gitlab_cursor:7");
        assert_eq!(svn_cursor_key(7), "svn_cursor:7");
    }
}
