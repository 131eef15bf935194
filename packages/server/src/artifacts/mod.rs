//! Artifact storage for SCM patch blobs.
//!
//! Patches are content-addressed under
//! `scm/<project_key>/<repo_id>/<source_type>/<rev_or_sha>/<sha256>.<ext>`
//! with `ext ∈ {diff, diffstat, ministat}`. For SVN the version label is
//! `r<N>`; for git/gitlab it is a ≥7-char lowercase hex sha. Writing the
//! same sha256 twice is a no-op, which keeps retried syncs idempotent.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const SCM_EXT_DIFF: &str = "diff";
pub const SCM_EXT_DIFFSTAT: &str = "diffstat";
pub const SCM_EXT_MINISTAT: &str = "ministat";

const VALID_EXTENSIONS: [&str; 3] = [SCM_EXT_DIFF, SCM_EXT_DIFFSTAT, SCM_EXT_MINISTAT];
const VALID_SOURCE_TYPES: [&str; 3] = ["svn", "git", "gitlab"];

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid source type `{0}`")]
    InvalidSourceType(String),
    #[error("invalid artifact extension `{0}`")]
    InvalidExtension(String),
    #[error("invalid revision label `{0}` for source type `{1}`")]
    InvalidRevLabel(String, String),
    #[error("artifact io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Incremental SHA-256 with byte accounting, for streaming large diffs.
#[derive(Default)]
pub struct Sha256Stream {
    hasher: Sha256,
    size_bytes: u64,
}

impl Sha256Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(data);
        self.size_bytes += data.len() as u64;
        self
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.size_bytes)
    }
}

/// SHA-256 of a full buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The SVN revision label used in artifact paths.
pub fn svn_rev_label(rev: i64) -> String {
    format!("r{rev}")
}

/// Git/GitLab path labels are full or abbreviated (≥7) lowercase hex shas.
pub fn is_valid_git_sha_label(label: &str) -> bool {
    label.len() >= 7 && label.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn is_valid_svn_rev_label(label: &str) -> bool {
    label
        .strip_prefix('r')
        .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Relative storage path for one patch artifact (v2 layout).
pub fn scm_patch_relpath(
    project_key: &str,
    repo_id: i64,
    source_type: &str,
    rev_or_sha: &str,
    sha256: &str,
    ext: &str,
) -> Result<String, ArtifactError> {
    if !VALID_SOURCE_TYPES.contains(&source_type) {
        return Err(ArtifactError::InvalidSourceType(source_type.to_string()));
    }
    if !VALID_EXTENSIONS.contains(&ext) {
        return Err(ArtifactError::InvalidExtension(ext.to_string()));
    }
    let label_ok = if source_type == "svn" {
        is_valid_svn_rev_label(rev_or_sha)
    } else {
        is_valid_git_sha_label(rev_or_sha)
    };
    if !label_ok {
        return Err(ArtifactError::InvalidRevLabel(
            rev_or_sha.to_string(),
            source_type.to_string(),
        ));
    }
    Ok(format!(
        "scm/{project_key}/{repo_id}/{source_type}/{rev_or_sha}/{sha256}.{ext}"
    ))
}

/// Evidence URI stored in `evidence_refs_json` next to patch-blob rows.
pub fn evidence_uri(source_type: &str, source_id: &str, sha256: &str) -> String {
    format!("memory://patch_blobs/{source_type}/{source_id}/{sha256}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub uri: String,
    pub sha256: String,
    pub size_bytes: u64,
    /// False when the content-addressed target already existed.
    pub created: bool,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_text(&self, relpath: &str, content: &str) -> Result<StoredArtifact, ArtifactError>;
}

/// Local filesystem artifact store rooted at a configurable directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactsStore {
    root: PathBuf,
}

impl LocalArtifactsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_uri(path: &Path) -> String {
        match std::path::absolute(path) {
            Ok(abs) => format!("file://{}", abs.display()),
            Err(_) => format!("file://{}", path.display()),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactsStore {
    async fn put_text(&self, relpath: &str, content: &str) -> Result<StoredArtifact, ArtifactError> {
        let path = self.root.join(relpath);
        let io_err = |source: std::io::Error, path: &Path| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(e, parent))?;
        }

        let mut stream = Sha256Stream::new();
        stream.update(content.as_bytes());
        let (sha256, size_bytes) = stream.finish();

        // Content-addressed: an existing file with this path already holds
        // identical bytes.
        let created = match tokio::fs::try_exists(&path).await {
            Ok(true) => false,
            _ => {
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| io_err(e, &path))?;
                true
            }
        };

        Ok(StoredArtifact {
            uri: Self::file_uri(&path),
            sha256,
            size_bytes,
            created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_relpath_follows_v2_layout() {
        let path = scm_patch_relpath("proj_a", 1, "svn", "r100", "abc123", "diff").unwrap();
        assert_eq!(path, "scm/proj_a/1/svn/r100/abc123.diff");

        let path =
            scm_patch_relpath("proj_a", 2, "gitlab", "def4567aa", "e3b0c4", "ministat").unwrap();
        assert_eq!(path, "scm/proj_a/2/gitlab/def4567aa/e3b0c4.ministat");
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(scm_patch_relpath("p", 1, "hg", "abc1234", "x", "diff").is_err());
        assert!(scm_patch_relpath("p", 1, "git", "abc1234", "x", "patch").is_err());
        assert!(scm_patch_relpath("p", 1, "svn", "100", "x", "diff").is_err());
        assert!(scm_patch_relpath("p", 1, "git", "ABC1234", "x", "diff").is_err());
        assert!(scm_patch_relpath("p", 1, "git", "abc12", "x", "diff").is_err());
    }

    #[test]
    fn git_sha_labels_are_lowercase_hex_min_7() {
        assert!(is_valid_git_sha_label("abc1234"));
        assert!(is_valid_git_sha_label(
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        ));
        assert!(!is_valid_git_sha_label("abc123"));
        assert!(!is_valid_git_sha_label("ABC1234"));
        assert!(!is_valid_git_sha_label("ghijklm"));
    }

    #[test]
    fn svn_labels_are_r_prefixed() {
        assert_eq!(svn_rev_label(100), "r100");
        assert!(is_valid_svn_rev_label("r1"));
        assert!(!is_valid_svn_rev_label("r"));
        assert!(!is_valid_svn_rev_label("100"));
    }

    #[test]
    fn evidence_uris_are_stable() {
        assert_eq!(
            evidence_uri("gitlab", "1:abc1234", "e3b0c4"),
            "memory://patch_blobs/gitlab/1:abc1234/e3b0c4"
        );
    }

    #[test]
    fn sha256_stream_matches_one_shot() {
        let mut stream = Sha256Stream::new();
        stream.update(b"hello ").update(b"world");
        let (digest, size) = stream.finish();
        assert_eq!(digest, sha256_hex(b"hello world"));
        assert_eq!(size, 11);
    }

    #[tokio::test]
    async fn local_store_writes_are_idempotent() {
        let root = std::env::temp_dir().join(format!("engram-artifacts-{}", uuid::Uuid::new_v4()));
        let store = LocalArtifactsStore::new(&root);

        let first = store.put_text("scm/p/1/svn/r1/x.diff", "diff body").await.unwrap();
        assert!(first.created);
        assert_eq!(first.sha256, sha256_hex(b"diff body"));
        assert!(first.uri.starts_with("file://"));

        let second = store.put_text("scm/p/1/svn/r1/x.diff", "diff body").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.sha256, first.sha256);

        tokio::fs::remove_dir_all(&root).await.ok();
    }
}
