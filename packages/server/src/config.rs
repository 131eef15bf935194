//! Configuration: a TOML file plus environment overlay.
//!
//! File resolution order: explicit `--config` path, then
//! `ENGRAM_LOGBOOK_CONFIG`, then `./.agentx/config.toml`, then
//! `~/.agentx/config.toml`. Sensitive material never lives in the file:
//! admin DSN, S3 credentials, the GitLab token and the SVN password all
//! come from the environment (or files/commands the config points at).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;

pub const ENV_CONFIG_PATH: &str = "ENGRAM_LOGBOOK_CONFIG";
pub const ENV_PG_DSN: &str = "ENGRAM_PG_DSN";
pub const ENV_PG_ADMIN_DSN: &str = "ENGRAM_PG_ADMIN_DSN";
pub const ENV_ARTIFACTS_ROOT: &str = "ENGRAM_ARTIFACTS_ROOT";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub project: ProjectConfig,
    pub sync: SyncConfig,
    pub gitlab: GitLabConfig,
    pub svn: SvnConfig,
    pub artifacts: ArtifactsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PostgresConfig {
    pub dsn: Option<String>,
    pub admin_dsn: Option<String>,
    pub schema_prefix: Option<String>,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProjectConfig {
    pub project_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub worker_concurrency: usize,
    pub lease_seconds: i32,
    pub heartbeat_interval_seconds: u64,
    pub handler_timeout_seconds: u64,
    pub retry_base_seconds: i64,
    pub retry_max_seconds: i64,
    pub reaper_interval_seconds: u64,
    pub reaper_stale_grace_seconds: i64,
    pub scheduler_interval_seconds: u64,
    pub cursor_max_age_seconds: i64,
    pub default_batch_size: i64,
    pub probe_budget: i64,
    pub rate_limit_rate: f64,
    pub rate_limit_burst: f64,
    pub limiter_wait_max_seconds: u64,
    pub breaker_failure_threshold: i64,
    pub breaker_open_base_seconds: i64,
    pub breaker_open_max_seconds: i64,
    pub breaker_half_open_success_quota: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            worker_concurrency: 4,
            lease_seconds: 300,
            heartbeat_interval_seconds: 30,
            handler_timeout_seconds: 600,
            retry_base_seconds: 30,
            retry_max_seconds: 3600,
            reaper_interval_seconds: 5,
            reaper_stale_grace_seconds: 30,
            scheduler_interval_seconds: 60,
            cursor_max_age_seconds: 900,
            default_batch_size: 200,
            probe_budget: 10,
            rate_limit_rate: 2.0,
            rate_limit_burst: 10.0,
            limiter_wait_max_seconds: 30,
            breaker_failure_threshold: 5,
            breaker_open_base_seconds: 60,
            breaker_open_max_seconds: 3600,
            breaker_half_open_success_quota: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GitLabConfig {
    pub token_env: Option<String>,
    pub token_file: Option<String>,
    pub token_exec: Option<String>,
    pub timeout_seconds: u64,
    pub per_page: u32,
}

impl Default for GitLabConfig {
    fn default() -> Self {
        GitLabConfig {
            token_env: None,
            token_file: None,
            token_exec: None,
            timeout_seconds: 30,
            per_page: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SvnConfig {
    pub username: Option<String>,
    pub password_env: Option<String>,
    pub password_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub backend: String,
    pub root: String,
    pub emit_object_store_audit: bool,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        ArtifactsConfig {
            backend: "local".to_string(),
            root: "./.agentx/artifacts".to_string(),
            emit_object_store_audit: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0:8088".to_string(),
        }
    }
}

/// S3/MinIO connection material, environment-only by design.
#[derive(Debug, Clone, Default)]
pub struct S3Env {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
}

impl S3Env {
    pub fn from_env() -> Self {
        S3Env {
            endpoint: std::env::var("ENGRAM_S3_ENDPOINT").ok(),
            access_key: std::env::var("ENGRAM_S3_ACCESS_KEY").ok(),
            secret_key: std::env::var("ENGRAM_S3_SECRET_KEY").ok(),
            bucket: std::env::var("ENGRAM_S3_BUCKET").ok(),
        }
    }
}

impl Config {
    /// Load configuration following the file priority chain, then apply
    /// environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenv();

        let mut config = match Self::resolve_path(explicit) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let cwd_default = PathBuf::from("./.agentx/config.toml");
        if cwd_default.exists() {
            return Some(cwd_default);
        }
        if let Ok(home) = std::env::var("HOME") {
            let home_default = PathBuf::from(home).join(".agentx/config.toml");
            if home_default.exists() {
                return Some(home_default);
            }
        }
        None
    }

    fn apply_env(&mut self) {
        if let Ok(dsn) = std::env::var(ENV_PG_DSN) {
            if !dsn.trim().is_empty() {
                self.postgres.dsn = Some(dsn);
            }
        }
        if let Ok(dsn) = std::env::var(ENV_PG_ADMIN_DSN) {
            if !dsn.trim().is_empty() {
                self.postgres.admin_dsn = Some(dsn);
            }
        }
        if let Ok(root) = std::env::var(ENV_ARTIFACTS_ROOT) {
            if !root.trim().is_empty() {
                self.artifacts.root = root;
            }
        }
    }

    /// The service DSN; absent DSN is the CLI's exit-code-3 case.
    pub fn dsn(&self) -> Option<&str> {
        self.postgres.dsn.as_deref()
    }

    pub fn project_key(&self) -> &str {
        self.project.project_key.as_deref().unwrap_or("default")
    }

    /// Resolve the GitLab token: env var name, then file, then command.
    pub fn gitlab_token(&self) -> Result<Option<String>> {
        if let Some(var) = &self.gitlab.token_env {
            if let Ok(token) = std::env::var(var) {
                let token = token.trim().to_string();
                if !token.is_empty() {
                    return Ok(Some(token));
                }
            }
        }
        if let Some(path) = &self.gitlab.token_file {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read gitlab token file {path}"))?;
            let token = token.trim().to_string();
            if !token.is_empty() {
                return Ok(Some(token));
            }
        }
        if let Some(cmd) = &self.gitlab.token_exec {
            let output = std::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .with_context(|| "failed to run gitlab token_exec command".to_string())?;
            if output.status.success() {
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !token.is_empty() {
                    return Ok(Some(token));
                }
            }
        }
        Ok(None)
    }

    /// Resolve the SVN password: env var name, then file.
    pub fn svn_password(&self) -> Result<Option<String>> {
        if let Some(var) = &self.svn.password_env {
            if let Ok(password) = std::env::var(var) {
                if !password.is_empty() {
                    return Ok(Some(password));
                }
            }
        }
        if let Some(path) = &self.svn.password_file {
            let password = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read svn password file {path}"))?;
            let password = password.trim_end_matches(['\r', '\n']).to_string();
            if !password.is_empty() {
                return Ok(Some(password));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_parses_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [postgres]
            dsn = "postgresql://localhost/engram"

            [project]
            project_key = "acme/logbook"
            "#,
        )
        .unwrap();

        assert_eq!(config.dsn(), Some("postgresql://localhost/engram"));
        assert_eq!(config.project_key(), "acme/logbook");
        assert_eq!(config.sync.lease_seconds, 300);
        assert_eq!(config.sync.breaker_failure_threshold, 5);
        assert_eq!(config.artifacts.backend, "local");
        assert!(!config.artifacts.emit_object_store_audit);
    }

    #[test]
    fn sync_section_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            lease_seconds = 60
            reaper_stale_grace_seconds = 10
            worker_concurrency = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.lease_seconds, 60);
        assert_eq!(config.sync.reaper_stale_grace_seconds, 10);
        assert_eq!(config.sync.worker_concurrency, 2);
        // Untouched values keep their defaults.
        assert_eq!(config.sync.handler_timeout_seconds, 600);
    }

    #[test]
    fn empty_config_has_no_dsn() {
        let config = Config::default();
        assert_eq!(config.dsn(), None);
        assert_eq!(config.project_key(), "default");
    }

    #[test]
    fn unknown_sections_are_tolerated() {
        let config: Config = toml::from_str(
            r#"
            [postgres]
            dsn = "postgresql://localhost/engram"

            [future_section]
            anything = true
            "#,
        )
        .unwrap();
        assert!(config.dsn().is_some());
    }
}
