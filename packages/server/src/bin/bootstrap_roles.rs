//! `engram-bootstrap-roles` - database bootstrap precheck and service
//! account creation.
//!
//! Deployment mode is detected from the four service-account password
//! env vars: all set means `unified-stack`, none set means
//! `logbook-only` (skip role creation), anything in between is a
//! configuration error. Re-running with identical env is a no-op:
//! existing roles get `ALTER ROLE` instead of `CREATE ROLE`.
//!
//! Exit codes: 0 success (including skip mode), 1 runtime failure,
//! 2 invalid configuration, 3 missing admin DSN.

use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

const ENV_ADMIN_DSN: &str = "ENGRAM_PG_ADMIN_DSN";
const ENV_ADMIN_DSN_FALLBACK: &str = "POSTGRES_DSN";
const ENV_OM_SCHEMA: &str = "OM_PG_SCHEMA";
const DEFAULT_OM_SCHEMA: &str = "openmemory";

const PASSWORD_ENVS: [&str; 4] = [
    "LOGBOOK_MIGRATOR_PASSWORD",
    "LOGBOOK_SVC_PASSWORD",
    "OPENMEMORY_MIGRATOR_PASSWORD",
    "OPENMEMORY_SVC_PASSWORD",
];

/// `(role_name, password_env)` for each login role.
const LOGIN_ROLES: [(&str, &str); 4] = [
    ("logbook_migrator", "LOGBOOK_MIGRATOR_PASSWORD"),
    ("logbook_svc", "LOGBOOK_SVC_PASSWORD"),
    ("openmemory_migrator_login", "OPENMEMORY_MIGRATOR_PASSWORD"),
    ("openmemory_svc", "OPENMEMORY_SVC_PASSWORD"),
];

mod codes {
    pub const CONFIG_MISSING_DSN: &str = "BOOTSTRAP_CONFIG_MISSING_DSN";
    pub const CONFIG_PARTIAL_PASSWORD: &str = "BOOTSTRAP_CONFIG_PARTIAL_PASSWORD";
    pub const PRECHECK_SCHEMA_PUBLIC: &str = "BOOTSTRAP_PRECHECK_SCHEMA_PUBLIC";
    pub const PRECHECK_NO_CREATEROLE: &str = "BOOTSTRAP_PRECHECK_NO_CREATEROLE";
    pub const ROLE_CREATION_FAILED: &str = "BOOTSTRAP_ROLE_CREATION_FAILED";
    pub const SKIP_MODE_ACTIVE: &str = "BOOTSTRAP_SKIP_MODE_ACTIVE";
}

#[derive(Parser)]
#[command(name = "engram-bootstrap-roles")]
#[command(about = "Precheck and create engram service-account roles")]
struct Cli {
    /// Admin DSN (overrides ENGRAM_PG_ADMIN_DSN / POSTGRES_DSN).
    #[arg(long)]
    dsn: Option<String>,

    /// Run prechecks only; do not create or alter roles.
    #[arg(long)]
    check: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
enum DeploymentMode {
    LogbookOnly,
    UnifiedStack,
    Invalid,
}

#[derive(Debug, Serialize)]
struct ModeDetection {
    mode: DeploymentMode,
    skip_roles: bool,
    set_passwords: Vec<String>,
    missing_passwords: Vec<String>,
    code: Option<String>,
}

/// Pure mode detection over the password env var states.
fn detect_deployment_mode(set: &[bool; 4]) -> ModeDetection {
    let set_passwords: Vec<String> = PASSWORD_ENVS
        .iter()
        .zip(set)
        .filter(|(_, s)| **s)
        .map(|(name, _)| name.to_string())
        .collect();
    let missing_passwords: Vec<String> = PASSWORD_ENVS
        .iter()
        .zip(set)
        .filter(|(_, s)| !**s)
        .map(|(name, _)| name.to_string())
        .collect();

    let (mode, skip_roles, code) = match set_passwords.len() {
        0 => (DeploymentMode::LogbookOnly, true, Some(codes::SKIP_MODE_ACTIVE.to_string())),
        4 => (DeploymentMode::UnifiedStack, false, None),
        _ => (
            DeploymentMode::Invalid,
            true,
            Some(codes::CONFIG_PARTIAL_PASSWORD.to_string()),
        ),
    };

    ModeDetection {
        mode,
        skip_roles,
        set_passwords,
        missing_passwords,
        code,
    }
}

#[derive(Debug, Serialize)]
struct RoleReport {
    role: String,
    created: bool,
    updated: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    ok: bool,
    mode: DeploymentMode,
    om_schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    roles: Vec<RoleReport>,
}

fn print_report(report: &Report) {
    println!(
        "{}",
        serde_json::to_string(report).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
}

fn report_failure(
    mode: DeploymentMode,
    om_schema: &str,
    code: &str,
    message: impl Into<String>,
    exit: u8,
) -> ExitCode {
    print_report(&Report {
        ok: false,
        mode,
        om_schema: om_schema.to_string(),
        code: Some(code.to_string()),
        message: Some(message.into()),
        roles: Vec::new(),
    });
    ExitCode::from(exit)
}

async fn has_createrole(pool: &PgPool) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT rolcreaterole OR rolsuper AS allowed FROM pg_roles WHERE rolname = current_user",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.get::<bool, _>("allowed")).unwrap_or(false))
}

async fn role_exists(pool: &PgPool, role: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM pg_roles WHERE rolname = $1")
        .bind(role)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Create or update one login role. Passwords cannot be bound as
/// parameters in DDL, so single quotes are doubled.
async fn create_or_update_role(
    pool: &PgPool,
    role: &str,
    password: &str,
) -> Result<RoleReport, sqlx::Error> {
    let quoted = password.replace('\'', "''");
    if role_exists(pool, role).await? {
        sqlx::query(&format!("ALTER ROLE {role} WITH LOGIN PASSWORD '{quoted}'"))
            .execute(pool)
            .await?;
        Ok(RoleReport {
            role: role.to_string(),
            created: false,
            updated: true,
        })
    } else {
        sqlx::query(&format!("CREATE ROLE {role} WITH LOGIN PASSWORD '{quoted}'"))
            .execute(pool)
            .await?;
        Ok(RoleReport {
            role: role.to_string(),
            created: true,
            updated: false,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let om_schema =
        std::env::var(ENV_OM_SCHEMA).unwrap_or_else(|_| DEFAULT_OM_SCHEMA.to_string());

    let set: [bool; 4] = std::array::from_fn(|i| {
        std::env::var(PASSWORD_ENVS[i])
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    });
    let detection = detect_deployment_mode(&set);

    if detection.mode == DeploymentMode::Invalid {
        return report_failure(
            detection.mode,
            &om_schema,
            codes::CONFIG_PARTIAL_PASSWORD,
            format!(
                "unified-stack needs all four password env vars (missing: {})",
                detection.missing_passwords.join(", ")
            ),
            2,
        );
    }

    if om_schema == "public" {
        return report_failure(
            detection.mode,
            &om_schema,
            codes::PRECHECK_SCHEMA_PUBLIC,
            "OM_PG_SCHEMA must not be `public`",
            2,
        );
    }

    let dsn = cli
        .dsn
        .or_else(|| std::env::var(ENV_ADMIN_DSN).ok().filter(|v| !v.is_empty()))
        .or_else(|| {
            std::env::var(ENV_ADMIN_DSN_FALLBACK)
                .ok()
                .filter(|v| !v.is_empty())
        });
    let Some(dsn) = dsn else {
        return report_failure(
            detection.mode,
            &om_schema,
            codes::CONFIG_MISSING_DSN,
            "set ENGRAM_PG_ADMIN_DSN (or POSTGRES_DSN) or pass --dsn",
            3,
        );
    };

    let pool = match PgPoolOptions::new().max_connections(1).connect(&dsn).await {
        Ok(pool) => pool,
        Err(e) => {
            return report_failure(
                detection.mode,
                &om_schema,
                codes::ROLE_CREATION_FAILED,
                format!("admin connection failed: {e}"),
                1,
            )
        }
    };

    if detection.skip_roles {
        print_report(&Report {
            ok: true,
            mode: detection.mode,
            om_schema,
            code: Some(codes::SKIP_MODE_ACTIVE.to_string()),
            message: Some("logbook-only mode: service account creation skipped".to_string()),
            roles: Vec::new(),
        });
        return ExitCode::from(0);
    }

    match has_createrole(&pool).await {
        Ok(true) => {}
        Ok(false) => {
            return report_failure(
                detection.mode,
                &om_schema,
                codes::PRECHECK_NO_CREATEROLE,
                "current user lacks CREATEROLE; use a superuser or grant CREATEROLE",
                1,
            )
        }
        Err(e) => {
            return report_failure(
                detection.mode,
                &om_schema,
                codes::ROLE_CREATION_FAILED,
                format!("precheck query failed: {e}"),
                1,
            )
        }
    }

    if cli.check {
        print_report(&Report {
            ok: true,
            mode: detection.mode,
            om_schema,
            code: None,
            message: Some("prechecks passed".to_string()),
            roles: Vec::new(),
        });
        return ExitCode::from(0);
    }

    let mut roles = Vec::new();
    for (role, password_env) in LOGIN_ROLES {
        let password = match std::env::var(password_env) {
            Ok(password) if !password.is_empty() => password,
            _ => {
                return report_failure(
                    detection.mode,
                    &om_schema,
                    codes::CONFIG_PARTIAL_PASSWORD,
                    format!("{password_env} vanished mid-run"),
                    2,
                )
            }
        };
        match create_or_update_role(&pool, role, &password).await {
            Ok(report) => roles.push(report),
            Err(e) => {
                return report_failure(
                    detection.mode,
                    &om_schema,
                    codes::ROLE_CREATION_FAILED,
                    format!("failed for role {role}: {e}"),
                    1,
                )
            }
        }
    }

    print_report(&Report {
        ok: true,
        mode: detection.mode,
        om_schema,
        code: None,
        message: None,
        roles,
    });
    ExitCode::from(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_passwords_is_logbook_only_skip() {
        let detection = detect_deployment_mode(&[false, false, false, false]);
        assert_eq!(detection.mode, DeploymentMode::LogbookOnly);
        assert!(detection.skip_roles);
        assert_eq!(detection.code.as_deref(), Some(codes::SKIP_MODE_ACTIVE));
    }

    #[test]
    fn all_passwords_is_unified_stack() {
        let detection = detect_deployment_mode(&[true, true, true, true]);
        assert_eq!(detection.mode, DeploymentMode::UnifiedStack);
        assert!(!detection.skip_roles);
        assert!(detection.code.is_none());
        assert_eq!(detection.set_passwords.len(), 4);
    }

    #[test]
    fn any_partial_subset_is_invalid() {
        for mask in 1u8..15 {
            let set = std::array::from_fn(|i| mask & (1 << i) != 0);
            let detection = detect_deployment_mode(&set);
            assert_eq!(detection.mode, DeploymentMode::Invalid, "mask {mask}");
            assert_eq!(
                detection.code.as_deref(),
                Some(codes::CONFIG_PARTIAL_PASSWORD)
            );
        }
    }
}
