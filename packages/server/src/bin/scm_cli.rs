//! `engram-scm` - repo registry CLI.
//!
//! All output is JSON, one document per invocation. Exit codes: 0
//! success, 1 generic error, 2 invalid arguments, 3 no DSN configured,
//! 4 not found.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use engram_core::store::{connect_pool, Repo, RepoType, SchemaContext};
use engram_core::Config;
use serde::Serialize;

const EXIT_OK: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_INVALID_ARGS: u8 = 2;
const EXIT_NO_DSN: u8 = 3;
const EXIT_NOT_FOUND: u8 = 4;

#[derive(Parser)]
#[command(name = "engram-scm")]
#[command(about = "SCM repo registry for the engram logbook")]
struct Cli {
    /// Path to the TOML config file (overrides the default chain).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a repo (idempotent on repo-type + repo-url).
    EnsureRepo {
        #[arg(long)]
        repo_type: String,
        #[arg(long)]
        repo_url: String,
        #[arg(long)]
        project_key: Option<String>,
        #[arg(long)]
        default_branch: Option<String>,
    },

    /// List registered repos.
    ListRepos {
        #[arg(long)]
        repo_type: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Fetch one repo by id or by (repo-type, repo-url).
    GetRepo {
        #[arg(long)]
        repo_id: Option<i64>,
        #[arg(long)]
        repo_type: Option<String>,
        #[arg(long)]
        repo_url: Option<String>,
    },
}

#[derive(Serialize)]
struct ErrorDoc {
    error: String,
}

fn fail(code: u8, message: impl Into<String>) -> ExitCode {
    let doc = ErrorDoc {
        error: message.into(),
    };
    println!(
        "{}",
        serde_json::to_string(&doc).unwrap_or_else(|_| "{\"error\":\"unprintable\"}".to_string())
    );
    ExitCode::from(code)
}

fn parse_repo_type(raw: &str) -> Result<RepoType, ExitCode> {
    RepoType::from_str(raw).map_err(|e| fail(EXIT_INVALID_ARGS, e))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(EXIT_ERROR, format!("config error: {e}")),
    };

    let Some(dsn) = config.dsn().map(str::to_string) else {
        return fail(
            EXIT_NO_DSN,
            "no postgres dsn configured ([postgres].dsn or ENGRAM_PG_DSN)",
        );
    };

    let context = match SchemaContext::new(config.postgres.schema_prefix.clone()) {
        Ok(context) => context,
        Err(e) => return fail(EXIT_INVALID_ARGS, e.to_string()),
    };

    let pool = match connect_pool(&dsn, &context, 4).await {
        Ok(pool) => pool,
        Err(e) => return fail(EXIT_ERROR, format!("database connection failed: {e}")),
    };

    match cli.command {
        Commands::EnsureRepo {
            repo_type,
            repo_url,
            project_key,
            default_branch,
        } => {
            let repo_type = match parse_repo_type(&repo_type) {
                Ok(t) => t,
                Err(code) => return code,
            };
            match Repo::upsert(
                &pool,
                repo_type,
                &repo_url,
                project_key.as_deref(),
                default_branch.as_deref(),
            )
            .await
            {
                Ok(repo) => {
                    println!("{}", serde_json::to_string(&repo).unwrap_or_default());
                    ExitCode::from(EXIT_OK)
                }
                Err(e) => fail(EXIT_ERROR, e.to_string()),
            }
        }

        Commands::ListRepos { repo_type, limit } => {
            let repo_type = match repo_type.as_deref().map(parse_repo_type).transpose() {
                Ok(t) => t,
                Err(code) => return code,
            };
            match Repo::list(&pool, repo_type, limit).await {
                Ok(repos) => {
                    println!("{}", serde_json::to_string(&repos).unwrap_or_default());
                    ExitCode::from(EXIT_OK)
                }
                Err(e) => fail(EXIT_ERROR, e.to_string()),
            }
        }

        Commands::GetRepo {
            repo_id,
            repo_type,
            repo_url,
        } => {
            let found = match (repo_id, repo_type, repo_url) {
                (Some(repo_id), None, None) => Repo::find_by_id(&pool, repo_id).await,
                (None, Some(repo_type), Some(repo_url)) => {
                    let repo_type = match parse_repo_type(&repo_type) {
                        Ok(t) => t,
                        Err(code) => return code,
                    };
                    Repo::find_by_url(&pool, repo_type, &repo_url).await
                }
                _ => {
                    return fail(
                        EXIT_INVALID_ARGS,
                        "pass either --repo-id or both --repo-type and --repo-url",
                    )
                }
            };

            match found {
                Ok(Some(repo)) => {
                    println!("{}", serde_json::to_string(&repo).unwrap_or_default());
                    ExitCode::from(EXIT_OK)
                }
                Ok(None) => fail(EXIT_NOT_FOUND, "repo not found"),
                Err(e) => fail(EXIT_ERROR, e.to_string()),
            }
        }
    }
}
