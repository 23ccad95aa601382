use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use shared::config::server::DatabaseConfig;

/// Script folders under the bootstrap root, applied in this order.
const STAGES: &[&str] = &["schema", "indexes"];

/// Tables the store cannot work without.
const REQUIRED_TABLES: &[&str] = &["conversations", "messages"];

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database bootstrap directory does not exist: {0}")]
    MissingRoot(PathBuf),
    #[error("database bootstrap stage '{stage}' missing at {path}")]
    MissingStage { stage: &'static str, path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error executing {path}: {source}")]
    Sql {
        path: PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("required table '{0}' is missing")]
    MissingTable(&'static str),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Apply every stage's scripts in file-name order, one transaction per script.
pub async fn run(pool: &PgPool, config: &DatabaseConfig) -> Result<usize, BootstrapError> {
    let mut applied = 0;
    for path in plan(&config.bootstrap_path)? {
        if apply_script(pool, &path).await? {
            applied += 1;
        }
    }
    info!(applied, "database bootstrap complete");
    Ok(applied)
}

/// Every script that [`run`] would apply, in order.
pub fn plan(root: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    if !root.exists() {
        return Err(BootstrapError::MissingRoot(root.to_path_buf()));
    }
    info!(path = %root.display(), "planning database bootstrap");

    let mut scripts = Vec::new();
    for &stage in STAGES {
        let stage_path = root.join(stage);
        if !stage_path.is_dir() {
            return Err(BootstrapError::MissingStage {
                stage,
                path: stage_path,
            });
        }
        let files = collect_sql_files(&stage_path)?;
        debug!(stage, count = files.len(), "bootstrap stage scripts");
        scripts.extend(files);
    }
    Ok(scripts)
}

/// `SELECT 1` against the pool.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}

/// Liveness plus presence of the tables the store needs.
pub async fn ensure_readiness(pool: &PgPool) -> Result<(), BootstrapError> {
    ensure_liveness(pool).await?;
    for &table in REQUIRED_TABLES {
        let present: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
        )
        .bind(table)
        .fetch_one(pool)
        .await?;
        if !present {
            return Err(BootstrapError::MissingTable(table));
        }
    }
    Ok(())
}

fn collect_sql_files(dir: &Path) -> Result<Vec<PathBuf>, BootstrapError> {
    let read_error = |source| BootstrapError::Read {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(read_error)? {
        let path = entry.map_err(read_error)?.path();
        if path
            .extension()
            .and_then(OsStr::to_str)
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
        {
            entries.push(path);
        }
    }

    entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(entries)
}

/// Returns false for scripts that are empty.
async fn apply_script(pool: &PgPool, path: &Path) -> Result<bool, BootstrapError> {
    let sql = fs::read_to_string(path).map_err(|source| BootstrapError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let trimmed = sql.trim();
    if trimmed.is_empty() {
        warn!(path = %path.display(), "skipping empty bootstrap script");
        return Ok(false);
    }

    let sql_error = |source| BootstrapError::Sql {
        path: path.to_path_buf(),
        source,
    };
    let mut transaction = pool.begin().await.map_err(sql_error)?;
    info!(script = %path.display(), "executing bootstrap script");
    sqlx::raw_sql(trimmed)
        .execute(&mut *transaction)
        .await
        .map_err(sql_error)?;
    transaction.commit().await.map_err(sql_error)?;
    Ok(true)
}
