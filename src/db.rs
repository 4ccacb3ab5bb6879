//! Postgres pools and per-service schemas.
//!
//! Each service owns its own database; the schema it needs is embedded at
//! compile time from `migrations/<service>`.

use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

static POSTS: Migrator = sqlx::migrate!("./migrations/posts");
static SEARCH: Migrator = sqlx::migrate!("./migrations/search");
static MEDIA: Migrator = sqlx::migrate!("./migrations/media");

/// Schema owned by one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Posts,
    Search,
    Media,
}

impl Schema {
    fn migrator(self) -> &'static Migrator {
        match self {
            Schema::Posts => &POSTS,
            Schema::Search => &SEARCH,
            Schema::Media => &MEDIA,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Schema::Posts => "posts",
            Schema::Search => "search",
            Schema::Media => "media",
        }
    }
}

pub async fn connect_pool(
    url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect(url)
        .await
        .context("failed to connect to database")?;
    info!(max_connections, "Database pool ready");
    Ok(pool)
}

pub async fn migrate(pool: &PgPool, schema: Schema) -> anyhow::Result<()> {
    schema
        .migrator()
        .run(pool)
        .await
        .with_context(|| format!("failed to apply {} migrations", schema.name()))?;
    info!(schema = schema.name(), "Migrations applied");
    Ok(())
}
