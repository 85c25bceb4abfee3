use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all pending migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    create_migration_table(pool).await?;
    let current_version = get_schema_version(pool).await?;

    if current_version < 1 {
        debug!("Running migration v1");
        run_migration_v1(pool).await?;
        set_schema_version(pool, 1).await?;
    }

    if current_version < 2 {
        debug!("Running migration v2");
        run_migration_v2(pool).await?;
        set_schema_version(pool, 2).await?;
    }

    if current_version < 3 {
        debug!("Running migration v3");
        run_migration_v3(pool).await?;
        set_schema_version(pool, 3).await?;
    }

    Ok(())
}

async fn create_migration_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS _schema_version (
            version INTEGER PRIMARY KEY
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create schema version table")?;

    Ok(())
}

async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let row: Option<(i32,)> = sqlx::query_as("SELECT version FROM _schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("Failed to get schema version")?;

    Ok(row.map_or(0, |(v,)| v))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("DELETE FROM _schema_version")
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO _schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

async fn run_migration_v1(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v1: settings, fetch ledger, core snapshots");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create settings table")?;

    // Append-only fetch ledger. Discriminator columns are NOT NULL with
    // neutral defaults so validity lookups stay plain equality.
    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS fetches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fetch_type TEXT NOT NULL,
            community TEXT NOT NULL,
            page INTEGER NOT NULL DEFAULT 0,
            user_key TEXT NOT NULL DEFAULT '',
            post_key TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            error_message TEXT NOT NULL DEFAULT '',
            raw_payload TEXT NOT NULL DEFAULT '',
            total_items INTEGER NOT NULL DEFAULT 0,
            total_pages INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create fetches table")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_fetches_lookup
        ON fetches (fetch_type, community, status, created_at)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create fetches lookup index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fetch_id INTEGER NOT NULL,
            extracted_at INTEGER NOT NULL,
            community TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            email TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            bio TEXT NOT NULL DEFAULT '',
            picture_url TEXT NOT NULL DEFAULT '',
            member_role TEXT NOT NULL DEFAULT '',
            member_created_at INTEGER NOT NULL DEFAULT 0,
            last_active INTEGER NOT NULL DEFAULT 0,
            is_online INTEGER NOT NULL DEFAULT 0,
            points INTEGER NOT NULL DEFAULT 0,
            leaderboard_applied_at INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT ''
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create users table")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_users_natural_key
        ON users (community, remote_id, extracted_at)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create users natural key index")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fetch_id INTEGER NOT NULL,
            extracted_at INTEGER NOT NULL,
            community TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            post_type TEXT NOT NULL DEFAULT '',
            author_key TEXT NOT NULL DEFAULT '',
            author_name TEXT NOT NULL DEFAULT '',
            root_key TEXT NOT NULL DEFAULT '',
            group_key TEXT NOT NULL DEFAULT '',
            label_key TEXT NOT NULL DEFAULT '',
            is_toplevel INTEGER NOT NULL DEFAULT 1,
            upvotes INTEGER NOT NULL DEFAULT 0,
            comment_count INTEGER NOT NULL DEFAULT 0,
            created_at_remote INTEGER NOT NULL DEFAULT 0,
            metadata TEXT NOT NULL DEFAULT ''
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts table")?;

    sqlx::query(
        r"
        CREATE INDEX IF NOT EXISTS idx_posts_natural_key
        ON posts (remote_id, extracted_at)
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create posts natural key index")?;

    Ok(())
}

async fn run_migration_v2(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v2: profiles, leaderboard, likes");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fetch_id INTEGER NOT NULL,
            extracted_at INTEGER NOT NULL,
            community TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            bio TEXT NOT NULL DEFAULT '',
            total_posts INTEGER NOT NULL DEFAULT 0,
            total_followers INTEGER NOT NULL DEFAULT 0,
            total_following INTEGER NOT NULL DEFAULT 0,
            total_contributions INTEGER NOT NULL DEFAULT 0,
            groups TEXT NOT NULL DEFAULT '',
            daily_activities TEXT NOT NULL DEFAULT ''
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create profiles table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS leaderboard (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fetch_id INTEGER NOT NULL,
            extracted_at INTEGER NOT NULL,
            community TEXT NOT NULL,
            user_key TEXT NOT NULL,
            user_name TEXT NOT NULL DEFAULT '',
            rank INTEGER NOT NULL DEFAULT 0,
            points INTEGER NOT NULL DEFAULT 0
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create leaderboard table")?;

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS likes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fetch_id INTEGER NOT NULL,
            extracted_at INTEGER NOT NULL,
            community TEXT NOT NULL,
            post_key TEXT NOT NULL,
            user_key TEXT NOT NULL,
            user_name TEXT NOT NULL DEFAULT '',
            user_first_name TEXT NOT NULL DEFAULT '',
            user_last_name TEXT NOT NULL DEFAULT ''
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create likes table")?;

    Ok(())
}

async fn run_migration_v3(pool: &SqlitePool) -> Result<()> {
    debug!("Running migration v3: discovered communities");

    sqlx::query(
        r"
        CREATE TABLE IF NOT EXISTS other_communities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL DEFAULT '',
            about_fetched INTEGER NOT NULL DEFAULT 0,
            about_payload TEXT NOT NULL DEFAULT '',
            first_seen_at INTEGER NOT NULL DEFAULT 0
        )
        ",
    )
    .execute(pool)
    .await
    .context("Failed to create other_communities table")?;

    Ok(())
}
