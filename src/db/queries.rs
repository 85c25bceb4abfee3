use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::warn;

use super::models::{
    FetchRecord, FetchType, LeaderboardEntry, LikeSnapshot, NewFetchRecord, OtherCommunity,
    PostSnapshot, ProfileSnapshot, UserSnapshot,
};

// ========== Settings ==========

/// Get a setting value by key.
pub async fn get_setting(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch setting")?;

    Ok(row.map(|(v,)| v))
}

/// Set a setting, overwriting any previous value.
pub async fn set_setting(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        ",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .context("Failed to set setting")?;

    Ok(())
}

/// The community currently under analysis, if one is selected.
pub async fn current_community(pool: &SqlitePool) -> Result<Option<String>> {
    let value = get_setting(pool, "current_community").await?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

// ========== Fetch ledger ==========

/// Append a fetch attempt to the ledger, returning its ID.
pub async fn insert_fetch(pool: &SqlitePool, record: &NewFetchRecord, now: i64) -> Result<i64> {
    let result = sqlx::query(
        r"
        INSERT INTO fetches
            (fetch_type, community, page, user_key, post_key, status,
             error_message, raw_payload, total_items, total_pages, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(record.fetch_type.as_str())
    .bind(&record.community)
    .bind(record.page)
    .bind(&record.user_key)
    .bind(&record.post_key)
    .bind(record.status.as_str())
    .bind(&record.error_message)
    .bind(&record.raw_payload)
    .bind(record.total_items)
    .bind(record.total_pages)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to insert fetch record")?;

    Ok(result.last_insert_rowid())
}

/// Get a fetch record by ID.
pub async fn get_fetch(pool: &SqlitePool, id: i64) -> Result<Option<FetchRecord>> {
    sqlx::query_as("SELECT * FROM fetches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch record by id")
}

/// The most recent successful fetch for an exact (type, community,
/// discriminators) combination that is newer than `cutoff`.
///
/// Error records never count; their absence is what makes the planner
/// regenerate the task on the next pass.
pub async fn most_recent_valid(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
    page: i64,
    user_key: &str,
    post_key: &str,
    cutoff: i64,
) -> Result<Option<FetchRecord>> {
    sqlx::query_as(
        r"
        SELECT * FROM fetches
        WHERE fetch_type = ? AND community = ? AND page = ?
          AND user_key = ? AND post_key = ?
          AND status = 'ok' AND created_at > ?
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        ",
    )
    .bind(fetch_type.as_str())
    .bind(community)
    .bind(page)
    .bind(user_key)
    .bind(post_key)
    .bind(cutoff)
    .fetch_optional(pool)
    .await
    .context("Failed to query most recent valid fetch")
}

/// Bulk form: page numbers with a valid fetch for (type, community).
/// Avoids one validity query per candidate page.
pub async fn valid_page_set(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
    cutoff: i64,
) -> Result<HashSet<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r"
        SELECT DISTINCT page FROM fetches
        WHERE fetch_type = ? AND community = ? AND status = 'ok' AND created_at > ?
        ",
    )
    .bind(fetch_type.as_str())
    .bind(community)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("Failed to query valid page set")?;

    Ok(rows.into_iter().map(|(p,)| p).collect())
}

/// Bulk form: user keys with a valid fetch for (type, community).
pub async fn valid_user_key_set(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
    cutoff: i64,
) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT DISTINCT user_key FROM fetches
        WHERE fetch_type = ? AND community = ? AND status = 'ok'
          AND created_at > ? AND user_key != ''
        ",
    )
    .bind(fetch_type.as_str())
    .bind(community)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("Failed to query valid user key set")?;

    Ok(rows.into_iter().map(|(k,)| k).collect())
}

/// Bulk form: post keys with a valid fetch for (type, community).
pub async fn valid_post_key_set(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
    cutoff: i64,
) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT DISTINCT post_key FROM fetches
        WHERE fetch_type = ? AND community = ? AND status = 'ok'
          AND created_at > ? AND post_key != ''
        ",
    )
    .bind(fetch_type.as_str())
    .bind(community)
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("Failed to query valid post key set")?;

    Ok(rows.into_iter().map(|(k,)| k).collect())
}

/// Post keys that have ever been fetched successfully for (type, community),
/// regardless of age. Distinguishes the likes "initial" cutoff from the
/// "refetch" cutoff.
pub async fn ever_fetched_post_key_set(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
) -> Result<HashSet<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT DISTINCT post_key FROM fetches
        WHERE fetch_type = ? AND community = ? AND status = 'ok' AND post_key != ''
        ",
    )
    .bind(fetch_type.as_str())
    .bind(community)
    .fetch_all(pool)
    .await
    .context("Failed to query ever-fetched post key set")?;

    Ok(rows.into_iter().map(|(k,)| k).collect())
}

/// Total page count recorded on the newest valid page-1 record of a type.
/// Zero when no valid page-1 fetch exists.
pub async fn recorded_total_pages(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
    cutoff: i64,
) -> Result<i64> {
    let record = most_recent_valid(pool, fetch_type, community, 1, "", "", cutoff).await?;
    Ok(record.map_or(0, |r| r.total_pages))
}

/// Whether any error record exists for (type, community).
/// Used to skip about-page fetches that already failed.
pub async fn has_error_fetch(
    pool: &SqlitePool,
    fetch_type: FetchType,
    community: &str,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        r"
        SELECT id FROM fetches
        WHERE fetch_type = ? AND community = ? AND status = 'error'
        LIMIT 1
        ",
    )
    .bind(fetch_type.as_str())
    .bind(community)
    .fetch_optional(pool)
    .await
    .context("Failed to query error fetches")?;

    Ok(row.is_some())
}

/// All fetch records ordered for bulk re-extraction: dependency-producing
/// types first, then ledger order.
pub async fn all_fetches_for_replay(pool: &SqlitePool) -> Result<Vec<FetchRecord>> {
    let mut records: Vec<FetchRecord> = sqlx::query_as("SELECT * FROM fetches ORDER BY id")
        .fetch_all(pool)
        .await
        .context("Failed to fetch records for replay")?;

    records.sort_by_key(|r| {
        let rank = r.type_enum().map_or(i64::MAX, |t| t.replay_rank());
        (rank, r.id)
    });

    Ok(records)
}

// ========== Snapshot dedup views ==========

pub(crate) const LATEST_USER_COLUMNS: &str = r"
    id, fetch_id, extracted_at, community, remote_id, name, email,
    first_name, last_name, bio, picture_url, member_role, member_created_at,
    last_active, is_online, points, leaderboard_applied_at, metadata
";

/// Latest snapshot per member natural key (community + remote id).
///
/// Callers never see older snapshots through this view; history stays in the
/// table for explicit queries.
pub async fn latest_users(pool: &SqlitePool, community: &str) -> Result<Vec<UserSnapshot>> {
    let sql = format!(
        r"
        SELECT {LATEST_USER_COLUMNS} FROM (
            SELECT u.*, ROW_NUMBER() OVER (
                PARTITION BY community, remote_id
                ORDER BY extracted_at DESC, id DESC
            ) AS row_rank
            FROM users u
            WHERE community = ?
        )
        WHERE row_rank = 1
        ORDER BY remote_id
        "
    );

    sqlx::query_as(&sql)
        .bind(community)
        .fetch_all(pool)
        .await
        .context("Failed to fetch latest user snapshots")
}

/// Latest snapshot for a single member.
pub async fn latest_user(
    pool: &SqlitePool,
    community: &str,
    remote_id: &str,
) -> Result<Option<UserSnapshot>> {
    sqlx::query_as(
        r"
        SELECT * FROM users
        WHERE community = ? AND remote_id = ?
        ORDER BY extracted_at DESC, id DESC
        LIMIT 1
        ",
    )
    .bind(community)
    .bind(remote_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch latest user snapshot")
}

/// Latest snapshot per post natural key (remote id alone; posts are globally
/// unique on the platform), scoped to one community.
pub async fn latest_posts(pool: &SqlitePool, community: &str) -> Result<Vec<PostSnapshot>> {
    sqlx::query_as(
        r"
        SELECT id, fetch_id, extracted_at, community, remote_id, title, content,
               post_type, author_key, author_name, root_key, group_key, label_key,
               is_toplevel, upvotes, comment_count, created_at_remote, metadata
        FROM (
            SELECT p.*, ROW_NUMBER() OVER (
                PARTITION BY remote_id
                ORDER BY extracted_at DESC, id DESC
            ) AS row_rank
            FROM posts p
            WHERE community = ?
        )
        WHERE row_rank = 1
        ORDER BY created_at_remote DESC
        ",
    )
    .bind(community)
    .fetch_all(pool)
    .await
    .context("Failed to fetch latest post snapshots")
}

/// Latest snapshot for a single post.
pub async fn latest_post(pool: &SqlitePool, remote_id: &str) -> Result<Option<PostSnapshot>> {
    sqlx::query_as(
        r"
        SELECT * FROM posts
        WHERE remote_id = ?
        ORDER BY extracted_at DESC, id DESC
        LIMIT 1
        ",
    )
    .bind(remote_id)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch latest post snapshot")
}

/// Latest profile snapshot per member across all communities.
pub async fn latest_profiles(pool: &SqlitePool) -> Result<Vec<ProfileSnapshot>> {
    sqlx::query_as(
        r"
        SELECT id, fetch_id, extracted_at, community, remote_id, name,
               first_name, last_name, bio, total_posts, total_followers,
               total_following, total_contributions, groups, daily_activities
        FROM (
            SELECT p.*, ROW_NUMBER() OVER (
                PARTITION BY community, remote_id
                ORDER BY extracted_at DESC, id DESC
            ) AS row_rank
            FROM profiles p
        )
        WHERE row_rank = 1
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to fetch latest profile snapshots")
}

/// Standings from the newest leaderboard observation per user, best rank
/// first.
pub async fn latest_leaderboard(
    pool: &SqlitePool,
    community: &str,
) -> Result<Vec<LeaderboardEntry>> {
    sqlx::query_as(
        r"
        SELECT id, fetch_id, extracted_at, community, user_key, user_name, rank, points
        FROM (
            SELECT l.*, ROW_NUMBER() OVER (
                PARTITION BY community, user_key
                ORDER BY extracted_at DESC, id DESC
            ) AS row_rank
            FROM leaderboard l
            WHERE community = ?
        )
        WHERE row_rank = 1
        ORDER BY rank
        ",
    )
    .bind(community)
    .fetch_all(pool)
    .await
    .context("Failed to fetch latest leaderboard standings")
}

/// Voters recorded by the newest likes fetch for a post. Older observations
/// stay in the table but are not merged in; each fetch is a full list.
pub async fn likes_for_post(pool: &SqlitePool, post_key: &str) -> Result<Vec<LikeSnapshot>> {
    sqlx::query_as(
        r"
        SELECT * FROM likes
        WHERE post_key = ?
          AND fetch_id = (
              SELECT fetch_id FROM likes
              WHERE post_key = ?
              ORDER BY extracted_at DESC, id DESC
              LIMIT 1
          )
        ORDER BY id
        ",
    )
    .bind(post_key)
    .bind(post_key)
    .fetch_all(pool)
    .await
    .context("Failed to fetch likes for post")
}

// ========== Discovered communities ==========

/// All discovered communities.
pub async fn list_other_communities(pool: &SqlitePool) -> Result<Vec<OtherCommunity>> {
    sqlx::query_as("SELECT * FROM other_communities ORDER BY slug")
        .fetch_all(pool)
        .await
        .context("Failed to list other communities")
}

/// Get one discovered community by slug.
pub async fn get_other_community(pool: &SqlitePool, slug: &str) -> Result<Option<OtherCommunity>> {
    sqlx::query_as("SELECT * FROM other_communities WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch other community")
}

/// Distinct profile owners listing each discovered community, computed from
/// the latest profile snapshots. The community under analysis is excluded.
pub async fn shared_community_counts(
    pool: &SqlitePool,
    exclude_community: &str,
) -> Result<HashMap<String, i64>> {
    let profiles = latest_profiles(pool).await?;

    let mut owners: HashMap<String, HashSet<String>> = HashMap::new();
    for profile in profiles {
        let Ok(groups) = serde_json::from_str::<serde_json::Value>(&profile.groups) else {
            continue;
        };
        let Some(entries) = groups.as_array() else {
            continue;
        };
        for entry in entries {
            let slug = entry
                .get("name")
                .and_then(|v| v.as_str())
                .or_else(|| entry.get("slug").and_then(|v| v.as_str()))
                .unwrap_or("");
            if slug.is_empty() || slug == exclude_community {
                continue;
            }
            owners
                .entry(slug.to_string())
                .or_default()
                .insert(profile.remote_id.clone());
        }
    }

    Ok(owners
        .into_iter()
        .map(|(slug, ids)| (slug, ids.len() as i64))
        .collect())
}

// ========== Maintenance ==========

/// Clear the ledger and every derived table. Per-table failures are logged
/// and skipped so one missing table does not block the others.
pub async fn reset_all(pool: &SqlitePool) -> Result<()> {
    let tables = [
        "fetches",
        "users",
        "posts",
        "profiles",
        "leaderboard",
        "likes",
        "other_communities",
    ];

    for table in tables {
        let sql = format!("DELETE FROM {table}");
        if let Err(e) = sqlx::query(&sql).execute(pool).await {
            warn!(table, "Reset skipped table: {e}");
        }
    }

    Ok(())
}

/// Delete failed about-page fetches and clear the fetched flag on the
/// matching community rows, so the planner can try them again.
/// Returns the affected slugs.
pub async fn reset_failed_about(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r"
        SELECT DISTINCT community FROM fetches
        WHERE fetch_type = 'community_about' AND status = 'error'
        ",
    )
    .fetch_all(pool)
    .await
    .context("Failed to find failed about fetches")?;

    let slugs: Vec<String> = rows.into_iter().map(|(s,)| s).collect();
    if slugs.is_empty() {
        return Ok(slugs);
    }

    for slug in &slugs {
        sqlx::query("UPDATE other_communities SET about_fetched = 0 WHERE slug = ?")
            .bind(slug)
            .execute(pool)
            .await
            .context("Failed to clear about_fetched flag")?;
    }

    sqlx::query("DELETE FROM fetches WHERE fetch_type = 'community_about' AND status = 'error'")
        .execute(pool)
        .await
        .context("Failed to delete failed about fetches")?;

    Ok(slugs)
}

/// Clear every versioned snapshot table ahead of a bulk re-extraction.
/// The ledger and the community reference rows are kept.
///
/// Takes a connection, not the pool: the clear must land in the same
/// transaction as the replay so readers never observe emptied tables.
pub async fn clear_snapshot_tables(conn: &mut sqlx::SqliteConnection) -> Result<()> {
    for table in ["users", "posts", "profiles", "leaderboard", "likes"] {
        let sql = format!("DELETE FROM {table}");
        if let Err(e) = sqlx::query(&sql).execute(&mut *conn).await {
            warn!(table, "Snapshot clear skipped table: {e}");
        }
    }
    Ok(())
}
