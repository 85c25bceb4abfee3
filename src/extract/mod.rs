//! Extraction pipeline: turns raw fetch payloads into snapshot rows.
//!
//! Extraction is idempotent per fetch record: each pass first deletes the
//! rows that exact record produced earlier, then re-inserts from the raw
//! payload. Snapshots from other records of the same entity are untouched,
//! so history survives re-extraction after a parser fix.

pub mod payload;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::db::{self, FetchRecord, FetchStatus, FetchType, NewFetchRecord};
use payload::{array_at, at, bool_at, epoch_at, i64_at, raw_at, str_at};

/// Rows produced per entity type by one or more extractions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExtractedCounts {
    pub users: i64,
    pub posts: i64,
    pub comments: i64,
    pub likes: i64,
    pub profiles: i64,
    pub leaderboard: i64,
    pub leaderboard_applied: i64,
    pub other_communities: i64,
}

impl ExtractedCounts {
    pub fn merge(&mut self, other: &Self) {
        self.users += other.users;
        self.posts += other.posts;
        self.comments += other.comments;
        self.likes += other.likes;
        self.profiles += other.profiles;
        self.leaderboard += other.leaderboard;
        self.leaderboard_applied += other.leaderboard_applied;
        self.other_communities += other.other_communities;
    }
}

/// The task echo the extension sends back with each result.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    #[serde(rename = "type")]
    pub task_type: String,
    pub community: String,
    // Both naming dialects are accepted: the extension echoes the camelCase
    // task fields, older clients send snake_case.
    #[serde(default, alias = "pageParam")]
    pub page_param: Option<i64>,
    #[serde(default, alias = "userKey")]
    pub user_key: Option<String>,
    #[serde(default, alias = "postKey")]
    pub post_key: Option<String>,
}

/// What the extension got back from the platform.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchOutcome {
    pub ok: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One fetch result as posted by the extension.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResultEnvelope {
    pub task: TaskRef,
    pub result: FetchOutcome,
}

/// Record a fetch result in the ledger, deriving pagination totals from the
/// payload before the insert. Failed fetches are recorded too; they simply
/// never count as valid.
pub async fn record_result(
    pool: &SqlitePool,
    envelope: &FetchResultEnvelope,
    now: i64,
) -> Result<FetchRecord> {
    let fetch_type = FetchType::parse(&envelope.task.task_type)
        .with_context(|| format!("unknown fetch type: {}", envelope.task.task_type))?;

    let data = envelope.result.data.clone().unwrap_or(Value::Null);
    let (total_items, total_pages) = if envelope.result.ok {
        derive_pagination(fetch_type, &data)
    } else {
        (0, 0)
    };

    // Paged types start at page one; a result echo that drops the page
    // number must land on the page the planner asked for, or the ledger
    // entry never satisfies the page-one validity lookup.
    let default_page = match fetch_type {
        FetchType::Members | FetchType::Posts | FetchType::Leaderboard => 1,
        _ => 0,
    };

    let record = NewFetchRecord {
        fetch_type,
        community: envelope.task.community.clone(),
        page: envelope.task.page_param.unwrap_or(default_page),
        user_key: envelope.task.user_key.clone().unwrap_or_default(),
        post_key: envelope.task.post_key.clone().unwrap_or_default(),
        status: if envelope.result.ok {
            FetchStatus::Ok
        } else {
            FetchStatus::Error
        },
        error_message: envelope.result.error.clone().unwrap_or_default(),
        raw_payload: data.to_string(),
        total_items,
        total_pages,
    };

    let id = db::insert_fetch(pool, &record, now).await?;
    let stored = db::get_fetch(pool, id)
        .await?
        .context("Fetch record vanished after insert")?;

    Ok(stored)
}

/// Derive `(total_items, total_pages)` from a payload, per type.
///
/// The platform reports `totalPages` directly only for member lists; post
/// lists paginate at twenty per page, and the leaderboard carries its own
/// limit.
#[must_use]
pub fn derive_pagination(fetch_type: FetchType, data: &Value) -> (i64, i64) {
    let props = at(data, &["pageProps"]);
    match fetch_type {
        FetchType::Members => (i64_at(props, &["total"]), i64_at(props, &["totalPages"])),
        FetchType::Posts => {
            let total = i64_at(props, &["total"]);
            let pages = if total > 0 { (total + 19) / 20 } else { 0 };
            (total, pages)
        }
        FetchType::Leaderboard => {
            let board = leaderboard_node(props);
            let total = array_at(board, &["users"]).len() as i64;
            let limit = match i64_at(board, &["limit"]) {
                0 => 20,
                n => n,
            };
            let pages = if total > 0 { (total + limit - 1) / limit } else { 1 };
            (total, pages)
        }
        FetchType::Comments | FetchType::Likes | FetchType::Profile | FetchType::CommunityAbout => {
            (0, 0)
        }
    }
}

fn leaderboard_node(props: &Value) -> &Value {
    let board = at(props, &["leaderboardsData"]);
    if board.is_null() {
        at(props, &["renderData", "leaderboard"])
    } else {
        board
    }
}

/// Extract snapshot rows from one fetch record.
///
/// Dispatches on the record's type with a total match; error records and
/// unparseable payloads contribute zero rows without failing.
pub async fn extract_record(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    now: i64,
) -> Result<ExtractedCounts> {
    let mut counts = ExtractedCounts::default();

    if !record.is_ok() {
        return Ok(counts);
    }
    let Some(fetch_type) = record.type_enum() else {
        warn!(fetch_id = record.id, fetch_type = %record.fetch_type, "Skipping unknown fetch type");
        return Ok(counts);
    };

    let data: Value = serde_json::from_str(&record.raw_payload).unwrap_or(Value::Null);

    match fetch_type {
        FetchType::Members => counts.users = extract_members(conn, record, &data, now).await?,
        FetchType::Posts => counts.posts = extract_posts(conn, record, &data, now).await?,
        FetchType::Comments => counts.comments = extract_comments(conn, record, &data, now).await?,
        FetchType::Likes => counts.likes = extract_likes(conn, record, &data, now).await?,
        FetchType::Profile => {
            let (profiles, communities) = extract_profile(conn, record, &data, now).await?;
            counts.profiles = profiles;
            counts.other_communities = communities;
        }
        FetchType::Leaderboard => {
            counts.leaderboard = extract_leaderboard(conn, record, &data, now).await?;
            // The apply step is part of every leaderboard extraction, not a
            // separate maintenance call.
            counts.leaderboard_applied = apply_leaderboard(conn, &record.community, now).await?;
        }
        FetchType::CommunityAbout => {
            extract_community_about(conn, record, &data, now).await?;
        }
    }

    Ok(counts)
}

// ========== Per-type extraction ==========

async fn extract_members(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<i64> {
    sqlx::query("DELETE FROM users WHERE fetch_id = ?")
        .bind(record.id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear previous user rows for fetch")?;

    let mut count = 0;
    for user in array_at(data, &["pageProps", "users"]) {
        let remote_id = str_at(user, &["id"]);
        if remote_id.is_empty() {
            continue;
        }

        // Activity and presence live in the nested metadata blob, not on the
        // user object itself.
        let mut last_active = epoch_at(user, &["metadata", "lastActive"]);
        if last_active == 0 {
            last_active = epoch_at(user, &["metadata", "lastOffline"]);
        }
        let picture = match str_at(user, &["metadata", "pictureProfile"]) {
            p if p.is_empty() => str_at(user, &["metadata", "picture"]),
            p => p,
        };

        sqlx::query(
            r"
            INSERT INTO users
                (fetch_id, extracted_at, community, remote_id, name, email,
                 first_name, last_name, bio, picture_url, member_role,
                 member_created_at, last_active, is_online, metadata)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(record.id)
        .bind(now)
        .bind(&record.community)
        .bind(&remote_id)
        .bind(str_at(user, &["name"]))
        .bind(str_at(user, &["email"]))
        .bind(str_at(user, &["firstName"]))
        .bind(str_at(user, &["lastName"]))
        .bind(str_at(user, &["metadata", "bio"]))
        .bind(picture)
        .bind(str_at(user, &["member", "role"]))
        .bind(epoch_at(user, &["member", "createdAt"]))
        .bind(last_active)
        .bind(bool_at(user, &["metadata", "online"]))
        .bind(raw_at(user, &["metadata"]))
        .execute(&mut *conn)
        .await
        .context("Failed to insert user snapshot")?;

        count += 1;
    }

    Ok(count)
}

/// Shared insert for both post dialects.
async fn insert_post_row(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    post: &Value,
    is_toplevel: bool,
    now: i64,
) -> Result<bool> {
    let remote_id = str_at(post, &["id"]);
    if remote_id.is_empty() {
        return Ok(false);
    }

    sqlx::query(
        r"
        INSERT INTO posts
            (fetch_id, extracted_at, community, remote_id, title, content,
             post_type, author_key, author_name, root_key, group_key,
             label_key, is_toplevel, upvotes, comment_count,
             created_at_remote, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(record.id)
    .bind(now)
    .bind(&record.community)
    .bind(&remote_id)
    .bind(str_at(post, &["metadata", "title"]))
    .bind(str_at(post, &["metadata", "content"]))
    .bind(str_at(post, &["postType"]))
    .bind(str_at(post, &["userId"]))
    .bind(str_at(post, &["user", "name"]))
    .bind(str_at(post, &["rootId"]))
    .bind(str_at(post, &["groupId"]))
    .bind(str_at(post, &["labelId"]))
    .bind(is_toplevel)
    .bind(i64_at(post, &["metadata", "upvotes"]))
    .bind(i64_at(post, &["metadata", "comments"]))
    .bind(epoch_at(post, &["createdAt"]))
    .bind(raw_at(post, &["metadata"]))
    .execute(&mut *conn)
    .await
    .context("Failed to insert post snapshot")?;

    Ok(true)
}

async fn extract_posts(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<i64> {
    sqlx::query("DELETE FROM posts WHERE fetch_id = ?")
        .bind(record.id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear previous post rows for fetch")?;

    let mut count = 0;
    for tree in array_at(data, &["pageProps", "postTrees"]) {
        let post = at(tree, &["post"]);
        let remote_id = str_at(post, &["id"]);
        let root = str_at(post, &["rootId"]);
        // An empty or self-referential root marks a top-level post.
        let is_toplevel = root.is_empty() || root == remote_id;
        if insert_post_row(conn, record, post, is_toplevel, now).await? {
            count += 1;
        }
    }

    Ok(count)
}

async fn extract_comments(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<i64> {
    sqlx::query("DELETE FROM posts WHERE fetch_id = ?")
        .bind(record.id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear previous comment rows for fetch")?;

    // The API dialect nests replies arbitrarily deep; every node is stored
    // as a non-toplevel post snapshot.
    let mut nodes: Vec<&Value> = Vec::new();
    let roots = array_at(data, &["posts"]);
    if roots.is_empty() {
        nodes.extend(array_at(data, &["pageProps", "postTree", "children"]));
    } else {
        nodes.extend(roots);
    }

    let mut count = 0;
    while let Some(node) = nodes.pop() {
        let post = if node.get("post").is_some() {
            at(node, &["post"])
        } else {
            node
        };
        if insert_post_row(conn, record, post, false, now).await? {
            count += 1;
        }
        nodes.extend(array_at(node, &["children"]));
        nodes.extend(array_at(node, &["comments"]));
    }

    Ok(count)
}

async fn extract_likes(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<i64> {
    sqlx::query("DELETE FROM likes WHERE fetch_id = ?")
        .bind(record.id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear previous like rows for fetch")?;

    let mut voters = array_at(data, &["users"]);
    if voters.is_empty() {
        voters = array_at(data, &["pageProps", "users"]);
    }

    let mut count = 0;
    for voter in voters {
        let user = if voter.get("user").is_some() {
            at(voter, &["user"])
        } else {
            voter
        };
        let user_key = str_at(user, &["id"]);
        if user_key.is_empty() {
            continue;
        }

        sqlx::query(
            r"
            INSERT INTO likes
                (fetch_id, extracted_at, community, post_key, user_key,
                 user_name, user_first_name, user_last_name)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(record.id)
        .bind(now)
        .bind(&record.community)
        .bind(&record.post_key)
        .bind(&user_key)
        .bind(str_at(user, &["name"]))
        .bind(str_at(user, &["firstName"]))
        .bind(str_at(user, &["lastName"]))
        .execute(&mut *conn)
        .await
        .context("Failed to insert like snapshot")?;

        count += 1;
    }

    Ok(count)
}

async fn extract_profile(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<(i64, i64)> {
    sqlx::query("DELETE FROM profiles WHERE fetch_id = ?")
        .bind(record.id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear previous profile rows for fetch")?;

    let user = at(data, &["pageProps", "user"]);
    let remote_id = str_at(user, &["id"]);
    if remote_id.is_empty() {
        // No identifiable subject: a profile payload yields at most one row.
        return Ok((0, 0));
    }

    sqlx::query(
        r"
        INSERT INTO profiles
            (fetch_id, extracted_at, community, remote_id, name, first_name,
             last_name, bio, total_posts, total_followers, total_following,
             total_contributions, groups, daily_activities)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(record.id)
    .bind(now)
    .bind(&record.community)
    .bind(&remote_id)
    .bind(str_at(user, &["name"]))
    .bind(str_at(user, &["firstName"]))
    .bind(str_at(user, &["lastName"]))
    .bind(str_at(user, &["metadata", "bio"]))
    .bind(i64_at(user, &["metadata", "totalPosts"]))
    .bind(i64_at(user, &["metadata", "totalFollowers"]))
    .bind(i64_at(user, &["metadata", "totalFollowing"]))
    .bind(i64_at(user, &["metadata", "totalContributions"]))
    .bind(raw_at(user, &["groups"]))
    .bind(raw_at(data, &["pageProps", "dailyActivities"]))
    .execute(&mut *conn)
    .await
    .context("Failed to insert profile snapshot")?;

    // Side pass: register communities this member belongs to that we have
    // not seen yet, excluding the one under analysis.
    let mut discovered = 0;
    for group in array_at(user, &["groups"]) {
        let slug = match str_at(group, &["name"]) {
            s if s.is_empty() => str_at(group, &["slug"]),
            s => s,
        };
        if slug.is_empty() || slug == record.community {
            continue;
        }
        let display_name = str_at(group, &["metadata", "displayName"]);

        let result = sqlx::query(
            r"
            INSERT INTO other_communities (slug, display_name, first_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(slug) DO NOTHING
            ",
        )
        .bind(&slug)
        .bind(&display_name)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("Failed to register discovered community")?;

        discovered += result.rows_affected() as i64;
    }

    Ok((1, discovered))
}

async fn extract_leaderboard(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<i64> {
    sqlx::query("DELETE FROM leaderboard WHERE fetch_id = ?")
        .bind(record.id)
        .execute(&mut *conn)
        .await
        .context("Failed to clear previous leaderboard rows for fetch")?;

    let board = leaderboard_node(at(data, &["pageProps"]));

    let mut count = 0;
    for (index, entry) in array_at(board, &["users"]).iter().enumerate() {
        let user = if entry.get("user").is_some() {
            at(entry, &["user"])
        } else {
            entry
        };
        let user_key = str_at(user, &["id"]);
        if user_key.is_empty() {
            continue;
        }

        let rank = match i64_at(entry, &["position"]) {
            0 => index as i64 + 1,
            r => r,
        };

        sqlx::query(
            r"
            INSERT INTO leaderboard
                (fetch_id, extracted_at, community, user_key, user_name, rank, points)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(record.id)
        .bind(now)
        .bind(&record.community)
        .bind(&user_key)
        .bind(str_at(user, &["name"]))
        .bind(rank)
        .bind(i64_at(entry, &["points"]))
        .execute(&mut *conn)
        .await
        .context("Failed to insert leaderboard entry")?;

        count += 1;
    }

    Ok(count)
}

/// Copy each member's most recent leaderboard points onto their current
/// snapshot row, scoped to one community. Only members with at least one
/// leaderboard entry are touched. Returns the number of rows updated.
pub async fn apply_leaderboard(
    conn: &mut SqliteConnection,
    community: &str,
    now: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r"
        UPDATE users SET
            points = (
                SELECT le.points FROM leaderboard le
                WHERE le.community = users.community AND le.user_key = users.remote_id
                ORDER BY le.extracted_at DESC, le.id DESC
                LIMIT 1
            ),
            leaderboard_applied_at = ?
        WHERE community = ?
          AND id IN (
              SELECT id FROM (
                  SELECT id, ROW_NUMBER() OVER (
                      PARTITION BY community, remote_id
                      ORDER BY extracted_at DESC, id DESC
                  ) AS row_rank
                  FROM users WHERE community = ?
              ) WHERE row_rank = 1
          )
          AND EXISTS (
              SELECT 1 FROM leaderboard le
              WHERE le.community = users.community AND le.user_key = users.remote_id
          )
        ",
    )
    .bind(now)
    .bind(community)
    .bind(community)
    .execute(&mut *conn)
    .await
    .context("Failed to apply leaderboard points")?;

    Ok(result.rows_affected() as i64)
}

async fn extract_community_about(
    conn: &mut SqliteConnection,
    record: &FetchRecord,
    data: &Value,
    now: i64,
) -> Result<()> {
    // Reference row, mutated in place rather than versioned: the about page
    // describes the community itself, not an observation of a member.
    let display_name = match str_at(data, &["pageProps", "group", "metadata", "displayName"]) {
        s if s.is_empty() => str_at(data, &["pageProps", "currentGroup", "metadata", "displayName"]),
        s => s,
    };

    sqlx::query(
        r"
        INSERT INTO other_communities (slug, display_name, about_fetched, about_payload, first_seen_at)
        VALUES (?, ?, 1, ?, ?)
        ON CONFLICT(slug) DO UPDATE SET
            about_fetched = 1,
            about_payload = excluded.about_payload,
            display_name = CASE
                WHEN excluded.display_name != '' THEN excluded.display_name
                ELSE other_communities.display_name
            END
        ",
    )
    .bind(&record.community)
    .bind(&display_name)
    .bind(&record.raw_payload)
    .bind(now)
    .execute(&mut *conn)
    .await
    .context("Failed to update community about data")?;

    Ok(())
}

// ========== Bulk re-extraction ==========

/// Result of a bulk replay.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ReplaySummary {
    pub processed: i64,
    pub failed: i64,
    pub counts: ExtractedCounts,
}

/// Replay every stored fetch record through extraction after clearing the
/// versioned snapshot tables.
///
/// Clear and replay share one transaction, so a concurrent reader sees
/// either the old snapshots or the fully rebuilt ones, never an emptied or
/// half-replayed state. A failing record logs and contributes zero rows
/// without aborting the rest of the batch.
pub async fn reextract_everything(pool: &SqlitePool, now: i64) -> Result<ReplaySummary> {
    let records = db::all_fetches_for_replay(pool).await?;

    let mut tx = pool.begin().await.context("Failed to begin replay batch")?;
    db::clear_snapshot_tables(&mut *tx).await?;
    let mut counts = ExtractedCounts::default();
    let mut processed = 0;
    let mut failed = 0;

    for record in &records {
        match extract_record(&mut *tx, record, now).await {
            Ok(c) => {
                counts.merge(&c);
                processed += 1;
            }
            Err(e) => {
                failed += 1;
                warn!(fetch_id = record.id, fetch_type = %record.fetch_type, "Replay extraction failed: {e:#}");
            }
        }
    }

    tx.commit().await.context("Failed to commit replay batch")?;
    debug!(processed, failed, "Bulk re-extraction complete");

    Ok(ReplaySummary {
        processed,
        failed,
        counts,
    })
}
