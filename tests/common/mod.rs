//! Shared helpers for integration tests: database setup, payload builders,
//! and an ingest shortcut that records a fetch result and extracts it.

#![allow(dead_code)]

use serde_json::{json, Value};
use tempfile::TempDir;

use skool_insight::db::{self, Database, FetchRecord, FetchType};
use skool_insight::extract::{self, ExtractedCounts, FetchOutcome, FetchResultEnvelope, TaskRef};

/// Fixed "now" so freshness decisions are reproducible.
pub const NOW: i64 = 1_750_000_000;
pub const DAY: i64 = 86400;
pub const HOUR: i64 = 3600;

pub const COMMUNITY: &str = "rust-learners";

pub async fn setup_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.sqlite");
    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");
    (db, temp_dir)
}

/// Database with the test community selected.
pub async fn setup_community() -> (Database, TempDir) {
    let (db, temp_dir) = setup_db().await;
    db::set_setting(db.pool(), "current_community", COMMUNITY)
        .await
        .expect("Failed to select community");
    (db, temp_dir)
}

pub fn envelope(fetch_type: FetchType, community: &str, data: Value) -> FetchResultEnvelope {
    FetchResultEnvelope {
        task: TaskRef {
            task_type: fetch_type.as_str().to_string(),
            community: community.to_string(),
            page_param: None,
            user_key: None,
            post_key: None,
        },
        result: FetchOutcome {
            ok: true,
            data: Some(data),
            error: None,
        },
    }
}

pub fn failed_envelope(fetch_type: FetchType, community: &str, error: &str) -> FetchResultEnvelope {
    FetchResultEnvelope {
        task: TaskRef {
            task_type: fetch_type.as_str().to_string(),
            community: community.to_string(),
            page_param: None,
            user_key: None,
            post_key: None,
        },
        result: FetchOutcome {
            ok: false,
            data: None,
            error: Some(error.to_string()),
        },
    }
}

/// Record a fetch result and run extraction on it, like the results endpoint.
pub async fn ingest(
    db: &Database,
    env: &FetchResultEnvelope,
    now: i64,
) -> (FetchRecord, ExtractedCounts) {
    let record = extract::record_result(db.pool(), env, now)
        .await
        .expect("Failed to record fetch result");
    let mut conn = db
        .pool()
        .acquire()
        .await
        .expect("Failed to acquire connection");
    let counts = extract::extract_record(&mut conn, &record, now)
        .await
        .expect("Extraction failed");
    (record, counts)
}

// ========== Payload builders ==========

/// One member as the member-list page renders it. Tests tweak fields by
/// indexing into the returned value.
pub fn member(id: &str, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "email": format!("{name}@example.com"),
        "firstName": "",
        "lastName": "",
        "metadata": {
            "bio": "",
            "online": false,
            "lastActive": NOW - HOUR,
        },
        "member": {
            "role": "member",
            "createdAt": NOW - 30 * DAY,
        },
    })
}

pub fn members_payload(users: Vec<Value>, total_pages: i64) -> Value {
    let total = users.len();
    json!({
        "pageProps": {
            "users": users,
            "total": total,
            "totalPages": total_pages,
        }
    })
}

pub fn post_tree(id: &str, title: &str, upvotes: i64, comments: i64, created_at: i64) -> Value {
    json!({
        "post": {
            "id": id,
            "name": id,
            "metadata": {
                "title": title,
                "content": "body",
                "upvotes": upvotes,
                "comments": comments,
            },
            "postType": "generic",
            "groupId": "grp-1",
            "userId": "author-1",
            "labelId": "",
            "rootId": "",
            "createdAt": created_at,
            "user": {"id": "author-1", "name": "Author"},
        }
    })
}

pub fn posts_payload(trees: Vec<Value>, total: i64) -> Value {
    json!({
        "pageProps": {
            "postTrees": trees,
            "total": total,
        }
    })
}

pub fn leaderboard_payload(entries: &[(&str, &str, i64)]) -> Value {
    let users: Vec<Value> = entries
        .iter()
        .enumerate()
        .map(|(i, (id, name, points))| {
            json!({
                "user": {"id": id, "name": name},
                "points": points,
                "position": i + 1,
            })
        })
        .collect();
    json!({
        "pageProps": {
            "leaderboardsData": {"limit": 20, "users": users}
        }
    })
}

pub fn profile_payload(id: &str, name: &str, groups: &[(&str, &str)]) -> Value {
    let groups: Vec<Value> = groups
        .iter()
        .map(|(slug, display)| {
            json!({"name": slug, "metadata": {"displayName": display}})
        })
        .collect();
    json!({
        "pageProps": {
            "user": {
                "id": id,
                "name": name,
                "firstName": "",
                "lastName": "",
                "metadata": {"bio": "", "totalPosts": 3},
                "groups": groups,
            },
            "dailyActivities": [],
        }
    })
}

pub fn likes_payload(voters: &[(&str, &str)]) -> Value {
    let users: Vec<Value> = voters
        .iter()
        .map(|(id, name)| json!({"id": id, "name": name, "firstName": "", "lastName": ""}))
        .collect();
    json!({"users": users})
}

pub fn about_payload(display_name: &str) -> Value {
    json!({
        "pageProps": {
            "group": {
                "name": "slug-only",
                "metadata": {"displayName": display_name},
            }
        }
    })
}

/// Raw row count of a table, for asserting deletion scoping.
pub async fn count_rows(db: &Database, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table}");
    let (count,): (i64,) = sqlx::query_as(&sql)
        .fetch_one(db.pool())
        .await
        .expect("Failed to count rows");
    count
}
