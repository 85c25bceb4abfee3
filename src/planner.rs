//! Phased fetch task generation.
//!
//! The planner is a pure, re-entrant function over the fetch ledger and the
//! current snapshots: calling it twice with no new data yields the same plan.
//! Phases run in strict dependency order and the first non-empty phase wins,
//! because later phases consume data (page counts, member lists, post lists)
//! that outstanding earlier tasks would still be filling in.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::{self, FetchType};
use crate::policy::StalenessPolicy;

/// One fetch the extension should perform next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: FetchType,
    pub community: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_param: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    /// URL slug of the member, needed alongside the hex id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_display_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_key: Option<String>,
    /// URL slug of the post.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_display_key: Option<String>,
    /// Platform UUID of the community, needed for the low-level API.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    /// Why the planner generated this task. Observability only.
    pub reason: String,
}

impl FetchTask {
    fn new(task_type: FetchType, community: &str, suffix: &str, reason: String) -> Self {
        let id = if suffix.is_empty() {
            format!("{}_{community}", task_type.as_str())
        } else {
            format!("{}_{community}_{suffix}", task_type.as_str())
        };
        Self {
            id,
            task_type,
            community: community.to_string(),
            page_param: None,
            user_key: None,
            user_display_key: None,
            post_key: None,
            post_display_key: None,
            group_key: None,
            reason,
        }
    }
}

/// The output of one planning pass.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPlan {
    pub tasks: Vec<FetchTask>,
    pub generated_at: i64,
    /// Which phase produced the tasks (empty plan reports "idle").
    pub phase: &'static str,
}

impl FetchPlan {
    fn empty(now: i64) -> Self {
        Self {
            tasks: Vec::new(),
            generated_at: now,
            phase: "idle",
        }
    }

    fn from_phase(tasks: Vec<FetchTask>, now: i64, phase: &'static str) -> Self {
        Self {
            tasks,
            generated_at: now,
            phase,
        }
    }
}

/// Types whose page-1 fetch gates everything else.
const PRIMARY_TYPES: [FetchType; 3] = [FetchType::Members, FetchType::Posts, FetchType::Leaderboard];

/// Generate the next batch of fetch tasks.
///
/// Read-only; emitted tasks are recommendations and are not reserved. `now`
/// is injected so freshness decisions are reproducible in tests.
pub async fn generate_plan(pool: &SqlitePool, now: i64) -> Result<FetchPlan> {
    // Phase 0: nothing to plan without a selected community.
    let Some(community) = db::current_community(pool).await? else {
        return Ok(FetchPlan::empty(now));
    };

    let policy = StalenessPolicy::load(pool).await?;

    let tasks = phase_initial_pages(pool, &policy, &community, now).await?;
    if !tasks.is_empty() {
        return Ok(FetchPlan::from_phase(tasks, now, "primary"));
    }

    let tasks = phase_pagination(pool, &policy, &community, now).await?;
    if !tasks.is_empty() {
        return Ok(FetchPlan::from_phase(tasks, now, "pagination"));
    }

    let tasks = phase_dependent(pool, &policy, &community, now).await?;
    if !tasks.is_empty() {
        return Ok(FetchPlan::from_phase(tasks, now, "secondary"));
    }

    let tasks = phase_about_pages(pool, &policy, &community, now).await?;
    if !tasks.is_empty() {
        return Ok(FetchPlan::from_phase(tasks, now, "tertiary"));
    }

    Ok(FetchPlan::empty(now))
}

/// Phase 1a: page 1 of each primary type must exist before anything else.
async fn phase_initial_pages(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let mut tasks = Vec::new();

    for fetch_type in PRIMARY_TYPES {
        let cutoff = policy.validity_cutoff(fetch_type, now);
        let existing = db::most_recent_valid(pool, fetch_type, community, 1, "", "", cutoff).await?;
        if existing.is_none() {
            let mut task = FetchTask::new(
                fetch_type,
                community,
                "page_1",
                format!("no valid {} page 1 fetch", fetch_type.as_str()),
            );
            task.page_param = Some(1);
            tasks.push(task);
        }
    }

    Ok(tasks)
}

/// Phase 1b: remaining pages, using the page count the page-1 record carries.
async fn phase_pagination(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let mut tasks = Vec::new();

    for fetch_type in PRIMARY_TYPES {
        let cutoff = policy.validity_cutoff(fetch_type, now);
        let total_pages = db::recorded_total_pages(pool, fetch_type, community, cutoff).await?;
        if total_pages <= 1 {
            continue;
        }

        let valid_pages = db::valid_page_set(pool, fetch_type, community, cutoff).await?;
        for page in 2..=total_pages {
            if valid_pages.contains(&page) {
                continue;
            }
            let mut task = FetchTask::new(
                fetch_type,
                community,
                &format!("page_{page}"),
                format!(
                    "{} page {page} of {total_pages} missing or stale",
                    fetch_type.as_str()
                ),
            );
            task.page_param = Some(page);
            tasks.push(task);
        }
    }

    Ok(tasks)
}

/// Phase 2: fetches that depend on the member and post lists being complete.
async fn phase_dependent(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let mut tasks = Vec::new();

    tasks.extend(profile_tasks(pool, policy, community, now).await?);
    tasks.extend(comment_tasks(pool, policy, community, now).await?);
    tasks.extend(likes_tasks(pool, policy, community, now).await?);

    Ok(tasks)
}

/// One profile task per recently-active member without a valid profile fetch.
async fn profile_tasks(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let cutoff = policy.validity_cutoff(FetchType::Profile, now);
    let valid = db::valid_user_key_set(pool, FetchType::Profile, community, cutoff).await?;
    let activity_cutoff = policy.profile_activity_cutoff(now);

    let mut tasks = Vec::new();
    for user in db::latest_users(pool, community).await? {
        if user.last_active < activity_cutoff {
            continue;
        }
        if valid.contains(&user.remote_id) {
            continue;
        }
        let mut task = FetchTask::new(
            FetchType::Profile,
            community,
            &user.remote_id,
            format!("member {} has no valid profile fetch", user.name),
        );
        task.user_key = Some(user.remote_id);
        task.user_display_key = Some(user.name);
        tasks.push(task);
    }

    Ok(tasks)
}

/// One comments task per commented, recent post without a valid fetch.
async fn comment_tasks(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let cutoff = policy.validity_cutoff(FetchType::Comments, now);
    let valid = db::valid_post_key_set(pool, FetchType::Comments, community, cutoff).await?;
    let age_cutoff = policy.comments_age_cutoff(now);

    let mut tasks = Vec::new();
    for post in db::latest_posts(pool, community).await? {
        if post.comment_count <= 0 {
            continue;
        }
        if post.created_at_remote < age_cutoff {
            continue;
        }
        if valid.contains(&post.remote_id) {
            continue;
        }
        let mut task = FetchTask::new(
            FetchType::Comments,
            community,
            &post.remote_id,
            format!("post has {} comments, none fetched", post.comment_count),
        );
        task.post_key = Some(post.remote_id);
        task.post_display_key = Some(post.title);
        task.group_key = non_empty(post.group_key);
        tasks.push(task);
    }

    Ok(tasks)
}

/// One likes task per upvoted post, applying the initial/refetch asymmetry:
/// a never-fetched post uses the generous initial age cutoff, a previously
/// fetched one the tight refetch cutoff.
async fn likes_tasks(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let cutoff = policy.validity_cutoff(FetchType::Likes, now);
    let valid = db::valid_post_key_set(pool, FetchType::Likes, community, cutoff).await?;
    let ever_fetched = db::ever_fetched_post_key_set(pool, FetchType::Likes, community).await?;
    let initial_cutoff = policy.likes_initial_age_cutoff(now);
    let refetch_cutoff = policy.likes_refetch_age_cutoff(now);

    let mut tasks = Vec::new();
    for post in db::latest_posts(pool, community).await? {
        if post.upvotes <= 0 {
            continue;
        }
        if !post.is_toplevel && !policy.likes_include_comments {
            continue;
        }
        if valid.contains(&post.remote_id) {
            continue;
        }

        let (age_cutoff, reason) = if ever_fetched.contains(&post.remote_id) {
            (refetch_cutoff, "likes stale, post recent enough to refetch")
        } else {
            (initial_cutoff, "likes never fetched for this post")
        };
        if post.created_at_remote < age_cutoff {
            continue;
        }

        let mut task = FetchTask::new(
            FetchType::Likes,
            community,
            &format!("post_{}", post.remote_id),
            reason.to_string(),
        );
        task.post_key = Some(post.remote_id);
        task.post_display_key = Some(post.title);
        task.group_key = non_empty(post.group_key);
        tasks.push(task);
    }

    Ok(tasks)
}

/// Phase 3: about pages for discovered communities with enough shared
/// members, skipping any that already failed.
async fn phase_about_pages(
    pool: &SqlitePool,
    policy: &StalenessPolicy,
    community: &str,
    now: i64,
) -> Result<Vec<FetchTask>> {
    let shared = db::shared_community_counts(pool, community).await?;
    let cutoff = policy.validity_cutoff(FetchType::CommunityAbout, now);

    let mut tasks = Vec::new();
    for other in db::list_other_communities(pool).await? {
        let count = shared.get(&other.slug).copied().unwrap_or(0);
        if count < policy.about_min_shared_members {
            continue;
        }
        if other.about_fetched {
            continue;
        }
        if db::most_recent_valid(pool, FetchType::CommunityAbout, &other.slug, 0, "", "", cutoff)
            .await?
            .is_some()
        {
            continue;
        }
        if db::has_error_fetch(pool, FetchType::CommunityAbout, &other.slug).await? {
            continue;
        }
        tasks.push(FetchTask::new(
            FetchType::CommunityAbout,
            &other.slug,
            "",
            format!("{count} shared members, about page unknown"),
        ));
    }

    Ok(tasks)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}
