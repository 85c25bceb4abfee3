use serde::{Deserialize, Serialize};

/// Kind of remote data a fetch task asks the extension for.
///
/// Every per-type decision (planning, pagination derivation, extraction)
/// dispatches on this enum with a total `match`, so adding a type is a
/// compile-time decision rather than a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchType {
    Members,
    Posts,
    Comments,
    Likes,
    Profile,
    Leaderboard,
    CommunityAbout,
}

impl FetchType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Members => "members",
            Self::Posts => "posts",
            Self::Comments => "comments",
            Self::Likes => "likes",
            Self::Profile => "profile",
            Self::Leaderboard => "leaderboard",
            Self::CommunityAbout => "community_about",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "members" => Some(Self::Members),
            "posts" => Some(Self::Posts),
            "comments" => Some(Self::Comments),
            "likes" => Some(Self::Likes),
            "profile" => Some(Self::Profile),
            "leaderboard" => Some(Self::Leaderboard),
            "community_about" => Some(Self::CommunityAbout),
            _ => None,
        }
    }

    /// Replay order for bulk re-extraction: types whose output later types
    /// depend on come first.
    #[must_use]
    pub const fn replay_rank(&self) -> i64 {
        match self {
            Self::Members => 1,
            Self::Posts => 2,
            Self::Comments => 3,
            Self::Profile => 4,
            Self::Leaderboard => 5,
            Self::CommunityAbout => 6,
            Self::Likes => 7,
        }
    }
}

/// Outcome recorded for a fetch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Ok,
    Error,
}

impl FetchStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// One remote call made by the extension, successful or not.
///
/// Rows are append-only: never updated, deleted only by explicit maintenance
/// resets. Discriminators (`page`, `user_key`, `post_key`) default to
/// `0`/empty rather than NULL so validity lookups stay plain equality.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FetchRecord {
    pub id: i64,
    pub fetch_type: String,
    pub community: String,
    pub page: i64,
    pub user_key: String,
    pub post_key: String,
    pub status: String,
    pub error_message: String,
    pub raw_payload: String,
    pub total_items: i64,
    pub total_pages: i64,
    pub created_at: i64,
}

impl FetchRecord {
    #[must_use]
    pub fn type_enum(&self) -> Option<FetchType> {
        FetchType::parse(&self.fetch_type)
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok.as_str()
    }
}

/// Data for appending a fetch record to the ledger.
#[derive(Debug, Clone)]
pub struct NewFetchRecord {
    pub fetch_type: FetchType,
    pub community: String,
    pub page: i64,
    pub user_key: String,
    pub post_key: String,
    pub status: FetchStatus,
    pub error_message: String,
    pub raw_payload: String,
    pub total_items: i64,
    pub total_pages: i64,
}

/// One observation of a community member, tied to the fetch that produced it.
///
/// `points` and `leaderboard_applied_at` are the only mutable fields: the
/// leaderboard apply step stamps them onto the newest snapshot per member.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSnapshot {
    pub id: i64,
    pub fetch_id: i64,
    pub extracted_at: i64,
    pub community: String,
    pub remote_id: String,
    pub name: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub bio: String,
    pub picture_url: String,
    pub member_role: String,
    pub member_created_at: i64,
    pub last_active: i64,
    pub is_online: bool,
    pub points: i64,
    pub leaderboard_applied_at: i64,
    pub metadata: String,
}

/// One observation of a post or comment.
///
/// Posts are globally unique on the platform, so the natural key is
/// `remote_id` alone (no community prefix).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PostSnapshot {
    pub id: i64,
    pub fetch_id: i64,
    pub extracted_at: i64,
    pub community: String,
    pub remote_id: String,
    pub title: String,
    pub content: String,
    pub post_type: String,
    pub author_key: String,
    pub author_name: String,
    pub root_key: String,
    pub group_key: String,
    pub label_key: String,
    pub is_toplevel: bool,
    pub upvotes: i64,
    pub comment_count: i64,
    pub created_at_remote: i64,
    pub metadata: String,
}

/// One observation of a member's full profile page.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProfileSnapshot {
    pub id: i64,
    pub fetch_id: i64,
    pub extracted_at: i64,
    pub community: String,
    pub remote_id: String,
    pub name: String,
    pub first_name: String,
    pub last_name: String,
    pub bio: String,
    pub total_posts: i64,
    pub total_followers: i64,
    pub total_following: i64,
    pub total_contributions: i64,
    pub groups: String,
    pub daily_activities: String,
}

/// One leaderboard standing observed for a user in a community.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub id: i64,
    pub fetch_id: i64,
    pub extracted_at: i64,
    pub community: String,
    pub user_key: String,
    pub user_name: String,
    pub rank: i64,
    pub points: i64,
}

/// One observed like: a user upvoting a post.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LikeSnapshot {
    pub id: i64,
    pub fetch_id: i64,
    pub extracted_at: i64,
    pub community: String,
    pub post_key: String,
    pub user_key: String,
    pub user_name: String,
    pub user_first_name: String,
    pub user_last_name: String,
}

/// A community discovered through a member's group memberships.
///
/// Reference row, not a snapshot: keyed by slug, mutated in place when its
/// about page is fetched. The shared-member count is computed on demand from
/// profile snapshots, never stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OtherCommunity {
    pub id: i64,
    pub slug: String,
    pub display_name: String,
    pub about_fetched: bool,
    pub about_payload: String,
    pub first_seen_at: i64,
}
