//! Staleness policy: how old a recorded fetch may be before it stops
//! counting as valid, per fetch type, with persisted overrides.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::db::{self, FetchType};

/// Global fallback when neither an override nor a per-type default applies.
pub const DEFAULT_STALE_HOURS: i64 = 24;

pub const DEFAULT_LIKES_INITIAL_CUTOFF_DAYS: i64 = 90;
pub const DEFAULT_LIKES_REFETCH_CUTOFF_DAYS: i64 = 7;
pub const DEFAULT_COMMENTS_MAX_POST_AGE_DAYS: i64 = 30;
pub const DEFAULT_PROFILE_MAX_INACTIVE_DAYS: i64 = 90;
pub const DEFAULT_ABOUT_MIN_SHARED_MEMBERS: i64 = 10;

const SECONDS_PER_HOUR: i64 = 3600;
const SECONDS_PER_DAY: i64 = 86400;

/// Resolved freshness rules for one planning pass.
///
/// Loaded once per pass so every phase sees a consistent view of the
/// settings table.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    stale_hours_overrides: Vec<(FetchType, i64)>,
    pub likes_initial_cutoff_days: i64,
    pub likes_refetch_cutoff_days: i64,
    pub likes_include_comments: bool,
    pub comments_max_post_age_days: i64,
    pub profile_max_inactive_days: i64,
    pub about_min_shared_members: i64,
}

impl StalenessPolicy {
    /// Load the policy from persisted settings, falling back to documented
    /// defaults for anything unset.
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let mut overrides = Vec::new();
        for fetch_type in ALL_FETCH_TYPES {
            let key = format!("stale_hours.{}", fetch_type.as_str());
            if let Some(hours) = setting_i64(pool, &key).await? {
                overrides.push((fetch_type, hours));
            }
        }

        Ok(Self {
            stale_hours_overrides: overrides,
            likes_initial_cutoff_days: setting_i64(pool, "likes.initial_cutoff_days")
                .await?
                .unwrap_or(DEFAULT_LIKES_INITIAL_CUTOFF_DAYS),
            likes_refetch_cutoff_days: setting_i64(pool, "likes.refetch_cutoff_days")
                .await?
                .unwrap_or(DEFAULT_LIKES_REFETCH_CUTOFF_DAYS),
            likes_include_comments: setting_bool(pool, "likes.include_comments")
                .await?
                .unwrap_or(false),
            comments_max_post_age_days: setting_i64(pool, "comments.max_post_age_days")
                .await?
                .unwrap_or(DEFAULT_COMMENTS_MAX_POST_AGE_DAYS),
            profile_max_inactive_days: setting_i64(pool, "profile.max_inactive_days")
                .await?
                .unwrap_or(DEFAULT_PROFILE_MAX_INACTIVE_DAYS),
            about_min_shared_members: setting_i64(pool, "about.min_shared_members")
                .await?
                .unwrap_or(DEFAULT_ABOUT_MIN_SHARED_MEMBERS),
        })
    }

    /// Freshness threshold in hours for a fetch type.
    ///
    /// Resolution order: persisted override, per-type default, global 24h
    /// fallback.
    #[must_use]
    pub fn threshold_hours(&self, fetch_type: FetchType) -> i64 {
        if let Some((_, hours)) = self
            .stale_hours_overrides
            .iter()
            .find(|(t, _)| *t == fetch_type)
        {
            return *hours;
        }
        default_stale_hours(fetch_type)
    }

    /// Ledger cutoff timestamp: fetches at or before this moment no longer
    /// count as valid for the given type.
    #[must_use]
    pub fn validity_cutoff(&self, fetch_type: FetchType, now: i64) -> i64 {
        now - self.threshold_hours(fetch_type) * SECONDS_PER_HOUR
    }

    /// Oldest creation time a post may have and still get its first likes
    /// fetch. Generous: a never-seen but old post is still worth one fetch.
    #[must_use]
    pub fn likes_initial_age_cutoff(&self, now: i64) -> i64 {
        now - self.likes_initial_cutoff_days * SECONDS_PER_DAY
    }

    /// Oldest creation time a post may have and still get its likes
    /// refreshed. Tight: a stale-but-old post is not worth repeated
    /// refetching.
    #[must_use]
    pub fn likes_refetch_age_cutoff(&self, now: i64) -> i64 {
        now - self.likes_refetch_cutoff_days * SECONDS_PER_DAY
    }

    /// Oldest creation time a post may have and still get a comments fetch.
    #[must_use]
    pub fn comments_age_cutoff(&self, now: i64) -> i64 {
        now - self.comments_max_post_age_days * SECONDS_PER_DAY
    }

    /// Oldest last-active time a member may have and still get a profile
    /// fetch.
    #[must_use]
    pub fn profile_activity_cutoff(&self, now: i64) -> i64 {
        now - self.profile_max_inactive_days * SECONDS_PER_DAY
    }
}

const ALL_FETCH_TYPES: [FetchType; 7] = [
    FetchType::Members,
    FetchType::Posts,
    FetchType::Comments,
    FetchType::Likes,
    FetchType::Profile,
    FetchType::Leaderboard,
    FetchType::CommunityAbout,
];

const fn default_stale_hours(fetch_type: FetchType) -> i64 {
    match fetch_type {
        FetchType::Members
        | FetchType::Posts
        | FetchType::Comments
        | FetchType::Likes
        | FetchType::Leaderboard => 24,
        FetchType::Profile => 24 * 7,
        FetchType::CommunityAbout => 24 * 30,
    }
}

async fn setting_i64(pool: &SqlitePool, key: &str) -> Result<Option<i64>> {
    Ok(db::get_setting(pool, key)
        .await?
        .and_then(|v| v.trim().parse::<i64>().ok()))
}

async fn setting_bool(pool: &SqlitePool, key: &str) -> Result<Option<bool>> {
    Ok(db::get_setting(pool, key).await?.map(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    }))
}
