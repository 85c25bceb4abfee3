//! Integration tests for settings and maintenance operations.

mod common;

use common::{
    count_rows, envelope, failed_envelope, ingest, member, members_payload, profile_payload,
    setup_community, COMMUNITY, HOUR, NOW,
};
use skool_insight::db::{self, FetchType};

#[tokio::test]
async fn settings_roundtrip() {
    let (db, _temp_dir) = setup_community().await;

    assert_eq!(
        db::get_setting(db.pool(), "stale_hours.members").await.unwrap(),
        None
    );

    db::set_setting(db.pool(), "stale_hours.members", "6")
        .await
        .unwrap();
    assert_eq!(
        db::get_setting(db.pool(), "stale_hours.members")
            .await
            .unwrap()
            .as_deref(),
        Some("6")
    );

    // Overwrite, not append.
    db::set_setting(db.pool(), "stale_hours.members", "12")
        .await
        .unwrap();
    assert_eq!(
        db::get_setting(db.pool(), "stale_hours.members")
            .await
            .unwrap()
            .as_deref(),
        Some("12")
    );
}

#[tokio::test]
async fn blank_community_setting_counts_as_unselected() {
    let (db, _temp_dir) = setup_community().await;

    db::set_setting(db.pool(), "current_community", "   ")
        .await
        .unwrap();

    assert_eq!(db::current_community(db.pool()).await.unwrap(), None);
}

#[tokio::test]
async fn reset_clears_data_but_keeps_settings() {
    let (db, _temp_dir) = setup_community().await;

    let env = envelope(
        FetchType::Members,
        COMMUNITY,
        members_payload(vec![member("u1", "Ada")], 1),
    );
    ingest(&db, &env, NOW - HOUR).await;

    let env = envelope(
        FetchType::Profile,
        COMMUNITY,
        profile_payload("u1", "Ada", &[("other-comm", "Other")]),
    );
    ingest(&db, &env, NOW - HOUR).await;

    assert!(count_rows(&db, "fetches").await > 0);
    assert!(count_rows(&db, "users").await > 0);
    assert!(count_rows(&db, "other_communities").await > 0);

    db::reset_all(db.pool()).await.unwrap();

    assert_eq!(count_rows(&db, "fetches").await, 0);
    assert_eq!(count_rows(&db, "users").await, 0);
    assert_eq!(count_rows(&db, "profiles").await, 0);
    assert_eq!(count_rows(&db, "other_communities").await, 0);

    assert_eq!(
        db::current_community(db.pool()).await.unwrap().as_deref(),
        Some(COMMUNITY)
    );
}

#[tokio::test]
async fn reset_failed_about_clears_errors_and_flags() {
    let (db, _temp_dir) = setup_community().await;

    let env = envelope(
        FetchType::Profile,
        COMMUNITY,
        profile_payload("u1", "Ada", &[("private-comm", "Private")]),
    );
    ingest(&db, &env, NOW - HOUR).await;

    let env = failed_envelope(FetchType::CommunityAbout, "private-comm", "403");
    ingest(&db, &env, NOW - HOUR).await;

    assert!(
        db::has_error_fetch(db.pool(), FetchType::CommunityAbout, "private-comm")
            .await
            .unwrap()
    );

    let slugs = db::reset_failed_about(db.pool()).await.unwrap();
    assert_eq!(slugs, vec!["private-comm".to_string()]);

    assert!(
        !db::has_error_fetch(db.pool(), FetchType::CommunityAbout, "private-comm")
            .await
            .unwrap()
    );
    let other = db::get_other_community(db.pool(), "private-comm")
        .await
        .unwrap()
        .unwrap();
    assert!(!other.about_fetched);
}

#[tokio::test]
async fn reset_failed_about_with_no_failures_is_a_noop() {
    let (db, _temp_dir) = setup_community().await;

    let slugs = db::reset_failed_about(db.pool()).await.unwrap();
    assert!(slugs.is_empty());
}
