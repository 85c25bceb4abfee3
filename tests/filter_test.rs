//! Integration tests for the member filter compiler.

mod common;

use std::collections::HashSet;

use common::{
    envelope, ingest, leaderboard_payload, member, members_payload, setup_community, COMMUNITY,
    DAY, HOUR, NOW,
};
use serde_json::{json, Value};
use skool_insight::db::{Database, FetchType};
use skool_insight::filter::{filter_members, MemberFilter};
use tempfile::TempDir;

/// Three members with distinct roles, activity, join dates, and points:
///
///   u1 Ada Lovelace    admin   150 pts  active 1d ago   joined 100d ago  online
///   u2 Grace Hopper    member  100 pts  active 10d ago  joined 50d ago
///   u3 Linus Pauling   member   20 pts  active 40d ago  joined 5d ago
async fn seed() -> (Database, TempDir) {
    let (db, temp_dir) = setup_community().await;

    let mut u1 = member("u1", "Ada Lovelace");
    u1["member"]["role"] = json!("admin");
    u1["metadata"]["lastActive"] = json!(NOW - DAY);
    u1["member"]["createdAt"] = json!(NOW - 100 * DAY);
    u1["metadata"]["online"] = json!(true);

    let mut u2 = member("u2", "Grace Hopper");
    u2["metadata"]["lastActive"] = json!(NOW - 10 * DAY);
    u2["member"]["createdAt"] = json!(NOW - 50 * DAY);

    let mut u3 = member("u3", "Linus Pauling");
    u3["metadata"]["lastActive"] = json!(NOW - 40 * DAY);
    u3["member"]["createdAt"] = json!(NOW - 5 * DAY);

    let env = envelope(
        FetchType::Members,
        COMMUNITY,
        members_payload(vec![u1, u2, u3], 1),
    );
    ingest(&db, &env, NOW - HOUR).await;

    let env = envelope(
        FetchType::Leaderboard,
        COMMUNITY,
        leaderboard_payload(&[("u1", "Ada Lovelace", 150), ("u2", "Grace Hopper", 100), ("u3", "Linus Pauling", 20)]),
    );
    ingest(&db, &env, NOW - HOUR).await;

    (db, temp_dir)
}

fn request(include: Value, exclude: Value) -> MemberFilter {
    MemberFilter {
        community_slug: COMMUNITY.to_string(),
        include: include.as_object().cloned().unwrap_or_default(),
        exclude: exclude.as_object().cloned().unwrap_or_default(),
        ..MemberFilter::default()
    }
}

#[tokio::test]
async fn include_and_exclude_partition_every_condition() {
    let (db, _temp_dir) = seed().await;

    // Boundary values on purpose: u2 sits exactly on points 100, the
    // active/joined windows split the members unevenly.
    let conditions = [
        ("member_role", json!("admin")),
        ("points_min", json!(100)),
        ("points_max", json!(100)),
        ("active_since", json!(7)),
        ("inactive_since", json!(7)),
        ("joined_since", json!(30)),
        ("joined_before", json!(30)),
        ("is_online", json!(true)),
    ];

    for (key, value) in &conditions {
        let included = filter_members(db.pool(), &request(json!({(*key): value}), json!({})), NOW)
            .await
            .unwrap();
        let excluded = filter_members(db.pool(), &request(json!({}), json!({(*key): value})), NOW)
            .await
            .unwrap();

        let inc: HashSet<String> = included.iter().map(|u| u.remote_id.clone()).collect();
        let exc: HashSet<String> = excluded.iter().map(|u| u.remote_id.clone()).collect();

        assert!(inc.is_disjoint(&exc), "overlap for condition {key}");
        assert_eq!(
            inc.len() + exc.len(),
            3,
            "condition {key} lost a member: include {inc:?} exclude {exc:?}"
        );
    }
}

#[tokio::test]
async fn boundary_member_lands_on_include_side() {
    let (db, _temp_dir) = seed().await;

    // points_min is inclusive, so exactly 100 points qualifies.
    let included = filter_members(
        db.pool(),
        &request(json!({"points_min": 100}), json!({})),
        NOW,
    )
    .await
    .unwrap();

    assert!(included.iter().any(|u| u.remote_id == "u2"));
}

#[tokio::test]
async fn conditions_combine_conjunctively() {
    let (db, _temp_dir) = seed().await;

    let members = filter_members(
        db.pool(),
        &request(
            json!({"points_min": 50, "active_since": 30}),
            json!({"member_role": "admin"}),
        ),
        NOW,
    )
    .await
    .unwrap();

    // Points and activity admit u1 and u2; excluding admins leaves u2.
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].remote_id, "u2");
}

#[tokio::test]
async fn search_is_case_insensitive_across_fields() {
    let (db, _temp_dir) = seed().await;

    let mut req = request(json!({}), json!({}));
    req.search_term = "GRACE".to_string();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].remote_id, "u2");

    // Matches the email column too.
    let mut req = request(json!({}), json!({}));
    req.search_term = "lovelace@example".to_string();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].remote_id, "u1");
}

#[tokio::test]
async fn sort_orders_and_falls_back_to_name() {
    let (db, _temp_dir) = seed().await;

    let mut req = request(json!({}), json!({}));
    req.sort_by = "points_desc".to_string();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    let ids: Vec<&str> = members.iter().map(|u| u.remote_id.as_str()).collect();
    assert_eq!(ids, vec!["u1", "u2", "u3"]);

    let mut req = request(json!({}), json!({}));
    req.sort_by = "definitely_not_a_sort".to_string();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    let names: Vec<&str> = members.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Ada Lovelace", "Grace Hopper", "Linus Pauling"]);
}

#[tokio::test]
async fn unknown_community_returns_no_rows() {
    let (db, _temp_dir) = seed().await;

    let mut req = request(json!({}), json!({}));
    req.community_slug = "ghost-town".to_string();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    assert!(members.is_empty());
}

#[tokio::test]
async fn empty_community_matches_nothing() {
    let (db, _temp_dir) = seed().await;

    // A snapshot row whose community is the empty string must not leak
    // through an empty request.
    let env = envelope(
        FetchType::Members,
        "",
        members_payload(vec![member("ghost", "Nobody")], 1),
    );
    ingest(&db, &env, NOW).await;

    let mut req = request(json!({}), json!({}));
    req.community_slug = String::new();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    assert!(members.is_empty());

    let mut req = request(json!({}), json!({}));
    req.community_slug = "   ".to_string();
    let members = filter_members(db.pool(), &req, NOW).await.unwrap();
    assert!(members.is_empty());
}

#[tokio::test]
async fn filter_sees_only_latest_snapshots() {
    let (db, _temp_dir) = seed().await;

    let mut renamed = member("u3", "Linus P.");
    renamed["metadata"]["lastActive"] = json!(NOW - 40 * DAY);
    let env = envelope(
        FetchType::Members,
        COMMUNITY,
        members_payload(vec![renamed], 1),
    );
    ingest(&db, &env, NOW).await;

    let members = filter_members(db.pool(), &request(json!({}), json!({})), NOW)
        .await
        .unwrap();

    assert_eq!(members.len(), 3);
    let linus: Vec<&str> = members
        .iter()
        .filter(|u| u.remote_id == "u3")
        .map(|u| u.name.as_str())
        .collect();
    assert_eq!(linus, vec!["Linus P."]);
}

#[tokio::test]
async fn unknown_conditions_are_ignored() {
    let (db, _temp_dir) = seed().await;

    let members = filter_members(
        db.pool(),
        &request(json!({"favorite_color": "blue"}), json!({})),
        NOW,
    )
    .await
    .unwrap();

    assert_eq!(members.len(), 3);
}
