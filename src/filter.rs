//! Member filter compiler.
//!
//! Turns a declarative filter request into one SQL query over the latest
//! member snapshots. Conditions come from a closed vocabulary and compile to
//! parameterized predicates over allow-listed columns; the request never
//! contributes SQL text, only bind values. An excluded condition is the
//! logical negation of the included one, so include and exclude partition
//! the community for every condition.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::{LATEST_USER_COLUMNS, UserSnapshot};

const SECONDS_PER_DAY: i64 = 86400;

/// A filter request as posted by the frontend.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberFilter {
    pub community_slug: String,
    pub search_term: String,
    pub sort_by: String,
    pub include: Map<String, Value>,
    pub exclude: Map<String, Value>,
}

/// One compiled condition. Column names are static, never request-supplied.
#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    TextEq(&'static str, String),
    TextNe(&'static str, String),
    AtLeast(&'static str, i64),
    AtMost(&'static str, i64),
    Below(&'static str, i64),
    Above(&'static str, i64),
    FlagIs(&'static str, bool),
}

#[derive(Debug, Clone)]
enum Bind {
    Text(String),
    Int(i64),
}

impl Predicate {
    fn push_sql(&self, sql: &mut String, binds: &mut Vec<Bind>) {
        match self {
            Self::TextEq(col, v) => {
                sql.push_str(&format!(" AND {col} = ?"));
                binds.push(Bind::Text(v.clone()));
            }
            Self::TextNe(col, v) => {
                sql.push_str(&format!(" AND {col} != ?"));
                binds.push(Bind::Text(v.clone()));
            }
            Self::AtLeast(col, n) => {
                sql.push_str(&format!(" AND {col} >= ?"));
                binds.push(Bind::Int(*n));
            }
            Self::AtMost(col, n) => {
                sql.push_str(&format!(" AND {col} <= ?"));
                binds.push(Bind::Int(*n));
            }
            Self::Below(col, n) => {
                sql.push_str(&format!(" AND {col} < ?"));
                binds.push(Bind::Int(*n));
            }
            Self::Above(col, n) => {
                sql.push_str(&format!(" AND {col} > ?"));
                binds.push(Bind::Int(*n));
            }
            Self::FlagIs(col, b) => {
                sql.push_str(&format!(" AND {col} = ?"));
                binds.push(Bind::Int(i64::from(*b)));
            }
        }
    }
}

/// Compile one condition in include polarity. `now` anchors the day-based
/// cutoffs so a compiled filter is reproducible.
fn include_predicate(key: &str, value: &Value, now: i64) -> Option<Predicate> {
    match key {
        "member_role" => Some(Predicate::TextEq("member_role", text(value))),
        "points_min" => Some(Predicate::AtLeast("points", int(value))),
        "points_max" => Some(Predicate::AtMost("points", int(value))),
        "active_since" => Some(Predicate::AtLeast("last_active", days_ago(value, now))),
        "inactive_since" => Some(Predicate::Below("last_active", days_ago(value, now))),
        "joined_since" => Some(Predicate::AtLeast("member_created_at", days_ago(value, now))),
        "joined_before" => Some(Predicate::Below("member_created_at", days_ago(value, now))),
        "is_online" => Some(Predicate::FlagIs("is_online", flag(value))),
        _ => None,
    }
}

/// Compile one condition in exclude polarity: the exact logical negation of
/// the include form, spelled out per key so boundary rows land on the right
/// side.
fn exclude_predicate(key: &str, value: &Value, now: i64) -> Option<Predicate> {
    match key {
        "member_role" => Some(Predicate::TextNe("member_role", text(value))),
        "points_min" => Some(Predicate::Below("points", int(value))),
        "points_max" => Some(Predicate::Above("points", int(value))),
        "active_since" => Some(Predicate::Below("last_active", days_ago(value, now))),
        "inactive_since" => Some(Predicate::AtLeast("last_active", days_ago(value, now))),
        "joined_since" => Some(Predicate::Below("member_created_at", days_ago(value, now))),
        "joined_before" => Some(Predicate::AtLeast("member_created_at", days_ago(value, now))),
        "is_online" => Some(Predicate::FlagIs("is_online", !flag(value))),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_string()
}

fn int(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(0)
}

fn flag(value: &Value) -> bool {
    value.as_bool().unwrap_or_else(|| int(value) != 0)
}

fn days_ago(value: &Value, now: i64) -> i64 {
    now - int(value) * SECONDS_PER_DAY
}

/// Sort clauses come from this allow-list; anything else, including an empty
/// request, falls back to `name_asc`.
fn order_clause(sort_by: &str) -> &'static str {
    match sort_by {
        "name_desc" => "LOWER(name) DESC",
        "points_asc" => "points ASC, LOWER(name) ASC",
        "points_desc" => "points DESC, LOWER(name) ASC",
        "joined_asc" => "member_created_at ASC",
        "joined_desc" => "member_created_at DESC",
        "last_active_asc" => "last_active ASC",
        "last_active_desc" => "last_active DESC",
        _ => "LOWER(name) ASC",
    }
}

#[derive(Debug)]
struct CompiledFilter {
    sql: String,
    binds: Vec<Bind>,
}

fn compile(filter: &MemberFilter, now: i64) -> CompiledFilter {
    // No community means no rows, stated explicitly: snapshot rows with an
    // empty community string must not match an empty request.
    let slug = filter.community_slug.trim();
    if slug.is_empty() {
        return CompiledFilter {
            sql: format!("SELECT {LATEST_USER_COLUMNS} FROM users WHERE 1 = 0"),
            binds: Vec::new(),
        };
    }

    let mut sql = format!(
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
        "
    );
    let mut binds = vec![Bind::Text(slug.to_string())];

    for (key, value) in &filter.include {
        match include_predicate(key, value, now) {
            Some(p) => p.push_sql(&mut sql, &mut binds),
            None => warn!(key, "Ignoring unknown include condition"),
        }
    }
    for (key, value) in &filter.exclude {
        match exclude_predicate(key, value, now) {
            Some(p) => p.push_sql(&mut sql, &mut binds),
            None => warn!(key, "Ignoring unknown exclude condition"),
        }
    }

    let term = filter.search_term.trim().to_lowercase();
    if !term.is_empty() {
        sql.push_str(
            " AND (LOWER(name) LIKE ? OR LOWER(first_name) LIKE ? \
             OR LOWER(last_name) LIKE ? OR LOWER(email) LIKE ?)",
        );
        let pattern = format!("%{term}%");
        for _ in 0..4 {
            binds.push(Bind::Text(pattern.clone()));
        }
    }

    sql.push_str(" ORDER BY ");
    sql.push_str(order_clause(&filter.sort_by));

    CompiledFilter { sql, binds }
}

/// Compile and run a member filter, returning the latest snapshot of each
/// matching member. A community with no snapshots yields an empty result.
pub async fn filter_members(
    pool: &SqlitePool,
    filter: &MemberFilter,
    now: i64,
) -> Result<Vec<UserSnapshot>> {
    let compiled = compile(filter, now);

    let mut query = sqlx::query_as(&compiled.sql);
    for bind in &compiled.binds {
        query = match bind {
            Bind::Text(v) => query.bind(v.clone()),
            Bind::Int(v) => query.bind(*v),
        };
    }

    query
        .fetch_all(pool)
        .await
        .context("Failed to run member filter")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exclude_is_logical_negation_of_include() {
        let now = 1_000 * SECONDS_PER_DAY;
        let cases = [
            ("member_role", json!("admin")),
            ("points_min", json!(10)),
            ("points_max", json!(50)),
            ("active_since", json!(7)),
            ("inactive_since", json!(30)),
            ("joined_since", json!(14)),
            ("joined_before", json!(90)),
            ("is_online", json!(true)),
        ];

        for (key, value) in &cases {
            let inc = include_predicate(key, value, now).unwrap();
            let exc = exclude_predicate(key, value, now).unwrap();
            let negated = match inc {
                Predicate::TextEq(c, v) => Predicate::TextNe(c, v),
                Predicate::TextNe(c, v) => Predicate::TextEq(c, v),
                Predicate::AtLeast(c, n) => Predicate::Below(c, n),
                Predicate::Below(c, n) => Predicate::AtLeast(c, n),
                Predicate::AtMost(c, n) => Predicate::Above(c, n),
                Predicate::Above(c, n) => Predicate::AtMost(c, n),
                Predicate::FlagIs(c, b) => Predicate::FlagIs(c, !b),
            };
            assert_eq!(exc, negated, "negation mismatch for {key}");
        }
    }

    #[test]
    fn unknown_sort_falls_back_to_name() {
        assert_eq!(order_clause(""), "LOWER(name) ASC");
        assert_eq!(order_clause("bogus"), "LOWER(name) ASC");
        assert_eq!(order_clause("points_desc"), "points DESC, LOWER(name) ASC");
    }

    #[test]
    fn unknown_conditions_are_dropped() {
        let now = 0;
        assert!(include_predicate("favorite_color", &json!("blue"), now).is_none());
        assert!(exclude_predicate("favorite_color", &json!("blue"), now).is_none());
    }

    #[test]
    fn empty_community_compiles_to_always_false() {
        let filter = MemberFilter::default();
        let compiled = compile(&filter, 0);
        assert!(compiled.sql.contains("1 = 0"));
        assert!(compiled.binds.is_empty());
    }

    #[test]
    fn search_binds_all_four_columns() {
        let filter = MemberFilter {
            community_slug: "rust-learners".into(),
            search_term: "  Ada ".into(),
            ..MemberFilter::default()
        };
        let compiled = compile(&filter, 0);
        assert!(compiled.sql.contains("LOWER(email) LIKE ?"));
        // Community bind plus four search binds.
        assert_eq!(compiled.binds.len(), 5);
    }
}
