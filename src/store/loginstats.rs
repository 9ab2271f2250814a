//! Statements against the `loginstats` table.
//!
//! `created` holds a day number (unix time divided by 86400) rather than a
//! timestamp so that retention arithmetic stays plain integer math.

use super::Database;
use crate::error::DiscoError;
use crate::logins::LoginCount;
use chrono::Utc;
use rusqlite::params;

/// `iphash` value stored for logins whose network could not be determined.
/// Such rows only contribute to the global ranking.
pub const NETHASH_UNDEFINED: i64 = -1;

const SECONDS_PER_DAY: i64 = 86_400;

const CREATE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS loginstats (
        iphash   INTEGER NOT NULL,
        entityid TEXT    NOT NULL,
        count    INTEGER NOT NULL,
        created  INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS loginstats_iphash ON loginstats (iphash, entityid);
    CREATE INDEX IF NOT EXISTS loginstats_created ON loginstats (created);
";

const INSERT_COUNT: &str =
    "INSERT INTO loginstats (iphash, entityid, count, created) VALUES (?1, ?2, ?3, ?4)";

const DELETE_EXPIRED: &str = "DELETE FROM loginstats WHERE created < ?1 OR count <= 0";

const TOP_FOR_NETWORK: &str = "SELECT entityid FROM loginstats WHERE iphash = ?1 \
     GROUP BY entityid ORDER BY SUM(count) DESC LIMIT ?2";

const TOP_GLOBAL: &str =
    "SELECT entityid FROM loginstats GROUP BY entityid ORDER BY SUM(count) DESC LIMIT ?1";

pub fn ensure_schema(db: &Database) -> Result<(), DiscoError> {
    db.execute(|conn| conn.execute_batch(CREATE_SCHEMA))
}

pub fn day_number(unix_secs: i64) -> i64 {
    unix_secs.div_euclid(SECONDS_PER_DAY)
}

pub fn current_day() -> i64 {
    day_number(Utc::now().timestamp())
}

/// Write one batch of counts for `day`, skipping non-positive counts.
/// Returns the number of rows written.
pub fn insert_counts(db: &Database, counts: &[LoginCount], day: i64) -> Result<usize, DiscoError> {
    let rows: Vec<&LoginCount> = counts.iter().filter(|c| c.count > 0).collect();
    if rows.is_empty() {
        return Ok(0);
    }

    db.execute_batch(INSERT_COUNT, &rows, |stmt, c| {
        stmt.execute(params![c.key.iphash(), c.key.entity_id, c.count, day])
    })
}

/// Delete rows created before `before_day`, and any row with a non-positive count.
pub fn delete_expired(db: &Database, before_day: i64) -> Result<usize, DiscoError> {
    db.execute_statement(DELETE_EXPIRED, params![before_day])
}

/// Entity IDs ordered by summed count, scoped to one network or global.
pub fn top_entities(
    db: &Database,
    nethash: Option<u16>,
    limit: usize,
) -> Result<Vec<String>, DiscoError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    match nethash {
        Some(hash) => db.query_strings(TOP_FOR_NETWORK, params![i64::from(hash), limit]),
        None => db.query_strings(TOP_GLOBAL, params![limit]),
    }
}
