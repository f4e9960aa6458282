//! Per-bucket open-proposal accounting.
//!
//! Rate-limit buckets group merge proposals (typically per maintainer);
//! each bucket caps how many proposals may be open at once. The counts are
//! always derived from the store, never cached, so every decision sees the
//! forge state as of the last scan.

use anyhow::{Context, Result};
use rusqlite::params;
use serde::Serialize;

use crate::config::PublisherConfig;
use crate::state::StateDb;

#[derive(Debug, Clone, Serialize)]
pub struct BucketStats {
    pub bucket: String,
    pub open: i64,
    pub max_open: i64,
    pub remaining: i64,
}

/// Effective open-proposal cap for a bucket: the tightest policy rule
/// naming it, or the configured default.
pub fn bucket_cap(db: &StateDb, cfg: &PublisherConfig, bucket: &str) -> Result<i64> {
    let rule_cap: Option<i64> = db
        .connection()
        .query_row(
            "SELECT MIN(max_open_mps) FROM policy WHERE rate_limit_bucket = ?1",
            params![bucket],
            |row| row.get(0),
        )
        .context("Failed to query bucket cap")?;
    Ok(rule_cap.unwrap_or(cfg.default_max_open_mps))
}

/// Stats for every bucket with open proposals or a policy rule, or for a
/// single named bucket.
pub fn stats(
    db: &StateDb,
    cfg: &PublisherConfig,
    bucket: Option<&str>,
) -> Result<Vec<BucketStats>> {
    let mut buckets: Vec<String> = match bucket {
        Some(bucket) => vec![bucket.to_string()],
        None => {
            let mut names: Vec<String> = db
                .open_mp_counts_by_bucket()?
                .into_iter()
                .map(|(name, _)| name)
                .filter(|name| !name.is_empty())
                .collect();
            let mut stmt = db
                .connection()
                .prepare(
                    "SELECT DISTINCT rate_limit_bucket FROM policy
                     WHERE rate_limit_bucket IS NOT NULL ORDER BY 1",
                )
                .context("Failed to prepare bucket listing")?;
            let from_policy = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context("Failed to query policy buckets")?;
            for name in from_policy {
                names.push(name.context("Failed to read bucket name")?);
            }
            names.sort();
            names.dedup();
            names
        }
    };

    let mut out = Vec::with_capacity(buckets.len());
    for name in buckets.drain(..) {
        let open = db.open_mp_count_for_bucket(&name)?;
        let max_open = bucket_cap(db, cfg, &name)?;
        out.push(BucketStats {
            bucket: name,
            open,
            max_open,
            remaining: (max_open - open).max(0),
        });
    }
    Ok(out)
}
