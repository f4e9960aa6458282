//! Derived views over the base tables.
//!
//! SQLite has no materialized views, so these are computed in code. The
//! contract matches what a trigger-based store would provide: every write
//! path that touches an input calls the matching recompute inside its own
//! transaction, so readers observe consistent values at commit.

use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::db::{parse_utc, run_from_row};
use super::models::{
    Candidate, ChangeSetState, PolicyRule, PublishMode, QueueBucket, Run, result_code,
};

/// SQL expression ranking queue buckets in assignment order.
pub fn bucket_rank_sql() -> String {
    let mut cases = String::from("CASE bucket ");
    for bucket in [
        QueueBucket::UpdateExistingMp,
        QueueBucket::Manual,
        QueueBucket::Control,
        QueueBucket::Hook,
        QueueBucket::Reschedule,
        QueueBucket::UpdateNewMp,
        QueueBucket::MissingDeps,
        QueueBucket::Default,
    ] {
        cases.push_str(&format!(
            "WHEN '{}' THEN {} ",
            bucket.as_str(),
            bucket.ordinal()
        ));
    }
    cases.push_str("ELSE 99 END");
    cases
}

/// The three last-run pointers for a codebase/campaign pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastRun {
    /// Most recent run by start time.
    pub last_run_id: Option<String>,
    /// Most recent run after walking past `nothing-new-to-do` markers and
    /// transient failures.
    pub last_effective_run_id: Option<String>,
    /// The effective run, if it is a success with at least one result
    /// branch still unabsorbed.
    pub last_unabsorbed_run_id: Option<String>,
}

#[derive(Debug, Clone)]
struct RunSummary {
    id: String,
    result_code: String,
    failure_transient: Option<bool>,
    resume_from: Option<String>,
    start_time: String,
}

const SUMMARY_COLS: &str = "id, result_code, failure_transient, resume_from, start_time";

fn summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSummary> {
    Ok(RunSummary {
        id: row.get(0)?,
        result_code: row.get(1)?,
        failure_transient: row.get::<_, Option<i64>>(2)?.map(|v| v != 0),
        resume_from: row.get(3)?,
        start_time: row.get(4)?,
    })
}

fn most_recent_summary(
    conn: &Connection,
    codebase: &str,
    campaign: &str,
) -> Result<Option<RunSummary>> {
    conn.query_row(
        &format!(
            "SELECT {SUMMARY_COLS} FROM run
             WHERE codebase = ?1 AND campaign = ?2
             ORDER BY start_time DESC LIMIT 1"
        ),
        params![codebase, campaign],
        summary_from_row,
    )
    .optional()
    .context("Failed to query most recent run")
}

fn summary_before(
    conn: &Connection,
    codebase: &str,
    campaign: &str,
    start_time: &str,
) -> Result<Option<RunSummary>> {
    conn.query_row(
        &format!(
            "SELECT {SUMMARY_COLS} FROM run
             WHERE codebase = ?1 AND campaign = ?2 AND start_time < ?3
             ORDER BY start_time DESC LIMIT 1"
        ),
        params![codebase, campaign, start_time],
        summary_from_row,
    )
    .optional()
    .context("Failed to query preceding run")
}

fn summary_by_id(conn: &Connection, id: &str) -> Result<Option<RunSummary>> {
    conn.query_row(
        &format!("SELECT {SUMMARY_COLS} FROM run WHERE id = ?1"),
        params![id],
        summary_from_row,
    )
    .optional()
    .context("Failed to query run by id")
}

fn has_unabsorbed_branch(conn: &Connection, run_id: &str) -> Result<bool> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM result_branch WHERE run_id = ?1 AND absorbed = 0",
            params![run_id],
            |row| row.get(0),
        )
        .context("Failed to count unabsorbed branches")?;
    Ok(count > 0)
}

/// Resolve the last/effective/unabsorbed run pointers.
///
/// The effective walk follows `resume_from` out of `nothing-new-to-do`
/// markers and steps over transient failures. The walk is bounded and
/// cycle-detecting; a malformed resume chain yields no effective run
/// rather than an infinite loop.
pub fn last_run(conn: &Connection, codebase: &str, campaign: &str) -> Result<LastRun> {
    let mut view = LastRun::default();
    let mut cursor = most_recent_summary(conn, codebase, campaign)?;
    view.last_run_id = cursor.as_ref().map(|r| r.id.clone());

    let mut visited: HashSet<String> = HashSet::new();
    let mut effective: Option<RunSummary> = None;
    while let Some(run) = cursor {
        if !visited.insert(run.id.clone()) || visited.len() > 64 {
            break;
        }
        if run.result_code == result_code::NOTHING_NEW_TO_DO {
            match &run.resume_from {
                Some(resume) => {
                    cursor = summary_by_id(conn, resume)?;
                    continue;
                }
                None => break,
            }
        }
        if run.failure_transient == Some(true) {
            cursor = summary_before(conn, codebase, campaign, &run.start_time)?;
            continue;
        }
        effective = Some(run);
        break;
    }

    if let Some(run) = effective {
        if run.result_code == result_code::SUCCESS && has_unabsorbed_branch(conn, &run.id)? {
            view.last_unabsorbed_run_id = Some(run.id.clone());
        }
        view.last_effective_run_id = Some(run.id);
    }
    Ok(view)
}

/// Recompute and persist the state of a change set from its runs,
/// publishes, result branches, and outstanding work.
pub fn recompute_change_set_state(conn: &Connection, id: &str) -> Result<ChangeSetState> {
    let runs: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM run WHERE change_set = ?1",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to count change set runs")?;
    let successes: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM run WHERE change_set = ?1 AND result_code = 'success'",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to count change set successes")?;
    let successful_publishes: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM publish WHERE change_set = ?1 AND result_code = 'success'",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to count change set publishes")?;
    let unabsorbed: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM result_branch b JOIN run r ON r.id = b.run_id
             WHERE r.change_set = ?1 AND r.result_code = 'success' AND b.absorbed = 0",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to count unabsorbed change set branches")?;
    let outstanding: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM queue WHERE change_set = ?1)
                  + (SELECT COUNT(*) FROM candidate c WHERE c.change_set = ?1
                     AND NOT EXISTS (SELECT 1 FROM run r
                                     WHERE r.change_set = ?1
                                       AND r.codebase = c.codebase
                                       AND r.campaign = c.campaign))",
            params![id],
            |row| row.get(0),
        )
        .context("Failed to count outstanding change set work")?;

    let state = if successful_publishes > 0 && unabsorbed == 0 {
        ChangeSetState::Done
    } else if successful_publishes > 0 {
        ChangeSetState::Publishing
    } else if successes > 0 && outstanding == 0 {
        ChangeSetState::Ready
    } else if runs > 0 {
        ChangeSetState::Working
    } else {
        ChangeSetState::Created
    };
    conn.execute(
        "UPDATE change_set SET state = ?1 WHERE id = ?2",
        params![state.as_str(), id],
    )
    .context("Failed to update change set state")?;
    Ok(state)
}

/// A run eligible for publishing, joined with its candidate and the
/// non-inert policy rules covering its unabsorbed branch roles.
#[derive(Debug, Clone)]
pub struct PublishReadyEntry {
    pub run: Run,
    pub candidate: Candidate,
    pub rules: Vec<PolicyRule>,
}

fn candidate_for(
    conn: &Connection,
    codebase: &str,
    campaign: &str,
    change_set: Option<&str>,
) -> Result<Option<Candidate>> {
    let query = |cs: Option<&str>| {
        conn.query_row(
            "SELECT id, codebase, campaign, change_set, command, context, value,
                    success_chance, policy
             FROM candidate
             WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(change_set, '') = IFNULL(?3, '')",
            params![codebase, campaign, cs],
            |row| {
                Ok(Candidate {
                    id: row.get(0)?,
                    codebase: row.get(1)?,
                    campaign: row.get(2)?,
                    change_set: row.get(3)?,
                    command: row.get(4)?,
                    context: row.get(5)?,
                    value: row.get(6)?,
                    success_chance: row.get(7)?,
                    policy: row.get(8)?,
                })
            },
        )
        .optional()
        .context("Failed to query candidate")
    };
    // A change-set-scoped candidate wins; fall back to the standing one.
    if change_set.is_some() {
        if let Some(found) = query(change_set)? {
            return Ok(Some(found));
        }
    }
    query(None)
}

fn policy_rules(conn: &Connection, name: &str) -> Result<Vec<PolicyRule>> {
    let mut stmt = conn
        .prepare(
            "SELECT name, role, mode, frequency_days, rate_limit_bucket, max_open_mps
             FROM policy WHERE name = ?1 ORDER BY role",
        )
        .context("Failed to prepare policy query")?;
    let rows = stmt
        .query_map(params![name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })
        .context("Failed to query policy rules")?;
    let mut rules = Vec::new();
    for row in rows {
        let (name, role, mode, frequency_days, rate_limit_bucket, max_open_mps) =
            row.context("Failed to read policy rule")?;
        rules.push(PolicyRule {
            name,
            role,
            mode: PublishMode::from_str(&mode)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse policy mode")?,
            frequency_days,
            rate_limit_bucket,
            max_open_mps,
        });
    }
    Ok(rules)
}

/// Effective last runs that are successes with at least one unabsorbed
/// branch whose policy role is not inert, joined with the current named
/// policy. Ordered by rate-limit bucket for round-robin fairness.
pub fn publish_ready(conn: &Connection) -> Result<Vec<PublishReadyEntry>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT codebase, campaign FROM candidate ORDER BY codebase, campaign")
        .context("Failed to prepare candidate pairs query")?;
    let pairs = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("Failed to query candidate pairs")?;

    let mut entries = Vec::new();
    for pair in pairs {
        let (codebase, campaign) = pair.context("Failed to read candidate pair")?;
        let view = last_run(conn, &codebase, &campaign)?;
        let Some(run_id) = view.last_unabsorbed_run_id else {
            continue;
        };
        let run = conn
            .query_row(
                "SELECT id, codebase, campaign, command, start_time, finish_time,
                        result_code, failure_stage, failure_transient, description, revision,
                        main_branch_revision, worker, logfilenames, result, value,
                        publish_status, resume_from, change_set
                 FROM run WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .context("Failed to load publish-ready run")?
            .into_run()?;
        let Some(candidate) =
            candidate_for(conn, &codebase, &campaign, run.change_set.as_deref())?
        else {
            continue;
        };
        let unabsorbed_roles: HashSet<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT role FROM result_branch WHERE run_id = ?1 AND absorbed = 0",
                )
                .context("Failed to prepare unabsorbed roles query")?;
            let roles = stmt
                .query_map(params![run.id], |row| row.get::<_, String>(0))
                .context("Failed to query unabsorbed roles")?;
            let mut set = HashSet::new();
            for role in roles {
                set.insert(role.context("Failed to read role")?);
            }
            set
        };
        let rules: Vec<PolicyRule> = policy_rules(conn, &candidate.policy)?
            .into_iter()
            .filter(|rule| !rule.mode.is_inert() && unabsorbed_roles.contains(&rule.role))
            .collect();
        if rules.is_empty() {
            continue;
        }
        entries.push(PublishReadyEntry {
            run,
            candidate,
            rules,
        });
    }
    // Bucket-sorted so the queue loop can round-robin fairly.
    entries.sort_by(|a, b| {
        let bucket = |e: &PublishReadyEntry| {
            e.rules
                .first()
                .and_then(|r| r.rate_limit_bucket.clone())
                .unwrap_or_default()
        };
        bucket(a).cmp(&bucket(b)).then(a.run.id.cmp(&b.run.id))
    });
    Ok(entries)
}

/// One-based position of a queue item in assignment order, with the
/// total queue depth.
pub fn queue_position(conn: &Connection, queue_id: i64) -> Result<Option<(i64, i64)>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT id FROM queue ORDER BY {}, priority, id",
            bucket_rank_sql()
        ))
        .context("Failed to prepare queue position query")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .context("Failed to query queue ids")?;
    let mut position = None;
    let mut total = 0i64;
    for id in ids {
        let id = id.context("Failed to read queue id")?;
        total += 1;
        if id == queue_id {
            position = Some(total);
        }
    }
    Ok(position.map(|p| (p, total)))
}

// Timestamps in summaries stay as raw strings for ordering; expose parsing
// for callers that need real instants.
pub fn run_start_time(conn: &Connection, run_id: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    conn.query_row(
        "SELECT start_time FROM run WHERE id = ?1",
        params![run_id],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .context("Failed to query run start time")?
    .map(|raw| parse_utc(&raw))
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::super::db::test_support::*;
    use super::super::db::{NewPublish, StateDb};
    use super::super::models::*;
    use super::*;
    use chrono::{Duration, Utc};

    fn record(
        db: &mut StateDb,
        id: &str,
        code: &str,
        transient: Option<bool>,
        resume_from: Option<&str>,
        minutes_ago: i64,
        branches: &[(&str, bool)],
    ) -> anyhow::Result<()> {
        let mut run = successful_run(id, "foo", "lintian-fixes");
        run.result_code = code.to_string();
        run.failure_transient = transient;
        run.resume_from = resume_from.map(String::from);
        run.start_time = Utc::now() - Duration::minutes(minutes_ago);
        run.finish_time = run.start_time + Duration::minutes(5);
        if code != "success" {
            run.revision = None;
        }
        let branches: Vec<ResultBranch> = branches
            .iter()
            .map(|(role, absorbed)| ResultBranch {
                run_id: id.to_string(),
                role: role.to_string(),
                remote_name: None,
                base_revision: None,
                revision: Some(format!("{id}-{role}")),
                absorbed: *absorbed,
            })
            .collect();
        db.record_run(&run, &branches)
    }

    #[test]
    fn test_last_run_simple_success() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        record(&mut db, "r1", "success", None, None, 60, &[("main", false)])?;
        let view = last_run(db.connection(), "foo", "lintian-fixes")?;
        assert_eq!(view.last_run_id.as_deref(), Some("r1"));
        assert_eq!(view.last_effective_run_id.as_deref(), Some("r1"));
        assert_eq!(view.last_unabsorbed_run_id.as_deref(), Some("r1"));
        Ok(())
    }

    #[test]
    fn test_last_run_walks_transient_failures() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        record(&mut db, "r1", "success", None, None, 120, &[("main", false)])?;
        record(&mut db, "r2", "worker-timeout", Some(true), None, 60, &[])?;
        record(&mut db, "r3", "worker-failure", Some(true), None, 30, &[])?;
        let view = last_run(db.connection(), "foo", "lintian-fixes")?;
        assert_eq!(view.last_run_id.as_deref(), Some("r3"));
        assert_eq!(view.last_effective_run_id.as_deref(), Some("r1"));
        assert_eq!(view.last_unabsorbed_run_id.as_deref(), Some("r1"));
        Ok(())
    }

    #[test]
    fn test_last_run_follows_resume_chain() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        record(&mut db, "r1", "success", None, None, 120, &[("main", false)])?;
        record(&mut db, "r2", "nothing-new-to-do", None, Some("r1"), 60, &[])?;
        let view = last_run(db.connection(), "foo", "lintian-fixes")?;
        assert_eq!(view.last_run_id.as_deref(), Some("r2"));
        assert_eq!(view.last_effective_run_id.as_deref(), Some("r1"));
        assert_eq!(view.last_unabsorbed_run_id.as_deref(), Some("r1"));
        Ok(())
    }

    #[test]
    fn test_last_run_resume_cycle_is_bounded() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        // r2 resumes from r3 and r3 resumes from r2.
        record(&mut db, "r2", "nothing-new-to-do", None, Some("r3"), 60, &[])?;
        record(&mut db, "r3", "nothing-new-to-do", None, Some("r2"), 30, &[])?;
        let view = last_run(db.connection(), "foo", "lintian-fixes")?;
        assert_eq!(view.last_run_id.as_deref(), Some("r3"));
        assert_eq!(view.last_effective_run_id, None);
        Ok(())
    }

    #[test]
    fn test_absorption_clears_unabsorbed_pointer() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        record(&mut db, "r1", "success", None, None, 60, &[("main", false)])?;
        db.absorb_result_branch("r1", "main")?;
        let view = last_run(db.connection(), "foo", "lintian-fixes")?;
        assert_eq!(view.last_effective_run_id.as_deref(), Some("r1"));
        assert_eq!(view.last_unabsorbed_run_id, None);
        Ok(())
    }

    #[test]
    fn test_change_set_lifecycle() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        db.ensure_change_set("cs-1")?;
        assert_eq!(
            db.get_change_set("cs-1")?.map(|cs| cs.state),
            Some(ChangeSetState::Created)
        );

        // A run moves it to working... and with a success and no pending
        // work it becomes ready.
        let mut run = successful_run("r1", "foo", "lintian-fixes");
        run.change_set = Some("cs-1".into());
        db.record_run(
            &run,
            &[ResultBranch {
                run_id: "r1".into(),
                role: "main".into(),
                remote_name: None,
                base_revision: None,
                revision: Some("rev-b".into()),
                absorbed: false,
            }],
        )?;
        assert_eq!(
            db.get_change_set("cs-1")?.map(|cs| cs.state),
            Some(ChangeSetState::Ready)
        );

        // A successful publish moves it to publishing.
        db.insert_publish(&NewPublish {
            timestamp: Utc::now(),
            change_set: Some("cs-1".into()),
            codebase: "foo".into(),
            campaign: "lintian-fixes".into(),
            role: Some("main".into()),
            mode: PublishMode::Push,
            source_branch_url: None,
            target_branch_url: None,
            revision: Some("rev-b".into()),
            merge_proposal_url: None,
            result_code: "success".into(),
            description: None,
            requester: None,
        })?;
        recompute_change_set_state(db.connection(), "cs-1")?;
        assert_eq!(
            db.get_change_set("cs-1")?.map(|cs| cs.state),
            Some(ChangeSetState::Publishing)
        );

        // Absorbing the last branch completes it.
        db.absorb_result_branch("r1", "main")?;
        assert_eq!(
            db.get_change_set("cs-1")?.map(|cs| cs.state),
            Some(ChangeSetState::Done)
        );
        Ok(())
    }

    #[test]
    fn test_publish_ready_requires_unabsorbed_non_inert_role() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        db.upsert_candidate(&Candidate {
            id: 0,
            codebase: "foo".into(),
            campaign: "lintian-fixes".into(),
            change_set: None,
            command: "cmd".into(),
            context: None,
            value: Some(10),
            success_chance: None,
            policy: "default".into(),
        })?;
        db.put_policy(
            "default",
            &[PolicyRule {
                name: "default".into(),
                role: "main".into(),
                mode: PublishMode::Propose,
                frequency_days: None,
                rate_limit_bucket: Some("maintainer-x".into()),
                max_open_mps: None,
            }],
        )?;

        assert!(publish_ready(db.connection())?.is_empty());

        record(&mut db, "r1", "success", None, None, 60, &[("main", false)])?;
        let ready = publish_ready(db.connection())?;
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].run.id, "r1");
        assert_eq!(ready[0].rules.len(), 1);
        assert_eq!(ready[0].rules[0].mode, PublishMode::Propose);

        // Once absorbed, the pair drops out.
        db.absorb_result_branch("r1", "main")?;
        assert!(publish_ready(db.connection())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_publish_ready_skips_inert_modes() -> anyhow::Result<()> {
        let mut db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        db.upsert_candidate(&Candidate {
            id: 0,
            codebase: "foo".into(),
            campaign: "lintian-fixes".into(),
            change_set: None,
            command: "cmd".into(),
            context: None,
            value: None,
            success_chance: None,
            policy: "silent".into(),
        })?;
        db.put_policy(
            "silent",
            &[PolicyRule {
                name: "silent".into(),
                role: "main".into(),
                mode: PublishMode::BuildOnly,
                frequency_days: None,
                rate_limit_bucket: None,
                max_open_mps: None,
            }],
        )?;
        record(&mut db, "r1", "success", None, None, 60, &[("main", false)])?;
        assert!(publish_ready(db.connection())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_queue_position_follows_assignment_order() -> anyhow::Result<()> {
        let db = StateDb::new_in_memory()?;
        seed_codebase(&db, "foo")?;
        seed_codebase(&db, "bar")?;
        let low = db
            .insert_queue_item(
                "foo",
                "a",
                "cmd",
                100,
                QueueBucket::Default,
                None,
                None,
                None,
                false,
            )?
            .expect("slot free");
        let urgent = db
            .insert_queue_item(
                "bar",
                "a",
                "cmd",
                0,
                QueueBucket::Manual,
                None,
                None,
                None,
                false,
            )?
            .expect("slot free");
        assert_eq!(queue_position(db.connection(), urgent.id)?, Some((1, 2)));
        assert_eq!(queue_position(db.connection(), low.id)?, Some((2, 2)));
        assert_eq!(queue_position(db.connection(), 9999)?, None);
        Ok(())
    }
}
