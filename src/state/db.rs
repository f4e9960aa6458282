use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use super::views;

/// Synchronous SQLite wrapper. All access from async code goes through
/// [`Db`], which runs closures on the blocking pool.
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) the state database at the given path and migrate.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS codebase (
                    name TEXT PRIMARY KEY,
                    vcs_type TEXT NOT NULL,
                    branch_url TEXT NOT NULL,
                    subpath TEXT,
                    web_url TEXT,
                    value INTEGER NOT NULL DEFAULT 1 CHECK (value > 0),
                    inactive INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS change_set (
                    id TEXT PRIMARY KEY,
                    state TEXT NOT NULL DEFAULT 'created'
                        CHECK (state IN ('created', 'working', 'ready', 'publishing', 'done'))
                );

                CREATE TABLE IF NOT EXISTS candidate (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    codebase TEXT NOT NULL REFERENCES codebase(name),
                    campaign TEXT NOT NULL,
                    change_set TEXT REFERENCES change_set(id),
                    command TEXT NOT NULL,
                    context TEXT,
                    value INTEGER,
                    success_chance REAL,
                    policy TEXT NOT NULL DEFAULT 'default'
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_candidate_slot
                    ON candidate(codebase, campaign, IFNULL(change_set, ''));

                CREATE TABLE IF NOT EXISTS queue (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    codebase TEXT NOT NULL REFERENCES codebase(name),
                    campaign TEXT NOT NULL,
                    command TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    bucket TEXT NOT NULL DEFAULT 'default',
                    estimated_duration_secs INTEGER,
                    change_set TEXT REFERENCES change_set(id),
                    requester TEXT,
                    refresh INTEGER NOT NULL DEFAULT 0
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_slot
                    ON queue(codebase, campaign, IFNULL(change_set, ''));

                CREATE TABLE IF NOT EXISTS active_run (
                    log_id TEXT PRIMARY KEY,
                    queue_id INTEGER NOT NULL UNIQUE,
                    codebase TEXT NOT NULL,
                    campaign TEXT NOT NULL,
                    command TEXT NOT NULL,
                    worker TEXT NOT NULL,
                    backchannel TEXT,
                    start_time TEXT NOT NULL,
                    estimated_duration_secs INTEGER NOT NULL,
                    last_heartbeat TEXT NOT NULL,
                    mia_count INTEGER NOT NULL DEFAULT 0,
                    vcs_info TEXT NOT NULL DEFAULT '{}',
                    change_set TEXT,
                    resume_from TEXT,
                    refresh INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS run (
                    id TEXT PRIMARY KEY,
                    codebase TEXT NOT NULL,
                    campaign TEXT NOT NULL,
                    command TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    finish_time TEXT NOT NULL,
                    result_code TEXT NOT NULL,
                    failure_stage TEXT,
                    failure_transient INTEGER,
                    description TEXT,
                    revision TEXT,
                    main_branch_revision TEXT,
                    worker TEXT,
                    logfilenames TEXT NOT NULL DEFAULT '[]',
                    result TEXT,
                    value INTEGER,
                    publish_status TEXT NOT NULL DEFAULT 'unknown'
                        CHECK (publish_status IN ('unknown', 'blocked', 'needs-manual-review',
                                                  'rejected', 'approved', 'ignored')),
                    resume_from TEXT,
                    change_set TEXT,
                    CHECK (publish_status != 'approved' OR revision IS NOT NULL),
                    CHECK (result_code != 'nothing-new-to-do' OR resume_from IS NOT NULL)
                );
                CREATE INDEX IF NOT EXISTS idx_run_codebase_campaign
                    ON run(codebase, campaign, start_time DESC);
                CREATE INDEX IF NOT EXISTS idx_run_change_set ON run(change_set);

                CREATE TABLE IF NOT EXISTS result_branch (
                    run_id TEXT NOT NULL REFERENCES run(id) ON DELETE CASCADE,
                    role TEXT NOT NULL,
                    remote_name TEXT,
                    base_revision TEXT,
                    revision TEXT,
                    absorbed INTEGER NOT NULL DEFAULT 0,
                    UNIQUE(run_id, role)
                );

                CREATE TABLE IF NOT EXISTS publish (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    change_set TEXT,
                    codebase TEXT NOT NULL,
                    campaign TEXT NOT NULL,
                    role TEXT,
                    mode TEXT NOT NULL
                        CHECK (mode IN ('push', 'attempt-push', 'propose', 'build-only',
                                        'push-derived', 'skip', 'bts')),
                    source_branch_url TEXT,
                    target_branch_url TEXT,
                    revision TEXT,
                    merge_proposal_url TEXT,
                    result_code TEXT NOT NULL,
                    description TEXT,
                    requester TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_publish_target
                    ON publish(codebase, campaign, role, timestamp DESC);
                CREATE INDEX IF NOT EXISTS idx_publish_mp ON publish(merge_proposal_url);

                CREATE TABLE IF NOT EXISTS merge_proposal (
                    url TEXT PRIMARY KEY,
                    codebase TEXT,
                    target_branch_url TEXT,
                    status TEXT NOT NULL DEFAULT 'open'
                        CHECK (status IN ('open', 'closed', 'merged', 'applied',
                                          'abandoned', 'rejected')),
                    revision TEXT,
                    merged_by TEXT,
                    merged_at TEXT,
                    last_scanned TEXT,
                    can_be_merged INTEGER,
                    rate_limit_bucket TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_mp_status ON merge_proposal(status);

                CREATE TABLE IF NOT EXISTS policy (
                    name TEXT NOT NULL,
                    role TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    frequency_days INTEGER,
                    rate_limit_bucket TEXT,
                    max_open_mps INTEGER,
                    PRIMARY KEY (name, role)
                );

                CREATE TABLE IF NOT EXISTS worker (
                    name TEXT PRIMARY KEY,
                    password TEXT NOT NULL,
                    link TEXT
                );

                CREATE TABLE IF NOT EXISTS event_log (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp TEXT NOT NULL,
                    topic TEXT NOT NULL,
                    payload TEXT NOT NULL
                );
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ── Codebases ─────────────────────────────────────────────────────

    pub fn upsert_codebase(&self, cb: &Codebase) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO codebase (name, vcs_type, branch_url, subpath, web_url, value, inactive)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                    vcs_type = ?2, branch_url = ?3, subpath = ?4,
                    web_url = ?5, value = ?6, inactive = ?7",
                params![
                    cb.name,
                    cb.vcs_type.as_str(),
                    cb.branch_url,
                    cb.subpath,
                    cb.web_url,
                    cb.value,
                    cb.inactive as i64,
                ],
            )
            .context("Failed to upsert codebase")?;
        Ok(())
    }

    pub fn get_codebase(&self, name: &str) -> Result<Option<Codebase>> {
        self.conn
            .query_row(
                "SELECT name, vcs_type, branch_url, subpath, web_url, value, inactive
                 FROM codebase WHERE name = ?1",
                params![name],
                |row| {
                    Ok(CodebaseRow {
                        name: row.get(0)?,
                        vcs_type: row.get(1)?,
                        branch_url: row.get(2)?,
                        subpath: row.get(3)?,
                        web_url: row.get(4)?,
                        value: row.get(5)?,
                        inactive: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("Failed to query codebase")?
            .map(CodebaseRow::into_codebase)
            .transpose()
    }

    // ── Candidates ────────────────────────────────────────────────────

    pub fn upsert_candidate(&self, c: &Candidate) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO candidate
                    (codebase, campaign, change_set, command, context, value, success_chance, policy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(codebase, campaign, IFNULL(change_set, '')) DO UPDATE SET
                    command = ?4, context = ?5, value = ?6, success_chance = ?7, policy = ?8",
                params![
                    c.codebase,
                    c.campaign,
                    c.change_set,
                    c.command,
                    c.context,
                    c.value,
                    c.success_chance,
                    c.policy,
                ],
            )
            .context("Failed to upsert candidate")?;
        let id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM candidate
                 WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(change_set, '') = IFNULL(?3, '')",
                params![c.codebase, c.campaign, c.change_set],
                |row| row.get(0),
            )
            .context("Candidate not found after upsert")?;
        Ok(id)
    }

    pub fn get_candidate(
        &self,
        codebase: &str,
        campaign: &str,
        change_set: Option<&str>,
    ) -> Result<Option<Candidate>> {
        self.conn
            .query_row(
                "SELECT id, codebase, campaign, change_set, command, context, value,
                        success_chance, policy
                 FROM candidate
                 WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(change_set, '') = IFNULL(?3, '')",
                params![codebase, campaign, change_set],
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
    }

    /// Delete a candidate. Cascades only to queue items, never to runs.
    pub fn delete_candidate(
        &mut self,
        codebase: &str,
        campaign: &str,
        change_set: Option<&str>,
    ) -> Result<bool> {
        let tx = self.conn.transaction().context("Failed to open transaction")?;
        tx.execute(
            "DELETE FROM queue
             WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(change_set, '') = IFNULL(?3, '')",
            params![codebase, campaign, change_set],
        )
        .context("Failed to delete queue items for candidate")?;
        let count = tx
            .execute(
                "DELETE FROM candidate
                 WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(change_set, '') = IFNULL(?3, '')",
                params![codebase, campaign, change_set],
            )
            .context("Failed to delete candidate")?;
        tx.commit().context("Failed to commit candidate delete")?;
        Ok(count > 0)
    }

    // ── Queue ─────────────────────────────────────────────────────────

    /// Insert a queue item. Returns `None` when the `(codebase, campaign,
    /// change_set)` slot is already occupied.
    pub fn insert_queue_item(
        &self,
        codebase: &str,
        campaign: &str,
        command: &str,
        priority: i64,
        bucket: QueueBucket,
        estimated_duration_secs: Option<i64>,
        change_set: Option<&str>,
        requester: Option<&str>,
        refresh: bool,
    ) -> Result<Option<QueueItem>> {
        let inserted = self.conn.execute(
            "INSERT INTO queue
                (codebase, campaign, command, priority, bucket, estimated_duration_secs,
                 change_set, requester, refresh)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(codebase, campaign, IFNULL(change_set, '')) DO NOTHING",
            params![
                codebase,
                campaign,
                command,
                priority,
                bucket.as_str(),
                estimated_duration_secs,
                change_set,
                requester,
                refresh as i64,
            ],
        );
        match inserted {
            Ok(0) => Ok(None),
            Ok(_) => {
                let id = self.conn.last_insert_rowid();
                Ok(self.get_queue_item(id)?)
            }
            Err(e) => Err(e).context("Failed to insert queue item"),
        }
    }

    pub fn get_queue_item(&self, id: i64) -> Result<Option<QueueItem>> {
        self.conn
            .query_row(
                "SELECT id, codebase, campaign, command, priority, bucket,
                        estimated_duration_secs, change_set, requester, refresh
                 FROM queue WHERE id = ?1",
                params![id],
                queue_item_from_row,
            )
            .optional()
            .context("Failed to query queue item")?
            .map(QueueItemRow::into_queue_item)
            .transpose()
    }

    /// Pending queue items in assignment order.
    pub fn list_queue(&self) -> Result<Vec<QueueItem>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT id, codebase, campaign, command, priority, bucket,
                        estimated_duration_secs, change_set, requester, refresh
                 FROM queue ORDER BY {}, priority, id",
                views::bucket_rank_sql()
            ))
            .context("Failed to prepare list_queue")?;
        let rows = stmt
            .query_map([], queue_item_from_row)
            .context("Failed to query queue")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read queue row")?.into_queue_item()?);
        }
        Ok(items)
    }

    /// Transactionally lease a queue item: delete the queue row and create
    /// the active-run in one commit. Returns false when another assigner
    /// claimed the row first.
    pub fn claim_queue_item(&mut self, queue_id: i64, lease: &ActiveRun) -> Result<bool> {
        let tx = self.conn.transaction().context("Failed to open transaction")?;
        let deleted = tx
            .execute("DELETE FROM queue WHERE id = ?1", params![queue_id])
            .context("Failed to delete queue row")?;
        if deleted == 0 {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO active_run
                (log_id, queue_id, codebase, campaign, command, worker, backchannel,
                 start_time, estimated_duration_secs, last_heartbeat, mia_count,
                 vcs_info, change_set, resume_from, refresh)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?12, ?13, ?14)",
            params![
                lease.log_id,
                lease.queue_id,
                lease.codebase,
                lease.campaign,
                lease.command,
                lease.worker,
                lease
                    .backchannel
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("Failed to serialize backchannel")?,
                lease.start_time.to_rfc3339(),
                lease.estimated_duration_secs,
                lease.last_heartbeat.to_rfc3339(),
                serde_json::to_string(&lease.vcs_info)
                    .context("Failed to serialize vcs info")?,
                lease.change_set,
                lease.resume_from,
                lease.refresh as i64,
            ],
        )
        .context("Failed to insert active run")?;
        tx.commit().context("Failed to commit lease")?;
        Ok(true)
    }

    pub fn get_active_run(&self, log_id: &str) -> Result<Option<ActiveRun>> {
        self.conn
            .query_row(
                "SELECT log_id, queue_id, codebase, campaign, command, worker, backchannel,
                        start_time, estimated_duration_secs, last_heartbeat, mia_count,
                        vcs_info, change_set, resume_from, refresh
                 FROM active_run WHERE log_id = ?1",
                params![log_id],
                active_run_from_row,
            )
            .optional()
            .context("Failed to query active run")?
            .map(ActiveRunRow::into_active_run)
            .transpose()
    }

    pub fn list_active_runs(&self) -> Result<Vec<ActiveRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT log_id, queue_id, codebase, campaign, command, worker, backchannel,
                        start_time, estimated_duration_secs, last_heartbeat, mia_count,
                        vcs_info, change_set, resume_from, refresh
                 FROM active_run ORDER BY start_time",
            )
            .context("Failed to prepare list_active_runs")?;
        let rows = stmt
            .query_map([], active_run_from_row)
            .context("Failed to query active runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read active run row")?.into_active_run()?);
        }
        Ok(runs)
    }

    pub fn record_heartbeat(&self, log_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE active_run SET last_heartbeat = ?1, mia_count = 0 WHERE log_id = ?2",
                params![at.to_rfc3339(), log_id],
            )
            .context("Failed to record heartbeat")?;
        Ok(count > 0)
    }

    pub fn increment_mia(&self, log_id: &str) -> Result<i64> {
        self.conn
            .execute(
                "UPDATE active_run SET mia_count = mia_count + 1 WHERE log_id = ?1",
                params![log_id],
            )
            .context("Failed to increment mia count")?;
        self.conn
            .query_row(
                "SELECT mia_count FROM active_run WHERE log_id = ?1",
                params![log_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read mia count")?
            .context("Active run vanished while counting mia sweeps")
    }

    // ── Runs ──────────────────────────────────────────────────────────

    /// Persist a finished run in one transaction: insert the run row and
    /// its result branches, delete the originating lease, and recompute
    /// the change-set state.
    pub fn record_run(&mut self, run: &Run, branches: &[ResultBranch]) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to open transaction")?;
        if let Some(cs) = &run.change_set {
            tx.execute(
                "INSERT INTO change_set (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
                params![cs],
            )
            .context("Failed to ensure change set")?;
        }
        tx.execute(
            "INSERT INTO run
                (id, codebase, campaign, command, start_time, finish_time, result_code,
                 failure_stage, failure_transient, description, revision,
                 main_branch_revision, worker, logfilenames, result, value,
                 publish_status, resume_from, change_set)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19)",
            params![
                run.id,
                run.codebase,
                run.campaign,
                run.command,
                run.start_time.to_rfc3339(),
                run.finish_time.to_rfc3339(),
                run.result_code,
                run.failure_stage,
                run.failure_transient.map(|b| b as i64),
                run.description,
                run.revision,
                run.main_branch_revision,
                run.worker,
                serde_json::to_string(&run.logfilenames)
                    .context("Failed to serialize logfilenames")?,
                run.result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()
                    .context("Failed to serialize result payload")?,
                run.value,
                run.publish_status.as_str(),
                run.resume_from,
                run.change_set,
            ],
        )
        .context("Failed to insert run")?;
        for branch in branches {
            tx.execute(
                "INSERT INTO result_branch
                    (run_id, role, remote_name, base_revision, revision, absorbed)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id,
                    branch.role,
                    branch.remote_name,
                    branch.base_revision,
                    branch.revision,
                    branch.absorbed as i64,
                ],
            )
            .context("Failed to insert result branch")?;
        }
        tx.execute("DELETE FROM active_run WHERE log_id = ?1", params![run.id])
            .context("Failed to delete lease")?;
        if let Some(cs) = &run.change_set {
            views::recompute_change_set_state(&tx, cs)?;
        }
        tx.commit().context("Failed to commit run")?;
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", RUN_SELECT),
                params![id],
                run_from_row,
            )
            .optional()
            .context("Failed to query run")?
            .map(RunRow::into_run)
            .transpose()
    }

    pub fn set_run_publish_status(&self, id: &str, status: PublishStatus) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE run SET publish_status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update publish status")?;
        Ok(count > 0)
    }

    pub fn get_result_branches(&self, run_id: &str) -> Result<Vec<ResultBranch>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, role, remote_name, base_revision, revision, absorbed
                 FROM result_branch WHERE run_id = ?1 ORDER BY role",
            )
            .context("Failed to prepare get_result_branches")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(ResultBranch {
                    run_id: row.get(0)?,
                    role: row.get(1)?,
                    remote_name: row.get(2)?,
                    base_revision: row.get(3)?,
                    revision: row.get(4)?,
                    absorbed: row.get::<_, i64>(5)? != 0,
                })
            })
            .context("Failed to query result branches")?;
        let mut branches = Vec::new();
        for row in rows {
            branches.push(row.context("Failed to read result branch row")?);
        }
        Ok(branches)
    }

    /// Mark a result branch absorbed and recompute the owning change set.
    pub fn absorb_result_branch(&mut self, run_id: &str, role: &str) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to open transaction")?;
        tx.execute(
            "UPDATE result_branch SET absorbed = 1 WHERE run_id = ?1 AND role = ?2",
            params![run_id, role],
        )
        .context("Failed to mark branch absorbed")?;
        let change_set: Option<String> = tx
            .query_row(
                "SELECT change_set FROM run WHERE id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read run change set")?
            .flatten();
        if let Some(cs) = change_set {
            views::recompute_change_set_state(&tx, &cs)?;
        }
        tx.commit().context("Failed to commit absorption")?;
        Ok(())
    }

    /// Mean duration of the most recent runs for a codebase/campaign pair.
    pub fn estimate_duration(&self, codebase: &str, campaign: &str) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT CAST(AVG(strftime('%s', finish_time) - strftime('%s', start_time))
                             AS INTEGER)
                 FROM (SELECT start_time, finish_time FROM run
                       WHERE codebase = ?1 AND campaign = ?2
                       ORDER BY start_time DESC LIMIT 5)",
                params![codebase, campaign],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to estimate duration")
            .map(Option::flatten)
    }

    // ── Publishes ─────────────────────────────────────────────────────

    pub fn insert_publish(&self, publish: &NewPublish) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO publish
                    (timestamp, change_set, codebase, campaign, role, mode,
                     source_branch_url, target_branch_url, revision,
                     merge_proposal_url, result_code, description, requester)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    publish.timestamp.to_rfc3339(),
                    publish.change_set,
                    publish.codebase,
                    publish.campaign,
                    publish.role,
                    publish.mode.as_str(),
                    publish.source_branch_url,
                    publish.target_branch_url,
                    publish.revision,
                    publish.merge_proposal_url,
                    publish.result_code,
                    publish.description,
                    publish.requester,
                ],
            )
            .context("Failed to insert publish")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_publishes(&self, codebase: &str, campaign: &str) -> Result<Vec<Publish>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE codebase = ?1 AND campaign = ?2 ORDER BY timestamp",
                PUBLISH_SELECT
            ))
            .context("Failed to prepare list_publishes")?;
        let rows = stmt
            .query_map(params![codebase, campaign], publish_from_row)
            .context("Failed to query publishes")?;
        let mut publishes = Vec::new();
        for row in rows {
            publishes.push(row.context("Failed to read publish row")?.into_publish()?);
        }
        Ok(publishes)
    }

    pub fn latest_publish_for_mp(&self, url: &str) -> Result<Option<Publish>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE merge_proposal_url = ?1 AND mode = 'propose'
                     ORDER BY timestamp DESC LIMIT 1",
                    PUBLISH_SELECT
                ),
                params![url],
                publish_from_row,
            )
            .optional()
            .context("Failed to query publish for merge proposal")?
            .map(PublishRow::into_publish)
            .transpose()
    }

    /// Failed publish attempts for a target since its last success, plus
    /// the timestamp of the most recent attempt. `nothing-to-do` outcomes
    /// are not failures and do not count.
    pub fn failed_attempts_since_success(
        &self,
        codebase: &str,
        campaign: &str,
        role: &str,
    ) -> Result<(u32, Option<DateTime<Utc>>)> {
        let last_success: Option<String> = self
            .conn
            .query_row(
                "SELECT MAX(timestamp) FROM publish
                 WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(role, '') = ?3
                   AND result_code = 'success'",
                params![codebase, campaign, role],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query last publish success")?
            .flatten();
        let floor = last_success.unwrap_or_default();
        let (count, latest): (u32, Option<String>) = self
            .conn
            .query_row(
                "SELECT COUNT(*), MAX(timestamp) FROM publish
                 WHERE codebase = ?1 AND campaign = ?2 AND IFNULL(role, '') = ?3
                   AND result_code NOT IN ('success', 'nothing-to-do')
                   AND timestamp > ?4",
                params![codebase, campaign, role, floor],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to count failed publish attempts")?;
        Ok((count, latest.map(|t| parse_utc(&t)).transpose()?))
    }

    /// Successful push-family publishes within the trailing period.
    pub fn count_recent_pushes(&self, period: Duration) -> Result<u32> {
        let floor = (Utc::now() - period).to_rfc3339();
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM publish
                 WHERE mode IN ('push', 'push-derived', 'attempt-push')
                   AND result_code = 'success' AND timestamp > ?1",
                params![floor],
                |row| row.get(0),
            )
            .context("Failed to count recent pushes")
    }

    // ── Merge proposals ───────────────────────────────────────────────

    pub fn upsert_merge_proposal(&self, mp: &MergeProposal) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO merge_proposal
                    (url, codebase, target_branch_url, status, revision, merged_by,
                     merged_at, last_scanned, can_be_merged, rate_limit_bucket)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(url) DO UPDATE SET
                    codebase = ?2, target_branch_url = ?3, status = ?4, revision = ?5,
                    merged_by = ?6, merged_at = ?7, last_scanned = ?8,
                    can_be_merged = ?9, rate_limit_bucket = ?10",
                params![
                    mp.url,
                    mp.codebase,
                    mp.target_branch_url,
                    mp.status.as_str(),
                    mp.revision,
                    mp.merged_by,
                    mp.merged_at.map(|t| t.to_rfc3339()),
                    mp.last_scanned.map(|t| t.to_rfc3339()),
                    mp.can_be_merged.map(|b| b as i64),
                    mp.rate_limit_bucket,
                ],
            )
            .context("Failed to upsert merge proposal")?;
        Ok(())
    }

    pub fn get_merge_proposal(&self, url: &str) -> Result<Option<MergeProposal>> {
        self.conn
            .query_row(
                &format!("{} WHERE url = ?1", MP_SELECT),
                params![url],
                mp_from_row,
            )
            .optional()
            .context("Failed to query merge proposal")?
            .map(MpRow::into_merge_proposal)
            .transpose()
    }

    /// Merge proposals, optionally filtered by the campaign that published
    /// them (via the publish table) or by status.
    pub fn list_merge_proposals(
        &self,
        campaign: Option<&str>,
        status: Option<MergeProposalStatus>,
    ) -> Result<Vec<MergeProposal>> {
        let mut sql = String::from(
            "SELECT DISTINCT m.url, m.codebase, m.target_branch_url, m.status, m.revision,
                    m.merged_by, m.merged_at, m.last_scanned, m.can_be_merged,
                    m.rate_limit_bucket
             FROM merge_proposal m",
        );
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(campaign) = campaign {
            sql.push_str(" JOIN publish p ON p.merge_proposal_url = m.url");
            clauses.push(format!("p.campaign = ?{}", args.len() + 1));
            args.push(Box::new(campaign.to_string()));
        }
        if let Some(status) = status {
            clauses.push(format!("m.status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY m.url");
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_merge_proposals")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), mp_from_row)
            .context("Failed to query merge proposals")?;
        let mut mps = Vec::new();
        for row in rows {
            mps.push(row.context("Failed to read merge proposal row")?.into_merge_proposal()?);
        }
        Ok(mps)
    }

    /// Open proposals plus any whose last scan is older than the threshold.
    pub fn merge_proposals_to_scan(&self, stale_before: DateTime<Utc>) -> Result<Vec<MergeProposal>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE status = 'open' OR last_scanned IS NULL OR last_scanned < ?1
                 ORDER BY IFNULL(last_scanned, '')",
                MP_SELECT
            ))
            .context("Failed to prepare merge_proposals_to_scan")?;
        let rows = stmt
            .query_map(params![stale_before.to_rfc3339()], mp_from_row)
            .context("Failed to query merge proposals to scan")?;
        let mut mps = Vec::new();
        for row in rows {
            mps.push(row.context("Failed to read merge proposal row")?.into_merge_proposal()?);
        }
        Ok(mps)
    }

    pub fn open_mp_count_for_bucket(&self, bucket: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM merge_proposal
                 WHERE status = 'open' AND rate_limit_bucket = ?1",
                params![bucket],
                |row| row.get(0),
            )
            .context("Failed to count open proposals for bucket")
    }

    pub fn open_mp_counts_by_bucket(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT IFNULL(rate_limit_bucket, ''), COUNT(*) FROM merge_proposal
                 WHERE status = 'open' GROUP BY rate_limit_bucket ORDER BY 1",
            )
            .context("Failed to prepare open_mp_counts_by_bucket")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to query bucket counts")?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row.context("Failed to read bucket count row")?);
        }
        Ok(counts)
    }

    /// True when any merge proposal in the target's publish chain was
    /// rejected by the maintainer.
    pub fn has_rejected_mp(&self, codebase: &str, campaign: &str, role: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM merge_proposal m
                 JOIN publish p ON p.merge_proposal_url = m.url
                 WHERE p.codebase = ?1 AND p.campaign = ?2 AND IFNULL(p.role, '') = ?3
                   AND m.status = 'rejected'",
                params![codebase, campaign, role],
                |row| row.get(0),
            )
            .context("Failed to query rejected proposals")?;
        Ok(count > 0)
    }

    /// Locate the run owning the result branch a publish delivered,
    /// matching on the branch revision.
    pub fn find_run_for_branch(
        &self,
        codebase: &str,
        campaign: &str,
        role: &str,
        revision: &str,
    ) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT b.run_id FROM result_branch b JOIN run r ON r.id = b.run_id
                 WHERE r.codebase = ?1 AND r.campaign = ?2 AND b.role = ?3 AND b.revision = ?4
                 ORDER BY r.start_time DESC LIMIT 1",
                params![codebase, campaign, role, revision],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to locate run for branch revision")
    }

    // ── Change sets ───────────────────────────────────────────────────

    pub fn ensure_change_set(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO change_set (id) VALUES (?1) ON CONFLICT(id) DO NOTHING",
                params![id],
            )
            .context("Failed to ensure change set")?;
        Ok(())
    }

    pub fn get_change_set(&self, id: &str) -> Result<Option<ChangeSet>> {
        self.conn
            .query_row(
                "SELECT id, state FROM change_set WHERE id = ?1",
                params![id],
                |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                },
            )
            .optional()
            .context("Failed to query change set")?
            .map(|(id, state)| {
                Ok(ChangeSet {
                    id,
                    state: ChangeSetState::from_str(&state)
                        .map_err(|e| anyhow::anyhow!(e))
                        .context("Failed to parse change set state")?,
                })
            })
            .transpose()
    }

    // ── Policies ──────────────────────────────────────────────────────

    /// Replace all rules for a named policy.
    pub fn put_policy(&mut self, name: &str, rules: &[PolicyRule]) -> Result<()> {
        let tx = self.conn.transaction().context("Failed to open transaction")?;
        tx.execute("DELETE FROM policy WHERE name = ?1", params![name])
            .context("Failed to clear policy")?;
        for rule in rules {
            tx.execute(
                "INSERT INTO policy
                    (name, role, mode, frequency_days, rate_limit_bucket, max_open_mps)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    name,
                    rule.role,
                    rule.mode.as_str(),
                    rule.frequency_days,
                    rule.rate_limit_bucket,
                    rule.max_open_mps,
                ],
            )
            .context("Failed to insert policy rule")?;
        }
        tx.commit().context("Failed to commit policy")?;
        Ok(())
    }

    pub fn get_policy(&self, name: &str) -> Result<Vec<PolicyRule>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, role, mode, frequency_days, rate_limit_bucket, max_open_mps
                 FROM policy WHERE name = ?1 ORDER BY role",
            )
            .context("Failed to prepare get_policy")?;
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
            .context("Failed to query policy")?;
        let mut rules = Vec::new();
        for row in rows {
            let (name, role, mode, frequency_days, rate_limit_bucket, max_open_mps) =
                row.context("Failed to read policy row")?;
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

    // ── Workers ───────────────────────────────────────────────────────

    pub fn upsert_worker(&self, worker: &Worker) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO worker (name, password, link) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET password = ?2, link = ?3",
                params![worker.name, worker.password, worker.link],
            )
            .context("Failed to upsert worker")?;
        Ok(())
    }

    pub fn get_worker(&self, name: &str) -> Result<Option<Worker>> {
        self.conn
            .query_row(
                "SELECT name, password, link FROM worker WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Worker {
                        name: row.get(0)?,
                        password: row.get(1)?,
                        link: row.get(2)?,
                    })
                },
            )
            .optional()
            .context("Failed to query worker")
    }

    // ── Event log ─────────────────────────────────────────────────────

    pub fn append_event(&self, topic: &str, payload: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO event_log (timestamp, topic, payload) VALUES (?1, ?2, ?3)",
                params![
                    Utc::now().to_rfc3339(),
                    topic,
                    serde_json::to_string(payload).context("Failed to serialize event")?,
                ],
            )
            .context("Failed to append event")?;
        Ok(())
    }
}

/// Async handle over [`StateDb`]. Clones share one connection; closures run
/// on the blocking pool so DB work never stalls the reactor.
#[derive(Clone)]
pub struct Db {
    inner: Arc<Mutex<StateDb>>,
}

impl Db {
    pub fn new(state: StateDb) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StateDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut guard = inner
                .lock()
                .map_err(|_| anyhow::anyhow!("State database lock poisoned"))?;
            f(&mut guard)
        })
        .await
        .context("State database task panicked")?
    }

    /// Synchronous access for startup and tests.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StateDb>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("State database lock poisoned"))
    }
}

pub(crate) fn parse_utc(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in store: {raw}"))
        .map(|t| t.with_timezone(&Utc))
}

// ── Internal row helpers ──────────────────────────────────────────────

struct CodebaseRow {
    name: String,
    vcs_type: String,
    branch_url: String,
    subpath: Option<String>,
    web_url: Option<String>,
    value: i64,
    inactive: i64,
}

impl CodebaseRow {
    fn into_codebase(self) -> Result<Codebase> {
        Ok(Codebase {
            name: self.name,
            vcs_type: VcsType::from_str(&self.vcs_type)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse vcs type")?,
            branch_url: self.branch_url,
            subpath: self.subpath,
            web_url: self.web_url,
            value: self.value,
            inactive: self.inactive != 0,
        })
    }
}

struct QueueItemRow {
    id: i64,
    codebase: String,
    campaign: String,
    command: String,
    priority: i64,
    bucket: String,
    estimated_duration_secs: Option<i64>,
    change_set: Option<String>,
    requester: Option<String>,
    refresh: i64,
}

fn queue_item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueItemRow> {
    Ok(QueueItemRow {
        id: row.get(0)?,
        codebase: row.get(1)?,
        campaign: row.get(2)?,
        command: row.get(3)?,
        priority: row.get(4)?,
        bucket: row.get(5)?,
        estimated_duration_secs: row.get(6)?,
        change_set: row.get(7)?,
        requester: row.get(8)?,
        refresh: row.get(9)?,
    })
}

impl QueueItemRow {
    fn into_queue_item(self) -> Result<QueueItem> {
        Ok(QueueItem {
            id: self.id,
            codebase: self.codebase,
            campaign: self.campaign,
            command: self.command,
            priority: self.priority,
            bucket: QueueBucket::from_str(&self.bucket)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse queue bucket")?,
            estimated_duration_secs: self.estimated_duration_secs,
            change_set: self.change_set,
            requester: self.requester,
            refresh: self.refresh != 0,
        })
    }
}

struct ActiveRunRow {
    log_id: String,
    queue_id: i64,
    codebase: String,
    campaign: String,
    command: String,
    worker: String,
    backchannel: Option<String>,
    start_time: String,
    estimated_duration_secs: i64,
    last_heartbeat: String,
    mia_count: i64,
    vcs_info: String,
    change_set: Option<String>,
    resume_from: Option<String>,
    refresh: i64,
}

fn active_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActiveRunRow> {
    Ok(ActiveRunRow {
        log_id: row.get(0)?,
        queue_id: row.get(1)?,
        codebase: row.get(2)?,
        campaign: row.get(3)?,
        command: row.get(4)?,
        worker: row.get(5)?,
        backchannel: row.get(6)?,
        start_time: row.get(7)?,
        estimated_duration_secs: row.get(8)?,
        last_heartbeat: row.get(9)?,
        mia_count: row.get(10)?,
        vcs_info: row.get(11)?,
        change_set: row.get(12)?,
        resume_from: row.get(13)?,
        refresh: row.get(14)?,
    })
}

impl ActiveRunRow {
    fn into_active_run(self) -> Result<ActiveRun> {
        Ok(ActiveRun {
            log_id: self.log_id,
            queue_id: self.queue_id,
            codebase: self.codebase,
            campaign: self.campaign,
            command: self.command,
            worker: self.worker,
            backchannel: self
                .backchannel
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse backchannel JSON")?,
            start_time: parse_utc(&self.start_time)?,
            estimated_duration_secs: self.estimated_duration_secs,
            last_heartbeat: parse_utc(&self.last_heartbeat)?,
            mia_count: self.mia_count,
            vcs_info: serde_json::from_str(&self.vcs_info)
                .context("Failed to parse vcs info JSON")?,
            change_set: self.change_set,
            resume_from: self.resume_from,
            refresh: self.refresh != 0,
        })
    }
}

const RUN_SELECT: &str = "SELECT id, codebase, campaign, command, start_time, finish_time,
        result_code, failure_stage, failure_transient, description, revision,
        main_branch_revision, worker, logfilenames, result, value, publish_status,
        resume_from, change_set
 FROM run";

pub(crate) struct RunRow {
    id: String,
    codebase: String,
    campaign: String,
    command: String,
    start_time: String,
    finish_time: String,
    result_code: String,
    failure_stage: Option<String>,
    failure_transient: Option<i64>,
    description: Option<String>,
    revision: Option<String>,
    main_branch_revision: Option<String>,
    worker: Option<String>,
    logfilenames: String,
    result: Option<String>,
    value: Option<i64>,
    publish_status: String,
    resume_from: Option<String>,
    change_set: Option<String>,
}

pub(crate) fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        id: row.get(0)?,
        codebase: row.get(1)?,
        campaign: row.get(2)?,
        command: row.get(3)?,
        start_time: row.get(4)?,
        finish_time: row.get(5)?,
        result_code: row.get(6)?,
        failure_stage: row.get(7)?,
        failure_transient: row.get(8)?,
        description: row.get(9)?,
        revision: row.get(10)?,
        main_branch_revision: row.get(11)?,
        worker: row.get(12)?,
        logfilenames: row.get(13)?,
        result: row.get(14)?,
        value: row.get(15)?,
        publish_status: row.get(16)?,
        resume_from: row.get(17)?,
        change_set: row.get(18)?,
    })
}

impl RunRow {
    pub(crate) fn into_run(self) -> Result<Run> {
        Ok(Run {
            id: self.id,
            codebase: self.codebase,
            campaign: self.campaign,
            command: self.command,
            start_time: parse_utc(&self.start_time)?,
            finish_time: parse_utc(&self.finish_time)?,
            result_code: self.result_code,
            failure_stage: self.failure_stage,
            failure_transient: self.failure_transient.map(|v| v != 0),
            description: self.description,
            revision: self.revision,
            main_branch_revision: self.main_branch_revision,
            worker: self.worker,
            logfilenames: serde_json::from_str(&self.logfilenames)
                .context("Failed to parse logfilenames JSON")?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Failed to parse result JSON")?,
            value: self.value,
            publish_status: PublishStatus::from_str(&self.publish_status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse publish status")?,
            resume_from: self.resume_from,
            change_set: self.change_set,
        })
    }
}

const PUBLISH_SELECT: &str = "SELECT id, timestamp, change_set, codebase, campaign, role, mode,
        source_branch_url, target_branch_url, revision, merge_proposal_url,
        result_code, description, requester
 FROM publish";

struct PublishRow {
    id: i64,
    timestamp: String,
    change_set: Option<String>,
    codebase: String,
    campaign: String,
    role: Option<String>,
    mode: String,
    source_branch_url: Option<String>,
    target_branch_url: Option<String>,
    revision: Option<String>,
    merge_proposal_url: Option<String>,
    result_code: String,
    description: Option<String>,
    requester: Option<String>,
}

fn publish_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublishRow> {
    Ok(PublishRow {
        id: row.get(0)?,
        timestamp: row.get(1)?,
        change_set: row.get(2)?,
        codebase: row.get(3)?,
        campaign: row.get(4)?,
        role: row.get(5)?,
        mode: row.get(6)?,
        source_branch_url: row.get(7)?,
        target_branch_url: row.get(8)?,
        revision: row.get(9)?,
        merge_proposal_url: row.get(10)?,
        result_code: row.get(11)?,
        description: row.get(12)?,
        requester: row.get(13)?,
    })
}

impl PublishRow {
    fn into_publish(self) -> Result<Publish> {
        Ok(Publish {
            id: self.id,
            timestamp: parse_utc(&self.timestamp)?,
            change_set: self.change_set,
            codebase: self.codebase,
            campaign: self.campaign,
            role: self.role,
            mode: PublishMode::from_str(&self.mode)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse publish mode")?,
            source_branch_url: self.source_branch_url,
            target_branch_url: self.target_branch_url,
            revision: self.revision,
            merge_proposal_url: self.merge_proposal_url,
            result_code: self.result_code,
            description: self.description,
            requester: self.requester,
        })
    }
}

/// Publish row fields supplied by callers; id and row identity are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewPublish {
    pub timestamp: DateTime<Utc>,
    pub change_set: Option<String>,
    pub codebase: String,
    pub campaign: String,
    pub role: Option<String>,
    pub mode: PublishMode,
    pub source_branch_url: Option<String>,
    pub target_branch_url: Option<String>,
    pub revision: Option<String>,
    pub merge_proposal_url: Option<String>,
    pub result_code: String,
    pub description: Option<String>,
    pub requester: Option<String>,
}

const MP_SELECT: &str = "SELECT url, codebase, target_branch_url, status, revision, merged_by,
        merged_at, last_scanned, can_be_merged, rate_limit_bucket
 FROM merge_proposal";

struct MpRow {
    url: String,
    codebase: Option<String>,
    target_branch_url: Option<String>,
    status: String,
    revision: Option<String>,
    merged_by: Option<String>,
    merged_at: Option<String>,
    last_scanned: Option<String>,
    can_be_merged: Option<i64>,
    rate_limit_bucket: Option<String>,
}

fn mp_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MpRow> {
    Ok(MpRow {
        url: row.get(0)?,
        codebase: row.get(1)?,
        target_branch_url: row.get(2)?,
        status: row.get(3)?,
        revision: row.get(4)?,
        merged_by: row.get(5)?,
        merged_at: row.get(6)?,
        last_scanned: row.get(7)?,
        can_be_merged: row.get(8)?,
        rate_limit_bucket: row.get(9)?,
    })
}

impl MpRow {
    fn into_merge_proposal(self) -> Result<MergeProposal> {
        Ok(MergeProposal {
            url: self.url,
            codebase: self.codebase,
            target_branch_url: self.target_branch_url,
            status: MergeProposalStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!(e))
                .context("Failed to parse merge proposal status")?,
            revision: self.revision,
            merged_by: self.merged_by,
            merged_at: self.merged_at.as_deref().map(parse_utc).transpose()?,
            last_scanned: self.last_scanned.as_deref().map(parse_utc).transpose()?,
            can_be_merged: self.can_be_merged.map(|v| v != 0),
            rate_limit_bucket: self.rate_limit_bucket,
        })
    }
}
