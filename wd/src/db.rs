//! Workflow databases
//!
//! Two SQLite files: the private DB under the service directory is the
//! source of truth for restarts; the public DB under the log directory is
//! a read-only copy for external tools. All writes go through an internal
//! queue that the main loop flushes once per tick, to both databases. If
//! the public DB is found corrupted it is replaced wholesale by a copy of
//! the private one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::pool::TaskPoolRow;

// workflow_params keys.
pub const KEY_UUID: &str = "uuid_str";
pub const KEY_PAUSED: &str = "is_paused";
pub const KEY_INITIAL_POINT: &str = "icp";
pub const KEY_FINAL_POINT: &str = "fcp";
pub const KEY_STOP_POINT: &str = "stopcp";
pub const KEY_STOP_CLOCK_TIME: &str = "stop_clock_time";
pub const KEY_STOP_TASK: &str = "stop_task";
pub const KEY_HOLD_POINT: &str = "holdcp";
pub const KEY_RUN_MODE: &str = "run_mode";
pub const KEY_UTC_MODE: &str = "UTC_mode";
pub const KEY_CYCLE_POINT_TZ: &str = "cycle_point_tz";

/// One row of the `task_jobs` table.
#[derive(Debug, Clone, Default)]
pub struct TaskJobRow {
    pub point: String,
    pub name: String,
    pub submit_num: u32,
    pub platform: String,
    pub job_runner: String,
    pub job_id: String,
    pub time_submit: Option<String>,
    pub time_run_start: Option<String>,
    pub time_run_exit: Option<String>,
    pub run_status: Option<i32>,
    pub elapsed_secs: Option<i64>,
}

/// A queued write.
#[derive(Debug, Clone)]
pub enum DbOp {
    PutWorkflowParam { key: String, value: String },
    DeleteWorkflowParam { key: String },
    PutTemplateVar { key: String, value: String },
    /// Full replacement of the task pool table.
    PutTaskPool(Vec<TaskPoolRow>),
    PutTaskJob(TaskJobRow),
    PutTaskActionTimer { point: String, name: String, kind: String, due: String },
    DeleteTaskActionTimer { point: String, name: String },
    PutXtrigger { signature: String },
    PutAbsOutput { point: String, name: String, output: String },
    PutBroadcastState { point: String, namespace: String, settings: String },
    PutTaskLateFlag { point: String, name: String },
}

pub struct DatabaseManager {
    pri_path: PathBuf,
    pub_path: PathBuf,
    pri: Connection,
    public: Connection,
    queue: Vec<DbOp>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflow_params (key TEXT PRIMARY KEY, value TEXT);
CREATE TABLE IF NOT EXISTS workflow_template_vars (key TEXT PRIMARY KEY, value TEXT);
CREATE TABLE IF NOT EXISTS task_pool (
    cycle TEXT, name TEXT, status TEXT, flow_nums TEXT,
    submit_num INTEGER, is_held INTEGER, outputs TEXT,
    PRIMARY KEY (cycle, name));
CREATE TABLE IF NOT EXISTS task_jobs (
    cycle TEXT, name TEXT, submit_num INTEGER,
    platform TEXT, job_runner TEXT, job_id TEXT,
    time_submit TEXT, time_run_start TEXT, time_run_exit TEXT,
    run_status INTEGER, elapsed_secs INTEGER,
    PRIMARY KEY (cycle, name, submit_num));
CREATE TABLE IF NOT EXISTS task_action_timers (
    cycle TEXT, name TEXT, kind TEXT, due TEXT,
    PRIMARY KEY (cycle, name));
CREATE TABLE IF NOT EXISTS xtriggers (signature TEXT PRIMARY KEY);
CREATE TABLE IF NOT EXISTS abs_outputs (cycle TEXT, name TEXT, output TEXT);
CREATE TABLE IF NOT EXISTS broadcast_states (
    point TEXT, namespace TEXT, settings TEXT,
    PRIMARY KEY (point, namespace));
CREATE TABLE IF NOT EXISTS task_late_flags (
    cycle TEXT, name TEXT, value INTEGER,
    PRIMARY KEY (cycle, name));
";

impl DatabaseManager {
    /// Open (creating if needed) both databases.
    pub fn new(pri_path: PathBuf, pub_path: PathBuf) -> Result<Self> {
        for path in [&pri_path, &pub_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("failed to create database directory")?;
            }
        }
        let pri = Connection::open(&pri_path).context("failed to open private database")?;
        let public = Connection::open(&pub_path).context("failed to open public database")?;
        pri.execute_batch(SCHEMA)?;
        public.execute_batch(SCHEMA)?;
        debug!(pri = %pri_path.display(), public = %pub_path.display(), "databases open");
        Ok(Self {
            pri_path,
            pub_path,
            pri,
            public,
            queue: Vec::new(),
        })
    }

    /// Whether a private DB already exists at the path (restart check).
    pub fn exists(pri_path: &Path) -> bool {
        pri_path.is_file()
    }

    /// Queue a write for the next flush.
    pub fn put(&mut self, op: DbOp) {
        self.queue.push(op);
    }

    pub fn has_queued_ops(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Flush the write queue to both databases.
    pub fn process_queued_ops(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.queue);
        debug!(ops = ops.len(), "flushing database queue");
        for conn in [&mut self.pri, &mut self.public] {
            let tx = conn.transaction()?;
            for op in &ops {
                apply_op(&tx, op)?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    /// If the public DB is unreadable, replace it with a copy of the
    /// private one.
    pub fn recover_pub_from_pri(&mut self) -> Result<()> {
        let healthy = self
            .public
            .query_row("SELECT count(*) FROM workflow_params", [], |row| row.get::<_, i64>(0))
            .is_ok();
        if healthy {
            return Ok(());
        }
        warn!("public database corrupted, recovering from private");
        // Swap in a throwaway connection so the file can be replaced.
        let stub = Connection::open_in_memory()?;
        let old = std::mem::replace(&mut self.public, stub);
        drop(old);
        std::fs::copy(&self.pri_path, &self.pub_path).context("failed to copy private database")?;
        self.public = Connection::open(&self.pub_path)?;
        info!("public database recovered");
        Ok(())
    }

    /// Final flush on shutdown.
    pub fn on_workflow_shutdown(&mut self) -> Result<()> {
        self.process_queued_ops()
    }

    // === Restart reads (private DB) ===

    pub fn select_workflow_params(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.pri.prepare("SELECT key, value FROM workflow_params")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_template_vars(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.pri.prepare("SELECT key, value FROM workflow_template_vars")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_task_pool_for_restart(&self) -> Result<Vec<TaskPoolRow>> {
        let mut stmt = self.pri.prepare(
            "SELECT cycle, name, status, flow_nums, submit_num, is_held, outputs FROM task_pool",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let flow_nums: String = row.get(3)?;
                let outputs: String = row.get(6)?;
                Ok(TaskPoolRow {
                    point: row.get(0)?,
                    name: row.get(1)?,
                    status: row.get(2)?,
                    flow_nums: flow_nums
                        .split(',')
                        .filter_map(|s| s.parse().ok())
                        .collect(),
                    submit_num: row.get(4)?,
                    is_held: row.get::<_, i64>(5)? != 0,
                    outputs: outputs
                        .split('\x1f')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Elapsed run times of past successful jobs, grouped per task name,
    /// oldest first.
    pub fn select_task_run_times(&self) -> Result<HashMap<String, Vec<i64>>> {
        let mut stmt = self.pri.prepare(
            "SELECT name, elapsed_secs FROM task_jobs
             WHERE run_status = 0 AND elapsed_secs IS NOT NULL ORDER BY rowid",
        )?;
        let mut times: HashMap<String, Vec<i64>> = HashMap::new();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (name, secs) = row?;
            times.entry(name).or_default().push(secs);
        }
        Ok(times)
    }

    pub fn select_task_action_timers(&self) -> Result<Vec<(String, String, String, String)>> {
        let mut stmt = self
            .pri
            .prepare("SELECT cycle, name, kind, due FROM task_action_timers")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_xtriggers(&self) -> Result<Vec<String>> {
        let mut stmt = self.pri.prepare("SELECT signature FROM xtriggers")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn select_broadcast_states(&self) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self
            .pri
            .prepare("SELECT point, namespace, settings FROM broadcast_states")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn apply_op(tx: &rusqlite::Transaction<'_>, op: &DbOp) -> Result<()> {
    match op {
        DbOp::PutWorkflowParam { key, value } => {
            tx.execute(
                "INSERT OR REPLACE INTO workflow_params (key, value) VALUES (?1, ?2)",
                (key, value),
            )?;
        }
        DbOp::DeleteWorkflowParam { key } => {
            tx.execute("DELETE FROM workflow_params WHERE key = ?1", (key,))?;
        }
        DbOp::PutTemplateVar { key, value } => {
            tx.execute(
                "INSERT OR REPLACE INTO workflow_template_vars (key, value) VALUES (?1, ?2)",
                (key, value),
            )?;
        }
        DbOp::PutTaskPool(rows) => {
            tx.execute("DELETE FROM task_pool", [])?;
            for row in rows {
                let flow_nums = row
                    .flow_nums
                    .iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                tx.execute(
                    "INSERT INTO task_pool (cycle, name, status, flow_nums, submit_num, is_held, outputs)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    (
                        &row.point,
                        &row.name,
                        &row.status,
                        flow_nums,
                        row.submit_num,
                        row.is_held as i64,
                        row.outputs.join("\x1f"),
                    ),
                )?;
            }
        }
        DbOp::PutTaskJob(row) => {
            tx.execute(
                "INSERT OR REPLACE INTO task_jobs
                 (cycle, name, submit_num, platform, job_runner, job_id,
                  time_submit, time_run_start, time_run_exit, run_status, elapsed_secs)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                (
                    &row.point,
                    &row.name,
                    row.submit_num,
                    &row.platform,
                    &row.job_runner,
                    &row.job_id,
                    &row.time_submit,
                    &row.time_run_start,
                    &row.time_run_exit,
                    row.run_status,
                    row.elapsed_secs,
                ),
            )?;
        }
        DbOp::PutTaskActionTimer { point, name, kind, due } => {
            tx.execute(
                "INSERT OR REPLACE INTO task_action_timers (cycle, name, kind, due) VALUES (?1, ?2, ?3, ?4)",
                (point, name, kind, due),
            )?;
        }
        DbOp::DeleteTaskActionTimer { point, name } => {
            tx.execute(
                "DELETE FROM task_action_timers WHERE cycle = ?1 AND name = ?2",
                (point, name),
            )?;
        }
        DbOp::PutXtrigger { signature } => {
            tx.execute("INSERT OR REPLACE INTO xtriggers (signature) VALUES (?1)", (signature,))?;
        }
        DbOp::PutAbsOutput { point, name, output } => {
            tx.execute(
                "INSERT INTO abs_outputs (cycle, name, output) VALUES (?1, ?2, ?3)",
                (point, name, output),
            )?;
        }
        DbOp::PutBroadcastState { point, namespace, settings } => {
            tx.execute(
                "INSERT OR REPLACE INTO broadcast_states (point, namespace, settings) VALUES (?1, ?2, ?3)",
                (point, namespace, settings),
            )?;
        }
        DbOp::PutTaskLateFlag { point, name } => {
            tx.execute(
                "INSERT OR REPLACE INTO task_late_flags (cycle, name, value) VALUES (?1, ?2, 1)",
                (point, name),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> DatabaseManager {
        DatabaseManager::new(dir.path().join(".service/db"), dir.path().join("log/db")).unwrap()
    }

    #[test]
    fn test_params_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        db.put(DbOp::PutWorkflowParam {
            key: KEY_UUID.into(),
            value: "abc".into(),
        });
        db.put(DbOp::PutWorkflowParam {
            key: KEY_PAUSED.into(),
            value: "1".into(),
        });
        db.put(DbOp::DeleteWorkflowParam { key: KEY_PAUSED.into() });
        db.process_queued_ops().unwrap();
        let params = db.select_workflow_params().unwrap();
        assert_eq!(params, vec![(KEY_UUID.to_string(), "abc".to_string())]);
    }

    #[test]
    fn test_task_pool_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        db.put(DbOp::PutTaskPool(vec![TaskPoolRow {
            point: "1".into(),
            name: "foo".into(),
            status: "running".into(),
            flow_nums: vec![1, 3],
            submit_num: 2,
            is_held: true,
            outputs: vec!["submitted".into(), "started".into()],
        }]));
        db.process_queued_ops().unwrap();
        let rows = db.select_task_pool_for_restart().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].flow_nums, vec![1, 3]);
        assert!(rows[0].is_held);
        assert_eq!(rows[0].outputs, vec!["submitted".to_string(), "started".to_string()]);
        // Full replace on next put.
        db.put(DbOp::PutTaskPool(vec![]));
        db.process_queued_ops().unwrap();
        assert!(db.select_task_pool_for_restart().unwrap().is_empty());
    }

    #[test]
    fn test_run_times_grouped_by_name() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        for (submit, secs) in [(1u32, 10i64), (2, 20)] {
            db.put(DbOp::PutTaskJob(TaskJobRow {
                point: "1".into(),
                name: "foo".into(),
                submit_num: submit,
                run_status: Some(0),
                elapsed_secs: Some(secs),
                ..Default::default()
            }));
        }
        db.put(DbOp::PutTaskJob(TaskJobRow {
            point: "1".into(),
            name: "bar".into(),
            submit_num: 1,
            run_status: Some(1),
            elapsed_secs: Some(99),
            ..Default::default()
        }));
        db.process_queued_ops().unwrap();
        let times = db.select_task_run_times().unwrap();
        assert_eq!(times["foo"], vec![10, 20]);
        // Failed jobs do not contribute run times.
        assert!(!times.contains_key("bar"));
    }

    #[test]
    fn test_recover_pub_from_pri() {
        let dir = TempDir::new().unwrap();
        let mut db = open(&dir);
        db.put(DbOp::PutWorkflowParam {
            key: "k".into(),
            value: "v".into(),
        });
        db.process_queued_ops().unwrap();
        // Wreck the public database underneath the open connection.
        let pub_path = dir.path().join("log/db");
        let stub = Connection::open_in_memory().unwrap();
        drop(std::mem::replace(&mut db.public, stub));
        std::fs::write(&pub_path, b"garbage").unwrap();
        db.public = Connection::open(&pub_path).unwrap();
        db.recover_pub_from_pri().unwrap();
        let count: i64 = db
            .public
            .query_row("SELECT count(*) FROM workflow_params", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_exists_restart_check() {
        let dir = TempDir::new().unwrap();
        let pri = dir.path().join(".service/db");
        assert!(!DatabaseManager::exists(&pri));
        let _db = open(&dir);
        assert!(DatabaseManager::exists(&pri));
    }
}
