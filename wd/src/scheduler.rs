//! The scheduler: startup, the main loop, and shutdown
//!
//! One `Scheduler` drives one workflow run. The main loop is the sole
//! writer of pool and data-store state; the server thread and helper
//! processes only ever feed the ingest queues. The tick order below is a
//! contract: commands and messages are drained at fixed points, and every
//! tick ends with persistence, publication, and the shutdown check.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastManager;
use crate::command::Command;
use crate::config::{RunOptions, WorkflowConfig};
use crate::cycling::CyclePoint;
use crate::datastore::{DataStore, WorkflowView};
use crate::db::{self, DatabaseManager, DbOp, TaskJobRow};
use crate::error::WorkflowError;
use crate::events::{RetryKind, RetryTimer, TaskEventsManager};
use crate::flow::FlowSpec;
use crate::jobs::TaskJobManager;
use crate::platform::Platform;
use crate::pool::TaskPool;
use crate::procpool::{ProcJobKind, SubProcPool, DEFAULT_POOL_SIZE};
use crate::queues::{ExtTriggerMsg, IngestQueue, TaskMsg};
use crate::server::{ContactFile, Server, ServerHandles};
use crate::status::{AutoRestartMode, RunMode, StopMode};
use crate::task::{TaskId, TaskStatus, parse_job_id};
use crate::timer::{Timer, WorkflowEvent};
use crate::xtrigger::XtriggerManager;

/// Nominal tick cadence.
pub const INTERVAL_MAIN_LOOP: Duration = Duration::from_secs(1);
/// Cadence while the subprocess pool has pending work.
pub const INTERVAL_MAIN_LOOP_QUICK: Duration = Duration::from_millis(500);
/// Re-issue poll+kill at this interval during a kill-stop.
pub const INTERVAL_STOP_KILL: Duration = Duration::from_secs(10);
/// Wait step while draining the subprocess pool at shutdown.
pub const INTERVAL_STOP_PROCESS_POOL_EMPTY: Duration = Duration::from_millis(500);
/// Sleep between auto-restart attempts.
pub const INTERVAL_AUTO_RESTART_ERROR: Duration = Duration::from_secs(5);
/// Auto-restart attempts before giving up.
const AUTO_RESTART_MAX_RETRIES: u32 = 3;

/// Ring of recent tick intervals kept for health reporting.
const MAIN_LOOP_INTERVALS: usize = 10;

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("workflow", &self.workflow).finish_non_exhaustive()
    }
}

pub struct Scheduler {
    // Identity.
    pub workflow: String,
    pub owner: String,
    pub host: String,
    pub uuid: String,
    run_dir: PathBuf,
    config_path: PathBuf,

    // Configuration.
    config: WorkflowConfig,
    options: RunOptions,
    run_mode: RunMode,
    pub is_restart: bool,

    // Managers.
    pool: TaskPool,
    proc_pool: SubProcPool,
    job_mgr: TaskJobManager,
    events_mgr: TaskEventsManager,
    xtrigger_mgr: XtriggerManager,
    broadcast_mgr: BroadcastManager,
    data_store: DataStore,
    db: DatabaseManager,
    timers: HashMap<WorkflowEvent, Timer>,

    // Queues.
    command_queue: IngestQueue<Command>,
    message_queue: IngestQueue<TaskMsg>,
    ext_trigger_queue: IngestQueue<ExtTriggerMsg>,

    // Server.
    server: Option<Server>,
    snapshot: Arc<RwLock<serde_json::Value>>,
    secret: String,

    // Run state.
    is_paused: bool,
    is_updated: bool,
    is_stalled: bool,
    is_reloaded: bool,
    pending_reload: Option<WorkflowConfig>,
    stop_mode: Option<StopMode>,
    stop_clock_time: Option<DateTime<Utc>>,
    time_next_kill: Option<DateTime<Utc>>,
    pub auto_restart_time: Option<DateTime<Utc>>,
    pub auto_restart_mode: Option<AutoRestartMode>,
    /// Install targets still completing remote init after a restart.
    incomplete_install: HashMap<String, Platform>,
    template_vars: Vec<(String, String)>,
    main_loop_intervals: VecDeque<Duration>,
}

impl Scheduler {
    /// Build a scheduler from a workflow configuration file.
    pub fn new(
        workflow: &str,
        config_path: &Path,
        run_dir: &Path,
        options: RunOptions,
    ) -> Result<Self, WorkflowError> {
        let config = WorkflowConfig::load(config_path)?;
        Self::with_config(workflow, config, config_path, run_dir, options)
    }

    /// Build a scheduler from an already-parsed configuration.
    pub fn with_config(
        workflow: &str,
        mut config: WorkflowConfig,
        config_path: &Path,
        run_dir: &Path,
        options: RunOptions,
    ) -> Result<Self, WorkflowError> {
        let pri_db = run_dir.join(".service").join("db");
        let is_restart = DatabaseManager::exists(&pri_db);
        check_startup_opts(&options, is_restart)?;

        // CLI overrides before anything reads the scheduling section.
        if let Some(icp) = &options.initial_cycle_point {
            config.scheduling.initial_cycle_point = Some(icp.parse()?);
        }
        if let Some(fcp) = &options.final_cycle_point {
            config.scheduling.final_cycle_point = Some(fcp.parse()?);
        }

        let db = DatabaseManager::new(pri_db, run_dir.join("log").join("db"))
            .map_err(WorkflowError::Unexpected)?;

        let mut uuid = Uuid::new_v4().to_string();
        let mut run_mode = options.run_mode.unwrap_or_default();
        let mut paused_start = options.paused_start;
        let mut restored_stop_point: Option<CyclePoint> = None;
        let mut restored_hold_point: Option<CyclePoint> = None;
        let mut restored_stop_task: Option<String> = None;
        let mut stop_clock_time: Option<DateTime<Utc>> = None;

        if is_restart {
            info!("LOADING workflow parameters");
            for (key, value) in db.select_workflow_params().map_err(WorkflowError::Unexpected)? {
                match key.as_str() {
                    db::KEY_UUID => {
                        info!("+ workflow UUID = {}", value);
                        uuid = value;
                    }
                    db::KEY_PAUSED => {
                        if paused_start.is_none() {
                            let paused = value == "1";
                            info!("+ paused = {}", paused);
                            paused_start = Some(paused);
                        }
                    }
                    db::KEY_RUN_MODE => {
                        if options.run_mode.is_none() {
                            if let Ok(mode) = serde_yaml::from_str::<RunMode>(&value) {
                                info!("+ run mode = {}", mode);
                                run_mode = mode;
                            }
                        }
                    }
                    db::KEY_STOP_POINT => {
                        if let Ok(point) = value.parse() {
                            info!("+ stop point = {}", value);
                            restored_stop_point = Some(point);
                        }
                    }
                    db::KEY_HOLD_POINT => {
                        if let Ok(point) = value.parse() {
                            info!("+ hold point = {}", value);
                            restored_hold_point = Some(point);
                        }
                    }
                    db::KEY_STOP_TASK => {
                        info!("+ stop task = {}", value);
                        restored_stop_task = Some(value);
                    }
                    db::KEY_STOP_CLOCK_TIME => {
                        if let Ok(time) = DateTime::parse_from_rfc3339(&value) {
                            let time = time.with_timezone(&Utc);
                            // A stop clock in the past is stale: ignore it.
                            if time > Utc::now() {
                                info!("+ stop clock time = {}", time);
                                stop_clock_time = Some(time);
                            } else {
                                debug!("- stop clock time = {} (ignored)", time);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        let defs = config.task_defs()?;
        let queue_limits: HashMap<String, usize> = config
            .scheduling
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), q.limit))
            .collect();
        let limit_interval = config
            .scheduling
            .default_interval
            .or_else(|| defs.values().find_map(|d| d.sequence.interval));
        let mut pool = TaskPool::new(
            defs,
            queue_limits,
            config.scheduling.runahead_limit,
            limit_interval,
            run_mode.is_simulation(),
        );

        let message_queue = IngestQueue::new();
        let mut platforms = config.platforms.clone();
        platforms
            .entry("localhost".to_string())
            .or_insert_with(Platform::localhost);
        let job_mgr = TaskJobManager::new(
            platforms,
            run_dir.join("log").join("job"),
            run_dir.join(".service"),
            run_mode.is_simulation(),
            message_queue.sender(),
        );

        let mut events_mgr = TaskEventsManager::new(run_mode.suppresses_event_handlers());
        let mut xtrigger_mgr = XtriggerManager::new(config.scheduling.xtriggers.clone());
        let mut broadcast_mgr = BroadcastManager::new();

        if is_restart {
            info!("LOADING task run times");
            for (name, times) in db.select_task_run_times().map_err(WorkflowError::Unexpected)? {
                events_mgr.load_run_times(&name, &times);
            }
            for row in db.select_task_pool_for_restart().map_err(WorkflowError::Unexpected)? {
                pool.load_db_task_pool_for_restart(row);
            }
            for (point, name, kind, due) in
                db.select_task_action_timers().map_err(WorkflowError::Unexpected)?
            {
                let Ok(point) = point.parse::<CyclePoint>() else { continue };
                let Ok(due) = DateTime::parse_from_rfc3339(&due) else { continue };
                let kind = if kind == "submission" {
                    RetryKind::Submission
                } else {
                    RetryKind::Execution
                };
                events_mgr.load_retry_timer(
                    TaskId::new(point, name),
                    RetryTimer {
                        due: due.with_timezone(&Utc),
                        kind,
                    },
                );
            }
            for signature in db.select_xtriggers().map_err(WorkflowError::Unexpected)? {
                xtrigger_mgr.load_satisfied(signature);
            }
            for (point, namespace, settings) in
                db.select_broadcast_states().map_err(WorkflowError::Unexpected)?
            {
                if let Ok(value) = serde_json::from_str(&settings) {
                    broadcast_mgr.load_broadcast_row(&point, &namespace, value);
                }
            }
        }

        let mut scheduler = Self {
            workflow: workflow.to_string(),
            owner: whoami(),
            host: hostname(),
            uuid,
            run_dir: run_dir.to_path_buf(),
            config_path: config_path.to_path_buf(),
            config,
            options,
            run_mode,
            is_restart,
            pool,
            proc_pool: SubProcPool::new(DEFAULT_POOL_SIZE),
            job_mgr,
            events_mgr,
            xtrigger_mgr,
            broadcast_mgr,
            data_store: DataStore::new(),
            db,
            timers: HashMap::new(),
            command_queue: IngestQueue::new(),
            message_queue,
            ext_trigger_queue: IngestQueue::new(),
            server: None,
            snapshot: Arc::new(RwLock::new(serde_json::Value::Null)),
            secret: String::new(),
            is_paused: false,
            is_updated: true,
            is_stalled: false,
            is_reloaded: false,
            pending_reload: None,
            stop_mode: None,
            stop_clock_time,
            time_next_kill: None,
            auto_restart_time: None,
            auto_restart_mode: None,
            incomplete_install: HashMap::new(),
            template_vars: Vec::new(),
            main_loop_intervals: VecDeque::with_capacity(MAIN_LOOP_INTERVALS),
        };

        scheduler.configure(
            restored_stop_point,
            restored_hold_point,
            restored_stop_task,
            paused_start,
        )?;
        Ok(scheduler)
    }

    fn configure(
        &mut self,
        restored_stop_point: Option<CyclePoint>,
        restored_hold_point: Option<CyclePoint>,
        restored_stop_task: Option<String>,
        paused_start: Option<bool>,
    ) -> Result<(), WorkflowError> {
        self.log_start();

        // Workflow timers.
        for (event, start_now) in [
            (WorkflowEvent::InactivityTimeout, true),
            (WorkflowEvent::WorkflowTimeout, true),
            (WorkflowEvent::StallTimeout, false),
        ] {
            if let Some(secs) = self.config.scheduler.events.timeout_for(event) {
                let mut timer = Timer::new(event, Duration::from_secs(secs.max(0) as u64));
                if start_now {
                    timer.reset();
                }
                self.timers.insert(event, timer);
            }
        }

        // Populate the pool.
        if self.is_restart {
            if let Some(task) = restored_stop_task {
                if let Ok(id) = task.parse() {
                    self.pool.set_stop_task(id);
                }
            }
            if let Some(point) = restored_stop_point {
                self.pool.set_stop_point(point);
            }
        } else if !self.options.start_tasks.is_empty() {
            let start_tasks = self.options.start_tasks.clone();
            info!(tasks = ?start_tasks, "start tasks");
            let descr = format!("original flow from {}", start_tasks.join(","));
            self.pool
                .force_trigger_tasks(&start_tasks, &FlowSpec::New, false, Some(&descr));
        } else {
            let initial = self.config.initial_point()?;
            let start = match &self.options.start_cycle_point {
                Some(startcp) => startcp.parse()?,
                None => initial,
            };
            let start_type = if start > initial { "Warm" } else { "Cold" };
            info!("{} start from {}", start_type, start);
            self.pool.load_from_point(start);
        }

        // Stop point from the CLI wins over anything restored.
        if let Some(stopcp) = &self.options.stop_cycle_point {
            let point = stopcp.parse()?;
            self.pool.set_stop_point(point);
        } else if let Some(point) = self.config.scheduling.stop_after_cycle_point {
            self.pool.set_stop_point(point);
        }

        // Hold point: CLI > restored > config.
        let hold_point = match &self.options.hold_after_cycle_point {
            Some(holdcp) => Some(holdcp.parse()?),
            None => restored_hold_point.or(self.config.scheduling.hold_after_cycle_point),
        };
        if let Some(point) = hold_point {
            self.command_set_hold_point(point)?;
        }

        if paused_start.unwrap_or(false) {
            info!("Paused on start up");
            self.pause_workflow();
        }

        // Template variables: the command line wins over stored values.
        let mut template_vars = self.options.template_vars.clone();
        if self.is_restart {
            for (key, value) in self.db.select_template_vars().map_err(WorkflowError::Unexpected)? {
                if !template_vars.iter().any(|(k, _)| *k == key) {
                    template_vars.push((key, value));
                }
            }
        }
        for (key, value) in &template_vars {
            self.db.put(DbOp::PutTemplateVar {
                key: key.clone(),
                value: value.clone(),
            });
        }
        self.template_vars = template_vars;

        self.job_mgr.set_workflow_env(self.workflow_env());
        self.put_workflow_params();
        self.db
            .process_queued_ops()
            .map_err(WorkflowError::Unexpected)?;

        let view = self.workflow_view();
        self.data_store.initiate_data_model(&self.pool, view);
        self.is_updated = true;
        Ok(())
    }

    fn log_start(&self) {
        info!("Workflow: {}", self.workflow);
        info!("Run mode: {}", self.run_mode);
        if let Some(point) = self.config.scheduling.initial_cycle_point {
            info!("Initial point: {}", point);
        }
        if let Some(point) = self.config.scheduling.final_cycle_point {
            info!("Final point: {}", point);
        }
        if let Some(point) = self.pool.stop_point() {
            info!("Stop point: {}", point);
        }
    }

    // === Accessors (used by the CLI surface and tests) ===

    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut TaskPool {
        &mut self.pool
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    pub fn is_stalled(&self) -> bool {
        self.is_stalled
    }

    pub fn stop_mode(&self) -> Option<StopMode> {
        self.stop_mode
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn command_sender(&self) -> tokio::sync::mpsc::UnboundedSender<Command> {
        self.command_queue.sender()
    }

    pub fn message_sender(&self) -> tokio::sync::mpsc::UnboundedSender<TaskMsg> {
        self.message_queue.sender()
    }

    pub fn ext_trigger_sender(&self) -> tokio::sync::mpsc::UnboundedSender<ExtTriggerMsg> {
        self.ext_trigger_queue.sender()
    }

    /// Average of the last few tick intervals.
    pub fn mean_main_loop_interval(&self) -> Option<Duration> {
        if self.main_loop_intervals.is_empty() {
            return None;
        }
        let total: Duration = self.main_loop_intervals.iter().sum();
        Some(total / self.main_loop_intervals.len() as u32)
    }

    // === Server ===

    /// Start the network interface and write the contact file.
    pub fn start_server(&mut self) -> Result<(), WorkflowError> {
        ContactFile::detect_old(&self.run_dir).map_err(|e| WorkflowError::Scheduler(e.to_string()))?;
        self.secret = load_or_create_secret(&self.run_dir).map_err(WorkflowError::Unexpected)?;
        let handles = ServerHandles {
            command_tx: self.command_queue.sender(),
            message_tx: self.message_queue.sender(),
            ext_trigger_tx: self.ext_trigger_queue.sender(),
            publish_tx: self.data_store.publish_sender(),
            snapshot: self.snapshot.clone(),
            secret: self.secret.clone(),
        };
        let server = Server::start(handles).map_err(WorkflowError::Unexpected)?;
        info!(
            "Scheduler: url=tcp://{}:{} pid={}",
            self.host,
            server.port,
            std::process::id()
        );
        info!("Workflow publisher: url=tcp://{}:{}", self.host, server.pub_port);
        self.write_contact_file(&server)?;
        self.server = Some(server);
        Ok(())
    }

    fn write_contact_file(&self, server: &Server) -> Result<(), WorkflowError> {
        let ssh_command = Platform::localhost().ssh_command;
        let contact = ContactFile {
            fields: vec![
                ("WD_API".into(), "1".into()),
                ("WD_WORKFLOW_HOST".into(), self.host.clone()),
                ("WD_WORKFLOW_ID".into(), self.workflow.clone()),
                ("WD_WORKFLOW_OWNER".into(), self.owner.clone()),
                ("WD_WORKFLOW_PORT".into(), server.port.to_string()),
                ("WD_WORKFLOW_PID".into(), std::process::id().to_string()),
                (
                    "WD_WORKFLOW_COMMAND".into(),
                    std::env::args().collect::<Vec<_>>().join(" "),
                ),
                ("WD_WORKFLOW_PUBLISH_PORT".into(), server.pub_port.to_string()),
                ("WD_WORKFLOW_RUN_DIR".into(), self.run_dir.display().to_string()),
                ("WD_WORKFLOW_UUID".into(), self.uuid.clone()),
                ("WD_VERSION".into(), env!("CARGO_PKG_VERSION").into()),
                ("WD_SSH_COMMAND".into(), ssh_command),
                (
                    "WD_INSTALL_PATH".into(),
                    std::env::current_exe()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                ),
                ("WD_USE_LOGIN_SHELL".into(), "true".into()),
            ],
        };
        contact.write(&self.run_dir).map_err(WorkflowError::Unexpected)
    }

    // === The run loop ===

    /// Run to completion: main loop, shutdown, optional auto-restart.
    /// `Ok` means a clean stop (process exit 0).
    pub async fn run(&mut self) -> Result<(), WorkflowError> {
        if self.is_restart {
            self.restart_remote_init();
            if !self.run_mode.is_simulation() {
                let active = self.pool.task_ids();
                self.job_mgr.poll_task_jobs(&mut self.pool, &active).await;
            }
        }
        self.run_event_handlers(WorkflowEvent::Startup, "workflow starting");

        let reason = match self.main_loop().await {
            Err(reason) => reason,
            Ok(never) => match never {},
        };
        self.log_shutdown_reason(&reason);
        if let Err(shutdown_err) = self.shutdown(&reason).await {
            // The original reason was already logged; the shutdown error
            // takes over the exit status.
            error!("Error during shutdown");
            return Err(shutdown_err);
        }
        if reason.is_clean_stop() {
            if self.auto_restart_mode == Some(AutoRestartMode::RestartNormal) {
                self.workflow_auto_restart().await?;
            }
            Ok(())
        } else {
            Err(reason)
        }
    }

    async fn main_loop(&mut self) -> Result<std::convert::Infallible, WorkflowError> {
        loop {
            let tinit = Instant::now();
            self.tick().await?;

            // Quick sleep while the subprocess pool has pending work.
            let elapsed = tinit.elapsed();
            let quick = self.proc_pool.is_not_done();
            let duration = if elapsed >= INTERVAL_MAIN_LOOP
                || (quick && elapsed >= INTERVAL_MAIN_LOOP_QUICK)
            {
                Duration::ZERO
            } else if quick {
                INTERVAL_MAIN_LOOP_QUICK - elapsed
            } else {
                INTERVAL_MAIN_LOOP - elapsed
            };
            tokio::time::sleep(duration).await;

            if self.main_loop_intervals.len() == MAIN_LOOP_INTERVALS {
                self.main_loop_intervals.pop_front();
            }
            self.main_loop_intervals.push_back(tinit.elapsed());
            if self.options.profile_mode {
                info!(tick_ms = elapsed.as_millis() as u64, "main loop interval");
            }
        }
    }

    /// One pass of the main loop. The step order is part of the contract.
    pub async fn tick(&mut self) -> Result<(), WorkflowError> {
        let now = Utc::now();

        // 1. Remote install fan-out progression.
        if !self.incomplete_install.is_empty() {
            self.manage_remote_init();
        }

        // 2. Apply a requested reload.
        if let Some(new_config) = self.pending_reload.take() {
            self.apply_reload(new_config)?;
        }

        // 3. Operator commands.
        self.process_command_queue().await;

        // 4. Subprocess pool progression and result routing.
        self.process_proc_pool();

        // 5. Trigger evaluation for waiting tasks.
        self.evaluate_triggers();

        // 7. Expiry.
        for id in self.pool.set_expired_tasks(now) {
            self.events_mgr.queue_event(&id, "expired", "task expired");
            self.is_updated = true;
        }

        // 8. Release queued tasks into the submission pipeline.
        self.release_queued_tasks().await;

        // 9. Simulated task completion.
        if self.pool.sim_time_check(&self.message_queue.sender(), now) {
            self.reset_inactivity_timer();
        }

        // 10. Broadcast expiry below the minimum active point.
        self.broadcast_mgr.expire_broadcast(self.pool.get_min_point().as_ref());

        // 11. Late tasks.
        let late = self
            .events_mgr
            .check_late_tasks(&mut self.pool, &mut self.proc_pool, now);
        for id in late {
            self.db.put(DbOp::PutTaskLateFlag {
                point: id.point.to_string(),
                name: id.name.clone(),
            });
        }

        // 12. Task messages (and any polls they imply).
        self.process_queued_task_messages().await;

        // 13. Commands queued by message handling.
        self.process_command_queue().await;

        // 14. Accumulated task events and retry timers.
        if self.events_mgr.process_events(&mut self.pool, &mut self.proc_pool, now) {
            self.is_updated = true;
        }

        // 15. Persist and publish.
        self.put_task_event_timers();
        let has_updated = self.update_data_structure();
        if has_updated && !self.is_stalled {
            if let Some(timer) = self.timers.get_mut(&WorkflowEvent::StallTimeout) {
                timer.stop();
            }
        }
        self.db
            .process_queued_ops()
            .map_err(WorkflowError::Unexpected)?;

        // 16. Public DB health.
        self.db
            .recover_pub_from_pri()
            .map_err(WorkflowError::Unexpected)?;

        // 17. Timers.
        self.timeout_check().await?;

        // 18. Shutdown eligibility.
        self.workflow_shutdown().await?;

        // 19. Periodic hooks.
        self.run_periodic_hooks();

        // 20. Stall evaluation on idle ticks only.
        if !has_updated && self.stop_mode.is_none() {
            self.check_workflow_stalled();
        }
        Ok(())
    }

    // === Tick pieces ===

    fn manage_remote_init(&mut self) {
        use crate::jobs::RemoteState;
        let targets: Vec<String> = self.incomplete_install.keys().cloned().collect();
        for target in targets {
            match self.job_mgr.remote_mgr.state(&target) {
                Some(RemoteState::InitDone) => {
                    let platform = self.incomplete_install[&target].clone();
                    self.job_mgr.remote_mgr.file_install(&platform, &mut self.proc_pool);
                }
                Some(RemoteState::FileInstallDone) => {
                    self.incomplete_install.remove(&target);
                }
                Some(state) if state.is_failed() => {
                    // Init will be retried on the next job submission.
                    self.incomplete_install.remove(&target);
                }
                _ => {}
            }
        }
    }

    /// Remote init for all install targets of active tasks, after restart.
    fn restart_remote_init(&mut self) {
        let mut platforms: HashMap<String, Platform> = HashMap::new();
        for itask in self.pool.tasks() {
            if !itask.status().is_active() {
                continue;
            }
            let Some(def) = self.pool.def(&itask.id.name) else { continue };
            let Some(platform) = self.config.platform(&def.platform) else { continue };
            if platform.is_local() {
                continue;
            }
            platforms.insert(platform.install_target().to_string(), platform);
        }
        for (target, platform) in platforms {
            self.job_mgr.remote_mgr.remote_init(&platform, &mut self.proc_pool);
            self.incomplete_install.insert(target, platform);
        }
    }

    fn apply_reload(&mut self, new_config: WorkflowConfig) -> Result<(), WorkflowError> {
        info!("Reloading the workflow definition");
        let defs = new_config.task_defs()?;
        let queue_limits: HashMap<String, usize> = new_config
            .scheduling
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), q.limit))
            .collect();
        let limit_interval = new_config
            .scheduling
            .default_interval
            .or_else(|| defs.values().find_map(|d| d.sequence.interval));
        self.pool
            .reload_taskdefs(defs, queue_limits, new_config.scheduling.runahead_limit, limit_interval);
        self.xtrigger_mgr.reload(new_config.scheduling.xtriggers.clone());
        let mut platforms = new_config.platforms.clone();
        platforms
            .entry("localhost".to_string())
            .or_insert_with(Platform::localhost);
        self.job_mgr.reload_platforms(platforms);
        // Fresh file installation after reload.
        self.job_mgr.remote_mgr.clear();
        self.config = new_config;

        let view = self.workflow_view();
        self.data_store.initiate_data_model(&self.pool, view);
        if self.pool.compute_runahead(true) {
            self.pool.release_runahead_tasks();
        }
        self.put_workflow_params();
        self.is_reloaded = true;
        self.is_updated = true;
        info!("Reload completed");
        Ok(())
    }

    /// Drain and execute queued commands, serially. A failing command is
    /// logged and the rest continue.
    async fn process_command_queue(&mut self) {
        let commands = self.command_queue.drain();
        if commands.is_empty() {
            return;
        }
        debug!(count = commands.len(), "processing queued commands");
        for command in commands {
            let cmdstr = command.describe();
            match self.execute_command(command).await {
                Ok(0) => {
                    info!("Command succeeded: {}", cmdstr);
                    self.is_updated = true;
                }
                Ok(warnings) => {
                    info!("Command succeeded with {} warning(s): {}", warnings, cmdstr);
                    self.is_updated = true;
                }
                Err(e) => match e {
                    WorkflowError::CommandFailed(msg) => {
                        error!("Command failed: {}\n{}", cmdstr, msg);
                    }
                    other => {
                        error!("Command failed: {}\n{}", cmdstr, other);
                    }
                },
            }
        }
    }

    async fn execute_command(&mut self, command: Command) -> Result<u32, WorkflowError> {
        match command {
            Command::Stop {
                mode,
                cycle_point,
                clock_time,
                task,
                flow_num,
            } => {
                self.command_stop(mode, cycle_point, clock_time, task, flow_num)?;
                Ok(0)
            }
            Command::Pause => {
                self.pause_workflow();
                Ok(0)
            }
            Command::Resume => {
                self.resume_workflow(false);
                Ok(0)
            }
            Command::Hold { tasks } => Ok(self.pool.hold_tasks(&tasks)),
            Command::Release { tasks } => Ok(self.pool.release_held_tasks(&tasks)),
            Command::SetHoldPoint { point } => {
                let point = point.parse()?;
                self.command_set_hold_point(point)?;
                Ok(0)
            }
            Command::ReleaseHoldPoint => {
                info!("Releasing all tasks and removing hold cycle point");
                self.pool.release_hold_point();
                self.db.put(DbOp::DeleteWorkflowParam {
                    key: db::KEY_HOLD_POINT.into(),
                });
                Ok(0)
            }
            Command::PollTasks { tasks } => {
                if self.run_mode.is_simulation() {
                    return Ok(0);
                }
                let (ids, warnings) = self.pool.filter_task_proxies(&tasks);
                self.job_mgr.poll_task_jobs(&mut self.pool, &ids).await;
                Ok(warnings)
            }
            Command::KillTasks { tasks } => {
                let (ids, warnings) = self.pool.filter_task_proxies(&tasks);
                if self.run_mode.is_simulation() {
                    // No job runner involved: fail active tasks directly.
                    for id in ids {
                        if let Some(itask) = self.pool.get_mut(&id) {
                            if itask.status().is_active() {
                                itask.state.reset(TaskStatus::Failed);
                            }
                        }
                    }
                    return Ok(warnings);
                }
                self.job_mgr.kill_task_jobs(&mut self.pool, &ids).await;
                Ok(warnings)
            }
            Command::RemoveTasks { tasks } => Ok(self.pool.remove_tasks(&tasks)),
            Command::ForceTriggerTasks {
                tasks,
                flow,
                flow_wait,
                flow_descr,
            } => {
                let flow_spec = match FlowSpec::parse(&flow) {
                    Ok(spec) => spec,
                    Err(e) => {
                        warn!("{}", e);
                        return Ok(0);
                    }
                };
                Ok(self
                    .pool
                    .force_trigger_tasks(&tasks, &flow_spec, flow_wait, flow_descr.as_deref()))
            }
            Command::ForceSpawnChildren {
                tasks,
                outputs,
                flow_num,
            } => {
                let (ids, _) = self.pool.filter_task_proxies(&tasks);
                let warnings = self.pool.force_spawn_children(&tasks, &outputs, flow_num);
                for id in ids {
                    for output in &outputs {
                        self.db.put(DbOp::PutAbsOutput {
                            point: id.point.to_string(),
                            name: id.name.clone(),
                            output: output.clone(),
                        });
                    }
                }
                Ok(warnings)
            }
            Command::ReloadWorkflow => {
                let new_config = WorkflowConfig::load(&self.config_path)
                    .map_err(|e| WorkflowError::CommandFailed(e.to_string()))?;
                self.pending_reload = Some(new_config);
                Ok(0)
            }
            Command::SetVerbosity { level } => {
                // The env-filter cannot be rebuilt after init; record the
                // level for job scripts and new subscribers.
                info!(%level, "verbosity set");
                self.job_mgr.set_workflow_env(self.workflow_env());
                Ok(0)
            }
        }
    }

    fn command_stop(
        &mut self,
        mode: Option<String>,
        cycle_point: Option<String>,
        clock_time: Option<String>,
        task: Option<String>,
        flow_num: Option<u32>,
    ) -> Result<(), WorkflowError> {
        if let Some(flow) = flow_num {
            self.pool.stop_flow(flow);
            return Ok(());
        }
        if let Some(point) = cycle_point {
            let point: CyclePoint = point.parse()?;
            if self.pool.set_stop_point(point) {
                self.db.put(DbOp::PutWorkflowParam {
                    key: db::KEY_STOP_POINT.into(),
                    value: point.to_string(),
                });
            }
            return Ok(());
        }
        if let Some(time) = clock_time {
            // ISO-8601 only; the old slash form is not recognised.
            let time = DateTime::parse_from_rfc3339(&time)
                .map_err(|e| WorkflowError::Input(format!("invalid stop clock time: {}", e)))?
                .with_timezone(&Utc);
            info!("Setting stop clock time: {}", time);
            self.stop_clock_time = Some(time);
            self.db.put(DbOp::PutWorkflowParam {
                key: db::KEY_STOP_CLOCK_TIME.into(),
                value: time.to_rfc3339(),
            });
            self.update_data_store();
            return Ok(());
        }
        if let Some(task) = task {
            let id: TaskId = task.parse()?;
            self.pool.set_stop_task(id.clone());
            self.db.put(DbOp::PutWorkflowParam {
                key: db::KEY_STOP_TASK.into(),
                value: id.to_string(),
            });
            return Ok(());
        }
        let mode = match mode {
            None => StopMode::RequestClean,
            Some(name) => StopMode::parse(&name)
                .ok_or_else(|| WorkflowError::CommandFailed(format!("Invalid stop mode: '{}'", name)))?,
        };
        self.set_stop(mode);
        if mode == StopMode::RequestKill {
            self.time_next_kill = Some(Utc::now());
        }
        Ok(())
    }

    fn set_stop(&mut self, mode: StopMode) {
        info!(%mode, "stop requested");
        self.stop_mode = Some(mode);
        self.update_data_store();
    }

    fn command_set_hold_point(&mut self, point: CyclePoint) -> Result<(), WorkflowError> {
        info!(
            "Setting hold cycle point: {}. All tasks after this point will be held.",
            point
        );
        self.pool.set_hold_point(point);
        self.db.put(DbOp::PutWorkflowParam {
            key: db::KEY_HOLD_POINT.into(),
            value: point.to_string(),
        });
        Ok(())
    }

    fn pause_workflow(&mut self) {
        if self.is_paused {
            info!("Workflow is already paused");
            return;
        }
        info!("PAUSING the workflow now");
        self.is_paused = true;
        self.db.put(DbOp::PutWorkflowParam {
            key: db::KEY_PAUSED.into(),
            value: "1".into(),
        });
        self.update_data_store();
    }

    fn resume_workflow(&mut self, quiet: bool) {
        if !self.is_paused {
            if !quiet {
                warn!("Cannot resume - workflow is not paused");
            }
            return;
        }
        if !quiet {
            info!("RESUMING the workflow now");
        }
        self.is_paused = false;
        self.db.put(DbOp::DeleteWorkflowParam {
            key: db::KEY_PAUSED.into(),
        });
        self.update_data_store();
    }

    fn process_proc_pool(&mut self) {
        for result in self.proc_pool.process() {
            match &result.kind {
                ProcJobKind::Xtrigger { signature } => {
                    if let Some(sig) = self.xtrigger_mgr.handle_result(signature, result.succeeded()) {
                        self.db.put(DbOp::PutXtrigger { signature: sig });
                    }
                }
                ProcJobKind::RemoteInit { .. } | ProcJobKind::FileInstall { .. } => {
                    self.job_mgr.remote_mgr.handle_result(&result);
                }
                ProcJobKind::EventHandler { context } => {
                    if result.succeeded() {
                        debug!(context = %context, "event handler finished");
                    } else {
                        warn!(context = %context, code = ?result.exit_code, "event handler failed");
                    }
                }
            }
        }
    }

    /// Main-loop steps 5 and 6: waiting tasks in the main pool that are
    /// neither queued nor in runahead are waiting on external dependencies.
    fn evaluate_triggers(&mut self) {
        // External events first, so this tick can use them.
        for msg in self.ext_trigger_queue.drain() {
            self.broadcast_mgr.register_ext_trigger(msg);
        }

        if self.pool.compute_runahead(false) {
            self.pool.release_runahead_tasks();
        }

        let mut housekeep = false;
        let waiting: Vec<TaskId> = self
            .pool
            .tasks()
            .filter(|t| {
                t.status() == TaskStatus::Waiting && !t.state.is_queued && !t.state.is_runahead
            })
            .map(|t| t.id.clone())
            .collect();
        for id in waiting {
            if let Some(itask) = self.pool.get(&id) {
                // Fire unsatisfied xtriggers; results come back through
                // the subprocess pool on later ticks.
                if !itask.state.xtriggers_all_satisfied() {
                    self.xtrigger_mgr.call_xtriggers(itask, &mut self.proc_pool);
                }
            }
            if let Some(itask) = self.pool.get_mut(&id) {
                if self.xtrigger_mgr.check_xtriggers(itask) {
                    housekeep = true;
                }
                self.broadcast_mgr.check_ext_triggers(itask);
            }
        }
        self.pool.queue_ready_tasks();

        // 6. Housekeep once per tick with newly satisfied results.
        if housekeep {
            self.xtrigger_mgr.housekeep(self.pool.tasks());
        }
    }

    /// Main-loop step 8: the submission pipeline. Nothing is submitted
    /// while paused, stopping, or waiting out an auto-restart.
    async fn release_queued_tasks(&mut self) {
        let pre_prep: Vec<TaskId> = if !self.is_paused
            && self.stop_mode.is_none()
            && self.auto_restart_time.is_none()
        {
            let mut ids = self.pool.release_queued_tasks();
            // Tasks part-way through the pipeline re-enter every tick.
            let preparing: Vec<TaskId> = self
                .pool
                .tasks()
                .filter(|t| t.status() == TaskStatus::Preparing)
                .map(|t| t.id.clone())
                .collect();
            for id in preparing {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
            ids
        } else if self.should_auto_restart_now()
            && self.auto_restart_mode == Some(AutoRestartMode::RestartNormal)
        {
            // Flush preparing tasks before the restart.
            self.pool
                .tasks()
                .filter(|t| t.status() == TaskStatus::Preparing)
                .map(|t| t.id.clone())
                .collect()
        } else {
            return;
        };
        if pre_prep.is_empty() {
            return;
        }

        self.is_updated = true;
        self.reset_inactivity_timer();

        let submitted = self
            .job_mgr
            .submit_task_jobs(&mut self.pool, &pre_prep, &self.broadcast_mgr, &mut self.proc_pool)
            .await;
        for id in submitted {
            let Some(itask) = self.pool.get(&id) else { continue };
            let flows = crate::flow::format_flow_nums(&itask.flow_nums);
            if self.options.reftest {
                info!("{} -triggered off in flow {}", id, flows);
            } else {
                debug!("{} -triggered off in flow {}", id, flows);
            }
            if let Some(job) = &itask.job {
                self.db.put(DbOp::PutTaskJob(TaskJobRow {
                    point: id.point.to_string(),
                    name: id.name.clone(),
                    submit_num: itask.submit_num,
                    platform: job.platform.clone(),
                    job_runner: job.job_runner.clone(),
                    job_id: job.job_id.clone(),
                    time_submit: Some(Utc::now().to_rfc3339()),
                    ..Default::default()
                }));
            }
        }
    }

    /// Main-loop step 12: drain and apply task messages, batched per task,
    /// in arrival order. Tasks whose state may have reversed get polled.
    async fn process_queued_task_messages(&mut self) {
        let messages = self.message_queue.drain();
        if messages.is_empty() {
            return;
        }
        self.reset_inactivity_timer();
        self.is_updated = true;

        // Group per task identity, preserving arrival order within a task.
        let mut grouped: Vec<(TaskId, Vec<(Option<u32>, TaskMsg)>)> = Vec::new();
        for msg in messages {
            let (id, submit_num) = match parse_job_id(&msg.job_id) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(job_id = %msg.job_id, error = %e, "dropping message with bad job id");
                    continue;
                }
            };
            match grouped.iter_mut().find(|(gid, _)| *gid == id) {
                Some((_, items)) => items.push((submit_num, msg)),
                None => grouped.push((id, vec![(submit_num, msg)])),
            }
        }

        let mut to_poll = Vec::new();
        for (id, items) in grouped {
            if self.pool.get(&id).is_none() {
                continue;
            }
            let mut should_poll = false;
            for (submit_num, msg) in items {
                if self.events_mgr.process_message(
                    &mut self.pool,
                    &id,
                    submit_num,
                    msg.severity,
                    &msg.message,
                    msg.event_time,
                ) {
                    should_poll = true;
                }
            }
            if should_poll {
                to_poll.push(id);
            }
        }
        if !to_poll.is_empty() && !self.run_mode.is_simulation() {
            self.job_mgr.poll_task_jobs(&mut self.pool, &to_poll).await;
        }

        // Persist job rows for tasks that changed under these messages.
        for itask in self.pool.tasks() {
            if itask.state.is_updated {
                if let Some(job) = &itask.job {
                    self.db.put(DbOp::PutTaskJob(TaskJobRow {
                        point: itask.id.point.to_string(),
                        name: itask.id.name.clone(),
                        submit_num: itask.submit_num,
                        platform: job.platform.clone(),
                        job_runner: job.job_runner.clone(),
                        job_id: job.job_id.clone(),
                        time_submit: itask.submitted_at.map(|t| t.to_rfc3339()),
                        time_run_start: itask.started_at.map(|t| t.to_rfc3339()),
                        time_run_exit: itask.finished_at.map(|t| t.to_rfc3339()),
                        run_status: match itask.status() {
                            TaskStatus::Succeeded => Some(0),
                            TaskStatus::Failed => Some(1),
                            _ => None,
                        },
                        elapsed_secs: itask.elapsed_secs(),
                    }));
                }
            }
        }
    }

    fn put_task_event_timers(&mut self) {
        if !self.events_mgr.has_retry_timers() {
            return;
        }
        for (id, timer) in self.events_mgr.retry_timer_rows() {
            self.db.put(DbOp::PutTaskActionTimer {
                point: id.point.to_string(),
                name: id.name.clone(),
                kind: match timer.kind {
                    RetryKind::Execution => "execution".into(),
                    RetryKind::Submission => "submission".into(),
                },
                due: timer.due.to_rfc3339(),
            });
        }
    }

    fn workflow_view(&self) -> WorkflowView {
        let status = match self.stop_mode {
            Some(mode) => format!("stopping ({})", mode),
            None if self.is_paused => "paused".to_string(),
            None => "running".to_string(),
        };
        WorkflowView {
            status,
            is_paused: self.is_paused,
            is_stalled: self.is_stalled,
        }
    }

    /// Main-loop step 15: collect deltas, publish, persist the task pool.
    /// Returns whether anything changed this tick.
    fn update_data_structure(&mut self) -> bool {
        let updated_tasks: Vec<TaskId> = self
            .pool
            .tasks()
            .filter(|t| t.state.is_updated)
            .map(|t| t.id.clone())
            .collect();
        let has_updated = self.is_updated || !updated_tasks.is_empty();
        let reloaded = self.is_reloaded;
        if has_updated || self.data_store.updates_pending {
            let view = self.workflow_view();
            self.data_store.update_data_structure(&self.pool, view, reloaded);
            self.is_reloaded = false;
            if let Ok(mut snapshot) = self.snapshot.write() {
                *snapshot = self.data_store.snapshot_json();
            }
        }
        if has_updated {
            self.db.put(DbOp::PutTaskPool(self.pool.db_rows()));
            self.is_updated = false;
            if !reloaded {
                // A reload alone cannot unstall the workflow.
                self.is_stalled = false;
            }
            for id in updated_tasks {
                if let Some(itask) = self.pool.get_mut(&id) {
                    itask.state.is_updated = false;
                }
            }
        }
        has_updated
    }

    /// Main-loop step 17: workflow timers and job timeouts.
    async fn timeout_check(&mut self) -> Result<(), WorkflowError> {
        let mut fired: Vec<WorkflowEvent> = Vec::new();
        for timer in self.timers.values_mut() {
            if timer.timed_out() {
                fired.push(timer.event());
            }
        }
        for event in fired {
            if self.config.scheduler.events.abort_on(event) {
                return Err(WorkflowError::Scheduler(format!("\"abort on {}\" is set", event)));
            }
            let handlers: Vec<String> = self.config.scheduler.events.handlers_for(event).to_vec();
            for command in handlers {
                self.dispatch_workflow_handler(event, &command, "");
            }
        }
        if !self.run_mode.is_simulation() {
            let to_poll = self.job_mgr.check_task_jobs(&self.pool);
            if !to_poll.is_empty() {
                self.job_mgr.poll_task_jobs(&mut self.pool, &to_poll).await;
            }
        }
        Ok(())
    }

    /// Main-loop step 18: may the workflow stop now?
    async fn workflow_shutdown(&mut self) -> Result<(), WorkflowError> {
        if (self.config.scheduler.events.abort_if_any_task_fails || self.options.abort_if_any_task_fails)
            && self.pool.any_task_failed()
            && self.stop_mode.is_none()
        {
            self.set_stop(StopMode::AutoOnTaskFailure);
        }

        if self.stop_mode.is_none()
            && (self.stop_clock_done() || self.pool.stop_task_done() || self.check_auto_shutdown())
        {
            self.set_stop(StopMode::Auto);
        }

        if self.pool.can_stop(self.stop_mode) {
            // One final round of persistence and publication.
            self.update_data_structure();
            let _ = self.db.process_queued_ops();
            self.proc_pool.close();
            if self.stop_mode != Some(StopMode::RequestNowNow) {
                let mut logged = false;
                while self.proc_pool.is_not_done() {
                    tokio::time::sleep(INTERVAL_STOP_PROCESS_POOL_EMPTY).await;
                    if !logged {
                        info!("Waiting for the command process pool to empty for shutdown");
                        logged = true;
                    }
                    self.proc_pool.process();
                    self.process_command_queue().await;
                }
            }
            let mode = self.stop_mode.unwrap_or(StopMode::Auto);
            if mode == StopMode::AutoOnTaskFailure {
                return Err(WorkflowError::Scheduler(mode.describe().to_string()));
            }
            return Err(WorkflowError::Stop(mode));
        } else if self
            .time_next_kill
            .is_some_and(|t| Utc::now() > t)
        {
            let everything = vec!["*".to_string()];
            let (ids, _) = self.pool.filter_task_proxies(&everything);
            self.job_mgr.poll_task_jobs(&mut self.pool, &ids).await;
            self.job_mgr.kill_task_jobs(&mut self.pool, &ids).await;
            self.time_next_kill =
                Some(Utc::now() + chrono::Duration::seconds(INTERVAL_STOP_KILL.as_secs() as i64));
        }

        // Auto stop [+restart] on host eviction.
        if !self.should_auto_restart_now() {
            // Not yet (or not at all).
        } else if self.auto_restart_mode == Some(AutoRestartMode::RestartNormal) {
            let mut waiting_on = None;
            for itask in self.pool.tasks() {
                if itask.status() == TaskStatus::Preparing {
                    waiting_on = Some("preparing jobs to submit");
                    break;
                }
                if itask.status().is_active()
                    && itask.job.as_ref().is_some_and(|j| j.host == "localhost")
                {
                    waiting_on = Some("jobs running on localhost to complete");
                    break;
                }
            }
            match waiting_on {
                Some(what) => info!("Waiting for {} before attempting restart", what),
                None => self.set_stop(StopMode::RequestNowNow),
            }
        } else if self.auto_restart_mode == Some(AutoRestartMode::ForceStop) {
            self.set_stop(StopMode::RequestNow);
        } else {
            return Err(WorkflowError::Scheduler(format!(
                "invalid auto restart mode: {:?}",
                self.auto_restart_mode
            )));
        }
        Ok(())
    }

    fn should_auto_restart_now(&self) -> bool {
        self.auto_restart_time.is_some_and(|t| Utc::now() >= t)
    }

    fn stop_clock_done(&mut self) -> bool {
        let Some(stop_time) = self.stop_clock_time else {
            return false;
        };
        if Utc::now() > stop_time {
            info!("Wall clock stop time reached: {}", stop_time);
            self.stop_clock_time = None;
            self.db.put(DbOp::DeleteWorkflowParam {
                key: db::KEY_STOP_CLOCK_TIME.into(),
            });
            self.update_data_store();
            true
        } else {
            false
        }
    }

    fn check_auto_shutdown(&mut self) -> bool {
        if self.is_paused {
            return false;
        }
        if self.check_workflow_stalled() {
            return false;
        }
        let more_to_run = self.pool.tasks().any(|t| {
            t.status() == TaskStatus::Preparing
                || t.status().is_active()
                || (t.status() == TaskStatus::Waiting && !t.state.is_runahead)
        });
        if more_to_run {
            return false;
        }
        if self.pool.stop_point().is_some() {
            // Forget the early stop point in case of a restart.
            self.pool.clear_stop_point();
            self.db.put(DbOp::DeleteWorkflowParam {
                key: db::KEY_STOP_POINT.into(),
            });
        }
        true
    }

    fn check_workflow_stalled(&mut self) -> bool {
        if self.is_stalled {
            return true;
        }
        if self.is_paused {
            return false;
        }
        let stalled = self.pool.is_stalled();
        if stalled != self.is_stalled {
            self.update_data_store();
            self.is_stalled = stalled;
        }
        if stalled {
            error!("Workflow stalled");
            self.run_event_handlers(WorkflowEvent::Stall, "workflow stalled");
            if let Some(timer) = self.timers.get_mut(&WorkflowEvent::StallTimeout) {
                timer.reset();
            }
        }
        stalled
    }

    fn run_periodic_hooks(&mut self) {
        // Health check: the contact file must still be ours.
        // (Extension point for further periodic plugins.)
    }

    fn reset_inactivity_timer(&mut self) {
        if let Some(timer) = self.timers.get_mut(&WorkflowEvent::InactivityTimeout) {
            timer.reset();
        }
    }

    fn update_data_store(&mut self) {
        self.data_store.updates_pending = true;
    }

    fn run_event_handlers(&mut self, event: WorkflowEvent, message: &str) {
        if self.run_mode.suppresses_event_handlers() {
            return;
        }
        let handlers: Vec<String> = self.config.scheduler.events.handlers_for(event).to_vec();
        for command in handlers {
            self.dispatch_workflow_handler(event, &command, message);
        }
    }

    fn dispatch_workflow_handler(&mut self, event: WorkflowEvent, command: &str, message: &str) {
        let command = command
            .replace("{event}", event.as_str())
            .replace("{workflow}", &self.workflow)
            .replace("{message}", message);
        debug!(event = %event, %command, "dispatching workflow event handler");
        self.proc_pool.submit(crate::procpool::ProcJob {
            kind: ProcJobKind::EventHandler {
                context: format!("workflow/{}", event),
            },
            command,
        });
    }

    // === Shutdown ===

    fn log_shutdown_reason(&mut self, reason: &WorkflowError) {
        match reason {
            WorkflowError::Stop(mode) => {
                info!("Workflow shutting down - {}", mode);
                if self.auto_restart_mode != Some(AutoRestartMode::RestartNormal) {
                    self.resume_workflow(true);
                }
            }
            WorkflowError::Scheduler(msg) => {
                error!("Workflow shutting down - {}", msg);
            }
            err if err.is_expected() => {
                error!("Workflow shutting down - {}", err);
            }
            err => {
                error!(error = ?err, "Workflow shutting down");
            }
        }
    }

    /// Tear everything down. Runs unconditionally for every shutdown
    /// reason; individual failures are logged and do not abort the rest.
    pub async fn shutdown(&mut self, reason: &WorkflowError) -> Result<(), WorkflowError> {
        // Shutdown/aborted handlers go through the pool before it closes.
        match reason {
            WorkflowError::Stop(mode) => {
                let msg = mode.to_string();
                self.run_event_handlers(WorkflowEvent::Shutdown, &msg);
            }
            other => {
                let msg = other.to_string();
                self.run_event_handlers(WorkflowEvent::Aborted, &msg);
            }
        }

        self.proc_pool.close();
        if matches!(reason, WorkflowError::Stop(StopMode::RequestNowNow)) {
            self.proc_pool.terminate();
        } else {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.proc_pool.is_not_done() && Instant::now() < deadline {
                self.proc_pool.process();
                tokio::time::sleep(INTERVAL_STOP_PROCESS_POOL_EMPTY).await;
            }
            self.proc_pool.terminate();
        }

        if !self.is_stalled {
            // Log incomplete tasks and partially satisfied prerequisites.
            self.pool.is_stalled();
        }
        self.pool.warn_stop_orphans();

        self.put_task_event_timers();
        self.db.put(DbOp::PutTaskPool(self.pool.db_rows()));
        if let Err(e) = self.db.on_workflow_shutdown() {
            error!(error = %e, "database shutdown failed");
        }

        if let Some(mut server) = self.server.take() {
            server.stop();
        }

        // Removing the contact file must happen last: its existence is how
        // others detect a running instance.
        if let Err(e) = ContactFile::remove(&self.run_dir) {
            warn!(error = %e, "failed to remove workflow contact file");
        }
        Ok(())
    }

    /// Attempt to restart the workflow on another host after shutdown.
    pub async fn workflow_auto_restart(&mut self) -> Result<(), WorkflowError> {
        let restart_command = self
            .config
            .scheduler
            .auto_restart_command
            .clone()
            .ok_or_else(|| WorkflowError::Scheduler("no auto-restart command configured".into()))?;
        for attempt in 1..=AUTO_RESTART_MAX_RETRIES {
            let error = match self.select_restart_host() {
                Err(e) => Some(e.to_string()),
                Ok(new_host) => {
                    info!("Attempting to restart on \"{}\"", new_host);
                    let command = restart_command
                        .replace("{workflow}", &self.workflow)
                        .replace("{host}", &new_host);
                    let output = tokio::process::Command::new("sh")
                        .arg("-c")
                        .arg(&command)
                        .output()
                        .await;
                    match output {
                        Ok(output) if output.status.success() => {
                            info!("Workflow now running on \"{}\"", new_host);
                            return Ok(());
                        }
                        Ok(output) => Some(String::from_utf8_lossy(&output.stderr).into_owned()),
                        Err(e) => Some(e.to_string()),
                    }
                }
            };
            if let Some(error) = error {
                let retry_note = if attempt < AUTO_RESTART_MAX_RETRIES {
                    format!(" will retry in {:?}", INTERVAL_AUTO_RESTART_ERROR)
                } else {
                    String::new()
                };
                error!("Could not restart workflow{}. Restart error:\n{}", retry_note, error);
                tokio::time::sleep(INTERVAL_AUTO_RESTART_ERROR).await;
            }
        }
        error!(
            "Workflow unable to automatically restart after {} tries - manual restart required.",
            AUTO_RESTART_MAX_RETRIES
        );
        Err(WorkflowError::Scheduler("auto-restart failed".into()))
    }

    fn select_restart_host(&self) -> Result<String, WorkflowError> {
        let command = self
            .config
            .scheduler
            .host_select_command
            .clone()
            .ok_or_else(|| WorkflowError::HostSelect("no host-select command configured".into()))?;
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .map_err(|e| WorkflowError::HostSelect(e.to_string()))?;
        if !output.status.success() {
            return Err(WorkflowError::HostSelect(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let host = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if host.is_empty() {
            return Err(WorkflowError::HostSelect("host-select returned nothing".into()));
        }
        Ok(host)
    }

    // === Persistence helpers ===

    fn put_workflow_params(&mut self) {
        let mut params: Vec<(&str, String)> = vec![
            (db::KEY_UUID, self.uuid.clone()),
            (db::KEY_RUN_MODE, self.run_mode.to_string()),
            (db::KEY_UTC_MODE, (self.config.scheduler.utc_mode as i64).to_string()),
        ];
        if let Some(point) = self.config.scheduling.initial_cycle_point {
            params.push((db::KEY_INITIAL_POINT, point.to_string()));
        }
        if let Some(point) = self.config.scheduling.final_cycle_point {
            params.push((db::KEY_FINAL_POINT, point.to_string()));
        }
        if let Some(point) = self.pool.stop_point() {
            params.push((db::KEY_STOP_POINT, point.to_string()));
        }
        if let Some(tz) = &self.config.scheduler.cycle_point_time_zone {
            params.push((db::KEY_CYCLE_POINT_TZ, tz.clone()));
        }
        for (key, value) in params {
            self.db.put(DbOp::PutWorkflowParam {
                key: key.to_string(),
                value,
            });
        }
        if self.is_paused {
            self.db.put(DbOp::PutWorkflowParam {
                key: db::KEY_PAUSED.into(),
                value: "1".into(),
            });
        }
    }

    /// Environment exported to every job script.
    fn workflow_env(&self) -> Vec<(String, String)> {
        let name_base = self
            .workflow
            .rsplit('/')
            .next()
            .unwrap_or(&self.workflow)
            .to_string();
        let cycling_mode = match self.config.scheduling.initial_cycle_point {
            Some(CyclePoint::DateTime(_)) => "datetime",
            _ => "integer",
        };
        let mut env = vec![
            ("WD_WORKFLOW_ID".to_string(), self.workflow.clone()),
            ("WD_WORKFLOW_NAME".to_string(), self.workflow.clone()),
            ("WD_WORKFLOW_NAME_BASE".to_string(), name_base),
            ("WD_CYCLING_MODE".to_string(), cycling_mode.to_string()),
            (
                "WD_UTC_MODE".to_string(),
                self.config.scheduler.utc_mode.to_string(),
            ),
            ("WD_VERBOSITY".to_string(), "info".to_string()),
        ];
        if let Some(point) = self.config.scheduling.initial_cycle_point {
            env.push(("WD_WORKFLOW_INITIAL_CYCLE_POINT".to_string(), point.to_string()));
        }
        if let Some(point) = self.config.scheduling.final_cycle_point {
            env.push(("WD_WORKFLOW_FINAL_CYCLE_POINT".to_string(), point.to_string()));
        }
        for (key, value) in &self.template_vars {
            env.push((format!("WD_TMPL_{}", key), value.clone()));
        }
        env
    }
}

fn check_startup_opts(options: &RunOptions, is_restart: bool) -> Result<(), WorkflowError> {
    if is_restart {
        if options.initial_cycle_point.is_some() {
            return Err(WorkflowError::Input(
                "option --icp is not valid for restart".into(),
            ));
        }
        if options.start_cycle_point.is_some() {
            return Err(WorkflowError::Input(
                "option --startcp is not valid for restart".into(),
            ));
        }
        if !options.start_tasks.is_empty() {
            return Err(WorkflowError::Input(
                "option --starttask is not valid for restart".into(),
            ));
        }
    }
    Ok(())
}

fn load_or_create_secret(run_dir: &Path) -> eyre::Result<String> {
    let path = run_dir.join(".service").join("client_keys");
    if let Ok(secret) = std::fs::read_to_string(&path) {
        return Ok(secret.trim().to_string());
    }
    let secret = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &secret)?;
    Ok(secret)
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ONE_TASK: &str = r#"
scheduling:
  initial-cycle-point: "1"
runtime:
  foo:
    simulated-run-secs: 3600
"#;

    fn sim_scheduler(dir: &TempDir, options: RunOptions) -> Scheduler {
        let config = WorkflowConfig::load_str(ONE_TASK).unwrap();
        Scheduler::with_config(
            "unit/flow",
            config,
            &dir.path().join("flow.yaml"),
            dir.path(),
            RunOptions {
                run_mode: Some(RunMode::Simulation),
                ..options
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_double_pause_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let mut sched = sim_scheduler(&dir, RunOptions::default());
        sched.pause_workflow();
        assert!(sched.is_paused());
        sched.pause_workflow();
        assert!(sched.is_paused());
        sched.resume_workflow(false);
        assert!(!sched.is_paused());
        // Double resume warns but changes nothing.
        sched.resume_workflow(false);
        assert!(!sched.is_paused());
    }

    #[tokio::test]
    async fn test_stop_clock_in_future_not_done() {
        let dir = TempDir::new().unwrap();
        let mut sched = sim_scheduler(&dir, RunOptions::default());
        sched.stop_clock_time = Some(Utc::now() + chrono::Duration::seconds(3600));
        assert!(!sched.stop_clock_done());
        sched.stop_clock_time = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(sched.stop_clock_done());
        // Consumed once reached.
        assert!(!sched.stop_clock_done());
    }

    #[tokio::test]
    async fn test_invalid_stop_mode_is_command_failure() {
        let dir = TempDir::new().unwrap();
        let mut sched = sim_scheduler(&dir, RunOptions::default());
        let err = sched
            .command_stop(Some("sideways".into()), None, None, None, None)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CommandFailed(_)));
        assert!(sched.stop_mode().is_none());
    }

    #[tokio::test]
    async fn test_stop_by_clock_time_iso_only() {
        let dir = TempDir::new().unwrap();
        let mut sched = sim_scheduler(&dir, RunOptions::default());
        // The removed legacy slash form is rejected.
        let err = sched
            .command_stop(None, None, Some("2099/01/01-06:00".into()), None, None)
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Input(_)));
        sched
            .command_stop(None, None, Some("2099-01-01T06:00:00Z".into()), None, None)
            .unwrap();
        assert!(sched.stop_clock_time.is_some());
    }

    #[test]
    fn test_startup_opts_checked_for_restart() {
        let options = RunOptions {
            start_tasks: vec!["1/foo".into()],
            ..Default::default()
        };
        assert!(check_startup_opts(&options, true).is_err());
        assert!(check_startup_opts(&options, false).is_ok());
    }

    #[tokio::test]
    async fn test_kill_in_simulation_fails_tasks_directly() {
        let dir = TempDir::new().unwrap();
        let mut sched = sim_scheduler(&dir, RunOptions::default());
        for _ in 0..2 {
            sched.tick().await.unwrap();
        }
        let id = TaskId::new("1".parse().unwrap(), "foo");
        assert!(sched.pool().get(&id).unwrap().status().is_active());
        sched
            .command_sender()
            .send(Command::KillTasks {
                tasks: vec!["*".into()],
            })
            .unwrap();
        sched.tick().await.unwrap();
        assert_eq!(sched.pool().get(&id).unwrap().status(), TaskStatus::Failed);
    }
}
