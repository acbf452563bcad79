use super::context::JobContext;
use super::handle::{SchedulerCommand, SchedulerHandle, SharedJobState};
use super::job::{BackgroundJob, HookEvent, JobError, JobSchedule, ShutdownBehavior};
use crate::server::metrics;
use crate::server_store::{JobRunStatus, JobScheduleState, ServerStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Longest sleep between schedule checks.
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(60);

/// Manages background job scheduling and execution.
pub struct JobScheduler {
    shared_state: Arc<RwLock<SharedJobState>>,

    /// Task handles of running jobs, owned by the scheduler loop.
    running_handles: HashMap<String, JoinHandle<()>>,

    job_cancel_tokens: HashMap<String, CancellationToken>,

    server_store: Arc<dyn ServerStore>,

    /// Hook events from the HTTP server and services.
    hook_receiver: mpsc::Receiver<HookEvent>,

    command_receiver: mpsc::Receiver<SchedulerCommand>,

    shutdown_token: CancellationToken,

    job_context: JobContext,
}

impl JobScheduler {
    pub fn new(
        server_store: Arc<dyn ServerStore>,
        hook_receiver: mpsc::Receiver<HookEvent>,
        command_receiver: mpsc::Receiver<SchedulerCommand>,
        shutdown_token: CancellationToken,
        job_context: JobContext,
        shared_state: Arc<RwLock<SharedJobState>>,
    ) -> Self {
        Self {
            shared_state,
            running_handles: HashMap::new(),
            job_cancel_tokens: HashMap::new(),
            server_store,
            hook_receiver,
            command_receiver,
            shutdown_token,
            job_context,
        }
    }

    pub async fn register_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let job_id = job.id().to_string();
        info!("Registering job: {} - {}", job_id, job.description());
        let mut state = self.shared_state.write().await;
        state.jobs.insert(job_id, job);
    }

    pub async fn job_count(&self) -> usize {
        self.shared_state.read().await.jobs.len()
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        let job_count = self.job_count().await;
        info!("Starting job scheduler with {} registered jobs", job_count);

        match self.server_store.mark_stale_jobs_failed() {
            Ok(count) if count > 0 => {
                info!("Marked {} stale jobs as failed from previous run", count);
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to mark stale jobs: {}", e);
            }
        }

        self.trigger_jobs_for_hook(HookEvent::OnStartup).await;

        loop {
            self.cleanup_completed_jobs().await;

            let sleep_duration = self.time_until_next_scheduled_job().await;
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs().await;
                }
                Some(event) = self.hook_receiver.recv() => {
                    debug!("Received hook event: {}", event);
                    self.trigger_jobs_for_hook(event).await;
                }
                Some(cmd) = self.command_receiver.recv() => {
                    self.handle_command(cmd).await;
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TriggerJob { job_id, response } => {
                let result = self.trigger_job(&job_id).await;
                let _ = response.send(result);
            }
        }
    }

    async fn trigger_job(&mut self, job_id: &str) -> Result<(), JobError> {
        let state = self.shared_state.read().await;
        if !state.jobs.contains_key(job_id) {
            return Err(JobError::NotFound);
        }
        if state.running_jobs.contains(job_id) {
            return Err(JobError::AlreadyRunning);
        }
        drop(state);

        self.spawn_job(job_id, "manual").await;
        Ok(())
    }

    fn interval_of(schedule: &JobSchedule) -> Option<Duration> {
        match schedule {
            JobSchedule::Interval(interval) => Some(*interval),
            JobSchedule::Combined { interval, .. } => *interval,
            JobSchedule::Hook(_) => None,
        }
    }

    /// Next scheduled run, `None` for hook-only jobs. Jobs without stored
    /// state are due at `now`.
    fn get_next_run_time(
        &self,
        job_id: &str,
        schedule: &JobSchedule,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        Self::interval_of(schedule)?;
        match self.server_store.get_schedule_state(job_id) {
            Ok(Some(state)) => Some(state.next_run_at),
            Ok(None) => Some(now),
            Err(e) => {
                warn!("Failed to read schedule state for {}: {}", job_id, e);
                Some(now)
            }
        }
    }

    async fn time_until_next_scheduled_job(&self) -> Duration {
        let mut min_duration = MAX_IDLE_SLEEP;

        let now = chrono::Utc::now();
        let state = self.shared_state.read().await;
        for (job_id, job) in &state.jobs {
            if state.running_jobs.contains(job_id) {
                continue;
            }
            if let Some(next_run) = self.get_next_run_time(job_id, &job.schedule(), now) {
                if next_run <= now {
                    return Duration::from_secs(0);
                }
                let duration = (next_run - now).to_std().unwrap_or(Duration::from_secs(1));
                min_duration = min_duration.min(duration);
            }
        }

        min_duration
    }

    async fn run_due_jobs(&mut self) {
        let now = chrono::Utc::now();
        let mut jobs_to_run = Vec::new();

        {
            let state = self.shared_state.read().await;
            for (job_id, job) in &state.jobs {
                if state.running_jobs.contains(job_id) {
                    continue;
                }
                if let Some(next_run) = self.get_next_run_time(job_id, &job.schedule(), now) {
                    if next_run <= now {
                        jobs_to_run.push(job_id.clone());
                    }
                }
            }
        }

        for job_id in jobs_to_run {
            self.spawn_job(&job_id, "schedule").await;
        }
    }

    async fn trigger_jobs_for_hook(&mut self, event: HookEvent) {
        let mut jobs_to_trigger = Vec::new();

        {
            let state = self.shared_state.read().await;
            for (job_id, job) in &state.jobs {
                if state.running_jobs.contains(job_id) {
                    debug!("Skipping hook trigger for already running job: {}", job_id);
                    continue;
                }

                let should_trigger = match job.schedule() {
                    JobSchedule::Hook(hook_event) => hook_event == event,
                    JobSchedule::Combined { ref hooks, .. } => hooks.contains(&event),
                    JobSchedule::Interval(_) => false,
                };

                if should_trigger {
                    jobs_to_trigger.push(job_id.clone());
                }
            }
        }

        for job_id in jobs_to_trigger {
            let trigger = format!("hook:{}", event);
            self.spawn_job(&job_id, &trigger).await;
        }
    }

    fn store_next_run(&self, job_id: &str, interval: Duration, finished: bool) {
        let now = chrono::Utc::now();
        let state = JobScheduleState {
            job_id: job_id.to_string(),
            next_run_at: now + chrono::Duration::from_std(interval).unwrap_or_default(),
            last_run_at: finished.then_some(now),
        };
        if let Err(e) = self.server_store.update_schedule_state(&state) {
            warn!("Failed to update schedule state for {}: {}", job_id, e);
        }
    }

    async fn spawn_job(&mut self, job_id: &str, triggered_by: &str) {
        let job = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(job) => Arc::clone(job),
                None => {
                    error!("Attempted to spawn unknown job: {}", job_id);
                    return;
                }
            }
        };

        let run_id = match self.server_store.record_job_start(job_id, triggered_by) {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to record job start for {}: {}", job_id, e);
                return;
            }
        };

        info!(
            "Starting job: {} (run_id: {}, triggered_by: {})",
            job_id, run_id, triggered_by
        );

        {
            let mut state = self.shared_state.write().await;
            state.running_jobs.insert(job_id.to_string());
        }

        // Push next_run_at forward now so the loop does not respawn the job
        // while it is still running.
        if let Some(interval) = Self::interval_of(&job.schedule()) {
            self.store_next_run(job_id, interval, false);
        }

        metrics::set_background_job_running(job_id, true);

        let cancel_token = self.job_context.cancellation_token.child_token();
        self.job_cancel_tokens
            .insert(job_id.to_string(), cancel_token.clone());
        let ctx = self.job_context.with_token(cancel_token);

        let server_store = Arc::clone(&self.server_store);
        let job_id_owned = job_id.to_string();
        let shared_state = Arc::clone(&self.shared_state);

        let handle = tokio::spawn(async move {
            let start_time = Instant::now();
            let result = tokio::task::spawn_blocking(move || job.execute(&ctx)).await;
            let elapsed = start_time.elapsed();

            let (status, error_msg, status_label) = match result {
                Ok(Ok(())) => {
                    info!(
                        "Job {} completed successfully in {:?}",
                        job_id_owned, elapsed
                    );
                    (JobRunStatus::Completed, None, "success")
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} was cancelled after {:?}", job_id_owned, elapsed);
                    (
                        JobRunStatus::Failed,
                        Some("Cancelled".to_string()),
                        "cancelled",
                    )
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_id_owned, elapsed, e);
                    (JobRunStatus::Failed, Some(e.to_string()), "failed")
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", job_id_owned, elapsed, e);
                    (
                        JobRunStatus::Failed,
                        Some(format!("Task panic: {}", e)),
                        "panic",
                    )
                }
            };

            metrics::record_background_job_execution(&job_id_owned, status_label, elapsed);
            metrics::set_background_job_running(&job_id_owned, false);

            if let Err(e) = server_store.record_job_finish(run_id, status, error_msg) {
                error!("Failed to record job finish for {}: {}", job_id_owned, e);
            }

            shared_state.write().await.running_jobs.remove(&job_id_owned);
        });

        self.running_handles.insert(job_id.to_string(), handle);
    }

    async fn update_schedule_after_run(&self, job_id: &str) {
        let schedule = {
            let state = self.shared_state.read().await;
            match state.jobs.get(job_id) {
                Some(job) => job.schedule(),
                None => return,
            }
        };
        if let Some(interval) = Self::interval_of(&schedule) {
            self.store_next_run(job_id, interval, true);
        }
    }

    async fn cleanup_completed_jobs(&mut self) {
        let completed: Vec<String> = self
            .running_handles
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in completed {
            if let Some(handle) = self.running_handles.remove(&job_id) {
                let _ = handle.await;
            }
            self.job_cancel_tokens.remove(&job_id);
            self.update_schedule_after_run(&job_id).await;
        }
    }

    /// Gracefully shut down the scheduler.
    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");

        {
            let state = self.shared_state.read().await;
            for job_id in &state.running_jobs {
                let cancellable = state
                    .jobs
                    .get(job_id)
                    .map(|j| j.shutdown_behavior() == ShutdownBehavior::Cancellable)
                    .unwrap_or(true);
                if cancellable {
                    if let Some(token) = self.job_cancel_tokens.get(job_id) {
                        debug!("Cancelling job: {}", job_id);
                        token.cancel();
                    }
                }
            }
        }

        for (job_id, handle) in self.running_handles.drain() {
            debug!("Waiting for job {} to stop...", job_id);
            let _ = tokio::time::timeout(Duration::from_secs(30), handle).await;
        }

        self.job_cancel_tokens.clear();
        info!("Scheduler shutdown complete");
    }
}

/// Create a scheduler and its handle.
pub fn create_scheduler(
    server_store: Arc<dyn ServerStore>,
    hook_receiver: mpsc::Receiver<HookEvent>,
    shutdown_token: CancellationToken,
    job_context: JobContext,
) -> (JobScheduler, SchedulerHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);
    let shared_state = Arc::new(RwLock::new(SharedJobState {
        jobs: HashMap::new(),
        running_jobs: HashSet::new(),
    }));

    let scheduler = JobScheduler::new(
        server_store.clone(),
        hook_receiver,
        command_rx,
        shutdown_token,
        job_context,
        Arc::clone(&shared_state),
    );

    let handle = SchedulerHandle::new(command_tx, shared_state, server_store);

    (scheduler, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::server_store::SqliteServerStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct TestJob {
        id: &'static str,
        schedule: JobSchedule,
        execution_count: Arc<AtomicUsize>,
        should_fail: Arc<AtomicBool>,
    }

    impl TestJob {
        fn new(id: &'static str, schedule: JobSchedule) -> (Arc<Self>, Arc<AtomicUsize>) {
            let count = Arc::new(AtomicUsize::new(0));
            let job = Arc::new(Self {
                id,
                schedule,
                execution_count: count.clone(),
                should_fail: Arc::new(AtomicBool::new(false)),
            });
            (job, count)
        }
    }

    impl BackgroundJob for TestJob {
        fn id(&self) -> &'static str {
            self.id
        }

        fn name(&self) -> &'static str {
            "Test Job"
        }

        fn description(&self) -> &'static str {
            "A test job for unit tests"
        }

        fn schedule(&self) -> JobSchedule {
            self.schedule.clone()
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            self.execution_count.fetch_add(1, Ordering::SeqCst);
            if self.should_fail.load(Ordering::SeqCst) {
                Err(JobError::ExecutionFailed("Test failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn create_test_scheduler() -> (
        JobScheduler,
        SchedulerHandle,
        TempDir,
        mpsc::Sender<HookEvent>,
        CancellationToken,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let server_store: Arc<dyn ServerStore> =
            Arc::new(SqliteServerStore::new(temp_dir.path().join("server.db")).unwrap());

        let (hook_sender, hook_receiver) = mpsc::channel(100);
        let shutdown_token = CancellationToken::new();
        let job_context = JobContext::new(
            shutdown_token.child_token(),
            server_store.clone(),
            Arc::new(SystemClock),
        );

        let (scheduler, handle) = create_scheduler(
            server_store,
            hook_receiver,
            shutdown_token.clone(),
            job_context,
        );

        (scheduler, handle, temp_dir, hook_sender, shutdown_token)
    }

    async fn wait_for(count: &AtomicUsize, expected: usize) {
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job did not run {} times", expected);
    }

    #[tokio::test]
    async fn test_register_and_list_jobs() {
        let (mut scheduler, handle, _temp_dir, _hooks, _shutdown) = create_test_scheduler();
        assert!(handle.list_jobs().await.unwrap().is_empty());

        for id in ["job_b", "job_a"] {
            let (job, _) = TestJob::new(id, JobSchedule::Hook(HookEvent::OnStartup));
            scheduler.register_job(job).await;
        }

        let jobs = handle.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "job_a");
        assert_eq!(jobs[1].id, "job_b");
        assert_eq!(jobs[0].name, "Test Job");
        assert!(!jobs[0].is_running);
        assert!(jobs[0].last_run.is_none());
        assert!(handle.job_exists("job_a").await);
        assert!(!handle.job_exists("nonexistent").await);
        assert!(handle.get_job("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hook_and_manual_triggers_run_job() {
        let (mut scheduler, handle, _temp_dir, hooks, shutdown) = create_test_scheduler();
        let (job, count) = TestJob::new(
            "queue",
            JobSchedule::Combined {
                interval: Some(Duration::from_secs(3600)),
                hooks: vec![HookEvent::OnEmailsQueued],
            },
        );
        scheduler.register_job(job).await;

        let task = tokio::spawn(async move { scheduler.run().await });

        // First interval run happens at startup
        wait_for(&count, 1).await;

        hooks.send(HookEvent::OnEmailsQueued).await.unwrap();
        wait_for(&count, 2).await;

        // Let the run finish before triggering again
        for _ in 0..100 {
            if !handle.is_job_running("queue").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.trigger_job("queue").await.unwrap();
        wait_for(&count, 3).await;

        assert!(matches!(
            handle.trigger_job("missing").await,
            Err(JobError::NotFound)
        ));

        shutdown.cancel();
        task.await.unwrap();

        let history = handle.get_job_history("queue", 10).unwrap();
        assert!(history.len() >= 3);
        assert!(history.iter().any(|r| r.triggered_by == "manual"));
        assert!(history
            .iter()
            .any(|r| r.triggered_by == "hook:OnEmailsQueued"));
    }

    #[tokio::test]
    async fn test_interval_job_runs_on_fresh_database() {
        let (mut scheduler, handle, _temp_dir, _hooks, shutdown) = create_test_scheduler();
        let (job, count) = TestJob::new("cleanup", JobSchedule::Interval(Duration::from_secs(3600)));
        scheduler.register_job(job).await;

        let task = tokio::spawn(async move { scheduler.run().await });
        wait_for(&count, 1).await;

        // The stored next run pushes the job out by one interval
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        task.await.unwrap();

        let history = handle.get_job_history("cleanup", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].triggered_by, "schedule");
    }

    #[tokio::test]
    async fn test_failed_job_is_recorded() {
        let (mut scheduler, handle, _temp_dir, _hooks, shutdown) = create_test_scheduler();
        let count = Arc::new(AtomicUsize::new(0));
        let job = Arc::new(TestJob {
            id: "failing",
            schedule: JobSchedule::Hook(HookEvent::OnStartup),
            execution_count: count.clone(),
            should_fail: Arc::new(AtomicBool::new(true)),
        });
        scheduler.register_job(job).await;

        let task = tokio::spawn(async move { scheduler.run().await });
        wait_for(&count, 1).await;

        let mut last = None;
        for _ in 0..100 {
            last = handle.get_job("failing").await.unwrap().and_then(|j| j.last_run);
            if last.as_ref().map(|r| r.status != "running").unwrap_or(false) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let last = last.unwrap();
        assert_eq!(last.status, "failed");
        assert!(last.error_message.unwrap().contains("Test failure"));

        shutdown.cancel();
        task.await.unwrap();
    }
}
