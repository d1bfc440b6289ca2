use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use talon_core::config::ConfigJob;

use crate::error::{Result, SchedulerError};
use crate::types::{parse_interval, Job, JobSource};
use crate::{ActionRunner, Notifier};

struct RunningJob {
    job: Job,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Fields a dynamic job update may change.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub interval: Option<String>,
    pub args: Option<BTreeMap<String, String>>,
    pub notify_channel: Option<String>,
}

/// The job engine.
///
/// Each unpaused job runs in its own ticker task invoking the runner's
/// direct action path. Mutations are governed by the approver list and the
/// per-user quota; the dynamic job set is written to the state file after
/// every mutation.
pub struct Scheduler {
    runner: Arc<dyn ActionRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    approvers: Vec<String>,
    max_jobs_per_user: usize,
    jobs: Mutex<HashMap<String, RunningJob>>,
    persist_path: Option<PathBuf>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn ActionRunner>) -> Self {
        Self {
            runner,
            notifier: None,
            approvers: Vec::new(),
            max_jobs_per_user: 0,
            jobs: Mutex::new(HashMap::new()),
            persist_path: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Approver list and per-user dynamic quota (0 disables the quota).
    pub fn with_governance(mut self, approvers: Vec<String>, max_jobs_per_user: usize) -> Self {
        self.approvers = approvers;
        self.max_jobs_per_user = max_jobs_per_user;
        self
    }

    /// Persist dynamic jobs at `path` (`<data_dir>/scheduler/jobs.yaml`).
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persist_path = Some(path.into());
        self
    }

    /// Install the immutable config-declared jobs. Invalid entries are
    /// logged and skipped so one bad job cannot prevent boot.
    pub fn load_config_jobs(&self, jobs: &[ConfigJob]) {
        for cfg in jobs {
            let job = Job {
                name: cfg.name.clone(),
                interval: cfg.interval.clone(),
                action: cfg.action.clone(),
                args: cfg.args.clone(),
                notify_channel: cfg.notify_channel.clone(),
                paused: false,
                source: JobSource::Config,
                created_by: String::new(),
            };
            if let Err(e) = self.install(job) {
                warn!(job = %cfg.name, error = %e, "skipping invalid config job");
            }
        }
    }

    /// Reload previously persisted dynamic jobs.
    pub fn load_dynamic_jobs(&self) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let jobs: Vec<Job> = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw)?,
            Err(_) => return Ok(()),
        };
        for job in jobs {
            if let Err(e) = self.install(job) {
                warn!(error = %e, "skipping invalid persisted job");
            }
        }
        Ok(())
    }

    /// Create a dynamic job on behalf of `caller`.
    pub fn add_job(&self, caller: &str, mut job: Job) -> Result<()> {
        self.authorize(caller)?;
        job.source = JobSource::Dynamic;
        job.created_by = caller.to_string();

        if self.max_jobs_per_user > 0 {
            let owned = self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.job.source == JobSource::Dynamic && r.job.created_by == caller)
                .count();
            if owned >= self.max_jobs_per_user {
                return Err(SchedulerError::QuotaExceeded {
                    user: caller.to_string(),
                    count: owned,
                    max: self.max_jobs_per_user,
                });
            }
        }

        self.install(job)?;
        self.persist()
    }

    /// Remove a dynamic job. Config jobs always survive.
    pub fn remove_job(&self, caller: &str, name: &str) -> Result<()> {
        self.authorize(caller)?;
        let removed = {
            let mut jobs = self.jobs.lock().unwrap();
            let source = match jobs.get(name) {
                None => return Err(SchedulerError::NotFound { name: name.to_string() }),
                Some(r) => r.job.source,
            };
            if source == JobSource::Config {
                return Err(SchedulerError::ConfigProtected);
            }
            jobs.remove(name).expect("presence checked above")
        };
        removed.cancel.cancel();
        info!(job = name, "dynamic job removed");
        self.persist()
    }

    /// Update a dynamic job in place, restarting its ticker.
    pub fn update_job(&self, caller: &str, name: &str, update: JobUpdate) -> Result<()> {
        self.authorize(caller)?;
        let mut job = {
            let jobs = self.jobs.lock().unwrap();
            match jobs.get(name) {
                None => return Err(SchedulerError::NotFound { name: name.to_string() }),
                Some(r) if r.job.source == JobSource::Config => {
                    return Err(SchedulerError::ConfigProtected)
                }
                Some(r) => r.job.clone(),
            }
        };

        if let Some(interval) = update.interval {
            parse_interval(&interval)?;
            job.interval = interval;
        }
        if let Some(args) = update.args {
            job.args = args;
        }
        if let Some(notify) = update.notify_channel {
            job.notify_channel = notify;
        }

        if let Some(old) = self.jobs.lock().unwrap().remove(name) {
            old.cancel.cancel();
        }
        self.install(job)?;
        self.persist()
    }

    /// Pause any job, config-sourced included. The ticker is cancelled.
    pub fn pause(&self, name: &str) -> Result<()> {
        {
            let mut jobs = self.jobs.lock().unwrap();
            let running = jobs
                .get_mut(name)
                .ok_or_else(|| SchedulerError::NotFound { name: name.to_string() })?;
            if running.job.paused {
                return Ok(());
            }
            running.job.paused = true;
            running.cancel.cancel();
            running.handle = None;
        }
        info!(job = name, "job paused");
        self.persist()
    }

    /// Resume a paused job: a fresh ticker is spawned.
    pub fn resume(&self, name: &str) -> Result<()> {
        let job = {
            let mut jobs = self.jobs.lock().unwrap();
            let running = jobs
                .get_mut(name)
                .ok_or_else(|| SchedulerError::NotFound { name: name.to_string() })?;
            if !running.job.paused {
                return Ok(());
            }
            running.job.paused = false;
            running.job.clone()
        };
        // reinstall replaces the cancelled entry with a live one
        if let Some(old) = self.jobs.lock().unwrap().remove(name) {
            old.cancel.cancel();
        }
        self.install(job)?;
        info!(job = name, "job resumed");
        self.persist()
    }

    /// All jobs, sorted by name.
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        jobs
    }

    /// Cancel every ticker and block until all have drained.
    pub async fn stop(&self) {
        let drained: Vec<RunningJob> = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.drain().map(|(_, r)| r).collect()
        };
        for running in &drained {
            running.cancel.cancel();
        }
        for running in drained {
            if let Some(handle) = running.handle {
                let _ = handle.await;
            }
        }
        info!("scheduler stopped");
    }

    // --- internal ----------------------------------------------------------

    fn authorize(&self, caller: &str) -> Result<()> {
        if self.approvers.is_empty() || self.approvers.iter().any(|a| a == caller) {
            Ok(())
        } else {
            Err(SchedulerError::NotAuthorized)
        }
    }

    /// Validate, spawn the ticker (unless paused), and store the entry.
    fn install(&self, job: Job) -> Result<()> {
        let interval = parse_interval(&job.interval)?;
        job.split_action()?;

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.name) {
            return Err(SchedulerError::Duplicate { name: job.name.clone() });
        }

        let cancel = CancellationToken::new();
        let handle = if job.paused {
            None
        } else {
            Some(spawn_ticker(
                job.clone(),
                interval,
                Arc::clone(&self.runner),
                self.notifier.clone(),
                cancel.clone(),
            ))
        };

        info!(job = %job.name, interval = %job.interval, source = ?job.source, "job installed");
        jobs.insert(job.name.clone(), RunningJob { job, cancel, handle });
        Ok(())
    }

    /// Write the dynamic job set. The persisted file always equals the
    /// in-memory dynamic set after a mutation.
    fn persist(&self) -> Result<()> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        let dynamic: Vec<Job> = {
            let jobs = self.jobs.lock().unwrap();
            let mut list: Vec<Job> = jobs
                .values()
                .filter(|r| r.job.source == JobSource::Dynamic)
                .map(|r| r.job.clone())
                .collect();
            list.sort_by(|a, b| a.name.cmp(&b.name));
            list
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("yaml.tmp");
        std::fs::write(&tmp, serde_yaml::to_string(&dynamic)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn spawn_ticker(
    job: Job,
    interval: Duration,
    runner: Arc<dyn ActionRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (plugin, action) = match job.split_action() {
            Ok(pair) => (pair.0.to_string(), pair.1.to_string()),
            Err(e) => {
                warn!(job = %job.name, error = %e, "ticker refused bad action");
                return;
            }
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // consume the immediate first tick so the first run lands after one
        // full interval
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let args: HashMap<String, String> =
                        job.args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                    let result = runner.run_action(&plugin, &action, args).await;
                    let text = match result.error {
                        Some(err) => format!("error: {err}"),
                        None => result.content,
                    };
                    if !job.notify_channel.is_empty() {
                        if let Some(ref notifier) = notifier {
                            notifier
                                .notify(&job.notify_channel, &format!("[scheduled: {}] {}", job.name, text))
                                .await;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use talon_core::types::ToolResult;

    struct CountingRunner {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionRunner for CountingRunner {
        async fn run_action(
            &self,
            plugin: &str,
            action: &str,
            _args: HashMap<String, String>,
        ) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::success("direct", format!("{plugin}.{action} ran"))
        }
    }

    struct RecordingNotifier {
        messages: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, channel: &str, text: &str) {
            self.messages
                .lock()
                .unwrap()
                .push((channel.to_string(), text.to_string()));
        }
    }

    fn job(name: &str, interval: &str) -> Job {
        Job {
            name: name.into(),
            interval: interval.into(),
            action: "gitlab.analyze_code".into(),
            args: BTreeMap::new(),
            notify_channel: String::new(),
            paused: false,
            source: JobSource::Dynamic,
            created_by: String::new(),
        }
    }

    fn runner() -> Arc<CountingRunner> {
        Arc::new(CountingRunner { calls: AtomicUsize::new(0) })
    }

    #[tokio::test]
    async fn ticker_fires_and_notifies() {
        let r = runner();
        let notifier = Arc::new(RecordingNotifier { messages: Mutex::new(Vec::new()) });
        let scheduler = Scheduler::new(r.clone()).with_notifier(notifier.clone());

        let mut j = job("digest", "30ms");
        j.notify_channel = "slack".into();
        scheduler.add_job("alice", j).unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop().await;

        assert!(r.calls.load(Ordering::SeqCst) >= 2);
        let messages = notifier.messages.lock().unwrap();
        assert!(!messages.is_empty());
        assert_eq!(messages[0].0, "slack");
        assert!(messages[0].1.starts_with("[scheduled: digest] "));
        assert!(messages[0].1.contains("gitlab.analyze_code ran"));
    }

    #[tokio::test]
    async fn approver_list_gates_mutations() {
        let scheduler = Scheduler::new(runner())
            .with_governance(vec!["alice".into()], 0);

        assert!(matches!(
            scheduler.add_job("mallory", job("x", "1m")),
            Err(SchedulerError::NotAuthorized)
        ));
        scheduler.add_job("alice", job("x", "1m")).unwrap();
        assert!(matches!(
            scheduler.remove_job("mallory", "x"),
            Err(SchedulerError::NotAuthorized)
        ));
        scheduler.remove_job("alice", "x").unwrap();
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn quota_limits_dynamic_jobs_per_user() {
        let scheduler = Scheduler::new(runner()).with_governance(Vec::new(), 2);
        scheduler.add_job("bob", job("one", "1m")).unwrap();
        scheduler.add_job("bob", job("two", "1m")).unwrap();
        let err = scheduler.add_job("bob", job("three", "1m")).unwrap_err();
        assert!(matches!(err, SchedulerError::QuotaExceeded { count: 2, max: 2, .. }));
        // other users are unaffected
        scheduler.add_job("carol", job("three", "1m")).unwrap();
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn config_jobs_survive_mutation_attempts() {
        let scheduler = Scheduler::new(runner());
        scheduler.load_config_jobs(&[ConfigJob {
            name: "heartbeat".into(),
            interval: "1h".into(),
            action: "health.ping".into(),
            args: BTreeMap::new(),
            notify_channel: String::new(),
        }]);

        assert!(matches!(
            scheduler.remove_job("alice", "heartbeat"),
            Err(SchedulerError::ConfigProtected)
        ));
        assert!(matches!(
            scheduler.update_job("alice", "heartbeat", JobUpdate::default()),
            Err(SchedulerError::ConfigProtected)
        ));

        // pause and resume are allowed
        scheduler.pause("heartbeat").unwrap();
        assert!(scheduler.list_jobs()[0].paused);
        scheduler.resume("heartbeat").unwrap();
        assert!(!scheduler.list_jobs()[0].paused);

        assert_eq!(scheduler.list_jobs().len(), 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn dynamic_set_equals_persisted_file_after_every_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scheduler").join("jobs.yaml");

        let read_persisted = |path: &std::path::Path| -> Vec<Job> {
            serde_yaml::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
        };

        let scheduler = Scheduler::new(runner()).with_persistence(&path);
        scheduler.add_job("alice", job("a", "1m")).unwrap();
        scheduler.add_job("alice", job("b", "2m")).unwrap();
        assert_eq!(read_persisted(&path).len(), 2);

        scheduler
            .update_job(
                "alice",
                "b",
                JobUpdate { interval: Some("5m".into()), ..Default::default() },
            )
            .unwrap();
        let persisted = read_persisted(&path);
        assert_eq!(persisted.iter().find(|j| j.name == "b").unwrap().interval, "5m");

        scheduler.remove_job("alice", "a").unwrap();
        let persisted = read_persisted(&path);
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].name, "b");
        scheduler.stop().await;

        // a fresh scheduler reloads the persisted set
        let reloaded = Scheduler::new(runner()).with_persistence(&path);
        reloaded.load_dynamic_jobs().unwrap();
        assert_eq!(reloaded.list_jobs().len(), 1);
        assert_eq!(reloaded.list_jobs()[0].name, "b");
        reloaded.stop().await;
    }

    #[tokio::test]
    async fn paused_job_does_not_fire() {
        let r = runner();
        let scheduler = Scheduler::new(r.clone());
        let mut j = job("quiet", "20ms");
        j.paused = true;
        scheduler.add_job("alice", j).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(r.calls.load(Ordering::SeqCst), 0);

        scheduler.resume("quiet").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(r.calls.load(Ordering::SeqCst) >= 1);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let scheduler = Scheduler::new(runner());
        scheduler.add_job("alice", job("same", "1m")).unwrap();
        assert!(matches!(
            scheduler.add_job("alice", job("same", "1m")),
            Err(SchedulerError::Duplicate { .. })
        ));
        scheduler.stop().await;
    }
}
