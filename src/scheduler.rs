//! Periodic trigger (beat schedule)
//!
//! Turns schedule entries into ordinary enqueue calls through a
//! [`TaskProducer`]. It never talks to the dispatcher directly and is only
//! built when the configuration lists at least one entry.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Days, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{DispatchError, DispatchResult};
use crate::task::{EnqueueOptions, TaskId};
use crate::topology::QueueTopology;

/// Unique identifier for scheduled jobs
pub type ScheduledJobId = Uuid;

/// Anything that accepts new tasks
#[async_trait]
pub trait TaskProducer: Send + Sync {
    async fn enqueue(
        &self,
        task_name: &str,
        payload: Vec<u8>,
        options: EnqueueOptions,
    ) -> DispatchResult<TaskId>;
}

/// Recurring schedule. Intervals are zone independent; daily and weekly
/// times are wall-clock times in the scheduler's time zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleExpression {
    EverySeconds(u64),
    EveryMinutes(u64),
    EveryHours(u64),
    /// Every day at hour:minute
    Daily { hour: u32, minute: u32 },
    /// Every week on `day` (0=Sunday) at hour:minute
    Weekly { day: u32, hour: u32, minute: u32 },
}

impl ScheduleExpression {
    /// First run strictly after `from`, with wall-clock times read in `tz`
    pub fn next_execution(&self, from: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match self {
            ScheduleExpression::EverySeconds(seconds) => {
                Some(from + Duration::seconds(*seconds as i64))
            }
            ScheduleExpression::EveryMinutes(minutes) => {
                Some(from + Duration::minutes(*minutes as i64))
            }
            ScheduleExpression::EveryHours(hours) => Some(from + Duration::hours(*hours as i64)),
            ScheduleExpression::Daily { hour, minute } => {
                next_wall_clock(from, tz, *hour, *minute, None)
            }
            ScheduleExpression::Weekly { day, hour, minute } => {
                next_wall_clock(from, tz, *hour, *minute, Some(*day))
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ScheduleExpression::EverySeconds(0)
            | ScheduleExpression::EveryMinutes(0)
            | ScheduleExpression::EveryHours(0) => Err("interval must be positive".to_string()),
            ScheduleExpression::Daily { hour, minute } if *hour > 23 || *minute > 59 => {
                Err(format!("invalid time {}:{}", hour, minute))
            }
            ScheduleExpression::Weekly { day, hour, minute }
                if *day > 6 || *hour > 23 || *minute > 59 =>
            {
                Err(format!("invalid weekly time day={} {}:{}", day, hour, minute))
            }
            _ => Ok(()),
        }
    }
}

/// Earliest `hour:minute` in `tz` after `from`, optionally on one weekday.
/// Local times skipped by a DST jump are passed over.
fn next_wall_clock(
    from: DateTime<Utc>,
    tz: Tz,
    hour: u32,
    minute: u32,
    weekday: Option<u32>,
) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
    let today = from.with_timezone(&tz).date_naive();

    (0..=14)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .filter(|date| weekday.map_or(true, |day| date.weekday().num_days_from_sunday() == day))
        .filter_map(|date| tz.from_local_datetime(&date.and_time(time)).earliest())
        .map(|local| local.with_timezone(&Utc))
        .find(|next| *next > from)
}

fn default_enabled() -> bool {
    true
}

/// One `beat_schedule` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEntry {
    pub name: String,
    /// Task name to enqueue
    pub task: String,
    pub schedule: ScheduleExpression,
    /// JSON arguments, serialized as the task payload
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Explicit queue; routed by task name when absent
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl BeatEntry {
    pub fn new<S: Into<String>>(name: S, task: S, schedule: ScheduleExpression) -> Self {
        Self {
            name: name.into(),
            task: task.into(),
            schedule,
            payload: serde_json::Value::Null,
            queue: None,
            enabled: true,
        }
    }

    pub fn validate(&self, topology: &QueueTopology) -> DispatchResult<()> {
        if self.name.is_empty() || self.task.is_empty() {
            return Err(DispatchError::config(
                "beat_schedule entries need a name and a task",
            ));
        }
        self.schedule.validate().map_err(|reason| {
            DispatchError::config(format!("beat_schedule entry {}: {}", self.name, reason))
        })?;
        if let Some(queue) = &self.queue {
            if !topology.contains(queue) {
                return Err(DispatchError::UnknownQueue {
                    queue: queue.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A schedule entry plus its run bookkeeping
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub id: ScheduledJobId,
    pub entry: BeatEntry,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub failure_count: u64,
    /// Zone daily and weekly times are read in
    pub timezone: Tz,
}

impl ScheduledJob {
    pub fn new(entry: BeatEntry, now: DateTime<Utc>, timezone: Tz) -> Self {
        let next_run = entry.schedule.next_execution(now, timezone);
        Self {
            id: ScheduledJobId::new_v4(),
            entry,
            timezone,
            next_run,
            last_run: None,
            run_count: 0,
            failure_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.entry.enabled && self.next_run.is_some_and(|next| now >= next)
    }

    fn mark_executed(&mut self, now: DateTime<Utc>, success: bool) {
        self.last_run = Some(now);
        self.run_count += 1;
        if !success {
            self.failure_count += 1;
        }
        self.next_run = self.entry.schedule.next_execution(now, self.timezone);
    }
}

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub total_executions: u64,
    pub total_failures: u64,
}

/// Fires scheduled entries as synthetic enqueue calls
pub struct BeatScheduler {
    producer: Arc<dyn TaskProducer>,
    jobs: RwLock<HashMap<ScheduledJobId, ScheduledJob>>,
    tick: std::time::Duration,
    timezone: Tz,
    shutdown_tx: watch::Sender<bool>,
}

impl BeatScheduler {
    pub fn new(producer: Arc<dyn TaskProducer>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            producer,
            jobs: RwLock::new(HashMap::new()),
            tick: std::time::Duration::from_secs(1),
            timezone: Tz::UTC,
            shutdown_tx,
        }
    }

    /// Build a scheduler for `config.beat_schedule` in the configured time
    /// zone, or `None` when no entries are configured
    pub async fn from_config(
        producer: Arc<dyn TaskProducer>,
        config: &Config,
    ) -> DispatchResult<Option<Self>> {
        if config.beat_schedule.is_empty() {
            return Ok(None);
        }
        let scheduler = Self::new(producer).with_timezone(config.schedule_timezone()?);
        for entry in &config.beat_schedule {
            scheduler.add_entry(entry.clone()).await;
        }
        Ok(Some(scheduler))
    }

    /// How often due jobs are checked
    pub fn with_tick(mut self, tick: std::time::Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Zone for daily and weekly times of entries added afterwards
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub async fn add_entry(&self, entry: BeatEntry) -> ScheduledJobId {
        let job = ScheduledJob::new(entry, Utc::now(), self.timezone);
        let job_id = job.id;

        info!("Adding scheduled job: {} ({})", job.entry.name, job_id);
        debug!("Job schedule: {:?}", job.entry.schedule);

        self.jobs.write().await.insert(job_id, job);
        job_id
    }

    pub async fn remove_job(&self, job_id: ScheduledJobId) -> bool {
        let removed = self.jobs.write().await.remove(&job_id).is_some();
        if removed {
            info!("Removed scheduled job: {}", job_id);
        }
        removed
    }

    pub async fn set_job_enabled(&self, job_id: ScheduledJobId, enabled: bool) -> DispatchResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or_else(|| DispatchError::scheduler(format!("Job not found: {}", job_id)))?;
        job.entry.enabled = enabled;
        info!("Job {} {}", job_id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub async fn get_job(&self, job_id: ScheduledJobId) -> Option<ScheduledJob> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    pub async fn list_jobs(&self) -> Vec<ScheduledJob> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Tick until [`BeatScheduler::shutdown`]
    pub async fn start(&self) -> DispatchResult<()> {
        info!("Starting beat scheduler");
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(self.tick);

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.fire_due(Utc::now()).await {
                        error!("Error processing scheduled jobs: {}", e);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("Beat scheduler stopped");
        Ok(())
    }

    /// Enqueue every job due at `now`; returns how many were submitted
    pub async fn fire_due(&self, now: DateTime<Utc>) -> DispatchResult<usize> {
        let due: Vec<ScheduledJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();

        let mut submitted = 0;
        for job in due {
            let result = self.submit(&job.entry).await;

            if let Some(stored) = self.jobs.write().await.get_mut(&job.id) {
                stored.mark_executed(now, result.is_ok());
            }

            match result {
                Ok(task_id) => {
                    submitted += 1;
                    info!(
                        "Scheduled job {} submitted successfully (task: {})",
                        job.entry.name, task_id
                    );
                }
                Err(e) => error!("Failed to execute scheduled job {}: {}", job.entry.name, e),
            }
        }
        Ok(submitted)
    }

    async fn submit(&self, entry: &BeatEntry) -> DispatchResult<TaskId> {
        let payload = serde_json::to_vec(&entry.payload)?;
        let mut options = EnqueueOptions::new();
        if let Some(queue) = &entry.queue {
            options = options.queue(queue.clone());
        }
        self.producer.enqueue(&entry.task, payload, options).await
    }

    pub fn shutdown(&self) {
        info!("Shutting down beat scheduler");
        self.shutdown_tx.send_replace(true);
    }

    pub async fn get_stats(&self) -> SchedulerStats {
        let jobs = self.jobs.read().await;
        SchedulerStats {
            total_jobs: jobs.len(),
            enabled_jobs: jobs.values().filter(|job| job.entry.enabled).count(),
            total_executions: jobs.values().map(|job| job.run_count).sum(),
            total_failures: jobs.values().map(|job| job.failure_count).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Vec<u8>, Option<String>)>>,
    }

    #[async_trait]
    impl TaskProducer for Recorder {
        async fn enqueue(
            &self,
            task_name: &str,
            payload: Vec<u8>,
            options: EnqueueOptions,
        ) -> DispatchResult<TaskId> {
            if task_name == "app.tasks.reject" {
                return Err(DispatchError::invalid_task(task_name, "rejected"));
            }
            self.calls
                .lock()
                .unwrap()
                .push((task_name.to_string(), payload, options.queue));
            Ok(TaskId::new_v4())
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_rolls_over_to_tomorrow() {
        let schedule = ScheduleExpression::Daily { hour: 2, minute: 0 };
        assert_eq!(
            schedule.next_execution(at(2026, 3, 10, 1, 30), Tz::UTC),
            Some(at(2026, 3, 10, 2, 0))
        );
        assert_eq!(
            schedule.next_execution(at(2026, 3, 10, 2, 0), Tz::UTC),
            Some(at(2026, 3, 11, 2, 0))
        );
    }

    #[test]
    fn weekly_targets_the_requested_weekday() {
        // 2026-03-10 is a Tuesday
        let schedule = ScheduleExpression::Weekly { day: 0, hour: 2, minute: 0 };
        assert_eq!(
            schedule.next_execution(at(2026, 3, 10, 12, 0), Tz::UTC),
            Some(at(2026, 3, 15, 2, 0))
        );
        let same_day = ScheduleExpression::Weekly { day: 2, hour: 1, minute: 0 };
        assert_eq!(
            same_day.next_execution(at(2026, 3, 10, 12, 0), Tz::UTC),
            Some(at(2026, 3, 17, 1, 0))
        );
    }

    #[test]
    fn daily_time_is_read_in_the_configured_zone() {
        let schedule = ScheduleExpression::Daily { hour: 2, minute: 0 };
        // 02:00 in Tokyo is 17:00 UTC the previous day
        assert_eq!(
            schedule.next_execution(at(2026, 3, 10, 12, 0), Tz::Asia__Tokyo),
            Some(at(2026, 3, 10, 17, 0))
        );
        assert_eq!(
            schedule.next_execution(at(2026, 3, 10, 17, 0), Tz::Asia__Tokyo),
            Some(at(2026, 3, 11, 17, 0))
        );

        let sunday = ScheduleExpression::Weekly { day: 0, hour: 2, minute: 0 };
        assert_eq!(
            sunday.next_execution(at(2026, 3, 10, 12, 0), Tz::Asia__Tokyo),
            Some(at(2026, 3, 14, 17, 0))
        );
    }

    #[test]
    fn time_skipped_by_dst_moves_to_next_day() {
        // New York springs forward on 2026-03-08, 02:30 does not exist that day
        let schedule = ScheduleExpression::Daily { hour: 2, minute: 30 };
        assert_eq!(
            schedule.next_execution(at(2026, 3, 7, 12, 0), Tz::America__New_York),
            Some(at(2026, 3, 9, 6, 30))
        );
    }

    #[test]
    fn invalid_entries_are_rejected() {
        let topology = assert_ok!(QueueTopology::from_config(&Config::default()));
        let entry = BeatEntry::new("x", "app.tasks.x", ScheduleExpression::EverySeconds(0));
        assert_err!(entry.validate(&topology));

        let entry = BeatEntry::new("x", "app.tasks.x", ScheduleExpression::Daily { hour: 24, minute: 0 });
        assert_err!(entry.validate(&topology));

        let mut entry = BeatEntry::new("x", "app.tasks.x", ScheduleExpression::EveryMinutes(5));
        entry.queue = Some("missing".to_string());
        assert_err!(entry.validate(&topology));
    }

    #[test]
    fn entries_parse_from_config_json() {
        let config = assert_ok!(Config::from_json_str(
            r#"{"beat_schedule": [{
                "name": "regenerate-all-kb-summaries",
                "task": "app.tasks.atlas_tasks.task_regenerate_all_kb_summaries",
                "schedule": {"daily": {"hour": 2, "minute": 0}}
            }]}"#
        ));
        assert_ok!(config.validate());
        let entry = &config.beat_schedule[0];
        assert!(entry.enabled);
        assert_eq!(entry.schedule, ScheduleExpression::Daily { hour: 2, minute: 0 });
        assert_eq!(entry.payload, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn built_from_config_in_its_time_zone() {
        let producer: Arc<dyn TaskProducer> = Arc::new(Recorder::default());
        let config = Config::default();
        assert!(assert_ok!(BeatScheduler::from_config(producer.clone(), &config).await).is_none());

        let config = Config {
            beat_schedule: vec![BeatEntry::new(
                "regenerate-all-kb-summaries",
                "app.tasks.atlas_tasks.task_regenerate_all_kb_summaries",
                ScheduleExpression::Daily { hour: 2, minute: 0 },
            )],
            ..Config::default()
        };
        let scheduler = assert_ok!(BeatScheduler::from_config(producer, &config).await)
            .expect("scheduler for configured entries");
        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].timezone, Tz::Asia__Tokyo);
        let next = jobs[0].next_run.expect("daily job is scheduled");
        assert_eq!((next.hour(), next.minute()), (17, 0));

        let bad = Config {
            timezone: "Mars/Olympus_Mons".to_string(),
            ..config
        };
        let producer: Arc<dyn TaskProducer> = Arc::new(Recorder::default());
        assert!(BeatScheduler::from_config(producer, &bad).await.is_err());
    }

    #[tokio::test]
    async fn due_jobs_become_enqueue_calls() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = BeatScheduler::new(recorder.clone());

        let mut entry = BeatEntry::new("ping", "app.tasks.ping", ScheduleExpression::EverySeconds(10));
        entry.payload = serde_json::json!({"source": "beat"});
        entry.queue = Some("low_priority".to_string());
        let id = scheduler.add_entry(entry).await;

        let now = Utc::now();
        assert_eq!(assert_ok!(scheduler.fire_due(now).await), 0);
        assert_eq!(assert_ok!(scheduler.fire_due(now + Duration::seconds(11)).await), 1);

        let calls = recorder.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "app.tasks.ping");
        assert_eq!(calls[0].2.as_deref(), Some("low_priority"));
        let payload: serde_json::Value = assert_ok!(serde_json::from_slice(&calls[0].1));
        assert_eq!(payload["source"], "beat");

        let job = scheduler.get_job(id).await.expect("job kept");
        assert_eq!(job.run_count, 1);
        assert!(job.next_run.expect("recurring") > now + Duration::seconds(11));
    }

    #[tokio::test]
    async fn disabled_and_failing_jobs() {
        let recorder = Arc::new(Recorder::default());
        let scheduler = BeatScheduler::new(recorder.clone());
        let quiet = scheduler
            .add_entry(BeatEntry::new("quiet", "app.tasks.quiet", ScheduleExpression::EverySeconds(1)))
            .await;
        scheduler
            .add_entry(BeatEntry::new("bad", "app.tasks.reject", ScheduleExpression::EverySeconds(1)))
            .await;
        assert_ok!(scheduler.set_job_enabled(quiet, false).await);

        let later = Utc::now() + Duration::seconds(5);
        assert_eq!(assert_ok!(scheduler.fire_due(later).await), 0);

        let stats = scheduler.get_stats().await;
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.enabled_jobs, 1);
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.total_failures, 1);
        assert!(recorder.calls.lock().unwrap().is_empty());

        assert!(scheduler.remove_job(quiet).await);
        assert_err!(scheduler.set_job_enabled(quiet, true).await);
    }
}
