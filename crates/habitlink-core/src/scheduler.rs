//! Scheduler driving the recurrence and reminder jobs

use chrono::{DateTime, Utc};
use habitlink_api::{DueReminder, RecurrenceOutcome, SchedulerStatus};
use habitlink_config::SchedulerSettings;
use habitlink_util::{HabitError, Result, TimeSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{RecurrenceEngine, ReminderScanner};

/// Job cadence
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub recurrence_interval: Duration,
    pub reminder_interval: Duration,
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            recurrence_interval: settings.recurrence_interval,
            reminder_interval: settings.reminder_interval,
        }
    }
}

/// Output of a job run, forwarded to the service
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Recurrence(Vec<RecurrenceOutcome>),
    Reminders(Vec<DueReminder>),
}

/// In-flight flag for one job. A run that cannot take the latch is skipped.
#[derive(Debug, Default)]
pub struct JobLatch {
    busy: AtomicBool,
}

impl JobLatch {
    pub fn try_acquire(&self) -> Option<LatchGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LatchGuard { latch: self })
    }

    pub fn is_held(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the latch on drop
pub struct LatchGuard<'a> {
    latch: &'a JobLatch,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy)]
enum Job {
    Recurrence,
    Reminders,
}

struct Jobs {
    recurrence: Arc<RecurrenceEngine>,
    scanner: Arc<ReminderScanner>,
    clock: Arc<dyn TimeSource>,
    recurrence_latch: JobLatch,
    reminder_latch: JobLatch,
    last_recurrence_at: Mutex<Option<DateTime<Utc>>>,
    last_reminder_scan_at: Mutex<Option<DateTime<Utc>>>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Jobs {
    async fn run(&self, job: Job) {
        match job {
            Job::Recurrence => {
                self.run_recurrence().await;
            }
            Job::Reminders => {
                self.scan_reminders().await;
            }
        }
    }

    async fn run_recurrence(&self) -> Option<Vec<RecurrenceOutcome>> {
        let Some(_latch) = self.recurrence_latch.try_acquire() else {
            debug!("Recurrence still in flight, run skipped");
            return None;
        };

        let now = self.clock.now();
        let outcomes = self.recurrence.tick(now).await;
        *lock(&self.last_recurrence_at) = Some(now);

        if !outcomes.is_empty() {
            let _ = self.events.send(SchedulerEvent::Recurrence(outcomes.clone()));
        }
        Some(outcomes)
    }

    async fn scan_reminders(&self) -> Option<Vec<DueReminder>> {
        let Some(_latch) = self.reminder_latch.try_acquire() else {
            debug!("Reminder scan still in flight, run skipped");
            return None;
        };

        let now = self.clock.now();
        let reminders = self.scanner.due_reminders(now, None).await;
        *lock(&self.last_reminder_scan_at) = Some(now);

        if !reminders.is_empty() {
            let _ = self.events.send(SchedulerEvent::Reminders(reminders.clone()));
        }
        Some(reminders)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Running {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Process-scoped driver for the two batch jobs.
///
/// Nothing about the scheduler is persisted; a restarted service starts it
/// again from configuration.
pub struct Scheduler {
    jobs: Arc<Jobs>,
    config: SchedulerConfig,
    running: Mutex<Option<Running>>,
}

impl Scheduler {
    pub fn new(
        recurrence: Arc<RecurrenceEngine>,
        scanner: Arc<ReminderScanner>,
        clock: Arc<dyn TimeSource>,
        config: SchedulerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let jobs = Jobs {
            recurrence,
            scanner,
            clock,
            recurrence_latch: JobLatch::default(),
            reminder_latch: JobLatch::default(),
            last_recurrence_at: Mutex::new(None),
            last_reminder_scan_at: Mutex::new(None),
            events,
        };

        let scheduler = Self {
            jobs: Arc::new(jobs),
            config,
            running: Mutex::new(None),
        };
        (scheduler, events_rx)
    }

    /// Start ticking both jobs. The first runs happen one interval from now.
    pub fn start(&self) -> Result<()> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return Err(HabitError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(job_loop(
                self.jobs.clone(),
                Job::Recurrence,
                self.config.recurrence_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(job_loop(
                self.jobs.clone(),
                Job::Reminders,
                self.config.reminder_interval,
                shutdown_rx,
            )),
        ];

        *running = Some(Running { shutdown, tasks });
        info!(
            recurrence_interval = ?self.config.recurrence_interval,
            reminder_interval = ?self.config.reminder_interval,
            "Scheduler started"
        );
        Ok(())
    }

    /// Stop ticking. A job already in flight runs to completion first.
    pub async fn stop(&self) -> Result<()> {
        let running = lock(&self.running).take();
        let Some(running) = running else {
            return Err(HabitError::NotRunning);
        };

        let _ = running.shutdown.send(true);
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler job task ended abnormally");
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Run recurrence now. `None` if a run is already in flight.
    pub async fn run_recurrence_now(&self) -> Option<Vec<RecurrenceOutcome>> {
        self.jobs.run_recurrence().await
    }

    /// Run a global reminder scan now. `None` if a scan is already in flight.
    pub async fn scan_reminders_now(&self) -> Option<Vec<DueReminder>> {
        self.jobs.scan_reminders().await
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            recurrence_in_flight: self.jobs.recurrence_latch.is_held(),
            reminders_in_flight: self.jobs.reminder_latch.is_held(),
            last_recurrence_at: *lock(&self.jobs.last_recurrence_at),
            last_reminder_scan_at: *lock(&self.jobs.last_reminder_scan_at),
        }
    }
}

async fn job_loop(jobs: Arc<Jobs>, job: Job, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                jobs.run(job).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(job = ?job, "Scheduler job loop shutting down");
                    break;
                }
            }
        }
    }
}
