//! Fixed-cadence collection loop, one OS thread per cadence.
//!
//! A [`Scheduler`] owns at most one running loop. Settings are read once per
//! `start()`, so a new interval or enablement takes effect through `restart()`.

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::credentials::{EventArchiveSettings, TemperatureLogSettings};

pub trait CadenceSettings: Clone + Send + 'static {
    fn enabled(&self) -> bool;
    fn interval(&self) -> Duration;
}

impl CadenceSettings for EventArchiveSettings {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn interval(&self) -> Duration {
        EventArchiveSettings::interval(self)
    }
}

impl CadenceSettings for TemperatureLogSettings {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn interval(&self) -> Duration {
        TemperatureLogSettings::interval(self)
    }
}

/// What a collection cycle did, for logs and status readers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub accounts: usize,
    pub installations: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub deleted: usize,
    /// The cycle stopped early because the shared rate limit was exhausted.
    pub rate_limited: bool,
    pub errors: Vec<String>,
}

impl CycleReport {
    pub fn begin(now: DateTime<Utc>) -> Self {
        CycleReport {
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn error(&mut self, message: String) {
        warn!("{}", message);
        self.errors.push(message);
    }
}

/// One unit of scheduled work (event archiving, temperature sampling).
pub trait CollectionJob: Send + Sync + 'static {
    type Settings: CadenceSettings;

    /// Thread name and log prefix.
    fn name(&self) -> &'static str;

    fn load_settings(&self) -> Result<Self::Settings, String>;

    /// Runs once per `start()` before the first cycle.
    fn prepare(&self, settings: &Self::Settings) -> Result<(), String>;

    fn run_cycle(&self, settings: &Self::Settings) -> CycleReport;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub enabled: bool,
    pub interval_secs: u64,
    pub cycles: u64,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

struct RunningLoop {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Scheduler<J: CollectionJob> {
    job: Arc<J>,
    running: Mutex<Option<RunningLoop>>,
    status: Arc<Mutex<SchedulerStatus>>,
}

impl<J: CollectionJob> Scheduler<J> {
    pub fn new(job: J) -> Self {
        Scheduler {
            job: Arc::new(job),
            running: Mutex::new(None),
            status: Arc::new(Mutex::new(SchedulerStatus::default())),
        }
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    /// Starts the loop. Returns `Ok(false)` when it was already running or is disabled.
    pub fn start(&self) -> Result<bool, String> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Ok(false);
        }

        let name = self.job.name();
        let settings = self.job.load_settings().inspect_err(|e| self.set_error(e.clone()))?;
        {
            let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
            status.enabled = settings.enabled();
            status.interval_secs = settings.interval().as_secs();
        }
        if !settings.enabled() {
            info!("{}: disabled, not starting", name);
            return Ok(false);
        }
        self.job.prepare(&settings).inspect_err(|e| self.set_error(e.clone()))?;

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let job = self.job.clone();
        let status = self.status.clone();
        let interval = settings.interval();
        let handle = thread::Builder::new()
            .name(format!("{}-scheduler", name))
            .spawn(move || {
                info!("{}: started, interval={}s", name, interval.as_secs());
                loop {
                    let tick_start = Instant::now();
                    {
                        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                        s.last_started = Some(Utc::now());
                    }

                    let report = job.run_cycle(&settings);
                    log_report(name, &report);
                    {
                        let mut s = status.lock().unwrap_or_else(PoisonError::into_inner);
                        s.cycles += 1;
                        s.last_finished = report.finished_at.or_else(|| Some(Utc::now()));
                        s.last_error = report.errors.last().cloned();
                        s.last_report = Some(report);
                    }

                    // Maintain steady cadence; a stop signal interrupts the wait.
                    let wait = interval.saturating_sub(tick_start.elapsed());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("{}: stopped", name);
            })
            .map_err(|e| format!("spawning {} thread failed: {}", name, e))?;

        self.status.lock().unwrap_or_else(PoisonError::into_inner).running = true;
        *running = Some(RunningLoop { stop_tx, handle });
        Ok(true)
    }

    /// Signals the loop and waits for the in-flight cycle to finish.
    pub fn stop(&self) {
        let taken = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(RunningLoop { stop_tx, handle }) = taken else {
            return;
        };
        let _ = stop_tx.send(());
        if handle.join().is_err() {
            error!("{}: scheduler thread panicked", self.job.name());
        }
        self.status.lock().unwrap_or_else(PoisonError::into_inner).running = false;
    }

    pub fn restart(&self) -> Result<bool, String> {
        self.stop();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_error(&self, e: String) {
        error!("{}: {}", self.job.name(), e);
        self.status.lock().unwrap_or_else(PoisonError::into_inner).last_error = Some(e);
    }
}

impl<J: CollectionJob> Drop for Scheduler<J> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn log_report(name: &str, r: &CycleReport) {
    let took = match (r.started_at, r.finished_at) {
        (Some(s), Some(f)) => (f - s).num_milliseconds(),
        _ => 0,
    };
    info!(
        "{}: cycle done in {}ms (accounts={}, installations={}, fetched={}, inserted={}, deleted={}, rate_limited={}, errors={})",
        name,
        took,
        r.accounts,
        r.installations,
        r.fetched,
        r.inserted,
        r.deleted,
        r.rate_limited,
        r.errors.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct TestSettings {
        enabled: bool,
        interval: Duration,
    }

    impl CadenceSettings for TestSettings {
        fn enabled(&self) -> bool {
            self.enabled
        }

        fn interval(&self) -> Duration {
            self.interval
        }
    }

    struct CountingJob {
        settings: Mutex<TestSettings>,
        cycles: Arc<AtomicUsize>,
        prepared: AtomicUsize,
    }

    impl CollectionJob for CountingJob {
        type Settings = TestSettings;

        fn name(&self) -> &'static str {
            "Test"
        }

        fn load_settings(&self) -> Result<TestSettings, String> {
            Ok(self.settings.lock().unwrap().clone())
        }

        fn prepare(&self, _settings: &TestSettings) -> Result<(), String> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn run_cycle(&self, _settings: &TestSettings) -> CycleReport {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            let mut r = CycleReport::begin(Utc::now());
            r.accounts = 1;
            r.finished_at = Some(Utc::now());
            r
        }
    }

    fn scheduler(enabled: bool, interval: Duration) -> (Scheduler<CountingJob>, Arc<AtomicUsize>) {
        let cycles = Arc::new(AtomicUsize::new(0));
        let job = CountingJob {
            settings: Mutex::new(TestSettings { enabled, interval }),
            cycles: cycles.clone(),
            prepared: AtomicUsize::new(0),
        };
        (Scheduler::new(job), cycles)
    }

    fn wait_for(cycles: &AtomicUsize, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while cycles.load(Ordering::SeqCst) < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_immediately_and_start_is_idempotent() {
        let (s, cycles) = scheduler(true, Duration::from_secs(3600));
        assert!(s.start().unwrap());
        assert!(!s.start().unwrap());
        wait_for(&cycles, 1);
        s.stop();

        assert_eq!(cycles.load(Ordering::SeqCst), 1);
        assert_eq!(s.job().prepared.load(Ordering::SeqCst), 1);
        let status = s.status();
        assert!(!status.running);
        assert_eq!(status.cycles, 1);
        assert_eq!(status.interval_secs, 3600);
        assert_eq!(status.last_report.unwrap().accounts, 1);
    }

    #[test]
    fn ticks_repeat_until_stopped() {
        let (s, cycles) = scheduler(true, Duration::from_millis(10));
        s.start().unwrap();
        wait_for(&cycles, 3);
        s.stop();
        let after_stop = cycles.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(cycles.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn disabled_cadence_does_not_start() {
        let (s, cycles) = scheduler(false, Duration::from_secs(1));
        assert!(!s.start().unwrap());
        assert!(!s.is_running());
        assert_eq!(cycles.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_applies_new_settings() {
        let (s, cycles) = scheduler(true, Duration::from_secs(3600));
        s.start().unwrap();
        wait_for(&cycles, 1);
        s.job().settings.lock().unwrap().interval = Duration::from_secs(60);
        assert!(s.restart().unwrap());
        wait_for(&cycles, 2);
        assert_eq!(s.status().interval_secs, 60);
        assert!(s.is_running());
        s.stop();
        assert_eq!(s.job().prepared.load(Ordering::SeqCst), 2);
    }
}
