//! End-to-end detection runs against a scripted sleep tracker account

use chrono::{Duration, NaiveDate};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sleepwatch::cache::{CacheStore, FileStore, KeyValueStore, MemoryStore};
use sleepwatch::clock::FixedClock;
use sleepwatch::config::{Credentials, DetectorConfig, FetchConfig};
use sleepwatch::error::ErrorKind;
use sleepwatch::plugins::{Session, TrackerPlugin};
use sleepwatch::types::{AnomalySource, DeviceDescriptor, RawSample, RunReport, Stage, Vendor};
use sleepwatch::{DetectorError, Orchestrator};

const WINDOW_DAYS: i64 = 90;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 10, 1).unwrap()
}

fn window_start() -> NaiveDate {
    today() - Duration::days(WINDOW_DAYS)
}

/// A regular night; every metric follows the same slow rhythm
fn rhythm(i: i64) -> [f64; 4] {
    let p = (2.0 * std::f64::consts::PI * i as f64 / 9.7).sin();
    [58.0 + 2.0 * p, 14.0 + 0.6 * p, 430.0 + 25.0 * p, 80.0 + 5.0 * p]
}

/// Training means with heart rate raised by three standard deviations
fn elevated_heart_rate() -> [f64; 4] {
    let nights: Vec<[f64; 4]> = (0..WINDOW_DAYS).map(rhythm).collect();
    let n = nights.len() as f64;
    let mean = |col: usize| nights.iter().map(|v| v[col]).sum::<f64>() / n;
    let hr_mean = mean(0);
    let hr_sd = (nights.iter().map(|v| (v[0] - hr_mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    [hr_mean + 3.0 * hr_sd, mean(1), mean(2), mean(3)]
}

fn sample(date: NaiveDate, values: [f64; 4]) -> RawSample {
    let mut s = RawSample::new(date);
    s.heart_rate = Some(values[0]);
    s.respiratory_rate = Some(values[1]);
    s.sleep_duration_minutes = Some(values[2]);
    s.sleep_score = Some(values[3]);
    s
}

#[derive(Clone, Copy)]
enum Sleeper {
    /// Regular nights, then a night with elevated heart rate today
    Feverish,
    /// Regular nights throughout
    Calm,
    /// Regular nights but today's night not synced yet
    Unsynced,
    /// Device that never reported a night
    Silent,
}

/// Account with a fixed set of devices
struct Household {
    devices: Vec<(&'static str, &'static str, Sleeper)>,
    calls: Arc<AtomicU32>,
}

impl Household {
    fn new(devices: Vec<(&'static str, &'static str, Sleeper)>) -> Self {
        Self {
            devices,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    fn night(sleeper: Sleeper, date: NaiveDate) -> Option<RawSample> {
        let i = (date - window_start()).num_days();
        match sleeper {
            Sleeper::Silent => None,
            Sleeper::Unsynced if date == today() => None,
            Sleeper::Feverish if date == today() => Some(sample(date, elevated_heart_rate())),
            _ => Some(sample(date, rhythm(i))),
        }
    }
}

impl TrackerPlugin for Household {
    fn vendor(&self) -> Vendor {
        Vendor::Emfit
    }

    fn notification_title(&self) -> &'static str {
        "Emfit Anomaly Alert"
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Session, DetectorError> {
        credentials
            .token
            .as_ref()
            .map(Session::new)
            .ok_or_else(|| DetectorError::Authentication("token required".into()))
    }

    fn list_devices(&self, _: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError> {
        Ok(self
            .devices
            .iter()
            .map(|(id, name, _)| DeviceDescriptor::new(*id, *name, Vendor::Emfit))
            .collect())
    }

    fn fetch_metrics(
        &self,
        _: &Session,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawSample>, DetectorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let sleeper = self
            .devices
            .iter()
            .find(|(id, _, _)| *id == device_id)
            .map(|(_, _, sleeper)| *sleeper)
            .ok_or_else(|| DetectorError::PermanentFetch(format!("unknown device '{device_id}'")))?;
        Ok(start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter_map(|d| Self::night(sleeper, d))
            .collect())
    }
}

fn config() -> DetectorConfig {
    DetectorConfig {
        credentials: Credentials::with_token("secret"),
        fetch: FetchConfig {
            max_attempts: 2,
            retry_backoff_ms: 0,
            request_timeout_secs: 1,
        },
        ..DetectorConfig::default()
    }
}

fn run(config: DetectorConfig, household: Household) -> RunReport {
    let clock = Arc::new(FixedClock::at_noon(today()));
    Orchestrator::new(config, Box::new(household), clock)
        .unwrap()
        .run()
        .unwrap()
}

#[test]
fn test_elevated_heart_rate_today_is_flagged() {
    let report = run(config(), Household::new(vec![("4242", "Bedroom", Sleeper::Feverish)]));
    assert_eq!(report.successes(), 1);

    let result = report.devices[0].result().unwrap();
    assert_eq!(result.rows, 91);
    assert_eq!(result.history.len(), 91);
    assert_eq!(result.window_start, window_start());
    assert_eq!(result.window_end, today());

    assert_eq!(result.latest.date, today());
    assert!(result.latest_is_today);
    assert!(result.latest.is_anomaly, "score {}", result.latest.score);
    assert_eq!(result.latest.source, AnomalySource::Model);

    // About 5% of the 90 training nights sit below the threshold
    let training_flagged = result
        .history
        .iter()
        .filter(|r| r.date < today() && r.is_anomaly)
        .count();
    assert!((4..=5).contains(&training_flagged), "flagged {training_flagged}");
    assert_eq!(result.flagged_count, training_flagged + 1);
}

#[test]
fn test_device_without_nights_fails_alone() {
    let report = run(
        config(),
        Household::new(vec![
            ("1", "Main", Sleeper::Feverish),
            ("2", "Guest", Sleeper::Silent),
        ]),
    );

    assert_eq!(report.devices.len(), 2);
    assert!(report.devices[0].is_success());

    let failure = report.devices[1].failure().unwrap();
    assert_eq!(failure.stage, Stage::Preprocess);
    assert_eq!(failure.kind, ErrorKind::Data);
}

#[test]
fn test_unknown_device_fails_at_fetch() {
    let config = DetectorConfig {
        device_ids: vec!["1".into(), "ghost".into()],
        ..config()
    };
    let report = run(config, Household::new(vec![("1", "Main", Sleeper::Calm)]));

    assert_eq!(report.successes(), 1);
    let failure = report.devices[1].failure().unwrap();
    assert_eq!(failure.stage, Stage::Fetch);
    assert_eq!(failure.kind, ErrorKind::Fetch);
    assert!(failure.message.contains("ghost"));
    assert_eq!(report.devices[1].device.display_name, "ghost");
}

#[test]
fn test_missing_today_reports_previous_night() {
    let report = run(config(), Household::new(vec![("1", "Main", Sleeper::Unsynced)]));
    let result = report.devices[0].result().unwrap();
    assert_eq!(result.rows, 90);
    assert!(!result.latest_is_today);
    assert_eq!(result.latest.date, today() - Duration::days(1));
}

#[test]
fn test_forced_outlier_on_calm_night() {
    let forced_date = today() - Duration::days(10);
    let plain = run(config(), Household::new(vec![("1", "Main", Sleeper::Calm)]));
    let forced = run(
        DetectorConfig {
            force_outlier_date: Some(forced_date),
            ..config()
        },
        Household::new(vec![("1", "Main", Sleeper::Calm)]),
    );

    let plain = &plain.devices[0].result().unwrap().history;
    let forced = &forced.devices[0].result().unwrap().history;
    for (before, after) in plain.iter().zip(forced) {
        if after.date == forced_date {
            assert!(after.is_anomaly);
            assert_eq!(after.source, AnomalySource::Forced);
            assert_eq!(after.score, before.score);
        } else {
            assert_eq!(after, before);
        }
    }
}

#[test]
fn test_cached_rerun_is_idempotent() {
    let clock = Arc::new(FixedClock::at_noon(today()));
    let cache = Arc::new(CacheStore::new(Box::new(MemoryStore::new()), clock.clone(), 3600));
    let household = Household::new(vec![("1", "Main", Sleeper::Feverish)]);
    let calls = household.calls.clone();
    let orchestrator = Orchestrator::new(config(), Box::new(household), clock)
        .unwrap()
        .with_cache(cache);

    let first = orchestrator.run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 91);

    let second = orchestrator.run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 91);
    assert_eq!(first.devices, second.devices);
}

#[test]
fn test_file_cache_serves_a_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FixedClock::at_noon(today()));
    let open_cache = || {
        Arc::new(CacheStore::new(
            Box::new(FileStore::open(dir.path()).unwrap()),
            clock.clone(),
            3600,
        ))
    };

    let first = Orchestrator::new(
        config(),
        Box::new(Household::new(vec![("1", "Main", Sleeper::Feverish)])),
        clock.clone(),
    )
    .unwrap()
    .with_cache(open_cache())
    .run()
    .unwrap();
    assert_eq!(FileStore::open(dir.path()).unwrap().len().unwrap(), 91);

    let household = Household::new(vec![("1", "Main", Sleeper::Feverish)]);
    let calls = household.calls.clone();
    let second = Orchestrator::new(config(), Box::new(household), clock.clone())
        .unwrap()
        .with_cache(open_cache())
        .run()
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(first.devices, second.devices);
    assert_eq!(second.cache.unwrap().hits, 91);
}

#[test]
fn test_only_today_expires() {
    let clock = Arc::new(FixedClock::at_noon(today()));
    let cache = Arc::new(CacheStore::new(Box::new(MemoryStore::new()), clock.clone(), 3600));
    let household = Household::new(vec![("1", "Main", Sleeper::Calm)]);
    let calls = household.calls.clone();
    let orchestrator = Orchestrator::new(config(), Box::new(household), clock.clone())
        .unwrap()
        .with_cache(cache);

    orchestrator.run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 91);

    clock.advance(Duration::hours(2));
    orchestrator.run().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 92);
}
