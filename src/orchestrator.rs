//! Run orchestration
//!
//! Drives one detection run: authenticate, resolve devices, then for every
//! device fetch (through the cache) → preprocess → fit/score → package.
//! A failing stage turns into a failure entry for that device only; the run
//! always reports on every resolved device.

use chrono::NaiveDate;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::collaborators::{
    summary_text, Explainer, Notifier, OpenAiExplainer, PushoverNotifier, EXPLANATION_UNAVAILABLE,
};
use crate::config::DetectorConfig;
use crate::error::DetectorError;
use crate::model::AnomalyModel;
use crate::plugins::{create_plugin, HttpTransport, ReqwestTransport, Session, TrackerPlugin};
use crate::preprocess::{FeatureMatrix, Preprocessor};
use crate::resolver::DeviceResolver;
use crate::stats::{self, WindowContext};
use crate::types::{
    AnomalyResult, DeviceDescriptor, DeviceFailure, DeviceOutcome, DeviceReport, DeviceRunResult,
    RawSample, RunReport, Stage,
};

type StageResult<T> = Result<T, (Stage, DetectorError)>;

fn at(stage: Stage) -> impl Fn(DetectorError) -> (Stage, DetectorError) {
    move |e| (stage, e)
}

/// Multi-device detection run
pub struct Orchestrator {
    config: DetectorConfig,
    plugin: Box<dyn TrackerPlugin>,
    clock: Arc<dyn Clock>,
    cache: Option<Arc<CacheStore>>,
    notifier: Option<Box<dyn Notifier>>,
    explainer: Option<Box<dyn Explainer>>,
}

impl Orchestrator {
    /// Orchestrator without cache or collaborators; the config is validated
    pub fn new(
        config: DetectorConfig,
        plugin: Box<dyn TrackerPlugin>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DetectorError> {
        config.validate()?;
        Ok(Self {
            config,
            plugin,
            clock,
            cache: None,
            notifier: None,
            explainer: None,
        })
    }

    /// Production wiring: reqwest transport, vendor plugin, file cache and
    /// whichever collaborators the config enables
    pub fn from_config(config: DetectorConfig, clock: Arc<dyn Clock>) -> Result<Self, DetectorError> {
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(
            Duration::from_secs(config.fetch.request_timeout_secs),
        )?);
        let plugin = create_plugin(config.vendor, transport.clone());

        let cache = if config.cache.enabled {
            Some(Arc::new(CacheStore::from_config(&config.cache, clock.clone())?))
        } else {
            None
        };

        let notifier: Option<Box<dyn Notifier>> = match (
            config.alert.enabled,
            &config.alert.pushover_token,
            &config.alert.pushover_user,
        ) {
            (true, Some(token), Some(user)) => Some(Box::new(PushoverNotifier::new(
                transport.clone(),
                token.clone(),
                user.clone(),
                plugin.notification_title(),
            ))),
            (true, _, _) => {
                warn!("alerting enabled without Pushover credentials, alerts will be skipped");
                None
            }
            _ => None,
        };

        let explainer: Option<Box<dyn Explainer>> = match &config.explainer {
            Some(explainer) if !explainer.api_key.is_empty() => {
                let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(
                    explainer.timeout_secs,
                ))?);
                Some(Box::new(OpenAiExplainer::new(transport, explainer.clone())))
            }
            Some(_) => {
                warn!("explainer configured without an API key, explanations will be skipped");
                None
            }
            None => None,
        };

        let mut orchestrator = Self::new(config, plugin, clock)?;
        orchestrator.cache = cache;
        orchestrator.notifier = notifier;
        orchestrator.explainer = explainer;
        Ok(orchestrator)
    }

    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_explainer(mut self, explainer: Box<dyn Explainer>) -> Self {
        self.explainer = Some(explainer);
        self
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn plugin(&self) -> &dyn TrackerPlugin {
        self.plugin.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<CacheStore>> {
        self.cache.as_ref()
    }

    /// Authenticate with retries for transient failures
    pub fn authenticate(&self) -> Result<Session, DetectorError> {
        self.with_retry("authenticate", || {
            self.plugin.authenticate(&self.config.credentials)
        })
    }

    /// Devices the run would process
    pub fn resolve_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError> {
        DeviceResolver::new(self.plugin.as_ref()).resolve(session, &self.config.device_ids)
    }

    /// Execute a full run.
    ///
    /// Fails only when no device set can be established; per-device problems
    /// are reported inside the returned [`RunReport`].
    pub fn run(&self) -> Result<RunReport, DetectorError> {
        let session = match self.authenticate() {
            Ok(session) => session,
            Err(e) if !self.config.device_ids.is_empty() => {
                error!(error = %e, "authentication failed");
                let devices = DeviceResolver::new(self.plugin.as_ref())
                    .configured(&self.config.device_ids)
                    .into_iter()
                    .map(|device| DeviceReport {
                        device,
                        outcome: DeviceOutcome::Failure(DeviceFailure::new(Stage::ResolveDevice, &e)),
                    })
                    .collect();
                return Ok(self.report(devices));
            }
            Err(e) => return Err(e),
        };

        let devices = self.resolve_devices(&session)?;
        info!(
            vendor = %self.plugin.vendor(),
            devices = devices.len(),
            parallelism = self.config.parallelism,
            "starting detection run"
        );

        let reports = if self.config.parallelism > 1 && devices.len() > 1 {
            self.run_parallel(&session, &devices)
        } else {
            devices
                .iter()
                .map(|device| self.run_device(&session, device))
                .collect()
        };
        Ok(self.report(reports))
    }

    fn report(&self, devices: Vec<DeviceReport>) -> RunReport {
        RunReport {
            generated_at: self.clock.now(),
            vendor: self.plugin.vendor(),
            devices,
            cache: self.cache.as_ref().map(|c| c.stats()),
        }
    }

    /// Devices on scoped worker threads; reports keep resolution order
    fn run_parallel(&self, session: &Session, devices: &[DeviceDescriptor]) -> Vec<DeviceReport> {
        let workers = self.config.parallelism.min(devices.len());
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<DeviceReport>>> = Mutex::new(vec![None; devices.len()]);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    let Some(device) = devices.get(i) else {
                        break;
                    };
                    let report = self.run_device(session, device);
                    let mut slots = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    slots[i] = Some(report);
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }

    /// Run the pipeline for one device; never fails
    pub fn run_device(&self, session: &Session, device: &DeviceDescriptor) -> DeviceReport {
        let outcome = match self.process_device(session, device) {
            Ok(result) => DeviceOutcome::Success(Box::new(result)),
            Err((stage, e)) => {
                error!(device_id = %device.id, %stage, error = %e, "device run failed");
                DeviceOutcome::Failure(DeviceFailure::new(stage, &e))
            }
        };
        DeviceReport {
            device: device.clone(),
            outcome,
        }
    }

    fn process_device(
        &self,
        session: &Session,
        device: &DeviceDescriptor,
    ) -> StageResult<DeviceRunResult> {
        let today = self.clock.today();
        let window_start = today - chrono::Duration::days(i64::from(self.config.training_window_days));

        // Stage 1: Fetch raw nights
        let samples = self
            .fetch_window(session, &device.id, window_start, today)
            .map_err(at(Stage::Fetch))?;
        debug!(device_id = %device.id, samples = samples.len(), "fetched window");

        // Stage 2: Preprocess into a feature matrix
        let matrix = Preprocessor::new(self.config.preprocess.clone())
            .process(&samples, window_start, today)
            .map_err(at(Stage::Preprocess))?;

        // Stage 3: Fit and score
        let results = AnomalyModel::new(self.config.model.clone())
            .fit_score(&matrix, self.config.force_outlier_date)
            .map_err(at(Stage::FitScore))?;

        // Stage 4: Package results and notify
        self.package(device, window_start, today, &matrix, results)
            .map_err(at(Stage::Package))
    }

    /// Nights for `start..=end`, read day by day through the cache when enabled
    fn fetch_window(
        &self,
        session: &Session,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawSample>, DetectorError> {
        let Some(cache) = &self.cache else {
            return self.with_retry("fetch", || {
                self.plugin.fetch_metrics(session, device_id, start, end)
            });
        };

        let mut samples = Vec::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            let sample = cache.get_or_fetch_with(self.plugin.vendor(), device_id, date, || {
                self.with_retry("fetch", || {
                    self.plugin.fetch_metrics(session, device_id, date, date)
                })
            })?;
            samples.extend(sample);
        }
        Ok(samples)
    }

    /// Retry transient failures with doubling backoff
    fn with_retry<T, F>(&self, operation: &str, mut call: F) -> Result<T, DetectorError>
    where
        F: FnMut() -> Result<T, DetectorError>,
    {
        let max_attempts = self.config.fetch.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.fetch.retry_backoff_ms);
        let mut attempt = 1;
        loop {
            match call() {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(operation, attempt, max_attempts, error = %e, "transient failure, retrying");
                    thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn package(
        &self,
        device: &DeviceDescriptor,
        window_start: NaiveDate,
        window_end: NaiveDate,
        matrix: &FeatureMatrix,
        history: Vec<AnomalyResult>,
    ) -> Result<DeviceRunResult, DetectorError> {
        let latest = history
            .last()
            .cloned()
            .ok_or_else(|| DetectorError::Model("no scored rows".to_string()))?;
        let flagged_count = history.iter().filter(|r| r.is_anomaly).count();

        let explanation = if latest.is_anomaly {
            self.explain(device, &latest, matrix)
        } else {
            None
        };
        let notified = latest.is_anomaly && self.notify(device, &latest, explanation.as_deref());

        info!(
            device_id = %device.id,
            rows = matrix.len(),
            flagged = flagged_count,
            latest = %latest.date,
            latest_anomalous = latest.is_anomaly,
            "device run complete"
        );

        Ok(DeviceRunResult {
            window_start,
            window_end,
            rows: matrix.len(),
            summary: stats::summarize_rows(&matrix.rows),
            latest_is_today: matrix.today_index.is_some(),
            history,
            latest,
            flagged_count,
            explanation,
            notified,
        })
    }

    fn explain(
        &self,
        device: &DeviceDescriptor,
        latest: &AnomalyResult,
        matrix: &FeatureMatrix,
    ) -> Option<String> {
        let explainer = self.explainer.as_ref()?;
        let context = WindowContext::from_rows(&matrix.rows);
        match explainer.explain(latest, &context) {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "explanation failed");
                Some(EXPLANATION_UNAVAILABLE.to_string())
            }
        }
    }

    fn notify(&self, device: &DeviceDescriptor, latest: &AnomalyResult, explanation: Option<&str>) -> bool {
        if !self.config.alert.enabled {
            return false;
        }
        let Some(notifier) = &self.notifier else {
            return false;
        };
        match notifier.send(&summary_text(device, latest, explanation)) {
            Ok(()) => true,
            Err(e) => {
                warn!(device_id = %device.id, error = %e, "notification failed");
                false
            }
        }
    }
}
