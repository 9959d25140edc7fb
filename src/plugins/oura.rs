//! Oura Ring plugin
//!
//! Uses the Oura v2 user collection API with a personal access token. An Oura
//! account carries a single ring, so device enumeration is derived from the
//! account id. Nightly values join the `sleep` periods with the `daily_sleep`
//! score of the same day.

use chrono::{Duration, NaiveDate};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::http::{decode, HttpRequest, HttpTransport};
use super::{into_daily_series, parse_day, validate_request, Session, TrackerPlugin};
use crate::config::Credentials;
use crate::error::DetectorError;
use crate::types::{DeviceDescriptor, RawSample, Vendor};

pub const OURA_API_BASE: &str = "https://api.ouraring.com/v2";

/// Upper bound on followed pagination tokens per request
const MAX_PAGES: usize = 20;

/// Oura Ring plugin
pub struct OuraPlugin {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
}

impl OuraPlugin {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_base_url(transport, OURA_API_BASE)
    }

    pub fn with_base_url(transport: Arc<dyn HttpTransport>, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Id of the account's ring, `None` when the account reports no user id
    fn ring_id(&self, session: &Session) -> Result<Option<String>, DetectorError> {
        let account_id = match &session.account_id {
            Some(id) => Some(id.clone()),
            None => self.personal_info(&session.token)?.id,
        };
        Ok(account_id.map(|id| format!("oura-ring-{id}")))
    }

    fn personal_info(&self, token: &str) -> Result<PersonalInfo, DetectorError> {
        let request = HttpRequest::get(format!("{}/usercollection/personal_info", self.base_url))
            .bearer(token);
        let response = self.transport.execute(&request)?;
        decode(&response, "Oura personal info")
    }

    /// Fetch every page of a user collection document list
    fn collection<T: DeserializeOwned>(
        &self,
        session: &Session,
        name: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<T>, DetectorError> {
        let url = format!("{}/usercollection/{name}", self.base_url);
        let mut documents = Vec::new();
        let mut next_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut request = HttpRequest::get(&url)
                .bearer(&session.token)
                .query("start_date", start.format("%Y-%m-%d").to_string())
                .query("end_date", end.format("%Y-%m-%d").to_string());
            if let Some(token) = &next_token {
                request = request.query("next_token", token.clone());
            }

            let response = self.transport.execute(&request)?;
            let page: Page<T> = decode(&response, &format!("Oura {name}"))?;
            documents.extend(page.data);

            match page.next_token.filter(|t| !t.is_empty()) {
                Some(token) => next_token = Some(token),
                None => break,
            }
        }
        Ok(documents)
    }
}

impl TrackerPlugin for OuraPlugin {
    fn vendor(&self) -> Vendor {
        Vendor::Oura
    }

    fn notification_title(&self) -> &'static str {
        "Oura Anomaly Alert"
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Session, DetectorError> {
        let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) else {
            return Err(DetectorError::Authentication(
                "OURA_API_TOKEN must be set".to_string(),
            ));
        };
        let info = self.personal_info(token)?;
        Ok(Session {
            token: token.to_string(),
            account_id: info.id,
        })
    }

    fn list_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError> {
        Ok(self
            .ring_id(session)?
            .map(|id| DeviceDescriptor::new(id, "Oura Ring", Vendor::Oura))
            .into_iter()
            .collect())
    }

    fn fetch_metrics(
        &self,
        session: &Session,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawSample>, DetectorError> {
        validate_request(device_id, start, end)?;
        // Collections are account-wide; only the account's own ring may read them
        if self.ring_id(session)?.as_deref() != Some(device_id) {
            return Err(DetectorError::PermanentFetch(format!(
                "device '{device_id}' does not belong to this Oura account"
            )));
        }

        // Sleep periods are filtered on their end time, so ask one day further
        let periods: Vec<SleepPeriod> =
            self.collection(session, "sleep", start, end + Duration::days(1))?;
        let scores: Vec<DailySleep> = self.collection(session, "daily_sleep", start, end)?;

        let score_by_day: BTreeMap<NaiveDate, f64> = scores
            .into_iter()
            .filter_map(|d| Some((parse_day(&d.day)?, d.score?)))
            .collect();

        // Longest main sleep per day
        let mut main_sleep: BTreeMap<NaiveDate, SleepPeriod> = BTreeMap::new();
        for period in periods {
            if period.kind.as_deref().is_some_and(|k| k != "long_sleep") {
                continue;
            }
            let Some(day) = parse_day(&period.day) else {
                continue;
            };
            let longer = main_sleep
                .get(&day)
                .map_or(true, |p| period.total_sleep_duration > p.total_sleep_duration);
            if longer {
                main_sleep.insert(day, period);
            }
        }

        let mut days: Vec<NaiveDate> = main_sleep.keys().chain(score_by_day.keys()).copied().collect();
        days.sort();
        days.dedup();

        let samples = days.into_iter().map(|day| {
            let mut sample = RawSample::new(day);
            sample.sleep_score = score_by_day.get(&day).copied();
            if let Some(p) = main_sleep.get(&day) {
                sample.heart_rate = p.average_heart_rate;
                sample.respiratory_rate = p.average_breath;
                sample.sleep_duration_minutes = p.total_sleep_duration.map(|s| s / 60.0);
                if let Some(hrv) = p.average_hrv {
                    sample.extras.insert("average_hrv".to_string(), hrv);
                }
                if let Some(restless) = p.restless_periods {
                    sample.extras.insert("restless_periods".to_string(), restless);
                }
            }
            sample
        });
        Ok(into_daily_series(samples, start, end))
    }
}

// Oura API response structures

#[derive(Debug, Deserialize)]
struct PersonalInfo {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    next_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SleepPeriod {
    day: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    average_heart_rate: Option<f64>,
    average_breath: Option<f64>,
    average_hrv: Option<f64>,
    /// Seconds
    total_sleep_duration: Option<f64>,
    restless_periods: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailySleep {
    day: String,
    score: Option<f64>,
}
