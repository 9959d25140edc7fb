//! Emfit QS plugin
//!
//! Talks to the Emfit QS API. Devices come from the user's `device_settings`;
//! nightly values come from the trends endpoint.

use chrono::NaiveDate;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use super::http::{decode, HttpRequest, HttpTransport};
use super::{id_to_string, into_daily_series, parse_day, validate_request, Session, TrackerPlugin};
use crate::config::Credentials;
use crate::error::DetectorError;
use crate::types::{DeviceDescriptor, RawSample, Vendor};

pub const EMFIT_API_BASE: &str = "https://qs-api.emfit.com/api/v1";

/// Emfit QS plugin
pub struct EmfitPlugin {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
}

impl EmfitPlugin {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_base_url(transport, EMFIT_API_BASE)
    }

    pub fn with_base_url(transport: Arc<dyn HttpTransport>, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl TrackerPlugin for EmfitPlugin {
    fn vendor(&self) -> Vendor {
        Vendor::Emfit
    }

    fn notification_title(&self) -> &'static str {
        "Emfit Anomaly Alert"
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Session, DetectorError> {
        if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
            debug!("using configured Emfit API token");
            return Ok(Session::new(token));
        }

        let (Some(username), Some(password)) = (
            credentials.username.as_deref(),
            credentials.password.as_deref(),
        ) else {
            return Err(DetectorError::Authentication(
                "either EMFIT_TOKEN or EMFIT_USERNAME/EMFIT_PASSWORD must be set".to_string(),
            ));
        };

        let request = HttpRequest::post(format!("{}/login", self.base_url))
            .form(&[("username", username), ("password", password)]);
        let response = self.transport.execute(&request)?;
        let login: LoginResponse = decode(&response, "Emfit login")?;

        match login.token.filter(|t| !t.is_empty()) {
            Some(token) => Ok(Session::new(token)),
            None => Err(DetectorError::Authentication(
                "Emfit login response carried no token".to_string(),
            )),
        }
    }

    fn list_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError> {
        let request = HttpRequest::get(format!("{}/user/get", self.base_url)).bearer(&session.token);
        let response = self.transport.execute(&request)?;
        let user: UserResponse = decode(&response, "Emfit user")?;

        let devices = user
            .device_settings
            .unwrap_or_default()
            .into_iter()
            .filter_map(|setting| {
                let id = id_to_string(&setting.device_id)?;
                let name = setting
                    .device_name
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| id.clone());
                Some(DeviceDescriptor::new(id, name, Vendor::Emfit))
            })
            .collect();
        Ok(devices)
    }

    fn fetch_metrics(
        &self,
        session: &Session,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawSample>, DetectorError> {
        validate_request(device_id, start, end)?;

        let url = format!(
            "{}/trends/{}/{}/{}",
            self.base_url,
            device_id.trim(),
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d")
        );
        let response = self
            .transport
            .execute(&HttpRequest::get(url).bearer(&session.token))?;
        let trends: TrendsResponse = decode(&response, "Emfit trends")?;

        let samples = trends
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(TrendDay::into_sample);
        Ok(into_daily_series(samples, start, end))
    }
}

// Emfit API response structures

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    device_settings: Option<Vec<DeviceSetting>>,
}

#[derive(Debug, Deserialize)]
struct DeviceSetting {
    #[serde(default)]
    device_id: serde_json::Value,
    device_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrendsResponse {
    data: Option<Vec<TrendDay>>,
}

#[derive(Debug, Deserialize)]
struct TrendDay {
    date: String,
    meas_hr_avg: Option<f64>,
    meas_rr_avg: Option<f64>,
    /// Hours
    sleep_duration: Option<f64>,
    sleep_score: Option<f64>,
    tossnturn_count: Option<f64>,
}

impl TrendDay {
    fn into_sample(self) -> Option<RawSample> {
        let mut sample = RawSample::new(parse_day(&self.date)?);
        sample.heart_rate = self.meas_hr_avg;
        sample.respiratory_rate = self.meas_rr_avg;
        sample.sleep_duration_minutes = self.sleep_duration.map(|h| h * 60.0);
        sample.sleep_score = self.sleep_score;
        if let Some(tnt) = self.tossnturn_count {
            sample.extras.insert("toss_and_turn".to_string(), tnt);
        }
        Some(sample)
    }
}
