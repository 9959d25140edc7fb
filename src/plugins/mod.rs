//! Sleep tracker plugins
//!
//! Each vendor API is wrapped in a [`TrackerPlugin`] that authenticates,
//! enumerates devices and fetches nights, mapping vendor-native fields and
//! units to the canonical [`RawSample`] schema. Nothing outside this module
//! branches on the vendor.

mod eight;
mod emfit;
pub mod http;
mod oura;

pub use eight::EightSleepPlugin;
pub use emfit::EmfitPlugin;
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use oura::OuraPlugin;

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Credentials;
use crate::error::DetectorError;
use crate::types::{DeviceDescriptor, RawSample, Vendor};

/// Authenticated vendor session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    /// Vendor account id, when the API scopes data by user
    pub account_id: Option<String>,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            account_id: None,
        }
    }
}

/// Capability set every sleep tracker integration provides
pub trait TrackerPlugin: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Title used for push notifications
    fn notification_title(&self) -> &'static str;

    /// Fails with `Authentication` when credentials are missing or rejected
    fn authenticate(&self, credentials: &Credentials) -> Result<Session, DetectorError>;

    /// Devices on the account; empty, not an error, when there are none
    fn list_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError>;

    /// Nights in `start..=end`, ascending, at most one per date.
    ///
    /// Network and rate-limit problems are `TransientFetch`; invalid device
    /// ids or ranges are `PermanentFetch`.
    fn fetch_metrics(
        &self,
        session: &Session,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawSample>, DetectorError>;
}

/// Build the plugin for a vendor
pub fn create_plugin(vendor: Vendor, transport: Arc<dyn HttpTransport>) -> Box<dyn TrackerPlugin> {
    match vendor {
        Vendor::Emfit => Box::new(EmfitPlugin::new(transport)),
        Vendor::Oura => Box::new(OuraPlugin::new(transport)),
        Vendor::Eight => Box::new(EightSleepPlugin::new(transport)),
    }
}

/// Reject requests no vendor could answer
pub(crate) fn validate_request(
    device_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<(), DetectorError> {
    let id = device_id.trim();
    if id.is_empty() {
        return Err(DetectorError::PermanentFetch("empty device id".to_string()));
    }
    if id.contains(['/', '?', '#', '\\']) || id.chars().any(char::is_whitespace) {
        return Err(DetectorError::PermanentFetch(format!(
            "malformed device id '{device_id}'"
        )));
    }
    if start > end {
        return Err(DetectorError::PermanentFetch(format!(
            "start date {start} is after end date {end}"
        )));
    }
    Ok(())
}

/// Keep samples inside the range, one per date (first wins), ascending
pub(crate) fn into_daily_series(
    samples: impl IntoIterator<Item = RawSample>,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<RawSample> {
    let mut by_date: BTreeMap<NaiveDate, RawSample> = BTreeMap::new();
    for sample in samples {
        if sample.date < start || sample.date > end {
            continue;
        }
        by_date.entry(sample.date).or_insert(sample);
    }
    by_date.into_values().collect()
}

/// Parse the date part of a vendor date or timestamp string
pub(crate) fn parse_day(raw: &str) -> Option<NaiveDate> {
    let day = raw.get(..10)?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

/// Vendor ids arrive as numbers or strings
pub(crate) fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
