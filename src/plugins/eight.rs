//! Eight Sleep plugin
//!
//! Logs in with the account email and password, enumerates pods from the user
//! profile and reads nightly values from the per-user trends endpoint.

use chrono::NaiveDate;
use moka::sync::Cache;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::http::{decode, HttpRequest, HttpTransport};
use super::{id_to_string, into_daily_series, parse_day, validate_request, Session, TrackerPlugin};
use crate::config::Credentials;
use crate::error::DetectorError;
use crate::types::{DeviceDescriptor, RawSample, Vendor};

pub const EIGHT_API_BASE: &str = "https://client-api.8slp.net/v1";

const SESSION_HEADER: &str = "Session-Token";

/// How long a session's pod list is trusted before the profile is read again
const POD_LIST_TTL: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Eight Sleep plugin
pub struct EightSleepPlugin {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    /// Pod ids per session token
    pods: Cache<String, Arc<Vec<String>>>,
}

impl EightSleepPlugin {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_base_url(transport, EIGHT_API_BASE)
    }

    pub fn with_base_url(transport: Arc<dyn HttpTransport>, base_url: &str) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            pods: Cache::builder()
                .max_capacity(16)
                .time_to_live(POD_LIST_TTL)
                .build(),
        }
    }

    fn pod_ids(&self, session: &Session) -> Result<Vec<String>, DetectorError> {
        let request = HttpRequest::get(format!("{}/users/me", self.base_url))
            .header(SESSION_HEADER, session.token.clone());
        let response = self.transport.execute(&request)?;
        let me: MeResponse = decode(&response, "Eight Sleep user")?;

        Ok(me
            .user
            .and_then(|u| u.devices)
            .unwrap_or_default()
            .iter()
            .filter_map(id_to_string)
            .collect())
    }

    /// Fail unless the pod belongs to the signed-in user
    fn check_owned(&self, session: &Session, device_id: &str) -> Result<(), DetectorError> {
        let pods = self
            .pods
            .try_get_with(session.token.clone(), || self.pod_ids(session).map(Arc::new))
            .map_err(DetectorError::from_shared)?;
        if pods.iter().any(|id| id == device_id) {
            Ok(())
        } else {
            Err(DetectorError::PermanentFetch(format!(
                "pod '{device_id}' is not registered to this Eight Sleep account"
            )))
        }
    }

    fn user_id<'a>(&self, session: &'a Session) -> Result<&'a str, DetectorError> {
        session.account_id.as_deref().ok_or_else(|| {
            DetectorError::Authentication("Eight Sleep session has no user id".to_string())
        })
    }
}

impl TrackerPlugin for EightSleepPlugin {
    fn vendor(&self) -> Vendor {
        Vendor::Eight
    }

    fn notification_title(&self) -> &'static str {
        "Eight Sleep Anomaly Alert"
    }

    fn authenticate(&self, credentials: &Credentials) -> Result<Session, DetectorError> {
        let (Some(email), Some(password)) = (
            credentials.username.as_deref(),
            credentials.password.as_deref(),
        ) else {
            return Err(DetectorError::Authentication(
                "EIGHT_USERNAME and EIGHT_PASSWORD must be set".to_string(),
            ));
        };

        let request = HttpRequest::post(format!("{}/login", self.base_url))
            .json(json!({ "email": email, "password": password }));
        let response = self.transport.execute(&request)?;
        let login: LoginResponse = decode(&response, "Eight Sleep login")?;

        match login.session {
            Some(LoginSession {
                token: Some(token),
                user_id: Some(user_id),
            }) if !token.is_empty() => Ok(Session {
                token,
                account_id: Some(user_id),
            }),
            _ => Err(DetectorError::Authentication(
                "Eight Sleep login response carried no session".to_string(),
            )),
        }
    }

    fn list_devices(&self, session: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError> {
        let ids = self.pod_ids(session)?;
        self.pods.insert(session.token.clone(), Arc::new(ids.clone()));

        Ok(ids
            .into_iter()
            .map(|id| {
                let name = format!("Eight Sleep Pod ({id})");
                DeviceDescriptor::new(id, name, Vendor::Eight)
            })
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
        let user_id = self.user_id(session)?;
        self.check_owned(session, device_id)?;

        let request = HttpRequest::get(format!("{}/users/{user_id}/trends", self.base_url))
            .header(SESSION_HEADER, session.token.clone())
            .query("tz", "UTC")
            .query("from", start.format("%Y-%m-%d").to_string())
            .query("to", end.format("%Y-%m-%d").to_string());
        let response = self.transport.execute(&request)?;
        let trends: TrendsResponse = decode(&response, "Eight Sleep trends")?;

        let samples = trends
            .days
            .unwrap_or_default()
            .into_iter()
            .filter_map(TrendDay::into_sample);
        Ok(into_daily_series(samples, start, end))
    }
}

// Eight Sleep API response structures

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session: Option<LoginSession>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginSession {
    token: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    user: Option<MeUser>,
}

#[derive(Debug, Deserialize)]
struct MeUser {
    devices: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct TrendsResponse {
    days: Option<Vec<TrendDay>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrendDay {
    day: String,
    score: Option<f64>,
    /// Seconds
    sleep_duration: Option<f64>,
    tnt: Option<f64>,
    sleep_quality_score: Option<SleepQuality>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SleepQuality {
    heart_rate: Option<Average>,
    respiratory_rate: Option<Average>,
}

#[derive(Debug, Deserialize)]
struct Average {
    average: Option<f64>,
}

impl TrendDay {
    fn into_sample(self) -> Option<RawSample> {
        let mut sample = RawSample::new(parse_day(&self.day)?);
        let quality = self.sleep_quality_score.as_ref();
        sample.heart_rate = quality
            .and_then(|q| q.heart_rate.as_ref())
            .and_then(|a| a.average);
        sample.respiratory_rate = quality
            .and_then(|q| q.respiratory_rate.as_ref())
            .and_then(|a| a.average);
        sample.sleep_duration_minutes = self.sleep_duration.map(|s| s / 60.0);
        sample.sleep_score = self.score;
        if let Some(tnt) = self.tnt {
            sample.extras.insert("toss_and_turn".to_string(), tnt);
        }
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::http::testing::ScriptedTransport;
    use crate::plugins::http::HttpResponse;

    fn plugin(transport: &Arc<ScriptedTransport>) -> EightSleepPlugin {
        EightSleepPlugin::with_base_url(transport.clone(), "https://eight.test/v1")
    }

    fn session() -> Session {
        Session {
            token: "sess".into(),
            account_id: Some("user-9".into()),
        }
    }

    #[test]
    fn test_login_yields_user_scoped_session() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "/login",
            HttpResponse::ok(r#"{"session": {"userId": "user-9", "token": "sess", "expirationDate": "2030-01-01"}}"#),
        );
        let s = plugin(&transport)
            .authenticate(&Credentials::with_login("me@example.com", "pw"))
            .unwrap();
        assert_eq!(s, session());
    }

    #[test]
    fn test_login_requires_email_and_password() {
        let transport = Arc::new(ScriptedTransport::new());
        let err = plugin(&transport)
            .authenticate(&Credentials::with_token("x"))
            .unwrap_err();
        assert!(matches!(err, DetectorError::Authentication(_)));
    }

    #[test]
    fn test_list_devices() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.respond(
            "/users/me",
            HttpResponse::ok(r#"{"user": {"userId": "user-9", "devices": ["pod-a1"]}}"#),
        );
        let devices = plugin(&transport).list_devices(&session()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "pod-a1");
        assert_eq!(devices[0].display_name, "Eight Sleep Pod (pod-a1)");
    }

    fn with_pods(transport: &Arc<ScriptedTransport>) {
        transport.respond(
            "/users/me",
            HttpResponse::ok(r#"{"user": {"userId": "user-9", "devices": ["pod-a1", 31337]}}"#),
        );
    }

    #[test]
    fn test_fetch_maps_nested_quality_scores() {
        let transport = Arc::new(ScriptedTransport::new());
        with_pods(&transport);
        transport.respond(
            "/users/user-9/trends",
            HttpResponse::ok(
                r#"{"days": [{
                    "day": "2024-03-10",
                    "score": 88,
                    "sleepDuration": 27000,
                    "tnt": 22,
                    "sleepQualityScore": {
                        "heartRate": {"average": 57.5},
                        "respiratoryRate": {"average": 15.5}
                    }
                }]}"#,
            ),
        );
        let d = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let samples = plugin(&transport)
            .fetch_metrics(&session(), "pod-a1", d, d)
            .unwrap();

        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].heart_rate, Some(57.5));
        assert_eq!(samples[0].respiratory_rate, Some(15.5));
        assert_eq!(samples[0].sleep_duration_minutes, Some(450.0));
        assert_eq!(samples[0].sleep_score, Some(88.0));
        assert_eq!(samples[0].extras.get("toss_and_turn"), Some(&22.0));
    }

    #[test]
    fn test_fetch_rejects_unregistered_pod() {
        let transport = Arc::new(ScriptedTransport::new());
        with_pods(&transport);
        transport.respond("/users/user-9/trends", HttpResponse::ok(r#"{"days": []}"#));
        let d = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let err = plugin(&transport)
            .fetch_metrics(&session(), "pod-zz", d, d)
            .unwrap_err();

        assert!(matches!(err, DetectorError::PermanentFetch(_)));
        let sent = transport.recorded();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].url.ends_with("/users/me"));
    }

    #[test]
    fn test_pod_list_read_once_per_session() {
        let transport = Arc::new(ScriptedTransport::new());
        with_pods(&transport);
        transport.respond("/users/user-9/trends", HttpResponse::ok(r#"{"days": []}"#));
        let p = plugin(&transport);
        let d = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        for id in ["pod-a1", "31337", "pod-a1"] {
            p.fetch_metrics(&session(), id, d, d).unwrap();
        }

        let profile_reads = transport
            .recorded()
            .iter()
            .filter(|r| r.url.ends_with("/users/me"))
            .count();
        assert_eq!(profile_reads, 1);
    }
}
