//! External collaborators
//!
//! Push notification and natural-language explanation of an anomalous latest
//! night. Both are optional and never fatal to a run.

use serde::Deserialize;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::config::ExplainerConfig;
use crate::error::DetectorError;
use crate::plugins::http::{check_status, HttpRequest, HttpTransport};
use crate::stats::WindowContext;
use crate::types::{AnomalyResult, DeviceDescriptor, Metric};

pub const PUSHOVER_MESSAGES_URL: &str = "https://api.pushover.net/1/messages.json";

/// Fallback text when the explainer fails or times out
pub const EXPLANATION_UNAVAILABLE: &str = "explanation unavailable";

const SYSTEM_PROMPT: &str =
    "You are a sleep health analyst. Provide clear, concise explanations of sleep data anomalies.";

/// Delivers alert text to the user
pub trait Notifier: Send + Sync {
    fn send(&self, message: &str) -> Result<(), DetectorError>;
}

/// Explains why a night was flagged
pub trait Explainer: Send + Sync {
    fn explain(&self, result: &AnomalyResult, context: &WindowContext)
        -> Result<String, DetectorError>;
}

/// Pushover push notifications
pub struct PushoverNotifier {
    transport: Arc<dyn HttpTransport>,
    token: String,
    user: String,
    title: String,
    url: String,
}

impl PushoverNotifier {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        token: impl Into<String>,
        user: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            token: token.into(),
            user: user.into(),
            title: title.into(),
            url: PUSHOVER_MESSAGES_URL.to_string(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

impl Notifier for PushoverNotifier {
    fn send(&self, message: &str) -> Result<(), DetectorError> {
        let request = HttpRequest::post(&self.url).form(&[
            ("token", self.token.as_str()),
            ("user", self.user.as_str()),
            ("message", message),
            ("title", self.title.as_str()),
        ]);
        let response = self
            .transport
            .execute(&request)
            .map_err(|e| DetectorError::Notification(e.to_string()))?;
        check_status(&response, "Pushover").map_err(|e| DetectorError::Notification(e.to_string()))
    }
}

/// Chat-completion explainer for OpenAI-compatible endpoints
pub struct OpenAiExplainer {
    transport: Arc<dyn HttpTransport>,
    config: ExplainerConfig,
}

impl OpenAiExplainer {
    pub fn new(transport: Arc<dyn HttpTransport>, config: ExplainerConfig) -> Self {
        Self { transport, config }
    }
}

impl Explainer for OpenAiExplainer {
    fn explain(
        &self,
        result: &AnomalyResult,
        context: &WindowContext,
    ) -> Result<String, DetectorError> {
        if self.config.api_key.is_empty() {
            return Err(DetectorError::Explanation("no API key configured".to_string()));
        }

        let body = json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(result, context) },
            ],
        });
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let request = HttpRequest::post(url).bearer(&self.config.api_key).json(body);

        let response = self
            .transport
            .execute(&request)
            .map_err(|e| DetectorError::Explanation(e.to_string()))?;
        check_status(&response, "chat completion")
            .map_err(|e| DetectorError::Explanation(e.to_string()))?;
        let completion: ChatCompletion = serde_json::from_str(&response.body)
            .map_err(|e| DetectorError::Explanation(format!("unexpected response: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| DetectorError::Explanation("empty completion".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Prompt describing the flagged night against its window
pub fn build_prompt(result: &AnomalyResult, context: &WindowContext) -> String {
    let row = &result.feature_values;
    let mut prompt = format!(
        "Analyze this sleep data anomaly detected by an isolation forest:\n\n\
         Outlier night ({}):\n\
         - Heart rate: {:.1} bpm\n\
         - Respiratory rate: {:.1} breaths/min\n\
         - Sleep duration: {:.0} min\n\
         - Sleep score: {:.1}\n\
         - Anomaly score: {:.4} (more negative = more anomalous)\n\n\
         Historical context ({} days):\n",
        result.date,
        row.heart_rate,
        row.respiratory_rate,
        row.sleep_duration_minutes,
        row.sleep_score,
        result.score,
        context.days,
    );

    for (metric, m) in &context.metrics {
        let _ = write!(
            prompt,
            "\n{}:\n- Current: {:.1}\n- Mean: {:.1} (±{:.1})\n\
             - Percentiles: P10={:.1}, P25={:.1}, P50={:.1}, P75={:.1}, P90={:.1}\n",
            metric.label(),
            row.get(*metric),
            m.mean,
            m.std,
            m.p10,
            m.p25,
            m.p50,
            m.p75,
            m.p90,
        );
    }

    prompt.push_str(
        "\nIn 2-3 sentences, explain why this night was flagged. Focus on the metrics \
         that differ most from the historical pattern and what they may indicate, \
         such as the onset of illness, and suggest what to watch next.",
    );
    prompt
}

/// Alert body for an anomalous latest night
pub fn summary_text(
    device: &DeviceDescriptor,
    result: &AnomalyResult,
    explanation: Option<&str>,
) -> String {
    let row = &result.feature_values;
    let mut text = format!(
        "{} ({}) anomaly {} (HR {:.0}, RR {:.1}, Score {:.0}, IF {:.4})",
        device.display_name,
        device.vendor,
        result.date,
        row.get(Metric::HeartRate),
        row.get(Metric::RespiratoryRate),
        row.get(Metric::SleepScore),
        result.score,
    );
    if let Some(explanation) = explanation {
        let _ = write!(text, "\n\nAnalysis: {explanation}");
    }
    text
}
