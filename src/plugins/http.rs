//! HTTP transport seam
//!
//! Plugins and collaborators describe requests as plain [`HttpRequest`] values
//! and hand them to an [`HttpTransport`]. Production uses a blocking reqwest
//! client; tests script responses in memory.

use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::DetectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = Some(Body::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Executes requests. Network-level failures map to `TransientFetch`.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, DetectorError>;
}

/// Map a non-success status to the fetch error taxonomy
pub fn check_status(response: &HttpResponse, context: &str) -> Result<(), DetectorError> {
    let status = response.status;
    let detail = || {
        let body: String = response.body.chars().take(200).collect();
        format!("{context}: HTTP {status} {body}")
    };
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(DetectorError::Authentication(detail())),
        408 | 429 | 500..=599 => Err(DetectorError::TransientFetch(detail())),
        _ => Err(DetectorError::PermanentFetch(detail())),
    }
}

/// Check the status and decode a JSON body
pub fn decode<T: DeserializeOwned>(
    response: &HttpResponse,
    context: &str,
) -> Result<T, DetectorError> {
    check_status(response, context)?;
    serde_json::from_str(&response.body)
        .map_err(|e| DetectorError::MalformedData(format!("{context}: {e}")))
}

/// Blocking reqwest transport
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, DetectorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sleepwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DetectorError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, DetectorError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder.send().map_err(|e| {
            let what = if e.is_timeout() { "timed out" } else { "failed" };
            DetectorError::TransientFetch(format!("request to {} {what}: {e}", request.url))
        })?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|e| {
            DetectorError::TransientFetch(format!("reading body from {}: {e}", request.url))
        })?;
        Ok(HttpResponse { status, body })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(check_status(&HttpResponse::ok("{}"), "x").is_ok());
        assert!(matches!(
            check_status(&HttpResponse::with_status(401, ""), "x"),
            Err(DetectorError::Authentication(_))
        ));
        assert!(matches!(
            check_status(&HttpResponse::with_status(429, ""), "x"),
            Err(DetectorError::TransientFetch(_))
        ));
        assert!(matches!(
            check_status(&HttpResponse::with_status(503, ""), "x"),
            Err(DetectorError::TransientFetch(_))
        ));
        assert!(matches!(
            check_status(&HttpResponse::with_status(404, "no such device"), "x"),
            Err(DetectorError::PermanentFetch(_))
        ));
    }

    #[test]
    fn test_decode_reports_malformed_body() {
        let err = decode::<serde_json::Value>(&HttpResponse::ok("not json"), "trends")
            .unwrap_err();
        assert!(matches!(err, DetectorError::MalformedData(_)));
    }

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::get("https://example.test/a")
            .bearer("t0k")
            .query("start_date", "2024-01-01");
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.headers[0], ("Authorization".into(), "Bearer t0k".into()));
        assert_eq!(req.query.len(), 1);
    }
}
