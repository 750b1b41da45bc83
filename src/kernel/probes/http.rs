//! HTTP probe (spec.md §4.1). SSRF-checked, truncates the response body to
//! `Config::probe_http_max_response_bytes` for storage.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use url::Url;

use crate::common::error::ErrorKind;
use crate::domains::cron_tasks::model::HttpMethod;

use super::ssrf;

#[derive(Debug, Clone)]
pub struct HttpProbeResult {
    pub success: bool,
    pub duration_ms: i64,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    client: &reqwest::Client,
    url: &str,
    method: HttpMethod,
    headers: &HashMap<String, String>,
    body: Option<&str>,
    timeout: Duration,
    max_response_bytes: usize,
    ssrf_blocked_cidrs_override: Option<&[String]>,
) -> HttpProbeResult {
    let started = Instant::now();

    let parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(e) => {
            return HttpProbeResult {
                success: false,
                duration_ms: elapsed_ms(started),
                status_code: None,
                response_body: None,
                error: Some(format!("invalid URL: {e}")),
                error_kind: Some(ErrorKind::RequestError),
            }
        }
    };

    if let Err(reason) = ssrf::check_url(&parsed, ssrf_blocked_cidrs_override).await {
        return HttpProbeResult {
            success: false,
            duration_ms: elapsed_ms(started),
            status_code: None,
            response_body: None,
            error: Some(reason),
            error_kind: Some(ErrorKind::SsrfBlocked),
        };
    }

    let mut request = client.request(method.as_reqwest(), parsed);
    for (k, v) in headers {
        request = request.header(k, v);
    }
    if let Some(b) = body {
        request = request.body(b.to_string());
    }
    request = request.timeout(timeout);

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let success = status.as_u16() >= 200 && status.as_u16() < 400;
            let body_bytes = response.bytes().await.unwrap_or_default();
            let truncated: Vec<u8> = body_bytes.iter().take(max_response_bytes).copied().collect();
            let body_text = String::from_utf8_lossy(&truncated).into_owned();
            HttpProbeResult {
                success,
                duration_ms: elapsed_ms(started),
                status_code: Some(status.as_u16()),
                response_body: Some(body_text),
                error: None,
                error_kind: None,
            }
        }
        Err(e) => {
            let error_kind = if e.is_timeout() {
                ErrorKind::Timeout
            } else {
                ErrorKind::RequestError
            };
            HttpProbeResult {
                success: false,
                duration_ms: elapsed_ms(started),
                status_code: None,
                response_body: None,
                error: Some(describe_request_error(&e)),
                error_kind: Some(error_kind),
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}

/// `reqwest::Error`'s own `Display` embeds the full request URL, query
/// string included, on connect/timeout failures — that would defeat the
/// point of `ssrf::redact_url` the moment it's persisted to an `Execution`
/// row. Walk to the root cause (DNS/IO errors don't carry the URL) and
/// append the redacted URL ourselves instead.
fn describe_request_error(e: &reqwest::Error) -> String {
    let mut root: &dyn std::error::Error = e;
    while let Some(source) = root.source() {
        root = source;
    }
    match e.url() {
        Some(url) => format!("{} (url: {})", root, ssrf::redact_url(url)),
        None => root.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = run(
            &client,
            &format!("{}/ok", server.uri()),
            HttpMethod::Get,
            &HashMap::new(),
            None,
            Duration::from_secs(5),
            65536,
            None,
        )
        .await;

        assert!(result.success);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.response_body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn failure_on_5xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = run(
            &client,
            &format!("{}/broken", server.uri()),
            HttpMethod::Get,
            &HashMap::new(),
            None,
            Duration::from_secs(5),
            65536,
            None,
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.status_code, Some(500));
    }

    #[tokio::test]
    async fn ssrf_blocked_before_any_network_call() {
        let client = reqwest::Client::new();
        let result = run(
            &client,
            "http://169.254.169.254/latest/meta-data/",
            HttpMethod::Get,
            &HashMap::new(),
            None,
            Duration::from_secs(5),
            65536,
            None,
        )
        .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::SsrfBlocked));
        assert!(result.status_code.is_none());
    }

    #[tokio::test]
    async fn truncates_body_to_max_response_bytes() {
        let server = MockServer::start().await;
        let big_body = "a".repeat(200);
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_string(big_body))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = run(
            &client,
            &format!("{}/big", server.uri()),
            HttpMethod::Get,
            &HashMap::new(),
            None,
            Duration::from_secs(5),
            10,
            None,
        )
        .await;

        assert_eq!(result.response_body.unwrap().len(), 10);
    }
}
