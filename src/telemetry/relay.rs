//! # Backend Relay
//!
//! Forwards committed measurements to the HTTP backend.
//!
//! Every relay starts with an accessibility probe (a GET on the backend
//! path). Only a reachable endpoint receives the POST, which is attempted
//! up to a fixed number of times with a fixed delay in between. Failures
//! never leave this module except as a [`RelayOutcome`].

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::RelayError;
use crate::storage::NetworkCredentials;

/// Status and body of one backend response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendResponse {
    pub status: u16,
    pub body: String,
}

impl BackendResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// JSON document POSTed for every measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub tank_id: u32,
    pub level: u16,
    pub percentage: u8,
    pub api_key: String,
}

/// HTTP backend seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    /// GET the backend path.
    async fn probe(&self) -> Result<BackendResponse, RelayError>;

    /// POST one submission to the backend path.
    async fn submit(&self, submission: &Submission) -> Result<BackendResponse, RelayError>;
}

/// `reqwest` implementation of [`Backend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl HttpBackend {
    /// Build a backend for the stored credentials.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Transport`] if the HTTP client cannot be built.
    pub fn new(credentials: &NetworkCredentials, config: &BackendConfig) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .connect_timeout(Duration::from_millis(config.probe_timeout_ms))
            .user_agent(concat!("tank-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let url = credentials.backend_url();
        info!(url = %url, "Backend relay configured");

        Ok(Self {
            client,
            url,
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn read_response(response: reqwest::Response) -> Result<BackendResponse, RelayError> {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Ok(BackendResponse { status, body })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn probe(&self) -> Result<BackendResponse, RelayError> {
        let response = self
            .client
            .get(&self.url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Self::read_response(response).await
    }

    async fn submit(&self, submission: &Submission) -> Result<BackendResponse, RelayError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.request_timeout)
            .json(submission)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        Self::read_response(response).await
    }
}

/// Decide whether a probe response means the endpoint is reachable.
///
/// 403 and 404 are unreachable; 405 is reachable (the path exists but only
/// accepts POST); otherwise a body carrying a `status` or `error` marker is
/// reachable and anything else is not.
pub fn classify_probe(response: &BackendResponse) -> Result<(), RelayError> {
    match response.status {
        403 | 404 => Err(RelayError::BackendUnreachable(format!(
            "HTTP {}",
            response.status
        ))),
        405 => Ok(()),
        _ if response.body.contains("status") || response.body.contains("error") => Ok(()),
        status => Err(RelayError::BackendUnreachable(format!(
            "unrecognized response (HTTP {})",
            status
        ))),
    }
}

/// A submission succeeded only on HTTP 200 or 201.
pub fn classify_submit(response: &BackendResponse) -> Result<(), RelayError> {
    match response.status {
        200 | 201 => Ok(()),
        status => Err(RelayError::BackendHttp(status)),
    }
}

/// Attempt cap and spacing for submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl From<&BackendConfig> for RetryPolicy {
    fn from(config: &BackendConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// How relaying one measurement ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Accepted by the backend after `attempts` POSTs.
    Delivered { attempts: u32 },
    /// Probe said the endpoint is unreachable; nothing was POSTed.
    Unreachable(RelayError),
    /// Every attempt failed.
    Failed { attempts: u32, last_error: RelayError },
}

impl RelayOutcome {
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        matches!(self, RelayOutcome::Delivered { .. })
    }
}

/// Probe the backend, then POST `submission` with bounded retries.
///
/// # Arguments
///
/// * `backend` - Backend to talk to
/// * `submission` - Document to deliver
/// * `policy` - Attempt cap and delay between attempts
///
/// # Returns
///
/// * `RelayOutcome` - Never an error; failures are reported in the outcome
pub async fn relay<B: Backend + ?Sized>(
    backend: &B,
    submission: &Submission,
    policy: RetryPolicy,
) -> RelayOutcome {
    let reachable = match backend.probe().await {
        Ok(response) => classify_probe(&response),
        Err(e) => Err(RelayError::BackendUnreachable(e.to_string())),
    };
    if let Err(e) = reachable {
        warn!(error = %e, "Backend not accessible; skipping relay for this frame");
        return RelayOutcome::Unreachable(e);
    }
    debug!("Backend endpoint accessible");

    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = RelayError::Transport("no attempt made".to_string());

    for attempt in 1..=max_attempts {
        let result = backend
            .submit(submission)
            .await
            .and_then(|response| classify_submit(&response));

        match result {
            Ok(()) => {
                info!(
                    attempt,
                    level = submission.level,
                    percentage = submission.percentage,
                    "Measurement delivered to backend"
                );
                return RelayOutcome::Delivered { attempts: attempt };
            }
            Err(e) => {
                warn!(attempt, max_attempts, error = %e, "Backend submission failed");
                last_error = e;
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.retry_delay).await;
        }
    }

    warn!(attempts = max_attempts, "Giving up on this measurement");
    RelayOutcome::Failed {
        attempts: max_attempts,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn submission() -> Submission {
        Submission {
            tank_id: 1,
            level: 150,
            percentage: 75,
            api_key: "iotlogic".to_string(),
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_millis(5000),
        }
    }

    #[test]
    fn test_classify_probe() {
        assert!(classify_probe(&BackendResponse::new(405, "")).is_ok());
        assert!(classify_probe(&BackendResponse::new(200, r#"{"status":"ok"}"#)).is_ok());
        assert!(classify_probe(&BackendResponse::new(400, r#"{"error":"POST only"}"#)).is_ok());
        assert!(matches!(
            classify_probe(&BackendResponse::new(404, r#"{"error":"missing"}"#)),
            Err(RelayError::BackendUnreachable(_))
        ));
        assert!(classify_probe(&BackendResponse::new(403, "Forbidden")).is_err());
        assert!(classify_probe(&BackendResponse::new(200, "<html>hello</html>")).is_err());
    }

    #[test]
    fn test_classify_submit() {
        assert!(classify_submit(&BackendResponse::new(200, "")).is_ok());
        assert!(classify_submit(&BackendResponse::new(201, "")).is_ok());
        assert_eq!(
            classify_submit(&BackendResponse::new(500, "")),
            Err(RelayError::BackendHttp(500))
        );
        assert_eq!(
            classify_submit(&BackendResponse::new(204, "")),
            Err(RelayError::BackendHttp(204))
        );
    }

    #[test]
    fn test_submission_json_schema() {
        let json = serde_json::to_value(submission()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"tank_id": 1, "level": 150, "percentage": 75, "api_key": "iotlogic"})
        );
    }

    #[tokio::test]
    async fn test_relay_delivers_first_try() {
        let mut backend = MockBackend::new();
        backend
            .expect_probe()
            .times(1)
            .returning(|| Ok(BackendResponse::new(405, "")));
        backend
            .expect_submit()
            .withf(|s| s.level == 150 && s.api_key == "iotlogic")
            .times(1)
            .returning(|_| Ok(BackendResponse::new(200, r#"{"status":"success"}"#)));

        let outcome = relay(&backend, &submission(), policy()).await;
        assert_eq!(outcome, RelayOutcome::Delivered { attempts: 1 });
    }

    #[tokio::test]
    async fn test_unreachable_probe_skips_submission() {
        let mut backend = MockBackend::new();
        backend
            .expect_probe()
            .times(1)
            .returning(|| Ok(BackendResponse::new(404, "Not Found")));
        backend.expect_submit().never();

        let outcome = relay(&backend, &submission(), policy()).await;
        assert!(matches!(outcome, RelayOutcome::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_probe_transport_failure_is_unreachable() {
        let mut backend = MockBackend::new();
        backend
            .expect_probe()
            .returning(|| Err(RelayError::Transport("connection refused".to_string())));
        backend.expect_submit().never();

        let outcome = relay(&backend, &submission(), policy()).await;
        assert!(matches!(outcome, RelayOutcome::Unreachable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let mut backend = MockBackend::new();
        let mut seq = Sequence::new();
        backend
            .expect_probe()
            .returning(|| Ok(BackendResponse::new(200, r#"{"status":"ready"}"#)));
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BackendResponse::new(500, "")));
        backend
            .expect_submit()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(BackendResponse::new(201, "")));

        let start = tokio::time::Instant::now();
        let outcome = relay(&backend, &submission(), policy()).await;

        assert_eq!(outcome, RelayOutcome::Delivered { attempts: 2 });
        assert_eq!(start.elapsed(), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let mut backend = MockBackend::new();
        backend
            .expect_probe()
            .returning(|| Ok(BackendResponse::new(405, "")));
        backend
            .expect_submit()
            .times(3)
            .returning(|_| Err(RelayError::Transport("timed out".to_string())));

        let start = tokio::time::Instant::now();
        let outcome = relay(&backend, &submission(), policy()).await;

        assert_eq!(
            outcome,
            RelayOutcome::Failed {
                attempts: 3,
                last_error: RelayError::Transport("timed out".to_string()),
            }
        );
        // Delay only between attempts, not after the last one
        assert_eq!(start.elapsed(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_http_backend_url_from_credentials() {
        let creds = NetworkCredentials::new("net", "pw", "10.0.0.5", 8080, "/tank/api/tank_update.php", "k");
        let backend = HttpBackend::new(&creds, &BackendConfig::default()).unwrap();
        assert_eq!(backend.url(), "http://10.0.0.5:8080/tank/api/tank_update.php");
    }
}
