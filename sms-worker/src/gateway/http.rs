//! HTTP client for the SMS gateway API.
//!
//! `POST {base}/messages` with basic auth. The gateway answers 2xx with a
//! per-recipient state once it has queued the SMS on a device.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Gateway, Outcome, SendRequest};
use crate::error::{Error, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody<'a> {
    id: &'a str,
    message: &'a str,
    phone_numbers: [&'a str; 1],
    with_delivery_report: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    recipients: Vec<RecipientState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecipientState {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpGateway {
    client: Client,
    endpoint: String,
    login: Option<String>,
    password: Option<String>,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        login: Option<String>,
        password: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = url::Url::parse(base_url)
            .map_err(|e| Error::validation(format!("invalid gateway url {base_url}: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(32)
            .build()
            .map_err(|e| Error::validation(format!("failed to build gateway client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/messages", base.as_str().trim_end_matches('/')),
            login,
            password,
        })
    }
}

/// Map an HTTP status to a failure outcome. Only called for non-2xx.
fn classify_status(status: StatusCode, body: &str) -> Outcome {
    let reason = format!("gateway returned {}: {}", status.as_u16(), body.trim());
    // 408 request timeout, 425 too early, 429 rate limited
    let transient = status.is_server_error() || matches!(status.as_u16(), 408 | 425 | 429);
    if transient {
        Outcome::TransientFailure(reason)
    } else {
        Outcome::PermanentFailure(reason)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send(&self, request: &SendRequest) -> Outcome {
        let body = SendBody {
            id: &request.correlation_id,
            message: &request.content,
            phone_numbers: [&request.destination],
            with_delivery_report: true,
        };

        let mut call = self.client.post(&self.endpoint).json(&body);
        if let Some(login) = &self.login {
            call = call.basic_auth(login, self.password.as_ref());
        }

        let response = match call.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect"
                } else {
                    "request"
                };
                warn!(
                    correlation_id = %request.correlation_id,
                    kind = kind,
                    error = %e,
                    "gateway_send_error"
                );
                return Outcome::TransientFailure(format!("gateway {kind} error: {e}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let outcome = classify_status(status, &text);
            warn!(
                correlation_id = %request.correlation_id,
                status_code = status.as_u16(),
                outcome = outcome.label(),
                "gateway_send_rejected"
            );
            return outcome;
        }

        let parsed: SendResponse = response.json().await.unwrap_or_default();
        if let Some(failed) = parsed.recipients.iter().find(|r| {
            r.error.is_some() || r.state.as_deref().is_some_and(|s| s.eq_ignore_ascii_case("failed"))
        }) {
            let reason = failed
                .error
                .clone()
                .unwrap_or_else(|| "recipient rejected by gateway".to_string());
            warn!(
                correlation_id = %request.correlation_id,
                reason = %reason,
                "gateway_recipient_failed"
            );
            return Outcome::PermanentFailure(reason);
        }

        let gateway_id = parsed
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| request.correlation_id.clone());
        info!(
            correlation_id = %request.correlation_id,
            gateway_id = %gateway_id,
            status_code = status.as_u16(),
            "gateway_send_accepted"
        );
        Outcome::Accepted(gateway_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> SendRequest {
        SendRequest {
            destination: "+15550000001".to_string(),
            content: "hello".to_string(),
            correlation_id: "msg_1".to_string(),
        }
    }

    fn gateway(base: &str) -> HttpGateway {
        HttpGateway::new(
            base,
            Some("user".to_string()),
            Some("pass".to_string()),
            Duration::from_millis(300),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_accepted_returns_gateway_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "id": "msg_1",
                "message": "hello",
                "phoneNumbers": ["+15550000001"],
                "withDeliveryReport": true
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "id": "gw-123",
                "state": "Pending",
                "recipients": [{"phoneNumber": "+15550000001", "state": "Pending"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = gateway(&server.uri()).send(&request()).await;
        assert_eq!(outcome, Outcome::Accepted("gw-123".to_string()));
    }

    #[tokio::test]
    async fn test_recipient_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "gw-9",
                "recipients": [{"phoneNumber": "+15550000001", "state": "Failed", "error": "invalid number"}]
            })))
            .mount(&server)
            .await;

        let outcome = gateway(&server.uri()).send(&request()).await;
        assert_eq!(outcome, Outcome::PermanentFailure("invalid number".to_string()));
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (code, transient) in [(429, true), (503, true), (500, true), (408, true), (400, false), (401, false), (404, false)] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(code).set_body_string("nope"))
                .mount(&server)
                .await;

            let outcome = gateway(&server.uri()).send(&request()).await;
            match outcome {
                Outcome::TransientFailure(_) => assert!(transient, "{code} should be permanent"),
                Outcome::PermanentFailure(_) => assert!(!transient, "{code} should be transient"),
                Outcome::Accepted(_) => panic!("{code} must not be accepted"),
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let outcome = gateway(&server.uri()).send(&request()).await;
        assert!(matches!(outcome, Outcome::TransientFailure(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let outcome = gateway("http://127.0.0.1:1").send(&request()).await;
        assert!(matches!(outcome, Outcome::TransientFailure(_)));
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(HttpGateway::new("not a url", None, None, Duration::from_secs(1)).is_err());
    }
}
