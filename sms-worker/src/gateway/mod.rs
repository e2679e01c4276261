//! Outbound SMS gateway contract.
//!
//! A [`Gateway`] turns one message into one send attempt and classifies the
//! result. Classification is the gateway's job; deciding whether to retry is
//! the dispatcher's.

pub mod http;
pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Message;

pub use http::HttpGateway;
pub use simulated::SimulatedGateway;

/// Abstract send request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendRequest {
    pub destination: String,
    pub content: String,
    /// Our message id, echoed back by gateways that support it.
    pub correlation_id: String,
}

impl SendRequest {
    /// Build a request for `message`; `None` when it has no rendered content.
    pub fn from_message(message: &Message) -> Option<Self> {
        let content = message.content.as_ref()?;
        Some(SendRequest {
            destination: message.phone_number.clone(),
            content: content.clone(),
            correlation_id: message.id.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Accepted for delivery; carries the gateway-assigned id.
    Accepted(String),
    /// May succeed if retried (timeouts, 5xx, rate limiting).
    TransientFailure(String),
    /// Will not succeed on retry (bad destination, rejected content).
    PermanentFailure(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted(_) => "accepted",
            Outcome::TransientFailure(_) => "transient_failure",
            Outcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Outcome;
}

/// Pick the gateway described by `config`.
pub fn from_config(config: &Config) -> Result<Arc<dyn Gateway>> {
    if config.sms_gateway_mock {
        return Ok(Arc::new(SimulatedGateway::new()));
    }
    let base_url = config
        .sms_gateway_url
        .as_deref()
        .ok_or_else(|| Error::validation("SMS_GATEWAY_URL is required when SMS_GATEWAY_MOCK is off"))?;
    let gateway = HttpGateway::new(
        base_url,
        config.sms_gateway_login.clone(),
        config.sms_gateway_password.clone(),
        config.sms_gateway_timeout(),
    )?;
    Ok(Arc::new(gateway))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::MessageStatus;
    use chrono::Utc;

    fn message(content: Option<&str>) -> Message {
        Message {
            id: "msg_1".to_string(),
            owner_id: "o".to_string(),
            campaign_id: None,
            batch_id: None,
            import_id: None,
            template_id: None,
            variables: None,
            phone_number: "+15550000001".to_string(),
            content: content.map(str::to_string),
            status: MessageStatus::Claimed,
            previous_status: Some(MessageStatus::Queued),
            custom_id: None,
            scheduled_at: None,
            next_attempt_at: None,
            attempts: 0,
            claim_token: Some("t".to_string()),
            claimed_by: Some("w".to_string()),
            gateway_message_id: None,
            reason: None,
            queued_at: None,
            claimed_at: None,
            processed_at: None,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_request_from_message() {
        let req = SendRequest::from_message(&message(Some("hi"))).unwrap();
        assert_eq!(req.destination, "+15550000001");
        assert_eq!(req.content, "hi");
        assert_eq!(req.correlation_id, "msg_1");
        assert!(SendRequest::from_message(&message(None)).is_none());
    }

    #[test]
    fn test_from_config_requires_url_for_http() {
        let config = Config {
            sms_gateway_mock: false,
            ..Config::default()
        };
        assert!(from_config(&config).is_err());
        assert!(from_config(&Config::default()).is_ok());
    }
}
