//! Inbound delivery reports from the SMS gateway.
//!
//! Reports are keyed by the gateway-assigned id and may arrive more than once
//! or out of order. Anything that would not move the message forward is
//! acknowledged and dropped.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::status::{MessageStatus, StatusMachine, TransitionContext};

/// Callback body posted by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub event: String,
    /// Gateway-assigned message id.
    pub id: String,
    #[serde(default, rename = "deviceId", skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    Sent,
    Delivered,
    Failed,
    /// Inbound SMS; not part of the outbound pipeline.
    Received,
    Ping,
}

impl CallbackEvent {
    pub fn parse(event: &str) -> Option<Self> {
        match event {
            "sms:sent" => Some(CallbackEvent::Sent),
            "sms:delivered" => Some(CallbackEvent::Delivered),
            "sms:failed" => Some(CallbackEvent::Failed),
            "sms:received" => Some(CallbackEvent::Received),
            "system:ping" => Some(CallbackEvent::Ping),
            _ => None,
        }
    }

    fn target(self) -> Option<MessageStatus> {
        match self {
            CallbackEvent::Sent => Some(MessageStatus::Sent),
            CallbackEvent::Delivered => Some(MessageStatus::Delivered),
            CallbackEvent::Failed => Some(MessageStatus::Failed),
            CallbackEvent::Received | CallbackEvent::Ping => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CallbackOutcome {
    Applied {
        message_id: String,
        status: MessageStatus,
    },
    Ignored {
        message_id: String,
        reason: String,
    },
    UnknownMessage,
    Acknowledged,
}

/// Apply one delivery report.
pub async fn handle_callback(
    machine: &StatusMachine,
    callback: &GatewayCallback,
) -> Result<CallbackOutcome> {
    let event = CallbackEvent::parse(&callback.event).ok_or_else(|| {
        Error::validation(format!("unknown callback event: {}", callback.event))
    })?;
    let Some(target) = event.target() else {
        info!(event = %callback.event, "gateway_callback_acknowledged");
        return Ok(CallbackOutcome::Acknowledged);
    };
    if callback.id.trim().is_empty() {
        return Err(Error::validation("callback id is required"));
    }

    let found: Option<(String, String)> = sqlx::query_as(
        "SELECT id, status FROM messages WHERE gateway_message_id = ? \
         ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&callback.id)
    .fetch_optional(machine.pool())
    .await?;

    let Some((message_id, current)) = found else {
        info!(gateway_id = %callback.id, event = %callback.event, "gateway_callback_unknown_message");
        return Ok(CallbackOutcome::UnknownMessage);
    };

    let ignored = |reason: String| {
        info!(message_id = %message_id, reason = %reason, "gateway_callback_ignored");
        Ok(CallbackOutcome::Ignored {
            message_id: message_id.clone(),
            reason,
        })
    };

    let current: MessageStatus = current.parse().map_err(Error::Validation)?;
    if current == target {
        return ignored("duplicate".to_string());
    }
    if !current.can_transition_to(target) {
        return ignored(format!("out of order: {current} -> {target}"));
    }

    let reason = match event {
        CallbackEvent::Failed => Some(
            callback
                .payload
                .get("reason")
                .and_then(|r| r.as_str())
                .unwrap_or("reported failed by gateway")
                .to_string(),
        ),
        _ => None,
    };
    let ctx = TransitionContext {
        reason,
        gateway_id: Some(callback.id.clone()),
        payload: serde_json::to_value(callback).ok(),
        ..Default::default()
    };

    match machine.transition(&message_id, target, ctx).await {
        Ok(message) => Ok(CallbackOutcome::Applied {
            message_id: message.id,
            status: message.status,
        }),
        // Another report for the same message won the race.
        Err(Error::InvalidTransition { from, to }) => {
            warn!(message_id = %message_id, from = %from, to = %to, "gateway_callback_raced");
            ignored(format!("out of order: {from} -> {to}"))
        }
        Err(e) => Err(e),
    }
}
