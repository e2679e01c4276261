//! Persisted entity types for the SMS pipeline.
//!
//! Rows are decoded from SQLite in `db::rows`; every type here is also the JSON
//! shape returned by the HTTP surface.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use crate::status::MessageStatus;

/// Per-recipient template variables, ordered for deterministic serialization.
pub type Variables = BTreeMap<String, String>;

// =============================================================================
// Imports
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Processing,
    Success,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::Processing => "processing",
            ImportStatus::Success => "success",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }
}

/// Why an import ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportFailure {
    RowLimitExceeded,
    FileTooLarge,
    InvalidHeader,
    Storage,
}

impl ImportFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportFailure::RowLimitExceeded => "row_limit_exceeded",
            ImportFailure::FileTooLarge => "file_too_large",
            ImportFailure::InvalidHeader => "invalid_header",
            ImportFailure::Storage => "storage",
        }
    }
}

/// One rejected CSV row. `row` is 1-based and counts the header as row 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub content_hash: Option<String>,
    pub size_bytes: i64,
    pub status: ImportStatus,
    pub rows_seen: i64,
    pub rows_inserted: i64,
    pub rows_rejected: i64,
    pub errors: Vec<RowError>,
    pub failure_kind: Option<ImportFailure>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub import_id: String,
    pub row_index: i64,
    pub phone: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub variables: Variables,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Templates and campaigns
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub content: String,
    /// Placeholder names found in `content`, sorted.
    pub variables: Vec<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Draft => "draft",
            CampaignStatus::Active => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    /// Campaigns in these states still own work in the queue.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            CampaignStatus::Draft | CampaignStatus::Active | CampaignStatus::Paused
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub message_content: Option<String>,
    pub template_id: Option<String>,
    pub import_id: Option<String>,
    /// Progress handle for the materialized messages. Never equal to `id`.
    pub batch_id: String,
    pub status: CampaignStatus,
    pub total_messages: i64,
    pub scheduled_start_at: Option<DateTime<Utc>>,
    pub scheduled_end_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Messages
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub owner_id: String,
    pub campaign_id: Option<String>,
    pub batch_id: Option<String>,
    pub import_id: Option<String>,
    pub template_id: Option<String>,
    pub variables: Option<Variables>,
    pub phone_number: String,
    /// Rendered text. `None` until a template-based campaign starts.
    pub content: Option<String>,
    pub status: MessageStatus,
    pub previous_status: Option<MessageStatus>,
    pub custom_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    #[serde(skip_serializing)]
    pub claim_token: Option<String>,
    pub claimed_by: Option<String>,
    pub gateway_message_id: Option<String>,
    pub reason: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row, one per applied transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEvent {
    pub id: String,
    pub message_id: String,
    pub event_type: String,
    pub from_status: Option<MessageStatus>,
    pub to_status: MessageStatus,
    pub reason: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Webhooks
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub owner_id: String,
    pub url: String,
    pub event_types: Vec<String>,
    #[serde(skip_serializing)]
    pub secret_key: Option<String>,
    pub is_active: bool,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    pub webhook_id: String,
    pub message_id: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempts: i64,
    pub last_status_code: Option<i64>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// String conversions
// =============================================================================

macro_rules! text_enum {
    ($ty:ty, $label:literal, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| format!("unknown {}: {s}", $label))
            }
        }
    };
}

text_enum!(
    ImportStatus,
    "import status",
    [
        ImportStatus::Processing,
        ImportStatus::Success,
        ImportStatus::Failed,
        ImportStatus::Cancelled,
    ]
);

text_enum!(
    ImportFailure,
    "import failure",
    [
        ImportFailure::RowLimitExceeded,
        ImportFailure::FileTooLarge,
        ImportFailure::InvalidHeader,
        ImportFailure::Storage,
    ]
);

text_enum!(
    CampaignStatus,
    "campaign status",
    [
        CampaignStatus::Draft,
        CampaignStatus::Active,
        CampaignStatus::Paused,
        CampaignStatus::Completed,
        CampaignStatus::Cancelled,
    ]
);

text_enum!(
    DeliveryStatus,
    "delivery status",
    [
        DeliveryStatus::Pending,
        DeliveryStatus::InFlight,
        DeliveryStatus::Delivered,
        DeliveryStatus::Failed,
    ]
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enums_parse_their_own_output() {
        assert_eq!("paused".parse::<CampaignStatus>(), Ok(CampaignStatus::Paused));
        assert_eq!("in_flight".parse::<DeliveryStatus>(), Ok(DeliveryStatus::InFlight));
        assert_eq!(
            "row_limit_exceeded".parse::<ImportFailure>(),
            Ok(ImportFailure::RowLimitExceeded)
        );
        assert!("running".parse::<ImportStatus>().is_err());
    }

    #[test]
    fn test_serde_matches_text_form() {
        let json = serde_json::to_string(&DeliveryStatus::InFlight).unwrap();
        assert_eq!(json, "\"in_flight\"");
        let json = serde_json::to_string(&ImportFailure::FileTooLarge).unwrap();
        assert_eq!(json, "\"file_too_large\"");
    }

    #[test]
    fn test_row_error_omits_missing_column() {
        let err = RowError {
            row: 3,
            column: None,
            message: "duplicate phone number".to_string(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert!(json.get("column").is_none());
    }
}
