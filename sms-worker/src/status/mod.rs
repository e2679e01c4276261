//! Message lifecycle states and the rules for moving between them.
//!
//! ```text
//! scheduled ─┐
//!            ├─> claimed ─> processed ─> sent ─> delivered
//! queued ────┘      │            │         │
//!    ^              │            └─────────┴──> failed
//!    └── retry ─────┘  (claimed -> queued)        │
//!    └────────────── operator retry ──────────────┘
//! ```
//!
//! [`StatusMachine`] is the only writer of message status after creation; every
//! applied transition appends one `message_events` row and publishes one event
//! inside the same transaction.

pub mod callbacks;
pub mod machine;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use callbacks::{handle_callback, CallbackEvent, CallbackOutcome, GatewayCallback};
pub use machine::{StatusMachine, TransitionContext};

/// Lifecycle state of a single outbound message.
/// Ordering follows declaration order and is only used for stable map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Scheduled,
    Queued,
    Claimed,
    Processed,
    Sent,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 7] = [
        MessageStatus::Scheduled,
        MessageStatus::Queued,
        MessageStatus::Claimed,
        MessageStatus::Processed,
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Scheduled => "scheduled",
            MessageStatus::Queued => "queued",
            MessageStatus::Claimed => "claimed",
            MessageStatus::Processed => "processed",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }

    /// Position along the forward path. `failed` is terminal and ranks last.
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Scheduled | MessageStatus::Queued => 0,
            MessageStatus::Claimed => 1,
            MessageStatus::Processed => 2,
            MessageStatus::Sent => 3,
            MessageStatus::Delivered => 4,
            MessageStatus::Failed => 5,
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(self, to: MessageStatus) -> bool {
        use MessageStatus::*;
        match (self, to) {
            // Retry paths: the only backward moves.
            (Claimed, Queued) | (Failed, Queued) => true,
            // Claiming is reserved for the dispatch queue.
            (Scheduled | Queued, Claimed) => true,
            (_, Claimed) => false,
            // Nothing leaves a terminal state except the operator retry above.
            (Delivered | Failed, _) => false,
            (Scheduled | Queued, Failed) => true,
            // The gateway must accept a message before the carrier reports on it.
            (Scheduled | Queued, Processed | Sent | Delivered) => false,
            (Scheduled, Queued) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }

    /// Event type published when a message enters `self` from `from`.
    pub fn event_type(self, from: MessageStatus) -> &'static str {
        match (from, self) {
            (MessageStatus::Claimed | MessageStatus::Failed, MessageStatus::Queued) => {
                "message:retried"
            }
            (_, MessageStatus::Scheduled) => "message:scheduled",
            (_, MessageStatus::Queued) => "message:queued",
            (_, MessageStatus::Claimed) => "message:claimed",
            (_, MessageStatus::Processed) => "message:processed",
            (_, MessageStatus::Sent) => "message:sent",
            (_, MessageStatus::Delivered) => "message:delivered",
            (_, MessageStatus::Failed) => "message:failed",
        }
    }
}

/// Every event type a webhook may subscribe to.
pub const EVENT_TYPES: [&str; 8] = [
    "message:scheduled",
    "message:queued",
    "message:claimed",
    "message:processed",
    "message:sent",
    "message:delivered",
    "message:failed",
    "message:retried",
];

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown message status: {s}"))
    }
}
