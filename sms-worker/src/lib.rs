//! SMSFlow - CSV-driven SMS campaign pipeline.
//!
//! This library provides shared modules for the three SMSFlow binaries:
//! - `smsflow-web`: HTTP surface and the background import worker
//! - `smsflow-worker`: Dispatch workers that claim queued messages and send them
//! - `smsflow-notifier`: Webhook delivery worker
//!
//! ## Architecture
//!
//! ```text
//! Upload → Import Worker → contacts → Campaign → messages → Dispatcher → Gateway
//!                                                    ↓                      ↓
//!                                              status events  ←  delivery callbacks
//!                                                    ↓
//!                                             webhook outbox → Notifier
//! ```
//!
//! The binaries share nothing but the SQLite database.

pub mod campaign;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod import;
pub mod messages;
pub mod model;
pub mod phone;
pub mod status;
pub mod template;
pub mod templates;
pub mod util;
pub mod web;
pub mod webhooks;

#[cfg(test)]
mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use dispatch::{Dispatcher, DispatchQueue};
pub use error::{Error, ErrorKind, Result};
pub use events::{EventBus, StatusEvent};
pub use import::{ImportRegistry, ImportTask};
pub use status::{MessageStatus, StatusMachine};
pub use web::AppState;
pub use webhooks::Notifier;
