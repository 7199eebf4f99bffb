//! Mailpull Core — shared vocabulary for the polling/delivery loop.
//!
//! This crate provides:
//! - **types**: `Candidate`, `DeliveryOutcome`
//! - **error**: the session and round error taxonomy
//! - **session**: the `MailboxSession` trait every backend implements
//! - **stage**: `MessageStage` — spool a message body while hashing it
//! - **config**: schema, loading, and env var overrides
//! - **logging**: tracing subscriber setup

pub mod config;
pub mod error;
pub mod logging;
pub mod session;
pub mod stage;
pub mod types;
pub mod utils;

pub use error::{RoundError, SessionError};
pub use session::MailboxSession;
pub use stage::{MessageStage, StagedMessage};
pub use types::{Candidate, DeliveryOutcome};

/// Mailbox polled when none is configured.
pub const DEFAULT_MAILBOX: &str = "INBOX";
