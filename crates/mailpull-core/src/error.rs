//! Error taxonomy for sessions and rounds.
//!
//! Only [`RoundError`] ever leaves a round. Everything a single candidate can
//! fail with is a [`SessionError`] that the round logs and absorbs.

use std::time::Duration;

use thiserror::Error;

use crate::types::Candidate;

/// Failure reported by a `MailboxSession` operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("no such message: {0}")]
    NotFound(Candidate),

    #[error("no such mailbox: {0}")]
    NoMailbox(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Backend(String),
}

impl SessionError {
    /// Shorthand for a backend-specific failure.
    pub fn backend(msg: impl Into<String>) -> Self {
        SessionError::Backend(msg.into())
    }
}

/// A failure that stops a whole round from making progress.
#[derive(Debug, Error)]
pub enum RoundError {
    #[error("connect to {session}: {source}")]
    Connect {
        session: String,
        #[source]
        source: SessionError,
    },

    #[error("list {session}/{mailbox}: {source}")]
    List {
        session: String,
        mailbox: String,
        #[source]
        source: SessionError,
    },
}
