//! Core types — message identifiers and per-candidate outcomes.

use std::fmt;

// ─────────────────────────────────────────────
// Candidate
// ─────────────────────────────────────────────

/// A server-assigned message identifier, valid for one connected session.
///
/// IMAP backends carry a UID here; REST backends carry the opaque message id.
/// Never assume an identifier survives a reconnect.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Candidate(String);

impl Candidate {
    /// Wrap an opaque identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Candidate(id.into())
    }

    /// Build a candidate from a numeric IMAP UID.
    pub fn from_uid(uid: u32) -> Self {
        Candidate(uid.to_string())
    }

    /// The identifier as the server sent it.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the identifier as an IMAP UID.
    pub fn uid(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for Candidate {
    fn from(uid: u32) -> Self {
        Candidate::from_uid(uid)
    }
}

impl From<&str> for Candidate {
    fn from(id: &str) -> Self {
        Candidate::new(id)
    }
}

// ─────────────────────────────────────────────
// DeliveryOutcome
// ─────────────────────────────────────────────

/// What happened to one candidate within a round. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The callback accepted the message.
    Delivered,
    /// The callback returned an error.
    Rejected,
    /// Streaming or staging failed before the callback ran.
    Unreadable,
}

impl DeliveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Rejected => "rejected",
            DeliveryOutcome::Unreadable => "unreadable",
        }
    }
}

impl fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
