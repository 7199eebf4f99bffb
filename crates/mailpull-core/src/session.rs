//! MailboxSession trait — the capability every mail backend must provide.
//!
//! Each backend (IMAP, REST, in-memory) implements this trait to:
//! - `connect()` / `close()` — open and release one connection per round
//! - `list()` — enumerate candidate messages in a mailbox
//! - `read_body()` — stream one message body into a writer
//! - `mark()` / `move_to()` — update seen state and relocate
//!
//! Identifiers returned by `list()` are only meaningful until `close()`.
//! Backends apply their own per-call timeout and report it as
//! `SessionError::Timeout`.

use std::io::Write;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::types::Candidate;

/// A connection-oriented view of one remote mail store.
///
/// The round executor holds the session exclusively for the duration of a
/// round, so implementations never see concurrent calls.
#[async_trait]
pub trait MailboxSession: Send {
    /// Human-readable endpoint description for logs and errors
    /// (e.g. `imaps://user@mail.example.com:993`).
    fn describe(&self) -> String;

    /// Open a connection and authenticate.
    async fn connect(&mut self) -> Result<(), SessionError>;

    /// Release the connection. When `expunge` is set, messages flagged for
    /// deletion (e.g. by a copy-based move) are purged first.
    async fn close(&mut self, expunge: bool) -> Result<(), SessionError>;

    /// List messages in `mailbox` whose subject contains `pattern`
    /// (empty = all). Seen messages are only included with `include_seen`.
    async fn list(
        &mut self,
        mailbox: &str,
        pattern: &str,
        include_seen: bool,
    ) -> Result<Vec<Candidate>, SessionError>;

    /// Stream the full raw body of `id` into `dst` without marking it seen.
    /// Returns the number of bytes written.
    async fn read_body(
        &mut self,
        id: &Candidate,
        dst: &mut (dyn Write + Send),
    ) -> Result<u64, SessionError>;

    /// Set or clear the seen flag.
    async fn mark(&mut self, id: &Candidate, seen: bool) -> Result<(), SessionError>;

    /// Move the message to `dest_mailbox`.
    async fn move_to(&mut self, id: &Candidate, dest_mailbox: &str) -> Result<(), SessionError>;
}
