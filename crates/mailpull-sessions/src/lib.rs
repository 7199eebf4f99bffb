//! Mailpull Sessions — concrete `MailboxSession` backends.
//!
//! This crate provides:
//! - **memory**: `MemoryStore` / `MemorySession` — in-memory mailboxes with fault injection
//! - **imap**: `ImapSession` — IMAP/IMAPS via `async-imap` (feature `imap`)
//! - **graph**: `GraphSession` — mail REST API with a bearer token (feature `graph`)
//! - **factory**: `create_session` — pick a backend from the config

pub mod factory;
pub mod memory;

#[cfg(feature = "imap")]
pub mod imap;

#[cfg(feature = "graph")]
pub mod graph;

pub use factory::create_session;
pub use memory::{MemorySession, MemoryStore};

#[cfg(feature = "imap")]
pub use imap::ImapSession;

#[cfg(feature = "graph")]
pub use graph::GraphSession;
