//! Delivery callback — where staged messages leave the loop.

use async_trait::async_trait;

use mailpull_core::{Candidate, StagedMessage};

/// Application logic that consumes one staged message.
///
/// `body` is positioned at offset zero and may be read and re-read freely.
/// `digest` is the SHA-1 of exactly the bytes in `body`. Any error is a
/// rejection: the message is not marked seen and goes to the error mailbox
/// when one is configured.
///
/// Plain closures `Fn(&mut StagedMessage, &Candidate, &[u8]) -> anyhow::Result<()>`
/// implement this trait directly.
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(
        &self,
        body: &mut StagedMessage,
        id: &Candidate,
        digest: &[u8],
    ) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> Deliver for F
where
    F: Fn(&mut StagedMessage, &Candidate, &[u8]) -> anyhow::Result<()> + Send + Sync,
{
    async fn deliver(
        &self,
        body: &mut StagedMessage,
        id: &Candidate,
        digest: &[u8],
    ) -> anyhow::Result<()> {
        (self)(body, id, digest)
    }
}
