//! Polling scheduler — rounds forever with short/long backoff.
//!
//! A productive round is followed by the short sleep, an empty or failed one
//! by the long sleep. A stop is observed at round boundaries only: the round
//! in flight always runs to completion, and no round starts once a stop has
//! been requested.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use mailpull_core::config::schema::DeliveryConfig;
use mailpull_core::MailboxSession;

use crate::deliver::Deliver;
use crate::round::{RoundExecutor, RoundResult};

// ─────────────────────────────────────────────
// SleepPolicy
// ─────────────────────────────────────────────

/// The two sleep durations between rounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SleepPolicy {
    /// After a round that delivered at least one message.
    pub short: Duration,
    /// After an empty or failed round.
    pub long: Duration,
}

impl Default for SleepPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl SleepPolicy {
    pub fn new(short: Duration, long: Duration) -> Self {
        Self { short, long }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(config.short_sleep(), config.long_sleep())
    }

    /// Sleep to apply after `result`. Rejected and unreadable tallies do not
    /// count as progress.
    pub fn next(&self, result: &RoundResult) -> Duration {
        if result.error.is_none() && result.delivered > 0 {
            self.short
        } else {
            self.long
        }
    }
}

// ─────────────────────────────────────────────
// ShutdownHandle
// ─────────────────────────────────────────────

/// Cloneable stop switch for a `PollingScheduler`.
///
/// The flag goes from `false` to `true` once and never back. Stopping more
/// than once is a no-op.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request the loop to stop after the current round.
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("stopping polling scheduler");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Resolves once the flag behind `rx` is set.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

// ─────────────────────────────────────────────
// PollingScheduler
// ─────────────────────────────────────────────

/// Drives `RoundExecutor` in a loop until stopped.
pub struct PollingScheduler {
    session: Box<dyn MailboxSession>,
    deliver: Arc<dyn Deliver>,
    executor: RoundExecutor,
    policy: SleepPolicy,
    shutdown: ShutdownHandle,
}

impl PollingScheduler {
    pub fn new(
        session: Box<dyn MailboxSession>,
        deliver: Arc<dyn Deliver>,
        executor: RoundExecutor,
        policy: SleepPolicy,
    ) -> Self {
        Self {
            session,
            deliver,
            executor,
            policy,
            shutdown: ShutdownHandle::new(),
        }
    }

    /// Scheduler for the `delivery` section of the config.
    pub fn from_config(
        session: Box<dyn MailboxSession>,
        deliver: Arc<dyn Deliver>,
        config: &DeliveryConfig,
    ) -> Self {
        Self::new(
            session,
            deliver,
            RoundExecutor::from_config(config),
            SleepPolicy::from_config(config),
        )
    }

    /// Share a stop switch created elsewhere (e.g. by a signal handler).
    pub fn with_shutdown(mut self, handle: ShutdownHandle) -> Self {
        self.shutdown = handle;
        self
    }

    /// A handle that stops this scheduler from any task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn policy(&self) -> SleepPolicy {
        self.policy
    }

    /// Request the loop to stop after the current round. Idempotent.
    pub fn stop(&self) {
        self.shutdown.stop();
    }

    /// Exactly one round, with no sleep and no stop check.
    pub async fn run_once(&mut self) -> RoundResult {
        self.executor
            .run_round(self.session.as_mut(), self.deliver.as_ref())
            .await
    }

    /// Run rounds until stopped.
    ///
    /// The first round starts immediately, even if a stop was already
    /// requested. A stop during a sleep ends the loop without starting
    /// another round.
    pub async fn run(&mut self) {
        let mut shutdown = self.shutdown.subscribe();
        info!(
            session = %self.session.describe(),
            mailbox = %self.executor.mailbox(),
            short_s = self.policy.short.as_secs_f64(),
            long_s = self.policy.long.as_secs_f64(),
            "polling scheduler started"
        );

        loop {
            let result = self.run_once().await;
            let pause = self.policy.next(&result);

            match &result.error {
                Some(e) => error!(error = %e, "round failed"),
                None => info!(
                    delivered = result.delivered,
                    rejected = result.rejected,
                    unreadable = result.unreadable,
                    "round complete"
                ),
            }

            if *shutdown.borrow() {
                info!("polling scheduler shutting down");
                return;
            }

            debug!(sleep_s = pause.as_secs_f64(), "sleeping until next round");
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = stopped(&mut shutdown) => {
                    info!("polling scheduler shutting down");
                    return;
                }
            }
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
