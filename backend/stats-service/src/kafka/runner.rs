//! Consumer group runner
//!
//! Joins the group, runs one claim task per assigned partition and re-joins
//! whenever the group generation ends. Transient coordination failures are
//! followed by a fixed cooldown on the injected [`Clock`].
//!
//! ```text
//! Joining ──ok──▶ Consuming ──rebalance──▶ Rebalancing ──▶ Joining
//!    │                │
//!    └──error──▶ Failed ──cooldown──▶ Joining
//!
//! any state ──shutdown──▶ ShuttingDown ──drain──▶ Stopped
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{
    CoordinationError, Delivery, GroupClient, GroupSession, HandlerError, MessageHandler,
    PartitionClaim, SessionClosed,
};
use crate::metrics;
use crate::rate_limit::RateLimiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// Upper bound on one handler call
    pub handler_timeout: Duration,
    /// Upper bound on waiting for claim tasks at shutdown
    pub drain_timeout: Duration,
    /// Pause after a failed join or a broken session
    pub cooldown: Duration,
    /// Pause before retrying a message whose handler failed
    pub retry_backoff: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Source of the runner's cooldown and retry pauses
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Joining,
    Consuming,
    Rebalancing,
    Failed,
    ShuttingDown,
    Stopped,
}

/// How the final drain went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every claim task finished within the drain timeout
    pub drained: bool,
    /// Claim tasks aborted when the drain timeout elapsed
    pub abandoned: usize,
}

pub struct ConsumerGroupRunner {
    client: Arc<dyn GroupClient>,
    worker: Arc<ClaimWorker>,
    settings: RunnerSettings,
    clock: Arc<dyn Clock>,
    state: watch::Sender<RunnerState>,
}

impl ConsumerGroupRunner {
    pub fn new(
        client: Arc<dyn GroupClient>,
        handler: Arc<dyn MessageHandler>,
        limiter: Arc<RateLimiter>,
        settings: RunnerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(RunnerState::Joining);
        let worker = Arc::new(ClaimWorker {
            client: client.clone(),
            handler,
            limiter,
            clock: clock.clone(),
            handler_timeout: settings.handler_timeout,
            retry_backoff: settings.retry_backoff,
        });

        Self {
            client,
            worker,
            settings,
            clock,
            state,
        }
    }

    /// Observe state transitions
    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: RunnerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "Consumer runner state change");
        }
    }

    /// Consume until `shutdown` is cancelled, then drain and leave the group.
    pub async fn run(&self, shutdown: CancellationToken) -> ShutdownReport {
        let mut claims: JoinSet<()> = JoinSet::new();

        while !shutdown.is_cancelled() {
            self.transition(RunnerState::Joining);

            let joined = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                joined = self.client.join() => joined,
            };

            let session = match joined {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, "Failed to join consumer group");
                    if self.cool_down(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            let GroupSession {
                generation,
                claims: partitions,
                token,
                closed,
            } = session;

            info!(
                generation = generation,
                partitions = ?partitions.iter().map(|c| c.partition).collect::<Vec<_>>(),
                "Joined consumer group"
            );
            self.transition(RunnerState::Consuming);

            for claim in partitions {
                let worker = self.worker.clone();
                let session_token = token.clone();
                let shutdown = shutdown.clone();
                claims.spawn(async move {
                    worker.consume(claim, session_token, shutdown).await;
                });
            }

            let ended = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                reason = closed => Some(
                    reason.unwrap_or(SessionClosed::Error(CoordinationError::Closed))
                ),
            };

            let Some(reason) = ended else {
                break;
            };

            token.cancel();
            match reason {
                SessionClosed::Rebalance => {
                    self.transition(RunnerState::Rebalancing);
                    metrics::REBALANCES.inc();
                    info!(generation = generation, "Consumer group rebalancing");
                    wait_for_claims(&mut claims).await;
                }
                SessionClosed::Error(e) => {
                    warn!(generation = generation, error = %e, "Consumer group session failed");
                    wait_for_claims(&mut claims).await;
                    if !self.cool_down(&shutdown).await {
                        break;
                    }
                }
            }
        }

        self.shut_down(claims).await
    }

    /// Returns `false` when shutdown was requested before or during the pause.
    async fn cool_down(&self, shutdown: &CancellationToken) -> bool {
        self.transition(RunnerState::Failed);
        if shutdown.is_cancelled() {
            return false;
        }

        metrics::COOLDOWNS.inc();
        info!(
            cooldown_secs = self.settings.cooldown.as_secs_f64(),
            "Cooling down before rejoining consumer group"
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = self.clock.sleep(self.settings.cooldown) => !shutdown.is_cancelled(),
        }
    }

    async fn shut_down(&self, mut claims: JoinSet<()>) -> ShutdownReport {
        self.transition(RunnerState::ShuttingDown);
        info!(
            in_flight = claims.len(),
            drain_timeout_secs = self.settings.drain_timeout.as_secs_f64(),
            "Draining partition claims"
        );

        let drained = tokio::time::timeout(self.settings.drain_timeout, wait_for_claims(&mut claims))
            .await
            .is_ok();

        let abandoned = claims.len();
        if !drained {
            warn!(abandoned = abandoned, "Drain timeout elapsed, abandoning in-flight work");
            claims.abort_all();
        }

        self.client.close().await;
        self.transition(RunnerState::Stopped);
        info!("Consumer group runner stopped");

        ShutdownReport { drained, abandoned }
    }
}

async fn wait_for_claims(claims: &mut JoinSet<()>) {
    while let Some(result) = claims.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Partition claim task panicked");
            }
        }
    }
}

/// Shared state of every claim task of one runner
struct ClaimWorker {
    client: Arc<dyn GroupClient>,
    handler: Arc<dyn MessageHandler>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    handler_timeout: Duration,
    retry_backoff: Duration,
}

impl ClaimWorker {
    async fn consume(
        &self,
        mut claim: PartitionClaim,
        session: CancellationToken,
        shutdown: CancellationToken,
    ) {
        debug!(topic = %claim.topic, partition = claim.partition, "Partition claim started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                _ = shutdown.cancelled() => break,
                next = claim.messages.recv() => match next {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if !self.process(&delivery, &session, &shutdown).await {
                break;
            }
        }

        debug!(topic = %claim.topic, partition = claim.partition, "Partition claim stopped");
    }

    /// Handle one delivery until it succeeds. Returns `false` when cancellation
    /// interrupted it before a handler call started; the offset then stays
    /// uncommitted.
    async fn process(
        &self,
        delivery: &Delivery,
        session: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> bool {
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => return false,
                _ = shutdown.cancelled() => return false,
                _ = self.limiter.take() => {}
            }

            attempt += 1;
            let result = match tokio::time::timeout(self.handler_timeout, self.handler.handle(delivery))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(HandlerError::Timeout(self.handler_timeout)),
            };

            match result {
                Ok(()) => {
                    metrics::MESSAGES_PROCESSED.inc();
                    if let Err(e) = self.client.commit(delivery) {
                        warn!(
                            topic = %delivery.topic,
                            partition = delivery.partition,
                            offset = delivery.offset,
                            error = %e,
                            "Failed to commit offset"
                        );
                    }
                    return true;
                }
                Err(e) => {
                    metrics::MESSAGES_FAILED.with_label_values(&[e.kind()]).inc();
                    error!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        attempt = attempt,
                        error = %e,
                        "Message handler failed, offset left uncommitted"
                    );
                }
            }

            tokio::select! {
                biased;
                _ = session.cancelled() => return false,
                _ = shutdown.cancelled() => return false,
                _ = self.clock.sleep(self.retry_backoff) => {}
            }
        }
    }
}
