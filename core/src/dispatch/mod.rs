// Command dispatcher: FIFO, rate-limited, bounded-retry writes to the
// control characteristic

pub mod rate_limit;

pub use rate_limit::RateLimiter;

use crate::config::{RetrySettings, WriteRateLimit};
use crate::events::{BridgeEvent, BridgeMetrics, EventSender};
use crate::link::{LinkError, LinkHandle};
use crate::message::{CharacteristicId, Command};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn};

pub struct CommandDispatcher {
    link: LinkHandle,
    characteristic: CharacteristicId,
    limiter: RateLimiter,
    retry: RetrySettings,
    metrics: Arc<BridgeMetrics>,
}

impl CommandDispatcher {
    pub fn new(
        link: LinkHandle,
        characteristic: CharacteristicId,
        rate_limit: WriteRateLimit,
        retry: RetrySettings,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            link,
            characteristic,
            limiter: RateLimiter::new(rate_limit),
            retry,
            metrics,
        }
    }

    /// Total write attempts a command gets before it is dropped
    pub fn max_attempts(&self) -> u32 {
        self.retry.max_retries + 1
    }

    /// Deliver one command. Every attempt waits for a rate-limit slot; failed
    /// attempts are retried with exponential backoff up to `max_retries`.
    pub async fn dispatch(&mut self, command: &Command) -> Result<(), LinkError> {
        let data = command.to_bytes();
        let mut attempt = 0;

        loop {
            self.limiter.acquire().await;
            match self.link.write(self.characteristic, data.clone()).await {
                Ok(()) => {
                    self.metrics.record_dispatched();
                    debug!("Dispatched {} (attempt {})", command.kind, attempt + 1);
                    return Ok(());
                }
                Err(e) if !e.is_retryable() || attempt >= self.retry.max_retries => {
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        "Write of {} failed: {}; retry {}/{} in {:?}",
                        command.kind,
                        e,
                        attempt + 1,
                        self.retry.max_retries,
                        delay
                    );
                    attempt += 1;
                    sleep(delay).await;
                }
            }
        }
    }

    async fn dispatch_or_report(&mut self, command: Command, events: &EventSender) {
        if let Err(e) = self.dispatch(&command).await {
            self.metrics.record_command_failed();
            warn!("Dropping command {}: {}", command.kind, e);
            let _ = events.send(BridgeEvent::CommandDeliveryFailed {
                command: command.kind,
                attempts: self.max_attempts(),
                error: e.to_string(),
            });
        }
    }

    /// Consume `commands` in order until shutdown.
    ///
    /// Once shutdown is signalled, queued commands keep draining until the
    /// channel closes or `drain_grace` (counted from the signal) runs out.
    /// A write still in flight at the deadline is abandoned. Returning drops
    /// the link handle.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown: watch::Receiver<bool>,
        drain_grace: Duration,
        events: EventSender,
    ) {
        let mut deadline = if *shutdown.borrow() {
            Some(Instant::now() + drain_grace)
        } else {
            None
        };
        let mut drained = 0usize;

        loop {
            let next = match deadline {
                Some(deadline) => match timeout_at(deadline, commands.recv()).await {
                    Ok(next) => next,
                    Err(_) => break,
                },
                None => tokio::select! {
                    next = commands.recv() => next,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            deadline = Some(Instant::now() + drain_grace);
                        }
                        continue;
                    }
                },
            };

            let Some(command) = next else {
                if deadline.is_some() {
                    info!("Dispatcher drained {} queued commands", drained);
                } else {
                    debug!("Command channel closed");
                }
                return;
            };
            if deadline.is_some() {
                drained += 1;
            }

            let finished = {
                let dispatch = self.dispatch_or_report(command, &events);
                tokio::pin!(dispatch);
                loop {
                    match deadline {
                        Some(deadline) => break timeout_at(deadline, &mut dispatch).await.is_ok(),
                        None => tokio::select! {
                            _ = &mut dispatch => break true,
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    deadline = Some(Instant::now() + drain_grace);
                                }
                            }
                        },
                    }
                }
            };
            if !finished {
                // The link may still complete a write already handed to it
                self.metrics.record_command_abandoned();
                warn!("Drain grace of {:?} elapsed with a command in flight", drain_grace);
                break;
            }
        }

        commands.close();
        let mut abandoned = 0usize;
        while commands.try_recv().is_ok() {
            self.metrics.record_command_abandoned();
            abandoned += 1;
        }
        warn!(
            "Drain grace of {:?} elapsed; {} queued commands abandoned",
            drain_grace, abandoned
        );
    }
}
