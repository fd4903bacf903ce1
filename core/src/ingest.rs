//! Notification ingest
//!
//! `NotificationSink` is the only thing the transport callback touches: a
//! non-blocking push into the bounded notification channel. `IngestPipeline`
//! drains that channel, decodes each payload and hands commands on to the
//! dispatcher.

use crate::events::{BridgeEvent, BridgeMetrics, DropReason, EventSender};
use crate::message::{
    decode_notification, CharacteristicId, Command, Decoded, RawNotification, SensorReading,
};
use crate::policy::DecisionPolicy;
use crate::transport::NotificationCallback;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Result of handling one notification
#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    Reading(SensorReading),
    Command(Command),
}

/// Producer side of the notification channel
#[derive(Clone)]
pub struct NotificationSink {
    tx: mpsc::Sender<RawNotification>,
    metrics: Arc<BridgeMetrics>,
    events: EventSender,
}

impl NotificationSink {
    /// Bounded notification channel of `capacity` slots
    pub fn channel(
        capacity: usize,
        metrics: Arc<BridgeMetrics>,
        events: EventSender,
    ) -> (Self, mpsc::Receiver<RawNotification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                metrics,
                events,
            },
            rx,
        )
    }

    /// Enqueue without waiting. When the channel is full the new
    /// notification is discarded and counted. Returns whether it was queued.
    /// Nothing is counted once ingest has stopped.
    pub fn push(&self, raw: RawNotification) -> bool {
        match self.tx.try_send(raw) {
            Ok(()) => {
                self.metrics.record_notification();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_notification();
                let dropped = self.metrics.record_backpressure_drop();
                warn!("Notification queue full, dropping newest ({} dropped so far)", dropped);
                let _ = self.events.send(BridgeEvent::NotificationDropped {
                    reason: DropReason::QueueFull,
                });
                false
            }
            // Ingest already stopped; nothing left to deliver to
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Callback handed to the transport's subscribe
    pub fn callback(&self) -> NotificationCallback {
        let sink = self.clone();
        Arc::new(move |characteristic: CharacteristicId, payload: Vec<u8>| {
            sink.push(RawNotification::new(characteristic, payload));
        })
    }
}

/// Decodes notifications and turns readings into commands
pub struct IngestPipeline {
    command_keyword: String,
    metrics: Arc<BridgeMetrics>,
    events: EventSender,
}

impl IngestPipeline {
    pub fn new(command_keyword: impl Into<String>, metrics: Arc<BridgeMetrics>, events: EventSender) -> Self {
        Self {
            command_keyword: command_keyword.into(),
            metrics,
            events,
        }
    }

    /// Decode one notification. Malformed payloads are counted, reported
    /// and yield `None`.
    pub fn handle(&self, raw: RawNotification) -> Option<Ingested> {
        match decode_notification(&raw.payload, &self.command_keyword, raw.received_at) {
            Ok(Decoded::Reading(reading)) => {
                self.metrics.record_reading();
                Some(Ingested::Reading(reading))
            }
            Ok(Decoded::Control(command)) => {
                self.metrics.record_control_message();
                Some(Ingested::Command(command))
            }
            Err(e) => {
                let dropped = self.metrics.record_malformed();
                debug!(
                    "Dropping malformed notification from {}: {} ({} dropped so far)",
                    raw.characteristic_id, e, dropped
                );
                let _ = self.events.send(BridgeEvent::NotificationDropped {
                    reason: DropReason::Malformed(e),
                });
                None
            }
        }
    }

    /// Drain `notifications` until shutdown or until the channel closes.
    ///
    /// Readings go through `policy`; control messages are forwarded as-is.
    /// Dropping `commands` on exit closes the dispatcher's inbound channel.
    pub async fn run(
        self,
        mut notifications: mpsc::Receiver<RawNotification>,
        commands: mpsc::Sender<Command>,
        policy: Arc<dyn DecisionPolicy>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let raw = tokio::select! {
                raw = notifications.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let command = match self.handle(raw) {
                Some(Ingested::Reading(reading)) => policy.decide(&reading),
                Some(Ingested::Command(command)) => command,
                None => continue,
            };

            tokio::select! {
                sent = commands.send(command) => {
                    if sent.is_err() {
                        debug!("Command channel closed, stopping ingest");
                        break;
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    self.metrics.record_command_abandoned();
                    debug!("Shutdown while the command queue was full, abandoning command");
                    break;
                }
            }
        }

        // Stop accepting notifications; anything still queued is discarded
        notifications.close();
        debug!("Ingest loop exited");
    }
}

/// Resolves once shutdown is signalled or its sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CommandKind, DEFAULT_COMMAND_KEYWORD};
    use crate::policy::ThresholdPolicy;

    fn notify() -> CharacteristicId {
        CharacteristicId::from_short(0x2A58)
    }

    fn pipeline() -> (IngestPipeline, Arc<BridgeMetrics>, mpsc::UnboundedReceiver<BridgeEvent>) {
        let metrics = Arc::new(BridgeMetrics::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            IngestPipeline::new(DEFAULT_COMMAND_KEYWORD, metrics.clone(), events_tx),
            metrics,
            events_rx,
        )
    }

    #[test]
    fn test_handle_reading() {
        let (pipeline, metrics, _events) = pipeline();
        let result = pipeline.handle(RawNotification::new(notify(), b"0.6,1,2,3,4,5".to_vec()));

        match result {
            Some(Ingested::Reading(reading)) => {
                assert_eq!(reading.gx, 0.6);
                assert_eq!(reading.az, 5.0);
            }
            other => panic!("expected reading, got {:?}", other),
        }
        assert_eq!(metrics.snapshot().readings_decoded, 1);
    }

    #[test]
    fn test_handle_control_message() {
        let (pipeline, metrics, _events) = pipeline();
        let result = pipeline.handle(RawNotification::new(notify(), b"BLINK_5S\0\0".to_vec()));

        match result {
            Some(Ingested::Command(command)) => assert_eq!(command.kind, CommandKind::Blink5s),
            other => panic!("expected command, got {:?}", other),
        }
        assert_eq!(metrics.snapshot().control_messages, 1);
    }

    #[test]
    fn test_handle_malformed_is_counted_and_reported() {
        let (pipeline, metrics, mut events) = pipeline();

        assert!(pipeline.handle(RawNotification::new(notify(), b"1,2,3".to_vec())).is_none());
        assert!(pipeline.handle(RawNotification::new(notify(), vec![0xff, 0xfe])).is_none());

        assert_eq!(metrics.snapshot().dropped_malformed, 2);
        let first = events.try_recv().unwrap();
        assert!(matches!(
            first,
            BridgeEvent::NotificationDropped {
                reason: DropReason::Malformed(_)
            }
        ));
    }

    #[test]
    fn test_push_drops_newest_when_full() {
        let metrics = Arc::new(BridgeMetrics::new());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (sink, mut rx) = NotificationSink::channel(2, metrics.clone(), events_tx);

        assert!(sink.push(RawNotification::new(notify(), b"first".to_vec())));
        assert!(sink.push(RawNotification::new(notify(), b"second".to_vec())));
        assert!(!sink.push(RawNotification::new(notify(), b"third".to_vec())));

        assert_eq!(rx.try_recv().unwrap().payload, b"first".to_vec());
        assert_eq!(rx.try_recv().unwrap().payload, b"second".to_vec());
        assert!(rx.try_recv().is_err());

        // Ingest gone: not counted as received
        rx.close();
        assert!(!sink.push(RawNotification::new(notify(), b"late".to_vec())));

        let stats = metrics.snapshot();
        assert_eq!(stats.notifications_received, 3);
        assert_eq!(stats.dropped_backpressure, 1);
        assert_eq!(
            events_rx.try_recv().unwrap(),
            BridgeEvent::NotificationDropped {
                reason: DropReason::QueueFull
            }
        );
    }

    #[test]
    fn test_callback_pushes_into_channel() {
        let metrics = Arc::new(BridgeMetrics::new());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (sink, mut rx) = NotificationSink::channel(4, metrics, events_tx);

        let callback = sink.callback();
        callback(notify(), b"0.1,0,0,0,0,0".to_vec());

        let raw = rx.try_recv().unwrap();
        assert_eq!(raw.characteristic_id, notify());
    }

    #[tokio::test]
    async fn test_run_turns_readings_into_commands_in_order() {
        let (pipeline, _metrics, _events) = pipeline();
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let payloads: [&[u8]; 4] = [b"0.60,0,0,0,0,0", b"garbage", b"0.10,0,0,0,0,0", b"BLINK_1S"];
        for payload in payloads {
            raw_tx
                .send(RawNotification::new(notify(), payload.to_vec()))
                .await
                .unwrap();
        }
        drop(raw_tx);

        let policy: Arc<dyn DecisionPolicy> = Arc::new(ThresholdPolicy::default());
        pipeline.run(raw_rx, cmd_tx, policy, shutdown_rx).await;

        let mut kinds = Vec::new();
        while let Ok(command) = cmd_rx.try_recv() {
            kinds.push(command.kind);
        }
        assert_eq!(
            kinds,
            vec![CommandKind::Blink1s, CommandKind::Blink5s, CommandKind::Blink1s]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_blocked_on_full_queue_is_counted_at_shutdown() {
        let (pipeline, metrics, _events) = pipeline();
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        cmd_tx
            .try_send(Command::new(CommandKind::Blink5s, std::time::SystemTime::now()))
            .unwrap();
        raw_tx
            .send(RawNotification::new(notify(), b"BLINK_1S".to_vec()))
            .await
            .unwrap();

        let policy: Arc<dyn DecisionPolicy> = Arc::new(ThresholdPolicy::default());
        let task = tokio::spawn(pipeline.run(raw_rx, cmd_tx, policy, shutdown_rx));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(metrics.snapshot().control_messages, 1);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(metrics.snapshot().commands_abandoned, 1);
        assert_eq!(cmd_rx.recv().await.unwrap().kind, CommandKind::Blink5s);
        assert!(cmd_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (pipeline, _metrics, _events) = pipeline();
        let (raw_tx, raw_rx) = mpsc::channel(8);
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let policy: Arc<dyn DecisionPolicy> = Arc::new(ThresholdPolicy::default());
        let task = tokio::spawn(pipeline.run(raw_rx, cmd_tx, policy, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        // Receiver closed and the command sender dropped
        assert!(raw_tx
            .send(RawNotification::new(notify(), b"0.6,0,0,0,0,0".to_vec()))
            .await
            .is_err());
        assert!(cmd_rx.recv().await.is_none());
    }
}
