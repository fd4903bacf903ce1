// Integration test: link loss and recovery
//
// The simulated peripheral drops the connection mid-run. The bridge must
// reconnect on its own, resume notifications, and never hold an outage
// command for longer than its retry budget.

use blebridge_core::{
    BridgeConfig, BridgeEvent, BridgeSettings, BridgeSupervisor, CharacteristicId, CommandKind,
    DeviceSelector, LinkError, LinkState, MemorySink, ReconnectSettings, RunningBridge,
    SimulatedTransport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

fn notify() -> CharacteristicId {
    CharacteristicId::from_short(0x2A58)
}

fn settings(max_attempts: u32) -> BridgeSettings {
    BridgeSettings {
        reconnect: ReconnectSettings {
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            max_attempts,
            jitter: 0.0,
        },
        ..BridgeSettings::default()
    }
}

async fn start(
    settings: BridgeSettings,
) -> (Arc<SimulatedTransport>, Arc<MemorySink>, RunningBridge) {
    tracing_subscriber::fmt()
        .with_env_filter("debug")
        .try_init()
        .ok();

    let sim = Arc::new(SimulatedTransport::new().with_device("Nano 33 IoT", "AA:BB:CC:DD:EE:FF"));
    let sink = Arc::new(MemorySink::new());
    let config = BridgeConfig::new(
        DeviceSelector::Address("AA:BB:CC:DD:EE:FF".to_string()),
        notify(),
        CharacteristicId::from_short(0x2A59),
    )
    .with_platform_address_mode(true)
    .with_settings(settings);

    let bridge = BridgeSupervisor::new(config, sim.clone())
        .unwrap()
        .with_event_sink(sink.clone())
        .start()
        .await
        .expect("bridge starts");
    (sim, sink, bridge)
}

async fn wait_for_state(rx: &mut watch::Receiver<LinkState>, wanted: LinkState) {
    timeout(Duration::from_secs(120), rx.wait_for(|s| *s == wanted))
        .await
        .expect("link state reached in time")
        .expect("link still alive");
}

async fn wait_for_writes(sim: &SimulatedTransport, count: usize) {
    timeout(Duration::from_secs(30), async {
        while sim.written_text().len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("writes arrive in time");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resumes_notification_delivery() {
    let (sim, sink, mut bridge) = start(settings(8)).await;
    let mut state = bridge.subscribe_link_state();

    sim.inject_notification(notify(), b"0.9,0,0,0,0,0");
    wait_for_writes(&sim, 1).await;

    sim.drop_connection();
    wait_for_state(&mut state, LinkState::Reconnecting).await;
    println!("✓ link dropped, reconnecting");

    // Nothing is subscribed while the link is down
    assert!(!sim.inject_notification(notify(), b"0.9,0,0,0,0,0"));

    wait_for_state(&mut state, LinkState::Connected).await;
    println!("✓ link restored");

    assert!(sim.inject_notification(notify(), b"0.1,0,0,0,0,0"));
    wait_for_writes(&sim, 2).await;
    assert_eq!(sim.written_text(), vec!["BLINK_1S", "BLINK_5S"]);
    assert_eq!(sim.connect_count(), 2);

    bridge.relay_pending_events();
    assert!(sink.events().contains(&BridgeEvent::LinkStateChanged {
        from: LinkState::Connected,
        to: LinkState::Reconnecting,
    }));
    assert!(sink.events().contains(&BridgeEvent::LinkStateChanged {
        from: LinkState::Reconnecting,
        to: LinkState::Connected,
    }));

    let stats = bridge.shutdown().await;
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_outage_command_fails_within_retry_budget() {
    let (sim, sink, bridge) = start(settings(8)).await;
    let mut state = bridge.subscribe_link_state();

    // Command queued, then the peripheral disappears before it is written
    sim.set_devices_visible(false);
    sim.inject_notification(notify(), b"BLINK_5S");
    sim.drop_connection();
    let dropped_at = Instant::now();

    wait_for_state(&mut state, LinkState::Reconnecting).await;
    timeout(Duration::from_secs(5), async {
        while bridge.stats().commands_failed == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("command given up on");

    // 100 + 200 + 400 ms of retry backoff, nowhere near the outage length
    assert!(dropped_at.elapsed() < Duration::from_secs(1));

    sim.set_devices_visible(true);
    wait_for_state(&mut state, LinkState::Connected).await;
    sleep(Duration::from_secs(5)).await;

    // Never replayed after the link came back
    assert!(sim.writes().is_empty());

    bridge.shutdown().await;
    let failures: Vec<BridgeEvent> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, BridgeEvent::CommandDeliveryFailed { .. }))
        .collect();
    assert_eq!(
        failures,
        vec![BridgeEvent::CommandDeliveryFailed {
            command: CommandKind::Blink5s,
            attempts: 4,
            error: LinkError::NotConnected.to_string(),
        }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_window_reports_link_lost_and_keeps_trying() {
    let (sim, sink, bridge) = start(settings(2)).await;
    let mut state = bridge.subscribe_link_state();

    sim.set_devices_visible(false);
    sim.drop_connection();

    // Two windows of 1s + 2s
    sleep(Duration::from_secs(7)).await;
    assert_eq!(bridge.stats().link_lost, 2);
    assert_eq!(bridge.link_state(), LinkState::Reconnecting);

    sim.set_devices_visible(true);
    wait_for_state(&mut state, LinkState::Connected).await;

    let stats = bridge.shutdown().await;
    assert_eq!(stats.link_lost, 2);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(
        sink.count_where(|e| *e == BridgeEvent::LinkLost { attempts: 2 }),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_survives_failed_connects() {
    let (sim, _sink, bridge) = start(settings(8)).await;
    let mut state = bridge.subscribe_link_state();

    sim.fail_next_connects(3);
    sim.drop_connection();
    wait_for_state(&mut state, LinkState::Reconnecting).await;
    wait_for_state(&mut state, LinkState::Connected).await;

    // Initial connect, three failures, one success
    assert_eq!(sim.connect_count(), 5);
    assert!(sim.inject_notification(notify(), b"BLINK_1S"));
    wait_for_writes(&sim, 1).await;

    bridge.shutdown().await;
}
