//! End-to-end mission scenarios over the in-process bus and queue:
//! handshake, MA request latch, position reports, mission completion,
//! and the automatic-stop coordinator.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};

use etcs_core::bus::{topics, LocalBus, LocalQueue, MessageBus, QoS};
use etcs_core::fsm::{SessionFsm, SessionState};
use etcs_core::message::{nid, EtcsMessage, Source};
use etcs_core::obu::{Obu, ObuConfig, SensorEvent};
use etcs_core::rbc::{Rbc, RbcConfig};
use etcs_core::{ForwardBridge, ReverseBridge};

const RBC_ID: &str = "DE0001";
const TRAIN_ID: &str = "TRAIN01";

async fn wait_for_state(
    fsm: &Arc<RwLock<SessionFsm>>,
    want: SessionState,
    deadline: Duration,
) -> bool {
    let step = Duration::from_millis(25);
    let mut waited = Duration::ZERO;
    while waited < deadline {
        if fsm.read().await.state() == want {
            return true;
        }
        sleep(step).await;
        waited += step;
    }
    false
}

struct World {
    bus: Arc<LocalBus>,
    obu: Arc<Obu>,
    rbc: Arc<Rbc>,
}

/// Spin up RBC, both bridges and the OBU on one in-process bus.
async fn start_world() -> World {
    let bus = Arc::new(LocalBus::new());
    let queue = Arc::new(LocalQueue::new());

    let rbc = Arc::new(Rbc::new(
        RbcConfig { auto_grant: Some(Duration::from_millis(100)), ..RbcConfig::default() },
        bus.clone(),
    ));
    let fwd = ForwardBridge::new(RBC_ID, bus.clone(), queue.clone());
    let rev = ReverseBridge::new(RBC_ID, bus.clone(), queue.clone());
    {
        let rbc = rbc.clone();
        tokio::spawn(async move { rbc.run().await });
    }
    tokio::spawn(async move { fwd.run().await });
    tokio::spawn(async move { rev.run().await });
    sleep(Duration::from_millis(50)).await;

    let obu = Arc::new(Obu::new(ObuConfig::default(), bus.clone()));
    World { bus, obu, rbc }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_reaches_version_exchange_and_leaks_keys_once() {
    let world = start_world().await;
    let mut keys_rx = world.bus.subscribe(&topics::obu_keys(RBC_ID)).await;

    let obu = world.obu.clone();
    tokio::spawn(async move { obu.run().await });

    let fsm = world.obu.state_handle();
    assert!(
        wait_for_state(&fsm, SessionState::SessionEstablished, Duration::from_secs(5)).await,
        "OBU never established the session"
    );

    let update = timeout(Duration::from_secs(1), keys_rx.recv()).await.unwrap().unwrap();
    let parsed: etcs_core::KeyUpdate = serde_json::from_slice(&update.payload).unwrap();
    assert_eq!(parsed.kind, "KEY_UPDATE");
    sleep(Duration::from_millis(100)).await;
    assert!(keys_rx.try_recv().is_err(), "KEY_UPDATE must be published once");
}

#[tokio::test(flavor = "multi_thread")]
async fn full_mission_runs_to_termination() {
    let world = start_world().await;

    // Observe the OBU→RBC plane for wire-origin copies.
    let mut plane_rx = world.bus.subscribe(&topics::rbc_in(RBC_ID)).await;
    let mut status_rx = world.bus.subscribe(&topics::status(TRAIN_ID)).await;

    let obu_task = {
        let obu = world.obu.clone();
        tokio::spawn(async move { obu.run().await })
    };

    // Wait for the MA to arrive, then walk the three line sensors.
    let fsm = world.obu.state_handle();
    assert!(
        wait_for_state(&fsm, SessionState::MissionActive, Duration::from_secs(10)).await,
        "mission never became active"
    );
    assert!(world.rbc.ma_request_received().await);
    assert!(world.obu.ma_request_sent().await);

    for sensor in ["S1", "S2", "S3"] {
        let event = SensorEvent { sensor_id: sensor.into(), t_sensor_ms: Some(1) };
        world
            .bus
            .publish(&topics::sensor(RBC_ID), serde_json::to_vec(&event).unwrap(), QoS::ExactlyOnce)
            .await;
        sleep(Duration::from_millis(400)).await;
    }

    timeout(Duration::from_secs(10), obu_task).await.expect("mission never terminated").unwrap();

    // Default layout ⇒ MA carries 2 sections ⇒ completion at 3 reports.
    assert_eq!(world.obu.passed_sections().await, 3);

    // Exactly one MA request and one position report per sensor crossed
    // the bridge (wire origin).
    let mut ma_requests = 0;
    let mut reports = 0;
    while let Ok(raw) = plane_rx.try_recv() {
        let Some(msg) = EtcsMessage::from_bytes(&raw.payload) else { continue };
        if msg.origin() != Some(Source::Wire) {
            continue;
        }
        match msg.nid() {
            Some(nid::MA_REQUEST) => ma_requests += 1,
            Some(nid::POSITION_REPORT) => reports += 1,
            _ => {}
        }
    }
    assert_eq!(ma_requests, 1, "MA request must be latched to exactly one emission");
    assert_eq!(reports, 3, "one position report per admitted sensor event");

    // The status plane saw mission completion and session termination.
    let mut saw_complete = false;
    let mut saw_terminated = false;
    while let Ok(raw) = status_rx.try_recv() {
        let v: serde_json::Value = serde_json::from_slice(&raw.payload).unwrap_or_default();
        match v["state"].as_str() {
            Some("mission_complete") => saw_complete = true,
            Some("session_terminated") => saw_terminated = true,
            _ => {}
        }
    }
    assert!(saw_complete, "missing mission_complete status");
    assert!(saw_terminated, "missing session_terminated status");

    // After the termination ack the OBU is back in DISCONNECTED.
    assert_eq!(world.obu.state_handle().read().await.state(), SessionState::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn low_confidence_alert_is_ignored() {
    let bus = Arc::new(LocalBus::new());
    let obu = Arc::new(Obu::new(ObuConfig::default(), bus.clone()));
    let mut train_rx = bus.subscribe(topics::TRAIN_CMD).await;
    let mut status_rx = bus.subscribe(&topics::status(TRAIN_ID)).await;
    {
        let obu = obu.clone();
        tokio::spawn(async move { obu.run().await });
    }
    sleep(Duration::from_millis(50)).await;

    let alert = json!({ "label": "person", "conf": 0.10 });
    bus.publish(topics::AI_ALERT, serde_json::to_vec(&alert).unwrap(), QoS::AtLeastOnce).await;
    sleep(Duration::from_millis(300)).await;

    assert!(train_rx.try_recv().is_err(), "no stop command for low confidence");
    while let Ok(raw) = status_rx.try_recv() {
        let v: serde_json::Value = serde_json::from_slice(&raw.payload).unwrap_or_default();
        assert_ne!(v["event"].as_str(), Some("AUTO_STOP_OBSTACLE"));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn alert_burst_stops_the_train_exactly_once() {
    let bus = Arc::new(LocalBus::new());
    let obu = Arc::new(Obu::new(ObuConfig::default(), bus.clone()));
    let mut train_rx = bus.subscribe(topics::TRAIN_CMD).await;
    let mut status_rx = bus.subscribe(&topics::status(TRAIN_ID)).await;
    {
        let obu = obu.clone();
        tokio::spawn(async move { obu.run().await });
    }
    sleep(Duration::from_millis(50)).await;

    for _ in 0..2 {
        let alert = json!({ "label": "person", "conf": 0.9, "msg_id": "AI_TRAIN01_1" });
        bus.publish(topics::AI_ALERT, serde_json::to_vec(&alert).unwrap(), QoS::AtLeastOnce).await;
        sleep(Duration::from_millis(500)).await;
    }
    sleep(Duration::from_millis(200)).await;

    let cmd = train_rx.try_recv().expect("expected one stop command");
    assert_eq!(cmd.payload, b"0");
    assert!(train_rx.try_recv().is_err(), "burst must be debounced to one stop");

    let mut stop_events = 0;
    while let Ok(raw) = status_rx.try_recv() {
        let v: serde_json::Value = serde_json::from_slice(&raw.payload).unwrap_or_default();
        if v["event"].as_str() == Some("AUTO_STOP_OBSTACLE") {
            stop_events += 1;
        }
    }
    assert_eq!(stop_events, 1, "exactly one AUTO_STOP_OBSTACLE event");
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_times_out_back_to_disconnected() {
    // No RBC on the bus: AU2 never arrives.
    let bus = Arc::new(LocalBus::new());
    let cfg = ObuConfig { handshake_timeout: Duration::from_millis(300), ..ObuConfig::default() };
    let obu = Arc::new(Obu::new(cfg, bus.clone()));
    {
        let obu = obu.clone();
        tokio::spawn(async move { obu.run().await });
    }
    let fsm = obu.state_handle();
    assert!(
        wait_for_state(&fsm, SessionState::HandshakeInitiated, Duration::from_secs(1)).await,
        "AU1 never sent"
    );
    assert!(
        wait_for_state(&fsm, SessionState::Disconnected, Duration::from_secs(2)).await,
        "handshake timeout never fired"
    );
}
