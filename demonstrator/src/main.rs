//! main.rs — scripted mission harness.
//!
//! Runs the whole demonstrator in one process over the in-process bus
//! and queue: RBC, both bridges and the OBU, plus a sensor walker that
//! plays the line sensors once the Movement Authority arrives and an
//! optional obstacle injector for the auto-stop path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use etcs_core::bus::{topics, LocalBus, LocalQueue, MessageBus, QoS};
use etcs_core::fsm::SessionState;
use etcs_core::kpi::{now_ms, PositionKpi};
use etcs_core::obu::{Obu, ObuConfig, SensorEvent};
use etcs_core::rbc::{Rbc, RbcConfig, RouteConfig};
use etcs_core::topology::Topology;
use etcs_core::{ForwardBridge, ReverseBridge};

// ── CLI ───────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "etcs-demo", about = "ETCS L2 demonstrator mission harness")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// Inject an obstacle alert mid-mission (overrides config)
    #[arg(long)]
    obstacle: bool,
    /// Obstacle confidence to inject (e.g. 0.1 to exercise the
    /// below-threshold path)
    #[arg(long)]
    conf: Option<f64>,
    /// Let the reverse bridge pass PDUs through before keys arrive
    #[arg(long)]
    unsecured: bool,
}

// ── Config file ───────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
struct FullConfig {
    identity: IdentityConfig,
    route: RouteSection,
    mission: MissionConfig,
    obstacle: ObstacleConfig,
}

#[derive(Debug, serde::Deserialize)]
struct IdentityConfig {
    train_id: String,
    rbc_id: String,
}

#[derive(Debug, serde::Deserialize)]
struct RouteSection {
    id: String,
    tracks: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
struct MissionConfig {
    topology: String,
    sensors: Vec<String>,
    sensor_interval_ms: u64,
    auto_grant_ms: u64,
    handshake_timeout_ms: u64,
}

#[derive(Debug, serde::Deserialize)]
struct ObstacleConfig {
    enabled: bool,
    label: String,
    conf: f64,
    delay_ms: u64,
}

// ── Main ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "etcs_demonstrator=info,etcs_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config.toml")?;

    let topology = Topology::load_or_default(Path::new(&cfg.mission.topology));
    info!(
        "🚆 ETCS demonstrator starting — train {} → RBC {} on route {}",
        cfg.identity.train_id, cfg.identity.rbc_id, cfg.route.id
    );

    let bus = Arc::new(LocalBus::new());
    let queue = Arc::new(LocalQueue::new());

    // Trackside first, so the handshake reply is armed.
    let rbc = Arc::new(Rbc::new(
        RbcConfig {
            rbc_id: cfg.identity.rbc_id.clone(),
            train_id: cfg.identity.train_id.clone(),
            topology,
            route: RouteConfig { id: cfg.route.id.clone(), tracks: cfg.route.tracks.clone() },
            auto_grant: Some(Duration::from_millis(cfg.mission.auto_grant_ms)),
            ..RbcConfig::default()
        },
        bus.clone(),
    ));
    {
        let rbc = rbc.clone();
        tokio::spawn(async move { rbc.run().await });
    }

    let fwd = ForwardBridge::new(&cfg.identity.rbc_id, bus.clone(), queue.clone());
    tokio::spawn(async move { fwd.run().await });
    let mut rev = ReverseBridge::new(&cfg.identity.rbc_id, bus.clone(), queue.clone());
    if args.unsecured {
        rev = rev.with_unsecured_passthrough();
    }
    tokio::spawn(async move { rev.run().await });

    spawn_observers(&cfg, bus.clone()).await;

    let obu = Arc::new(Obu::new(
        ObuConfig {
            train_id: cfg.identity.train_id.clone(),
            rbc_id: cfg.identity.rbc_id.clone(),
            handshake_timeout: Duration::from_millis(cfg.mission.handshake_timeout_ms),
            ..ObuConfig::default()
        },
        bus.clone(),
    ));

    spawn_sensor_walker(&cfg, bus.clone(), obu.clone());
    if cfg.obstacle.enabled || args.obstacle {
        spawn_obstacle_injector(&cfg, args.conf, bus.clone(), obu.clone());
    }

    // Give the trackside tasks a beat to subscribe before AU1 goes out.
    sleep(Duration::from_millis(100)).await;

    // The mission loop owns the foreground; it returns after the
    // termination ack.
    obu.run().await;

    info!(
        "🏁 mission finished — {} sections passed, RBC saw MA request: {}",
        obu.passed_sections().await,
        rbc.ma_request_received().await
    );
    Ok(())
}

// ── Background tasks ──────────────────────────────────────────────────

/// Log status events and aggregate position KPIs.
async fn spawn_observers(cfg: &FullConfig, bus: Arc<LocalBus>) {
    let mut status_rx = bus.subscribe(&topics::status(&cfg.identity.train_id)).await;
    tokio::spawn(async move {
        while let Some(raw) = status_rx.recv().await {
            if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&raw.payload) {
                match v["type"].as_str() {
                    Some("TRAIN_EVENT") => {
                        warn!("⛔ {} (label {:?}, conf {:?})", v["event"], v["label"], v["conf"])
                    }
                    _ => info!("status: {} → {}", v["service"], v["state"]),
                }
            }
        }
    });

    let mut kpi_rx = bus.subscribe(&topics::kpi_pos(&cfg.identity.rbc_id)).await;
    let samples: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    tokio::spawn(async move {
        while let Some(raw) = kpi_rx.recv().await {
            let Ok(v) = serde_json::from_slice::<serde_json::Value>(&raw.payload) else { continue };
            if v["event"] == PositionKpi::EVENT {
                if let Ok(kpi) = serde_json::from_value::<PositionKpi>(v) {
                    if let Some(rtt) = kpi.rtt_ms {
                        samples.lock().await.push(rtt);
                    }
                    let mean = {
                        let s = samples.lock().await;
                        s.iter().sum::<u64>() as f64 / s.len().max(1) as f64
                    };
                    info!(
                        "📍 {} at D_LRBG={} m (rtt {:?} ms, mean {:.1} ms)",
                        kpi.sensor_id, kpi.d_lrbg, kpi.rtt_ms, mean
                    );
                }
            }
        }
    });

    let mut cmd_rx = bus.subscribe(topics::TRAIN_CMD).await;
    tokio::spawn(async move {
        while let Some(raw) = cmd_rx.recv().await {
            let cmd = String::from_utf8_lossy(&raw.payload).to_string();
            match cmd.as_str() {
                "0" => warn!("🛑 actuator: STOP"),
                "1" => info!("▶ actuator: GO"),
                other => warn!("actuator: unknown command {other:?}"),
            }
        }
    });
}

/// Play the configured line sensors once the mission is active.
fn spawn_sensor_walker(cfg: &FullConfig, bus: Arc<LocalBus>, obu: Arc<Obu>) {
    let sensors = cfg.mission.sensors.clone();
    let interval = Duration::from_millis(cfg.mission.sensor_interval_ms);
    let topic = topics::sensor(&cfg.identity.rbc_id);
    let fsm = obu.state_handle();
    tokio::spawn(async move {
        loop {
            let state = fsm.read().await.state();
            if matches!(state, SessionState::MissionActive | SessionState::MissionMonitoring) {
                break;
            }
            if state == SessionState::Disconnected && !fsm.read().await.history().is_empty() {
                return; // handshake failed, nothing to walk
            }
            sleep(Duration::from_millis(100)).await;
        }
        info!("🛤  mission active, walking {} sensors", sensors.len());
        for sensor_id in sensors {
            let event = SensorEvent { sensor_id, t_sensor_ms: Some(now_ms()) };
            let payload = serde_json::to_vec(&event).unwrap_or_default();
            bus.publish(&topic, payload, QoS::ExactlyOnce).await;
            sleep(interval).await;
        }
    });
}

/// Publish one AI obstacle alert mid-mission.
fn spawn_obstacle_injector(cfg: &FullConfig, conf: Option<f64>, bus: Arc<LocalBus>, obu: Arc<Obu>) {
    let label = cfg.obstacle.label.clone();
    let conf = conf.unwrap_or(cfg.obstacle.conf);
    let delay = Duration::from_millis(cfg.obstacle.delay_ms);
    let train_id = cfg.identity.train_id.clone();
    let fsm = obu.state_handle();
    tokio::spawn(async move {
        loop {
            if fsm.read().await.state() == SessionState::MissionMonitoring {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        sleep(delay).await;
        let alert = serde_json::json!({
            "label": label,
            "conf": conf,
            "msg_id": format!("AI_{train_id}_1"),
            "frame_id": 1,
            "ts": now_ms(),
            "t_alert_send_ms": now_ms(),
        });
        info!("👁  injecting obstacle alert (conf {conf})");
        bus.publish(topics::AI_ALERT, serde_json::to_vec(&alert).unwrap_or_default(), QoS::AtLeastOnce)
            .await;
    });
}
