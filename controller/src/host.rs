use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use greenhouse_common::{
    ControllerStatus, Device, RuleError, RulePatch, RuntimeConfig, StepDirection,
    TOPIC_AUTO_MODE, TOPIC_AUTO_SETTINGS, TOPIC_CMD_DEVICE_FILTER, TOPIC_CMD_DEVICE_PREFIX,
    TOPIC_CMD_EMERGENCY_STOP, TOPIC_CONTROLLER_NOTICE, TOPIC_CONTROLLER_STATE,
};

use crate::{
    actuator::HttpActuator,
    evaluator::{AutoControlEvaluator, OverrideNotice},
    store::RuleStore,
    sync::{AppStore, AutoModeEnvelope, MqttSettingsSync, SettingsEnvelope},
};

const MQTT_CLIENT_ID: &str = "greenhouse-controller-rust";
const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;
const NOTICE_HISTORY: usize = 20;
const COMMAND_QUEUE: usize = 32;

#[derive(Clone)]
struct AppState {
    evaluator: Arc<AutoControlEvaluator>,
    mqtt: AsyncClient,
    notices: Arc<Mutex<VecDeque<OverrideNotice>>>,
}

/// Device command received over MQTT, executed in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Switch { device: Device, desired: bool },
    EmergencyStop,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct AutoModeView {
    #[serde(rename = "autoMode")]
    auto_mode: bool,
    version: u64,
}

#[derive(Debug, Serialize)]
struct ControlView {
    notice: Option<OverrideNotice>,
    status: ControllerStatus,
}

#[derive(Debug, Serialize)]
struct EmergencyStopView {
    failed: Vec<Device>,
    status: ControllerStatus,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let app_store = AppStore::new();
    let mut runtime = app_store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let network = &runtime.network;
    let mut mqtt_options =
        MqttOptions::new(MQTT_CLIENT_ID, network.mqtt_host.clone(), network.mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    if !network.mqtt_user.is_empty() {
        mqtt_options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let sync = Arc::new(MqttSettingsSync::new(mqtt.clone(), MQTT_CLIENT_ID, app_store));
    let rules = Arc::new(RuleStore::new(runtime.rules, runtime.auto_mode, sync));
    let actuator = Arc::new(HttpActuator::new(
        &network.backend_url,
        Duration::from_millis(runtime.controller.actuator_timeout_ms),
    )?);
    let evaluator = AutoControlEvaluator::new(&runtime.controller, rules, actuator);
    info!(
        "auto control ready: backend {}, auto mode {}",
        network.backend_url,
        if runtime.auto_mode { "on" } else { "off" }
    );

    let app_state = AppState {
        evaluator: Arc::clone(&evaluator),
        mqtt,
        notices: Arc::new(Mutex::new(VecDeque::with_capacity(NOTICE_HISTORY))),
    };

    let rules_log = evaluator.store().subscribe_rules(|rules| {
        debug!("auto control rules at version {}", rules.version);
    });
    let auto_mode_log = evaluator.store().subscribe_auto_mode(|auto_mode| {
        debug!("auto mode {} at version {}", auto_mode.value, auto_mode.version);
    });

    subscribe_topics(&app_state.mqtt).await?;
    spawn_notice_loop(app_state.clone(), evaluator.subscribe_notices());
    let (commands, _) = spawn_command_worker(Arc::clone(&evaluator));
    spawn_mqtt_loop(app_state.clone(), commands, eventloop);
    evaluator.spawn();
    spawn_status_poll_loop(
        Arc::clone(&evaluator),
        Duration::from_millis(runtime.controller.poll_interval_ms),
    );
    spawn_state_publish_loop(
        app_state.clone(),
        Duration::from_millis(runtime.controller.state_publish_interval_ms),
    );

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/control", post(handle_control))
        .route("/api/emergency-stop", post(handle_emergency_stop))
        .route(
            "/api/auto-mode",
            get(handle_get_auto_mode).post(handle_set_auto_mode),
        )
        .route("/api/rules", get(handle_get_rules))
        .route("/api/rules/{device}", patch(handle_patch_rule))
        .route("/api/rules/{device}/threshold", post(handle_nudge_threshold))
        .route("/api/notices", get(handle_get_notices))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.network.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    evaluator.shutdown();
    rules_log.unsubscribe();
    auto_mode_log.unsubscribe();
    info!("controller stopped");
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    let network = &mut runtime.network;
    if let Ok(url) = std::env::var("GREENHOUSE_BACKEND_URL") {
        network.backend_url = url;
    }
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = env_port("MQTT_PORT") {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }
    if let Some(port) = env_port("CONTROLLER_HTTP_PORT") {
        network.http_port = port;
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_AUTO_SETTINGS,
        TOPIC_AUTO_MODE,
        TOPIC_CMD_DEVICE_FILTER,
        TOPIC_CMD_EMERGENCY_STOP,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(
    app_state: AppState,
    commands: mpsc::Sender<Command>,
    mut eventloop: rumqttc::EventLoop,
) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &commands, &message.topic, &message.payload)
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

// Commands await the actuator, so they run off the MQTT poll loop but one at a
// time: a later command for a device must land after an earlier one.
fn spawn_command_worker(
    evaluator: Arc<AutoControlEvaluator>,
) -> (mpsc::Sender<Command>, JoinHandle<()>) {
    let (commands, mut queue) = mpsc::channel(COMMAND_QUEUE);
    let worker = tokio::spawn(async move {
        while let Some(command) = queue.recv().await {
            match command {
                Command::Switch { device, desired } => {
                    evaluator.manual_control(device, desired).await;
                }
                Command::EmergencyStop => {
                    let failed = evaluator.emergency_stop().await;
                    if !failed.is_empty() {
                        warn!("emergency stop left {failed:?} unconfirmed");
                    }
                }
            }
        }
        debug!("device command queue closed");
    });
    (commands, worker)
}

fn spawn_status_poll_loop(evaluator: Arc<AutoControlEvaluator>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(err) = evaluator.refresh_status().await {
                warn!("status poll failed: {err}");
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let status = app_state.evaluator.status().await;
            match serde_json::to_vec(&status) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

fn spawn_notice_loop(app_state: AppState, mut notices: broadcast::Receiver<OverrideNotice>) {
    tokio::spawn(async move {
        loop {
            let notice = match notices.recv().await {
                Ok(notice) => notice,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("dropped {skipped} override notices");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            match serde_json::to_vec(&notice) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_NOTICE, QoS::AtLeastOnce, false, body)
                        .await
                    {
                        warn!("override notice publish failed: {err}");
                    }
                }
                Err(err) => warn!("override notice serialization failed: {err}"),
            }

            let mut history = app_state.notices.lock().await;
            push_notice(&mut history, notice);
        }
    });
}

fn push_notice(history: &mut VecDeque<OverrideNotice>, notice: OverrideNotice) {
    if history.len() == NOTICE_HISTORY {
        history.pop_front();
    }
    history.push_back(notice);
}

async fn handle_mqtt_message(
    app_state: &AppState,
    commands: &mpsc::Sender<Command>,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let store = app_state.evaluator.store();
    match topic {
        TOPIC_AUTO_SETTINGS => {
            let envelope: SettingsEnvelope =
                serde_json::from_slice(payload).context("invalid settings envelope")?;
            if envelope.origin != MQTT_CLIENT_ID && store.reconcile_rules(envelope.rules) {
                info!("adopted auto control rules from {}", envelope.origin);
            }
        }
        TOPIC_AUTO_MODE => {
            let envelope: AutoModeEnvelope =
                serde_json::from_slice(payload).context("invalid auto mode envelope")?;
            if envelope.origin != MQTT_CLIENT_ID && store.reconcile_auto_mode(envelope.enabled) {
                info!("adopted auto mode from {}", envelope.origin);
            }
        }
        _ => {
            if let Some(command) = parse_command(topic, payload)? {
                commands
                    .send(command)
                    .await
                    .context("device command queue closed")?;
            }
        }
    }

    Ok(())
}

fn parse_command(topic: &str, payload: &[u8]) -> anyhow::Result<Option<Command>> {
    if topic == TOPIC_CMD_EMERGENCY_STOP {
        return Ok(Some(Command::EmergencyStop));
    }
    let Some(name) = topic.strip_prefix(TOPIC_CMD_DEVICE_PREFIX) else {
        return Ok(None);
    };

    let device: Device = name.parse()?;
    let message = std::str::from_utf8(payload).context("non utf8 mqtt payload")?;
    let desired = parse_switch(message)
        .with_context(|| format!("unrecognised device command {message:?} for {device}"))?;
    Ok(Some(Command::Switch { device, desired }))
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.evaluator.status().await)
}

async fn handle_control(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(name) = params.get("device") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'device' parameter");
    };
    let device = match name.parse::<Device>() {
        Ok(device) => device,
        Err(err) => return rule_error_response(err),
    };
    let Some(desired) = params.get("value").and_then(|value| parse_switch(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'");
    };

    let outcome = state.evaluator.manual_control(device, desired).await;
    Json(ControlView {
        notice: outcome.notice,
        status: state.evaluator.status().await,
    })
    .into_response()
}

async fn handle_emergency_stop(State(state): State<AppState>) -> impl IntoResponse {
    let failed = state.evaluator.emergency_stop().await;
    Json(EmergencyStopView {
        failed,
        status: state.evaluator.status().await,
    })
}

async fn handle_get_auto_mode(State(state): State<AppState>) -> impl IntoResponse {
    let auto_mode = state.evaluator.store().auto_mode();
    Json(AutoModeView {
        auto_mode: auto_mode.value,
        version: auto_mode.version,
    })
}

async fn handle_set_auto_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(enabled) = params.get("value").and_then(|value| parse_switch(value)) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid value. Use 'on' or 'off'");
    };

    state.evaluator.set_auto_mode(enabled).await;
    handle_get_auto_mode(State(state)).await.into_response()
}

async fn handle_get_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.evaluator.store().rules())
}

async fn handle_patch_rule(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Json(patch): Json<RulePatch>,
) -> impl IntoResponse {
    let result = match device.parse::<Device>() {
        Ok(device) => state.evaluator.store().set_rule(device, patch).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(_) => handle_get_rules(State(state)).await.into_response(),
        Err(err) => rule_error_response(err),
    }
}

async fn handle_nudge_threshold(
    State(state): State<AppState>,
    Path(device): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let direction = match params.get("step").map(|value| value.to_ascii_lowercase()) {
        Some(step) if step == "up" => StepDirection::Up,
        Some(step) if step == "down" => StepDirection::Down,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid step. Use 'up' or 'down'"),
    };

    let result = match device.parse::<Device>() {
        Ok(device) => state.evaluator.store().nudge_threshold(device, direction).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(_) => handle_get_rules(State(state)).await.into_response(),
        Err(err) => rule_error_response(err),
    }
}

async fn handle_get_notices(State(state): State<AppState>) -> impl IntoResponse {
    let notices: Vec<OverrideNotice> = state.notices.lock().await.iter().cloned().collect();
    Json(notices)
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn rule_error_response(err: RuleError) -> axum::response::Response {
    error_response(StatusCode::BAD_REQUEST, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use greenhouse_common::{ControllerConfig, OverrideKind, RuleSet};

    use super::*;
    use crate::testing::{FakeActuator, RecordingSync};

    #[test]
    fn switch_values_accept_common_spellings() {
        assert_eq!(parse_switch(" ON "), Some(true));
        assert_eq!(parse_switch("0"), Some(false));
        assert_eq!(parse_switch("toggle"), None);
    }

    #[test]
    fn command_topics_parse_into_commands() {
        assert_eq!(
            parse_command("greenhouse/cmnd/device/window", b"off").unwrap(),
            Some(Command::Switch {
                device: Device::Window,
                desired: false,
            })
        );
        assert_eq!(
            parse_command(TOPIC_CMD_EMERGENCY_STOP, b"").unwrap(),
            Some(Command::EmergencyStop)
        );
        assert_eq!(parse_command("greenhouse/other", b"on").unwrap(), None);
        assert!(parse_command("greenhouse/cmnd/device/heater", b"on").is_err());
        assert!(parse_command("greenhouse/cmnd/device/fan", b"toggle").is_err());
    }

    #[tokio::test]
    async fn device_commands_run_in_arrival_order() {
        let actuator = Arc::new(FakeActuator::default());
        actuator.push_delay(Duration::from_millis(50));
        let store = Arc::new(RuleStore::new(
            RuleSet::default(),
            false,
            Arc::new(RecordingSync::default()),
        ));
        let evaluator =
            AutoControlEvaluator::new(&ControllerConfig::default(), store, actuator.clone());
        let (commands, worker) = spawn_command_worker(Arc::clone(&evaluator));

        for payload in ["on", "off"] {
            let command = parse_command("greenhouse/cmnd/device/light", payload.as_bytes())
                .unwrap()
                .unwrap();
            commands.send(command).await.unwrap();
        }
        drop(commands);
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            actuator.calls(),
            vec![(Device::Light, true), (Device::Light, false)]
        );
        assert!(!actuator.devices().light);
        assert!(!evaluator.status().await.devices.light);
    }

    #[test]
    fn notice_history_keeps_most_recent() {
        let mut history = VecDeque::new();
        for at_epoch in 0..25 {
            push_notice(
                &mut history,
                OverrideNotice {
                    kind: OverrideKind::ActiveRule,
                    device: Device::Fan,
                    message: OverrideKind::ActiveRule.message(Device::Fan),
                    at_epoch,
                },
            );
        }

        assert_eq!(history.len(), NOTICE_HISTORY);
        assert_eq!(history.front().map(|notice| notice.at_epoch), Some(5));
        assert_eq!(history.back().map(|notice| notice.at_epoch), Some(24));
    }
}
