//! relaybot-gateway: HTTP control plane, channel ingress and the cron wiring.
//!
//! Provides:
//! - `POST /rpc` JSON-RPC 2.0 control API (health, cron.*, lanes.stats, channels.list)
//! - `GET /health`
//! - Bearer token authentication
//! - Channel plugin framework with main-lane ingress
//! - Heartbeat turns triggered by cron wakes

pub mod channel;
pub mod handlers;
pub mod heartbeat;
pub mod ingress;
pub mod jsonrpc;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tokio::sync::watch;
use tracing::{info, warn};

use relaybot_config::RelayBotConfig;
use relaybot_cron::{
    AgentInvoker, CommandAgent, CommandLanes, CronDeps, CronService, CronSettings, CronStore, SystemEventQueue,
};
use relaybot_storage::{SessionResolver, SessionStore};
use relaybot_types::Surface;

use channel::{ChannelManager, ChannelPlugin};
use heartbeat::Heartbeat;
use ingress::Ingress;
use jsonrpc::parse_request;

/// Shared gateway state.
pub struct GatewayState {
    pub cron: Arc<CronService>,
    pub channels: Arc<ChannelManager>,
    pub auth_token: Option<String>,
}

/// Scheduler settings derived from the config file.
pub fn cron_settings(config: &RelayBotConfig) -> CronSettings {
    CronSettings {
        enabled: config.cron.enabled,
        max_concurrent_runs: config.cron.max_concurrent_runs.max(1),
        tick: Duration::from_secs(config.cron.tick_seconds.max(1)),
        lane: config.cron.lane.clone(),
        main_key: config.session.main_key.clone(),
        allow_from: config.allow_from(Surface::PRIMARY.as_str()),
        agent_timeout: Duration::from_secs(config.agent.timeout_seconds),
    }
}

/// Start the gateway and serve until Ctrl-C.
///
/// `plugins` are registered and started before the server binds.
pub async fn start_gateway(
    config: RelayBotConfig,
    port_override: Option<u16>,
    plugins: Vec<Arc<dyn ChannelPlugin>>,
) -> anyhow::Result<()> {
    let port = port_override.unwrap_or(config.gateway.port);
    let host = config.gateway.host.clone();

    let config_dir = relaybot_config::ensure_config_dir()?;
    info!("Config dir: {}", config_dir.display());

    let session_path = config.session_store_path()?;
    let sessions = Arc::new(SessionResolver::new(
        SessionStore::new(&session_path),
        config.session.idle_minutes,
    ));
    info!("Session store: {}", session_path.display());

    let cron_path = config.cron_store_path()?;
    let store = Arc::new(
        CronStore::open(&cron_path).with_context(|| format!("opening cron store {}", cron_path.display()))?,
    );
    info!("Cron store: {}", cron_path.display());

    let lanes = CommandLanes::new();
    let agent: Arc<dyn AgentInvoker> = Arc::new(CommandAgent::new(
        config.agent.command.clone(),
        config.agent.cwd.clone(),
        Duration::from_secs(config.agent.timeout_seconds),
    ));
    if config.agent.command.is_empty() {
        warn!("agent.command is empty; agent turns will fail until it is configured");
    }
    let events = Arc::new(SystemEventQueue::new());

    let channels = Arc::new(ChannelManager::new(256));
    for plugin in plugins {
        channels.register(plugin).await;
    }
    channels.start_all().await;

    let settings = cron_settings(&config);
    let cron = Arc::new(CronService::new(
        CronDeps {
            store,
            lanes: lanes.clone(),
            agent: agent.clone(),
            sessions: sessions.clone(),
            sender: channels.clone(),
            sink: events.clone(),
        },
        settings.clone(),
    ));
    cron.load().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(cron.clone().run(shutdown_rx.clone()));

    let heartbeat = Arc::new(Heartbeat::new(
        lanes.clone(),
        agent.clone(),
        sessions.clone(),
        events.clone(),
        channels.clone(),
        settings.main_key.clone(),
        config.agent.heartbeat_prompt.clone(),
        settings.allow_from.clone(),
    ));
    tokio::spawn(heartbeat.run(shutdown_rx.clone()));

    let ingress = Arc::new(Ingress::new(
        lanes,
        agent,
        sessions,
        events,
        channels.clone(),
        config.session.clone(),
    ));
    let channels_loop = channels.clone();
    tokio::spawn(async move {
        channels_loop.run_message_loop(ingress).await;
    });

    let state = Arc::new(GatewayState {
        cron,
        channels: channels.clone(),
        auth_token: config.gateway.auth_token.clone(),
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .with_state(state);

    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    info!("Gateway listening on {addr}");
    info!("  RPC:    http://{addr}/rpc");
    info!("  Health: http://{addr}/health");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for ctrl-c: {e}");
            }
            info!("Shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    channels.stop_all().await;
    Ok(())
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /rpc
async fn rpc_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: String,
) -> Result<impl IntoResponse, StatusCode> {
    if let Some(expected) = &state.auth_token {
        match extract_bearer_token(&headers) {
            Some(token) if token == expected => {}
            _ => {
                warn!("RPC authentication failed");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }

    let response = match parse_request(&body) {
        Ok(request) => handlers::handle_rpc(&request.method, &request.params, request.id, &state).await,
        Err(response) => response,
    };
    Ok(axum::Json(response))
}

/// Extract bearer token from the Authorization header.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer my-secret-token".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("my-secret-token"));
    }

    #[test]
    fn test_extract_bearer_token_missing_or_wrong_scheme() {
        assert_eq!(extract_bearer_token(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn test_cron_settings_from_config() {
        let config: RelayBotConfig = json5::from_str(
            r#"{
                cron: { max_concurrent_runs: 0, tick_seconds: 5, lane: "jobs" },
                session: { main_key: "home" },
                agent: { timeout_seconds: 90 },
                channels: {
                    wa: { channel_type: "whatsapp", allow_from: ["+15550001111"] },
                    tg: { channel_type: "telegram", allow_from: ["7"] },
                },
            }"#,
        )
        .unwrap();
        let settings = cron_settings(&config);
        assert!(settings.enabled);
        assert_eq!(settings.max_concurrent_runs, 1);
        assert_eq!(settings.tick, Duration::from_secs(5));
        assert_eq!(settings.lane, "jobs");
        assert_eq!(settings.main_key, "home");
        assert_eq!(settings.allow_from, vec!["+15550001111".to_string()]);
        assert_eq!(settings.agent_timeout, Duration::from_secs(90));
    }
}
