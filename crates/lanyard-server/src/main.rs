use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use lanyard_core::store::{MemoryMessageStore, MemoryUserStore, MessageStore};
use lanyard_gateway::hub::Hub;
use lanyard_gateway::signaling::SignalingBridge;
use lanyard_gateway::{socket, GatewayContext};
use lanyard_models::gateway::Member;
use lanyard_models::message::ChatMessage;
use lanyard_models::user::User;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod relay;

const SIGNALING_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lanyard=info,tower_http=debug")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    if let Some(user_id) = args.issue_token {
        let token = lanyard_core::auth::create_token(
            user_id,
            &config.auth.jwt_secret,
            config.auth.jwt_expiry_seconds,
        )?;
        println!("{token}");
        return Ok(());
    }

    let users = MemoryUserStore::new();
    for entry in &config.roster.users {
        users.insert(User {
            id: entry.id,
            username: entry.username.clone(),
            display_name: entry.display_name.clone(),
            avatar: None,
        });
    }
    if config.roster.users.is_empty() {
        tracing::warn!("roster is empty; no user can identify until one is configured");
    }
    let messages = MemoryMessageStore::new(config.server.message_history);

    let (signal_tx, signal_rx) = mpsc::channel(SIGNALING_QUEUE);
    let bridge: Arc<dyn SignalingBridge> = match &config.relay.control_addr {
        Some(addr) => match relay::RelayBridge::connect(addr, signal_tx).await {
            Ok(bridge) => bridge,
            Err(err) => {
                tracing::warn!(error = %err, "media relay unreachable, voice disabled");
                Arc::new(relay::NullBridge)
            }
        },
        None => {
            tracing::info!("no media relay configured, voice disabled");
            Arc::new(relay::NullBridge)
        }
    };

    let gateway_config = Arc::new(config.gateway_config());
    let hub = Hub::spawn(gateway_config.clone(), bridge, signal_rx);
    let ctx = GatewayContext {
        hub: hub.clone(),
        users: Arc::new(users),
        messages: Arc::new(messages),
        config: gateway_config,
    };

    let app = Router::new()
        .route("/gateway", get(socket::gateway_upgrade))
        .route("/messages", get(message_history))
        .route("/members", get(member_list))
        .route("/healthz", get(healthz))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        server_name = %config.server.server_name,
        bind_address = %config.server.bind_address,
        roster = config.roster.users.len(),
        "lanyard listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(hub))
        .await?;

    Ok(())
}

#[derive(Deserialize)]
struct HistoryParams {
    before: Option<i64>,
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn message_history(
    State(ctx): State<GatewayContext>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<ChatMessage>>, StatusCode> {
    ctx.messages
        .history(params.before, params.limit.min(100))
        .await
        .map(Json)
        .map_err(|err| {
            tracing::error!(error = %err, "history query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn member_list(State(ctx): State<GatewayContext>) -> Json<Vec<Member>> {
    Json(ctx.hub.member_snapshot().await)
}

async fn healthz(State(ctx): State<GatewayContext>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "online": ctx.hub.online_count().await,
    }))
}

async fn shutdown_signal(hub: Hub) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    tracing::info!("shutting down (ctrl-c)...");
    hub.shutdown().await;
}
