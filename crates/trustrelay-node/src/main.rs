//! trustrelay node binary.
//!
//! Wires the admission engine, rank cache, limiter, and sled store behind a
//! single listener: WebSocket sessions for the event protocol, a JSON
//! service descriptor for peers, and an HTML landing page for browsers.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
#[cfg(feature = "metrics")]
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trustrelay_bus::{OracleClient, RelayBus};
use trustrelay_core::IdentityKey;
use trustrelay_engine::AdmissionEngine;
use trustrelay_limiter::Limiter;
use trustrelay_rank::{RankCache, RankCacheConfig};
use trustrelay_storage_sled::{SledConfig, SledEventStore};

mod config;
mod session;

use config::NodeConfig;

/// Media type that selects the JSON service descriptor on `/`.
pub const DESCRIPTOR_ACCEPT: &str = "application/trustrelay+json";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AdmissionEngine<SledEventStore>>,
    pub store: Arc<SledEventStore>,
    pub descriptor: Arc<Descriptor>,
    pub landing: Arc<String>,
    #[cfg(feature = "metrics")]
    pub metrics_handle: PrometheusHandle,
}

/// Self-description document served to peers.
#[derive(Clone, Debug, Serialize)]
pub struct Descriptor {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pubkey: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub contact: String,
    pub software: String,
    pub version: String,
    pub admission: AdmissionSummary,
}

#[derive(Clone, Debug, Serialize)]
pub struct AdmissionSummary {
    pub mid_threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_threshold: Option<f64>,
    pub url_policy_enabled: bool,
}

fn build_descriptor(cfg: &NodeConfig) -> Descriptor {
    Descriptor {
        name: cfg.info.name.clone(),
        description: cfg.info.description.clone(),
        pubkey: cfg.info.pubkey.clone(),
        contact: cfg.info.contact.clone(),
        software: cfg.info.software.clone(),
        version: cfg.info.version.clone(),
        admission: AdmissionSummary {
            mid_threshold: cfg.admission.mid_threshold,
            high_threshold: cfg.admission.high_threshold,
            url_policy_enabled: cfg.admission.url_policy_enabled,
        },
    }
}

/// Renders the landing page once at startup.
fn render_landing(cfg: &NodeConfig) -> String {
    let contact = if cfg.info.contact.is_empty() {
        String::new()
    } else {
        format!("<p class=\"meta\">Contact: {}</p>", cfg.info.contact)
    };
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{name}</title>
<style>
body {{ font-family: sans-serif; max-width: 700px; margin: 50px auto; padding: 0 20px; color: #333; }}
h1 {{ color: #2c3e50; }}
.meta {{ color: #888; font-size: 14px; }}
code {{ background: #f5f5f5; padding: 2px 6px; border-radius: 4px; }}
</style>
</head>
<body>
<h1>{name}</h1>
<p>{description}</p>
<p class="meta">{software} v{version}</p>
{contact}
<p>Connect a client over WebSocket to this address, or request the service
descriptor with <code>Accept: {accept}</code>.</p>
</body>
</html>
"#,
        name = cfg.info.name,
        description = cfg.info.description,
        software = cfg.info.software,
        version = cfg.info.version,
        contact = contact,
        accept = DESCRIPTOR_ACCEPT,
    )
}

async fn root_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if let Some(ws) = ws {
        let group = session::ip_group(&addr);
        return ws.on_upgrade(move |socket| session::run_session(socket, state, group));
    }

    let wants_descriptor = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains(DESCRIPTOR_ACCEPT))
        .unwrap_or(false);
    if wants_descriptor {
        return Json(state.descriptor.as_ref().clone()).into_response();
    }

    Html(state.landing.as_ref().clone()).into_response()
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        body,
    )
}

fn init_tracing() {
    static INIT: OnceLock<()> = OnceLock::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

#[cfg(feature = "metrics")]
fn init_metrics_recorder() -> PrometheusHandle {
    static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
    HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("install prometheus recorder")
        })
        .clone()
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let cfg_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|idx| args.get(idx + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");
    let cfg = config::load_config(cfg_path)?;

    let mut sled_cfg = SledConfig::new(cfg.data_dir.clone());
    sled_cfg.flush_on_write = cfg.storage.flush_on_write;
    let store = Arc::new(SledEventStore::open(sled_cfg)?);

    if !cfg.oracle.is_configured() {
        warn!("oracle relay not configured; every identity will score 0");
    }
    let bus = Arc::new(RelayBus::new(cfg.oracle.relay_url.clone()));
    let oracle = OracleClient::new(
        bus.clone(),
        IdentityKey::new(cfg.oracle.pubkey.clone()),
        cfg.oracle.signing_keys()?,
    );
    let rank = Arc::new(RankCache::new(Arc::new(oracle), RankCacheConfig::default()));
    let limiter = Arc::new(Limiter::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresher = rank.spawn_refresher(shutdown_rx.clone());
    let cleaner = limiter.spawn_cleaner(shutdown_rx);

    let engine = Arc::new(AdmissionEngine::new(
        cfg.admission.to_config(),
        rank,
        limiter,
        store.clone(),
    ));

    #[cfg(feature = "metrics")]
    let metrics_handle = init_metrics_recorder();

    let state = AppState {
        engine,
        store,
        descriptor: Arc::new(build_descriptor(&cfg)),
        landing: Arc::new(render_landing(&cfg)),
        #[cfg(feature = "metrics")]
        metrics_handle,
    };

    let app = Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(healthz_handler));
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));
    let app = app.with_state(state);

    let addr: SocketAddr = cfg
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", cfg.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, name = %cfg.info.name, "trustrelay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown())
    .await?;

    // Stop the background workers, then drop the oracle connection.
    let _ = shutdown_tx.send(true);
    let _ = refresher.await;
    let _ = cleaner.await;
    bus.disconnect().await;
    info!("shutdown complete");
    Ok(())
}
