//! # Serveur de métriques
//!
//! Expose les compteurs de [`BandwidthMetrics`] en HTTP :
//!
//! - `/` : redirection permanente vers `/metrics/prometheus`
//! - `/metrics/prometheus` : format texte Prometheus
//! - `/metrics` : instantané JSON

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use icystream::BandwidthMetrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const PROMETHEUS_PATH: &str = "/metrics/prometheus";
pub const JSON_PATH: &str = "/metrics";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Routes de métriques
pub fn router(metrics: Arc<BandwidthMetrics>) -> Router {
    Router::new()
        .route("/", get(redirect_root))
        .route(PROMETHEUS_PATH, get(prometheus))
        .route(JSON_PATH, get(json))
        .with_state(metrics)
}

/// 301 vers la page Prometheus
async fn redirect_root() -> impl IntoResponse {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, PROMETHEUS_PATH)],
    )
}

async fn prometheus(State(metrics): State<Arc<BandwidthMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        metrics.render_prometheus(),
    )
}

async fn json(State(metrics): State<Arc<BandwidthMetrics>>) -> impl IntoResponse {
    Json(metrics.snapshot())
}

/// Serveur lié à son adresse, prêt à servir
pub struct MetricsServer {
    listener: TcpListener,
    router: Router,
}

impl MetricsServer {
    /// Lie l'adresse d'écoute ; l'échec est une erreur de démarrage
    pub async fn bind(address: &str, metrics: Arc<BandwidthMetrics>) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("cannot bind metrics endpoint on {}", address))?;
        Ok(Self {
            listener,
            router: router(metrics),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sert jusqu'à l'annulation du token
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Metrics available at http://{}{}", addr, PROMETHEUS_PATH);
        axum::serve(self.listener, self.router.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("metrics server failed")?;
        info!("Metrics server stopped");
        Ok(())
    }
}
