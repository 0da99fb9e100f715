//! ---
//! tdcs_section: "03-persistence-logging"
//! tdcs_subsection: "module"
//! tdcs_type: "source"
//! tdcs_scope: "code"
//! tdcs_description: "Metrics collection and export utilities."
//! tdcs_version: "v0.1.0"
//! tdcs_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    GaugeVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(encoder.format_type()),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the communication engine.
#[derive(Clone)]
pub struct CommMetrics {
    registry: SharedRegistry,
    operations_completed: IntCounterVec,
    operations_failed: IntCounterVec,
    operations_dropped: IntCounterVec,
    retries: IntCounterVec,
    reconnects: IntCounterVec,
    link_load: GaugeVec,
}

impl CommMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let operations_completed = IntCounterVec::new(
            Opts::new(
                "t_dcs_operations_completed_total",
                "Device operations that ran to successful completion",
            ),
            &["link", "operation"],
        )?;
        registry.register(Box::new(operations_completed.clone()))?;

        let operations_failed = IntCounterVec::new(
            Opts::new(
                "t_dcs_operations_failed_total",
                "Device operations that terminated with a failure status",
            ),
            &["link", "operation"],
        )?;
        registry.register(Box::new(operations_failed.clone()))?;

        let operations_dropped = IntCounterVec::new(
            Opts::new(
                "t_dcs_operations_dropped_total",
                "Operations rejected by the poll queue as duplicates",
            ),
            &["link"],
        )?;
        registry.register(Box::new(operations_dropped.clone()))?;

        let retries = IntCounterVec::new(
            Opts::new(
                "t_dcs_operation_retries_total",
                "Recoverable protocol errors that triggered a phase retry",
            ),
            &["link"],
        )?;
        registry.register(Box::new(retries.clone()))?;

        let reconnects = IntCounterVec::new(
            Opts::new(
                "t_dcs_link_reconnects_total",
                "Channel reopen events after transport failures",
            ),
            &["link"],
        )?;
        registry.register(Box::new(reconnects.clone()))?;

        let link_load = GaugeVec::new(
            Opts::new(
                "t_dcs_link_load_ratio",
                "Busy-time ratio of the link worker over the last 30 second interval",
            ),
            &["link"],
        )?;
        registry.register(Box::new(link_load.clone()))?;

        Ok(Self {
            registry,
            operations_completed,
            operations_failed,
            operations_dropped,
            retries,
            reconnects,
            link_load,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_completion(&self, link: &str, operation: &str, success: bool) {
        let family = if success {
            &self.operations_completed
        } else {
            &self.operations_failed
        };
        family.with_label_values(&[link, operation]).inc();
    }

    pub fn record_dropped(&self, link: &str) {
        self.operations_dropped.with_label_values(&[link]).inc();
    }

    pub fn record_retry(&self, link: &str) {
        self.retries.with_label_values(&[link]).inc();
    }

    pub fn record_reconnect(&self, link: &str) {
        self.reconnects.with_label_values(&[link]).inc();
    }

    pub fn set_link_load(&self, link: &str, load: f64) {
        self.link_load.with_label_values(&[link]).set(load);
    }
}

/// Metrics recorded by the daemon process itself.
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: SharedRegistry,
    starts_total: IntCounter,
    build_info: GaugeVec,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "t_dcsd_starts_total",
            "Total number of times the T-DCS daemon has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "t_dcsd_build_info",
                "Build metadata for the running daemon binary",
            ),
            &["version", "profile"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            starts_total,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    pub fn set_build_info(&self, version: &str, profile: &str) {
        self.build_info.with_label_values(&[version, profile]).set(1.0);
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comm_metrics_register_once() {
        let registry = new_registry();
        let metrics = CommMetrics::new(registry.clone()).expect("register families");
        metrics.record_completion("west-170", "meter settings", true);
        metrics.record_completion("west-170", "meter settings", false);
        metrics.set_link_load("west-170", 0.25);
        assert!(CommMetrics::new(registry).is_err());
    }
}
