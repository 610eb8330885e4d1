use anyhow::Result;
use axum::{Router, routing::get};
use kf_core::{DataplaneStatus, ErrorId, ErrorRecorder};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::{error, info};

/// Metrics collector for the dataplane
pub struct MetricsCollector {
    registry: Registry,

    // Error events
    errors: IntCounterVec,

    // Chain state
    stale_chains: IntGaugeVec,
    policy_chains: IntGaugeVec,
    jump_line: IntGaugeVec,
    ordering_ok: IntGaugeVec,

    // Reconcile passes
    reconcile_runs: IntCounterVec,
}

impl MetricsCollector {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let errors = IntCounterVec::new(
            Opts::new("kfence_errors_total", "Dataplane errors by failure class"),
            &["error_id"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let stale_chains = IntGaugeVec::new(
            Opts::new("kfence_stale_chains", "Chains waiting to be destroyed"),
            &["backend"],
        )?;
        registry.register(Box::new(stale_chains.clone()))?;

        let policy_chains = IntGaugeVec::new(
            Opts::new("kfence_policy_chains", "Per-policy chains present in the table"),
            &["backend"],
        )?;
        registry.register(Box::new(policy_chains.clone()))?;

        let jump_line = IntGaugeVec::new(
            Opts::new(
                "kfence_jump_rule_line",
                "Line of the jump rule in the shared chain (0=missing)",
            ),
            &["backend", "shared_chain"],
        )?;
        registry.register(Box::new(jump_line.clone()))?;

        let ordering_ok = IntGaugeVec::new(
            Opts::new(
                "kfence_jump_rule_ordered",
                "Jump rule sits after the services jump (1=yes, 0=no)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(ordering_ok.clone()))?;

        let reconcile_runs = IntCounterVec::new(
            Opts::new("kfence_reconcile_total", "Reconcile passes by result"),
            &["result"],
        )?;
        registry.register(Box::new(reconcile_runs.clone()))?;

        // zero every error class up front so dashboards see the series
        for id in ErrorId::ALL {
            errors.with_label_values(&[id.as_str()]);
        }

        Ok(Self {
            registry,
            errors,
            stale_chains,
            policy_chains,
            jump_line,
            ordering_ok,
            reconcile_runs,
        })
    }

    /// Update chain gauges from a status snapshot
    pub fn update_from_status(&self, status: &DataplaneStatus) {
        let backend = status.backend.as_str();
        self.stale_chains
            .with_label_values(&[backend])
            .set(status.stale_chains.len() as i64);
        self.policy_chains
            .with_label_values(&[backend])
            .set(status.policy_chains.len() as i64);
        self.jump_line
            .with_label_values(&[backend, status.shared_chain.as_str()])
            .set(status.jump_line as i64);
        self.ordering_ok
            .with_label_values(&[backend])
            .set(i64::from(status.ordering_ok()));
    }

    pub fn record_reconcile(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.reconcile_runs.with_label_values(&[result]).inc();
    }

    pub fn error_count(&self, id: ErrorId) -> u64 {
        self.errors.with_label_values(&[id.as_str()]).get()
    }

    /// Render metrics in Prometheus text format
    pub fn render_metrics(&self) -> Result<String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl ErrorRecorder for MetricsCollector {
    fn record_error(&self, id: ErrorId, message: &str) {
        self.errors.with_label_values(&[id.as_str()]).inc();
        error!(error_id = %id, "{}", message);
    }
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer {
    collector: Arc<MetricsCollector>,
    addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn new(collector: Arc<MetricsCollector>, port: u16) -> Self {
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
        Self { collector, addr }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    fn router(&self) -> Router {
        let collector = self.collector.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let collector = collector.clone();
                async move {
                    match collector.render_metrics() {
                        Ok(metrics) => metrics,
                        Err(e) => format!("# Error rendering metrics: {}", e),
                    }
                }
            }),
        )
    }

    /// Start the metrics HTTP server
    pub async fn serve(self) -> Result<()> {
        let app = self.router();

        info!(addr = %self.addr, "metrics server listening on /metrics");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> DataplaneStatus {
        DataplaneStatus {
            backend: "iptables".into(),
            shared_chain: "FORWARD".into(),
            jump_line: 3,
            services_chain: "KUBE-SERVICES".into(),
            services_line: 2,
            policy_chains: vec!["KFENCE-INGRESS-1".into(), "KFENCE-EGRESS-1".into()],
            stale_chains: vec!["KFENCE-EGRESS-0".into()],
        }
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        assert!(collector.is_ok());
    }

    #[test]
    fn test_error_recording() {
        let collector = MetricsCollector::new().unwrap();

        collector.record_error(ErrorId::ChainCleanup, "failed to clean up 1 chain(s)");
        collector.record_error(ErrorId::ChainCleanup, "failed to clean up 2 chain(s)");

        assert_eq!(collector.error_count(ErrorId::ChainCleanup), 2);
        assert_eq!(collector.error_count(ErrorId::ChainInit), 0);
    }

    #[test]
    fn test_metrics_rendering() {
        let collector = MetricsCollector::new().unwrap();
        collector.update_from_status(&status());
        collector.record_reconcile(true);
        collector.record_error(ErrorId::JumpReposition, "lock held");

        let output = collector.render_metrics().unwrap();

        assert!(output.contains("kfence_stale_chains{backend=\"iptables\"} 1"));
        assert!(output.contains("kfence_policy_chains{backend=\"iptables\"} 2"));
        assert!(output.contains("kfence_jump_rule_ordered{backend=\"iptables\"} 1"));
        assert!(output.contains("kfence_errors_total{error_id=\"jump_reposition\"} 1"));
        assert!(output.contains("kfence_errors_total{error_id=\"hns\"} 0"));
        assert!(output.contains("kfence_reconcile_total{result=\"success\"} 1"));
    }

    #[test]
    fn collectors_keep_separate_registries() {
        let first = MetricsCollector::new().unwrap();
        let second = MetricsCollector::new().unwrap();

        first.record_error(ErrorId::ChainFlush, "restore failed");

        assert_eq!(first.error_count(ErrorId::ChainFlush), 1);
        assert_eq!(second.error_count(ErrorId::ChainFlush), 0);
        assert!(second
            .render_metrics()
            .unwrap()
            .contains("kfence_errors_total{error_id=\"chain_flush\"} 0"));
    }

    #[test]
    fn test_server_binds_localhost() {
        let collector = Arc::new(MetricsCollector::new().unwrap());
        let server = MetricsServer::new(collector, 9464);
        assert_eq!(server.addr().to_string(), "127.0.0.1:9464");
    }
}
