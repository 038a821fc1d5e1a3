//! Prometheus scrape endpoint exporter.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use opentelemetry_sdk::Resource;

use super::{ExporterError, MetricExporter, MetricReader};
use crate::config::buckets::{SIZE_BUCKETS, SIZE_SUFFIXES, TIME_BUCKETS, TIME_SUFFIXES};
use crate::config::schema::PrometheusExporterConfig;
use crate::lifecycle::Shutdown;

/// How often the recorder drains its histogram buffers.
const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Serves collected metrics over HTTP for scraping.
#[derive(Debug, Clone)]
pub struct PrometheusExporter {
    config: PrometheusExporterConfig,
}

impl PrometheusExporter {
    pub fn new(config: PrometheusExporterConfig) -> Self {
        Self { config }
    }

    fn listen_addr(&self) -> Result<SocketAddr, ExporterError> {
        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| ExporterError::InvalidEndpoint {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ExporterError::InvalidEndpoint {
                endpoint,
                reason: "no address resolved".to_string(),
            })
    }

    fn builder(&self, addr: SocketAddr) -> Result<PrometheusBuilder, ExporterError> {
        let mut builder = PrometheusBuilder::new().with_http_listener(addr);
        for suffix in TIME_SUFFIXES {
            builder = builder
                .set_buckets_for_metric(Matcher::Suffix(suffix.to_string()), &TIME_BUCKETS)
                .map_err(|e| ExporterError::Setup(e.to_string()))?;
        }
        for suffix in SIZE_SUFFIXES {
            builder = builder
                .set_buckets_for_metric(Matcher::Suffix(suffix.to_string()), &SIZE_BUCKETS)
                .map_err(|e| ExporterError::Setup(e.to_string()))?;
        }
        Ok(builder)
    }
}

impl MetricExporter for PrometheusExporter {
    /// Starts the scrape listener. Must run inside a Tokio runtime.
    fn metric_reader(
        &self,
        _period: Duration,
        _resource: &Resource,
    ) -> Result<MetricReader, ExporterError> {
        let addr = self.listen_addr()?;
        let (recorder, serve) = self
            .builder(addr)?
            .build()
            .map_err(|e| ExporterError::Setup(e.to_string()))?;
        let handle = recorder.handle();

        let shutdown = Shutdown::new();
        let mut serve_rx = shutdown.subscribe();
        let name = self.config.name.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = serve => {
                    if let Err(e) = result {
                        tracing::error!(exporter = %name, error = ?e, "Prometheus listener failed");
                    }
                }
                _ = serve_rx.recv() => {
                    tracing::debug!(exporter = %name, "Prometheus listener stopped");
                }
            }
        });

        let mut upkeep_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(UPKEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => handle.run_upkeep(),
                    _ = upkeep_rx.recv() => break,
                }
            }
        });

        tracing::info!(exporter = %self.config.name, address = %addr, "Prometheus exporter listening");

        Ok(MetricReader::new(Arc::new(recorder)).with_closer(move || {
            shutdown.trigger();
            Ok(())
        }))
    }

    fn metric_default_reporting(&self) -> bool {
        !self.config.disable_metrics
    }
}
