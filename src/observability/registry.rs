//! Current telemetry state, swappable at runtime.
//!
//! # Responsibilities
//! - Hold the resolver and instrumentation handle of the active config
//! - Hand out consistent snapshots to request handlers without locking
//! - Rebuild exporters on reload only when their settings changed
//!
//! # Design Decisions
//! - Requests keep the snapshot they started with; a reload never changes
//!   the instruments of an in-flight request
//! - The previous handle is shut down before a new one binds listeners

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::config::resolver::ConfigResolver;
use crate::config::schema::ConfigData;
use crate::http::server::ServerTracker;
use crate::observability::exporter::{ExporterError, ExporterSet};
use crate::observability::handle::InstrumentationHandle;

/// One configuration generation: options plus the instruments built for it.
pub struct Telemetry {
    resolver: ConfigResolver,
    handle: Arc<InstrumentationHandle>,
    server: OnceLock<Arc<ServerTracker>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("service", &self.resolver.config().service_name)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Telemetry {
    pub fn new(config: ConfigData, handle: Arc<InstrumentationHandle>) -> Self {
        Self {
            resolver: ConfigResolver::new(config),
            handle,
            server: OnceLock::new(),
        }
    }

    /// Create the exporters named in `config` and a handle over them.
    pub fn from_config(config: ConfigData) -> Result<Self, ExporterError> {
        let exporters = ExporterSet::from_config(&config.exporters)?;
        let handle = InstrumentationHandle::from_config(&config, exporters)?;
        Ok(Self::new(config, Arc::new(handle)))
    }

    /// Default options, nothing exported.
    pub fn disabled() -> Self {
        Self::new(
            ConfigData::default(),
            Arc::new(InstrumentationHandle::disabled()),
        )
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn config(&self) -> &ConfigData {
        self.resolver.config()
    }

    pub fn handle(&self) -> &Arc<InstrumentationHandle> {
        &self.handle
    }

    /// Inbound request tracker, bound on first use.
    pub fn server_tracker(&self) -> Arc<ServerTracker> {
        self.server
            .get_or_init(|| Arc::new(ServerTracker::new(&self.resolver, &self.handle)))
            .clone()
    }
}

/// Whether two configs would produce the same exporters.
fn same_exporters(a: &ConfigData, b: &ConfigData) -> bool {
    a.exporters == b.exporters
        && a.service_name == b.service_name
        && a.service_version == b.service_version
        && a.metric_reporting_period == b.metric_reporting_period
        && a.trace_sample_rate == b.trace_sample_rate
}

/// Holder of the current [`Telemetry`].
pub struct Registry {
    current: ArcSwap<Telemetry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("current", &self.current.load())
            .finish()
    }
}

impl Registry {
    pub fn new(telemetry: Telemetry) -> Self {
        Self {
            current: ArcSwap::from_pointee(telemetry),
        }
    }

    /// The active generation. Lock free.
    pub fn snapshot(&self) -> Arc<Telemetry> {
        self.current.load_full()
    }

    /// Install `telemetry`, returning the generation it replaced.
    pub fn replace(&self, telemetry: Telemetry) -> Arc<Telemetry> {
        self.current.swap(Arc::new(telemetry))
    }

    /// Apply a new configuration.
    ///
    /// The instrumentation handle is kept when exporter settings are
    /// unchanged. Otherwise the old one is shut down within `deadline` and
    /// a new one is built; if that fails the new options still apply with
    /// nothing exported, and the error is returned.
    pub async fn reload(&self, mut config: ConfigData, deadline: Duration) -> Result<(), ExporterError> {
        config.apply_defaults();
        let current = self.snapshot();

        if same_exporters(current.config(), &config) {
            tracing::info!("Telemetry options reloaded, exporters kept");
            self.replace(Telemetry::new(config, current.handle.clone()));
            return Ok(());
        }

        if let Err(e) = current.handle.shutdown(deadline).await {
            tracing::warn!(error = %e, "Previous exporters did not shut down cleanly");
        }

        match Telemetry::from_config(config.clone()) {
            Ok(telemetry) => {
                tracing::info!("Telemetry reloaded with new exporters");
                self.replace(telemetry);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Exporters failed to start, reporting disabled");
                self.replace(Telemetry::new(
                    config,
                    Arc::new(InstrumentationHandle::disabled()),
                ));
                Err(e)
            }
        }
    }

    /// Shut down the active handle.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ExporterError> {
        self.snapshot().handle.shutdown(deadline).await
    }
}
