//! Connection phase hooks for the hyper-util client.
//!
//! The legacy client gives no per-request callbacks, so the connector and
//! resolver report into the [`ConnectionPhases`] of the round trip that is
//! polling them, found through a task-local.
//!
//! For https destinations the TLS handshake is whatever the connection took
//! beyond the TCP connect measured by [`TrackedTcp`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use http::Uri;
use hyper_rustls::{ConfigBuilderExt, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::dns::{GaiResolver, Name};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::{ClientConfig, RootCertStore};
use tower::Service;

tokio::task_local! {
    static CONNECTION_PHASES: Arc<ConnectionPhases>;
}

/// Latencies observed while getting a connection for one round trip.
///
/// Phases that did not happen (a pooled connection, a literal IP address,
/// plain HTTP) stay at zero.
#[derive(Debug, Default)]
pub struct ConnectionPhases {
    get_conn_nanos: AtomicU64,
    tcp_connect_nanos: AtomicU64,
    dns_nanos: AtomicU64,
    tls_nanos: AtomicU64,
    first_byte_unix_nanos: AtomicU64,
}

impl ConnectionPhases {
    pub fn record_get_conn(&self, elapsed: Duration) {
        self.get_conn_nanos.store(nanos(elapsed), Ordering::Relaxed);
    }

    /// TCP connect of a new connection, without any handshake on top.
    pub fn record_tcp_connect(&self, elapsed: Duration) {
        self.tcp_connect_nanos.store(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_dns(&self, elapsed: Duration) {
        self.dns_nanos.store(nanos(elapsed), Ordering::Relaxed);
    }

    pub fn record_tls(&self, elapsed: Duration) {
        self.tls_nanos.store(nanos(elapsed), Ordering::Relaxed);
    }

    /// Response headers are available.
    pub fn mark_first_byte(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.first_byte_unix_nanos.store(nanos(now), Ordering::Relaxed);
    }

    pub fn get_conn(&self) -> Duration {
        Duration::from_nanos(self.get_conn_nanos.load(Ordering::Relaxed))
    }

    pub fn tcp_connect(&self) -> Duration {
        Duration::from_nanos(self.tcp_connect_nanos.load(Ordering::Relaxed))
    }

    pub fn dns(&self) -> Duration {
        Duration::from_nanos(self.dns_nanos.load(Ordering::Relaxed))
    }

    pub fn tls(&self) -> Duration {
        Duration::from_nanos(self.tls_nanos.load(Ordering::Relaxed))
    }

    pub fn first_byte(&self) -> Option<SystemTime> {
        match self.first_byte_unix_nanos.load(Ordering::Relaxed) {
            0 => None,
            n => Some(UNIX_EPOCH + Duration::from_nanos(n)),
        }
    }

    /// Run `fut` with `phases` receiving the connection hooks it triggers.
    pub async fn scope<F: Future>(phases: Arc<ConnectionPhases>, fut: F) -> F::Output {
        CONNECTION_PHASES.scope(phases, fut).await
    }

    fn current() -> Option<Arc<ConnectionPhases>> {
        CONNECTION_PHASES.try_with(Arc::clone).ok()
    }
}

fn nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// DNS resolver reporting lookup time.
#[derive(Debug, Clone)]
pub struct TrackedResolver<R = GaiResolver> {
    inner: R,
}

impl<R> TrackedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl Default for TrackedResolver<GaiResolver> {
    fn default() -> Self {
        Self::new(GaiResolver::new())
    }
}

impl<R> Service<Name> for TrackedResolver<R>
where
    R: Service<Name>,
    R::Future: Send + 'static,
    R::Response: Send + 'static,
    R::Error: Send + 'static,
{
    type Response = R::Response;
    type Error = R::Error;
    type Future = BoxFuture<'static, Result<R::Response, R::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let phases = ConnectionPhases::current();
        let started = Instant::now();
        let lookup = self.inner.call(name);
        Box::pin(async move {
            let res = lookup.await;
            if let Some(phases) = phases {
                phases.record_dns(started.elapsed());
            }
            res
        })
    }
}

/// Transport connector under the TLS layer, reporting the TCP connect.
#[derive(Debug, Clone)]
pub struct TrackedTcp<C> {
    inner: C,
}

impl<C> TrackedTcp<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

impl<C> Service<Uri> for TrackedTcp<C>
where
    C: Service<Uri>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
    C::Error: Send + 'static,
{
    type Response = C::Response;
    type Error = C::Error;
    type Future = BoxFuture<'static, Result<C::Response, C::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let phases = ConnectionPhases::current();
        let started = Instant::now();
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            let res = connecting.await;
            if let Some(phases) = phases {
                phases.record_tcp_connect(started.elapsed());
            }
            res
        })
    }
}

/// Plain connector with the tracked system resolver.
pub type TcpConnector = TrackedTcp<HttpConnector<TrackedResolver>>;

/// Connector reporting the time spent opening a new connection, and the
/// TLS handshake of https destinations.
#[derive(Debug, Clone)]
pub struct TrackedConnector<C> {
    inner: C,
}

impl<C> TrackedConnector<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }
}

impl TrackedConnector<HttpsConnector<TcpConnector>> {
    /// http and https connector verifying servers against `tls`.
    pub fn with_tls_config(tls: ClientConfig) -> Self {
        let mut http = HttpConnector::new_with_resolver(TrackedResolver::default());
        http.enforce_http(false);
        http.set_nodelay(true);
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(TrackedTcp::new(http));
        Self::new(https)
    }

    /// http and https connector trusting the platform's root certificates.
    pub fn native_roots() -> Self {
        Self::with_tls_config(native_tls_config())
    }
}

/// Client TLS options over the platform's root certificates.
///
/// Without any usable root certificate https servers fail verification,
/// plain http keeps working.
pub fn native_tls_config() -> ClientConfig {
    // Only fails when a provider is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();
    let builder = ClientConfig::builder();
    match builder.clone().with_native_roots() {
        Ok(builder) => builder.with_no_client_auth(),
        Err(e) => {
            tracing::warn!(error = %e, "No native root certificates, https backends will fail verification");
            builder
                .with_root_certificates(RootCertStore::empty())
                .with_no_client_auth()
        }
    }
}

impl<C> Service<Uri> for TrackedConnector<C>
where
    C: Service<Uri>,
    C::Future: Send + 'static,
    C::Response: Send + 'static,
    C::Error: Send + 'static,
{
    type Response = C::Response;
    type Error = C::Error;
    type Future = BoxFuture<'static, Result<C::Response, C::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let phases = ConnectionPhases::current();
        let secure = dst.scheme() == Some(&http::uri::Scheme::HTTPS);
        let started = Instant::now();
        let connecting = self.inner.call(dst);
        Box::pin(async move {
            let res = connecting.await;
            if let Some(phases) = phases {
                let elapsed = started.elapsed();
                phases.record_get_conn(elapsed);
                if secure && res.is_ok() {
                    phases.record_tls(elapsed.saturating_sub(phases.tcp_connect()));
                }
            }
            res
        })
    }
}
