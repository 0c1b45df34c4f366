use std::time::Duration;

use reqwest::Client;

/// Shared `reqwest` client builder for provider adapters.
///
/// A modest idle timeout so DNS changes are picked up promptly and TCP
/// keepalive so long-lived SSE connections survive idle upstream proxies.
/// Deliberately no whole-request `.timeout()`: that wraps the entire body
/// read, and a run is allowed to stream for several minutes. The
/// coordinator's own deadline and cancellation token are the only bound on
/// how long an adapter's stream may stay open.
pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
}

pub(crate) fn http_client() -> Client {
    default_http_client_builder()
        .build()
        .expect("default adapter HTTP client configuration is always valid")
}
