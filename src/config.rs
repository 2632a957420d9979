use std::time::Duration;

/// TLS configuration for inbound (server-role) sessions. Pass a pre-built
/// rustls ServerConfig; cert/key loading and ALPN are the caller's business.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsConfig {
    pub server_config: std::sync::Arc<rustls::ServerConfig>,
}

/// TLS configuration for outbound (client-role) sessions.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsClientConfig {
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
}

#[cfg(feature = "tls")]
impl TlsClientConfig {
    /// Client config trusting the standard web PKI roots.
    pub fn with_webpki_roots() -> Self {
        let roots =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsClientConfig {
            client_config: std::sync::Arc::new(config),
        }
    }
}

/// Configuration for the reactor pool.
#[derive(Clone)]
pub struct Config {
    /// Number of loop threads. 0 = number of CPUs.
    pub threads: usize,
    /// Slot space per loop. Caps concurrent sessions on one loop.
    pub max_sessions_per_loop: u32,
    /// Initial receive buffer capacity per session.
    pub initial_recv_buffer: usize,
    /// Default receive buffer ceiling; per-session options may override.
    pub max_recv_buffer: usize,
    /// Upper bound on one poll wait. Bounds stop latency and timer slack.
    pub poll_ceiling: Duration,
    /// Set TCP_NODELAY on every session.
    pub tcp_nodelay: bool,
    /// Server-role TLS for inbound secure sessions.
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConfig>,
    /// Client-role TLS for outbound secure sessions.
    #[cfg(feature = "tls")]
    pub tls_client: Option<TlsClientConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threads: 0,
            max_sessions_per_loop: 16384,
            initial_recv_buffer: 4096,
            max_recv_buffer: 1024 * 1024,
            poll_ceiling: Duration::from_millis(100),
            tcp_nodelay: true,
            #[cfg(feature = "tls")]
            tls: None,
            #[cfg(feature = "tls")]
            tls_client: None,
        }
    }
}

/// Configuration for the async connector.
#[derive(Clone)]
pub struct ConnectorConfig {
    /// Poll period of the connector loop. Bounds timeout-detection latency.
    pub poll_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
        }
    }
}
