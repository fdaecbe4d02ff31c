use std::sync::OnceLock;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};

/// `reqwest`'s `rustls-tls-webpki-roots-no-provider` feature ships no
/// process-level `CryptoProvider`; one must be installed before the first
/// TLS handshake or `rustls` panics. Installed once, lazily, the first time
/// a client is built.
fn ensure_rustls_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Credentials injected into every outgoing request, playlist fetch and
/// segment GET alike. Only HTTP Basic is supported, matching spec.md §6's
/// `-auth basic` surface.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    basic: Option<(String, String)>,
}

impl AuthConfig {
    pub fn basic(user: String, password: String) -> Self {
        Self { basic: Some((user, password)) }
    }

    pub fn none() -> Self {
        Self { basic: None }
    }

    pub fn apply(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.basic {
            Some((user, password)) => req.basic_auth(user, Some(password)),
            None => req,
        }
    }
}

/// Builds a client with its own connection pool. The loader gets one, and
/// every worker gets its own, so segment fetches from one worker never
/// starve another worker's keep-alive connections.
pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    ensure_rustls_provider();
    Client::builder().timeout(timeout).pool_idle_timeout(Duration::from_secs(90)).build()
}
