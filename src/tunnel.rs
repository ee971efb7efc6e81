//! Tunnel provider abstraction
//!
//! A tunnel exposes a local listener under a public URL. Concrete relay
//! vendors are collaborators of this crate and live in the embedding
//! application; the registry only needs `open` and a handle whose drop
//! tears the tunnel down.

use crate::error::ShareResult;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::oneshot;

/// Boxed future type for dyn-compatible async trait methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A live tunnel. Dropping the handle (or the shutdown sender inside it)
/// signals the provider to close the tunnel.
pub struct TunnelHandle {
    public_url: String,
    _shutdown: Option<oneshot::Sender<()>>,
}

impl TunnelHandle {
    /// Handle for a tunnel that needs explicit teardown: the provider
    /// should close the tunnel when the receiver half completes.
    pub fn new(public_url: impl Into<String>, shutdown: oneshot::Sender<()>) -> Self {
        Self {
            public_url: public_url.into(),
            _shutdown: Some(shutdown),
        }
    }

    /// Handle for an endpoint with nothing to tear down (direct serving).
    pub fn detached(public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into(),
            _shutdown: None,
        }
    }

    /// Public base URL, without any share token appended.
    pub fn public_url(&self) -> &str {
        &self.public_url
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("public_url", &self.public_url)
            .finish()
    }
}

/// Trait implemented by tunnel vendors.
///
/// `open` may take arbitrarily long (relay handshakes); the registry runs
/// it on a background task and cancels that task when the share is stopped
/// before the tunnel came up.
pub trait TunnelProvider: Send + Sync {
    /// Provider name for logs and share listings (e.g. "direct", "relay")
    fn name(&self) -> &'static str;

    /// Establish a public endpoint for `127.0.0.1:local_port`.
    fn open<'a>(&'a self, local_port: u16) -> BoxFuture<'a, ShareResult<TunnelHandle>>;
}

/// Provider that exposes the local listener address as-is.
///
/// Useful on trusted networks and in tests; the "public" URL is simply
/// `http://<host>:<port>`.
pub struct DirectTunnel {
    host: String,
}

impl DirectTunnel {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Direct tunnel over the loopback interface
    pub fn loopback() -> Self {
        Self::new("127.0.0.1")
    }
}

impl TunnelProvider for DirectTunnel {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn open<'a>(&'a self, local_port: u16) -> BoxFuture<'a, ShareResult<TunnelHandle>> {
        Box::pin(async move {
            Ok(TunnelHandle::detached(format!(
                "http://{}:{}",
                self.host, local_port
            )))
        })
    }
}
