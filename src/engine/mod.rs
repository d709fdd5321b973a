//! Network engines run by the daemon.
//!
//! The coordinator only relies on the startup contract below: an engine is
//! moved into its own task and serves until the shared token is cancelled.

use std::future::Future;

use tokio_util::sync::CancellationToken;

pub mod dns;
pub mod proxy;

pub use dns::{DnsEngine, StaticZone};
pub use proxy::{ProxyEngine, ROOTS_PATH};

pub trait Engine: Send + 'static {
    fn name(&self) -> &'static str;

    /// Bind, serve, and return once `cancel` fires and in-flight work drains.
    fn serve(
        self,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'static;
}
