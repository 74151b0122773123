//! Thin wrapper around the parts of `tokio` this crate spawns and sleeps on. Kept as its own
//! module so the rest of the crate names one place instead of scattering `tokio::spawn`/
//! `tokio::time` calls directly.

use std::{future::Future, net::SocketAddr, time::Duration};

use crate::error::Result;

/// Spawns `fut` on the current runtime. Must be called from within a running runtime.
#[track_caller]
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::spawn(fut)
}

/// Resolves `host` to its candidate socket addresses, the same way `TcpStream::connect` would.
pub(crate) async fn resolve(host: &str) -> Result<impl Iterator<Item = SocketAddr>> {
    let addrs = tokio::net::lookup_host(host).await?;
    Ok(addrs)
}

/// Sleeps for `duration`, yielding control back to the runtime. Used for connection back-off.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
