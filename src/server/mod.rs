//! HTTP Surface
//!
//! A hyper http1 accept loop in front of [`EdgeService`]. Routing lives in
//! [`routes`]; this module only owns sockets and shutdown.

mod routes;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use routes::{handle, MAX_BODY_BYTES};

use crate::error::{Error, Result};
use crate::service::EdgeService;

/// Bind `addr` and serve until `cancel` fires
pub async fn serve(
    service: Arc<EdgeService>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    serve_listener(service, listener, cancel).await
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve_listener(
    service: Arc<EdgeService>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("Catalog edge listening on {}", local);

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    // Transient (EMFILE, ECONNABORTED); keep accepting
                    error!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let service = Arc::clone(&service);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let service = Arc::clone(&service);
                async move { Ok::<_, Infallible>(handle(&service, peer, req).await) }
            });
            let conn = http1::Builder::new().serve_connection(io, svc);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(%peer, "Connection error: {}", e);
                    }
                }
                _ = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    if let Err(e) = conn.await {
                        debug!(%peer, "Connection error during shutdown: {}", e);
                    }
                }
            }
        });
    }

    info!("Catalog edge stopped accepting connections");
    Ok(())
}
