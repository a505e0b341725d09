//! Listening socket and accept loop.
//!
//! Accepted connections are handed to the realm one at a time. Accept
//! errors are logged and the loop keeps going.

use crate::config::RealmConfig;
use crate::error::{ForwardError, ForwardResult};
use crate::realm::RealmHandle;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Pause after a failed accept. Errors such as EMFILE tend to repeat until
/// some connection closes.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections.
trait Incoming {
    fn next_conn(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Incoming for TcpListener {
    fn next_conn(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        self.accept()
    }
}

/// Bind the realm's listen address.
pub async fn bind_listener(config: &RealmConfig) -> ForwardResult<TcpListener> {
    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ForwardError::Bind { addr: addr.clone(), source })?;

    let local = listener.local_addr()?;
    info!(addr = %local, "listening");
    Ok(listener)
}

/// Accept connections forever, queueing each one for admission.
///
/// Only returns once the realm stops taking connections, with
/// [`ForwardError::RealmClosed`].
pub async fn accept_loop(listener: TcpListener, realm: RealmHandle) -> ForwardResult<()> {
    serve(&listener, &realm).await
}

async fn serve<L: Incoming>(incoming: &L, realm: &RealmHandle) -> ForwardResult<()> {
    loop {
        match incoming.next_conn().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "inbound connection accepted");
                realm.admit(stream).await?;
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
