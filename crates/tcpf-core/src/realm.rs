//! The realm: admission authority and registry for every tunnel sharing one
//! bind/destination configuration.
//!
//! All registry mutations happen on the single task running [`Realm::run`].
//! Accepted connections arrive on the admission queue through a
//! [`RealmHandle`]; closing tunnels report on a separate leave queue. No
//! lock is taken around the registry because nothing else touches it.

use crate::config::{DialFailurePolicy, RealmConfig};
use crate::error::{ForwardError, ForwardResult};
use crate::identity::{IdGenerator, TunnelId};
use crate::tunnel::{Tunnel, TunnelInfo};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Accepted connections wait here until the realm admits them. A depth of
/// one keeps the acceptor in lockstep with admission.
const ADMISSION_QUEUE_DEPTH: usize = 1;

enum RealmCommand {
    Admit(TcpStream),
    List(oneshot::Sender<Vec<TunnelInfo>>),
}

/// Cloneable front for a running [`Realm`].
#[derive(Clone)]
pub struct RealmHandle {
    tx: mpsc::Sender<RealmCommand>,
}

impl RealmHandle {
    /// Queue an accepted inbound connection for admission.
    ///
    /// Waits while the realm is busy admitting the previous connection.
    pub async fn admit(&self, conn: TcpStream) -> ForwardResult<()> {
        self.tx
            .send(RealmCommand::Admit(conn))
            .await
            .map_err(|_| ForwardError::RealmClosed)
    }

    /// Snapshot of the tunnels currently registered, ordered by id.
    pub async fn tunnels(&self) -> ForwardResult<Vec<TunnelInfo>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(RealmCommand::List(reply_tx))
            .await
            .map_err(|_| ForwardError::RealmClosed)?;
        reply_rx.await.map_err(|_| ForwardError::RealmClosed)
    }
}

/// Owner of the tunnel registry.
pub struct Realm {
    config: RealmConfig,
    ids: IdGenerator,
    tunnels: HashMap<TunnelId, Tunnel>,
    commands: mpsc::Receiver<RealmCommand>,
    leave_tx: mpsc::UnboundedSender<TunnelId>,
    leave_rx: mpsc::UnboundedReceiver<TunnelId>,
}

impl Realm {
    /// Create a realm and the handle used to feed it.
    ///
    /// Nothing is processed until [`Realm::run`] is polled.
    pub fn new(config: RealmConfig) -> (Self, RealmHandle) {
        let (tx, commands) = mpsc::channel(ADMISSION_QUEUE_DEPTH);
        let (leave_tx, leave_rx) = mpsc::unbounded_channel();
        let realm = Self {
            config,
            ids: IdGenerator::new(),
            tunnels: HashMap::new(),
            commands,
            leave_tx,
            leave_rx,
        };
        (realm, RealmHandle { tx })
    }

    pub fn config(&self) -> &RealmConfig {
        &self.config
    }

    /// Serve the admission and leave queues.
    ///
    /// Returns `Ok(())` once every [`RealmHandle`] is dropped, after shutting
    /// down the remaining tunnels.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::DestinationUnavailable`] when a dial fails
    /// under [`DialFailurePolicy::Terminate`]. Live tunnels are shut down
    /// first; the caller is expected to end the process.
    pub async fn run(mut self) -> ForwardResult<()> {
        info!(
            bind = %self.config.bind_address(),
            destination = %self.config.destination(),
            on_dial_failure = %self.config.on_dial_failure,
            "realm started"
        );

        loop {
            tokio::select! {
                Some(id) = self.leave_rx.recv() => self.remove(id),
                command = self.commands.recv() => match command {
                    Some(RealmCommand::Admit(conn)) => {
                        if let Err(e) = self.admit(conn).await {
                            self.shutdown_all();
                            return Err(e);
                        }
                    }
                    Some(RealmCommand::List(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    None => break,
                },
            }
        }

        debug!(remaining = self.tunnels.len(), "admission queue closed");
        self.shutdown_all();
        Ok(())
    }

    /// Dial the destination for `conn` and register the resulting tunnel.
    async fn admit(&mut self, conn: TcpStream) -> ForwardResult<()> {
        let addr = self.config.destination();
        let outbound = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(source) => {
                return match self.config.on_dial_failure {
                    DialFailurePolicy::Terminate => {
                        error!(addr = %addr, error = %source, "destination address is not available");
                        Err(ForwardError::DestinationUnavailable { addr, source })
                    }
                    DialFailurePolicy::Reject => {
                        warn!(addr = %addr, error = %source, "destination address is not available, dropping inbound connection");
                        Ok(())
                    }
                };
            }
        };

        let id = self.ids.next_id();
        match Tunnel::start(id, conn, outbound, self.leave_tx.downgrade()) {
            Ok(tunnel) => {
                info!(tunnel_id = %id, tunnel = %tunnel, "added tunnel");
                self.tunnels.insert(id, tunnel);
                self.list_tunnels();
            }
            Err(e) => {
                warn!(tunnel_id = %id, error = %e, "cannot start tunnel, dropping connection");
            }
        }
        Ok(())
    }

    /// Drop a tunnel from the registry and release its connections.
    ///
    /// Unknown ids are ignored, so repeated removal is harmless.
    fn remove(&mut self, id: TunnelId) {
        let Some(tunnel) = self.tunnels.remove(&id) else {
            debug!(tunnel_id = %id, "tunnel already removed");
            return;
        };
        info!(tunnel_id = %id, tunnel = %tunnel, "tunnel leaving realm and being closed");
        tunnel.shutdown();
        self.list_tunnels();
    }

    fn shutdown_all(&mut self) {
        for (id, tunnel) in self.tunnels.drain() {
            debug!(tunnel_id = %id, "shutting down tunnel");
            tunnel.shutdown();
        }
    }

    fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> = self.tunnels.values().map(Tunnel::info).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    fn list_tunnels(&self) {
        info!(
            tunnels = %render_listing(&self.snapshot()),
            "the realm has the following tunnels"
        );
    }
}

/// Render tunnels as `[1:[a -> b], 2:[c -> d]]`.
fn render_listing(infos: &[TunnelInfo]) -> String {
    let entries: Vec<String> = infos.iter().map(ToString::to_string).collect();
    format!("[{}]", entries.join(", "))
}
