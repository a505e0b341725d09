//! A tunnel is one inbound connection paired with one outbound connection
//! and the four pumps relaying between them.
//!
//! ```text
//! inbound ──read_pump──▶ remote handoff ──write_pump──▶ outbound
//! inbound ◀──write_pump── local handoff ◀──read_pump── outbound
//! ```
//!
//! The first pump to stop closes the tunnel. Closing is latched so it
//! happens once no matter how many pumps report afterwards: the tunnel asks
//! its realm to drop it from the registry, and the realm raises the shutdown
//! signal that unwinds the remaining pumps.

use crate::identity::TunnelId;
use crate::relay::{self, RelayEnd};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const PUMP_COUNT: usize = 4;

/// Lifecycle of a running tunnel.
///
/// A tunnel value only exists once its outbound dial succeeded, so it
/// starts out `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelState {
    /// All four pumps are relaying.
    Active = 0,
    /// A pump stopped; teardown is in progress.
    Closing = 1,
    /// Every pump has returned and both connections are released.
    Closed = 2,
}

impl TunnelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelState::Active,
            1 => TunnelState::Closing,
            _ => TunnelState::Closed,
        }
    }
}

/// Point-in-time description of a tunnel, used for registry listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelInfo {
    pub id: TunnelId,
    pub inbound: SocketAddr,
    pub outbound: SocketAddr,
}

impl fmt::Display for TunnelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:[{} -> {}]", self.id, self.inbound, self.outbound)
    }
}

/// State shared between the tunnel handle held by the realm and the four
/// pump tasks.
struct TunnelShared {
    id: TunnelId,
    inbound: SocketAddr,
    outbound: SocketAddr,
    state: AtomicU8,
    /// One-shot latch guarding [`TunnelShared::close`].
    closing: AtomicBool,
    live_pumps: AtomicUsize,
    shutdown: watch::Sender<bool>,
    /// Leave queue of the owning realm. Weak so a tunnel never keeps the
    /// realm's queue open on its own.
    realm: mpsc::WeakUnboundedSender<TunnelId>,
}

/// Handle to a running tunnel.
pub struct Tunnel {
    shared: Arc<TunnelShared>,
}

impl Tunnel {
    /// Take ownership of an inbound/outbound pair and start relaying.
    ///
    /// `realm` is the sender half of the owning realm's leave queue; the
    /// tunnel pushes its id there exactly once when it starts closing.
    ///
    /// # Errors
    ///
    /// Fails if either socket has no peer address (for example because it
    /// was reset before the tunnel could be built). No pumps are started in
    /// that case and both sockets are dropped.
    pub fn start(
        id: TunnelId,
        inbound: TcpStream,
        outbound: TcpStream,
        realm: mpsc::WeakUnboundedSender<TunnelId>,
    ) -> io::Result<Self> {
        let inbound_addr = inbound.peer_addr()?;
        let outbound_addr = outbound.peer_addr()?;
        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(TunnelShared {
            id,
            inbound: inbound_addr,
            outbound: outbound_addr,
            state: AtomicU8::new(TunnelState::Active as u8),
            closing: AtomicBool::new(false),
            live_pumps: AtomicUsize::new(PUMP_COUNT),
            shutdown,
            realm,
        });

        let (in_read, in_write) = inbound.into_split();
        let (out_read, out_write) = outbound.into_split();
        let (remote_tx, remote_rx) = relay::handoff();
        let (local_tx, local_rx) = relay::handoff();

        shared.spawn_pump(
            "inbound->remote",
            relay::read_pump(in_read, remote_tx, shared.shutdown.subscribe()),
        );
        shared.spawn_pump(
            "remote->outbound",
            relay::write_pump(out_write, remote_rx, shared.shutdown.subscribe()),
        );
        shared.spawn_pump(
            "outbound->local",
            relay::read_pump(out_read, local_tx, shared.shutdown.subscribe()),
        );
        shared.spawn_pump(
            "local->inbound",
            relay::write_pump(in_write, local_rx, shared.shutdown.subscribe()),
        );

        Ok(Self { shared })
    }

    pub fn id(&self) -> TunnelId {
        self.shared.id
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.shared.id,
            inbound: self.shared.inbound,
            outbound: self.shared.outbound,
        }
    }

    /// Start tearing the tunnel down. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Raise the shutdown signal so every pump returns and both
    /// connections are released. Idempotent.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl fmt::Display for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.shared, f)
    }
}

impl fmt::Display for TunnelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.inbound, self.outbound)
    }
}

impl TunnelShared {
    fn spawn_pump<F>(self: &Arc<Self>, pump: &'static str, relay: F)
    where
        F: Future<Output = RelayEnd> + Send + 'static,
    {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let end = relay.await;
            shared.pump_finished(pump, end);
        });
    }

    fn pump_finished(&self, pump: &'static str, end: RelayEnd) {
        if end.is_anomaly() {
            warn!(tunnel_id = %self.id, pump, error = %end, "error occurred");
        } else {
            debug!(tunnel_id = %self.id, pump, reason = %end, "relay ended");
        }

        self.close();

        if self.live_pumps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.store(TunnelState::Closed as u8, Ordering::Release);
            debug!(tunnel_id = %self.id, "all relays stopped, connections released");
        }
    }

    fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        // Never move a Closed tunnel back to Closing.
        let _ = self.state.compare_exchange(
            TunnelState::Active as u8,
            TunnelState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(tunnel_id = %self.id, tunnel = %self, "connection closed");

        let delivered = self
            .realm
            .upgrade()
            .is_some_and(|realm| realm.send(self.id).is_ok());
        if !delivered {
            debug!(tunnel_id = %self.id, "realm is gone, shutting tunnel down directly");
            self.shutdown();
        }
    }

    fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
