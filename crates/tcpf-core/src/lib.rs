//! tcpf-core: the forwarding engine behind `tcpf`.
//!
//! A [`Realm`] owns the registry of live [`Tunnel`]s for one bind/destination
//! pair. Each tunnel relays bytes between an accepted inbound connection and
//! a freshly dialed outbound connection using four [`relay`] pumps. The
//! [`acceptor`] feeds accepted connections into the realm's admission queue.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod identity;
pub mod realm;
pub mod relay;
pub mod tunnel;

// Re-export commonly used items at crate root.
pub use acceptor::{accept_loop, bind_listener};
pub use config::{DialFailurePolicy, RealmConfig};
pub use error::{ForwardError, ForwardResult};
pub use identity::{IdGenerator, TunnelId};
pub use realm::{Realm, RealmHandle};
pub use relay::{RelayEnd, READ_CHUNK_SIZE};
pub use tunnel::{Tunnel, TunnelInfo, TunnelState};
