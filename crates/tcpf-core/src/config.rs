//! Realm configuration: where to listen and where to forward.
//!
//! Host and port values are kept as the strings they were given; the core
//! only joins them into `host:port` pairs for binding and dialing.

use std::fmt;

/// What the realm does when the destination cannot be dialed for a newly
/// admitted connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DialFailurePolicy {
    /// Stop the realm and report the error; the process is expected to exit.
    #[default]
    Terminate,
    /// Drop only the inbound connection and keep serving.
    Reject,
}

impl fmt::Display for DialFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialFailurePolicy::Terminate => f.write_str("terminate"),
            DialFailurePolicy::Reject => f.write_str("reject"),
        }
    }
}

/// Bind and destination parameters shared by every tunnel of a realm.
#[derive(Debug, Clone)]
pub struct RealmConfig {
    pub bind_interface: String,
    pub bind_port: String,
    pub dest_host: String,
    pub dest_port: String,
    pub on_dial_failure: DialFailurePolicy,
}

impl RealmConfig {
    pub fn new(
        bind_interface: impl Into<String>,
        bind_port: impl Into<String>,
        dest_host: impl Into<String>,
        dest_port: impl Into<String>,
    ) -> Self {
        Self {
            bind_interface: bind_interface.into(),
            bind_port: bind_port.into(),
            dest_host: dest_host.into(),
            dest_port: dest_port.into(),
            on_dial_failure: DialFailurePolicy::default(),
        }
    }

    /// Builder-style override of the dial failure policy.
    pub fn with_dial_failure_policy(mut self, policy: DialFailurePolicy) -> Self {
        self.on_dial_failure = policy;
        self
    }

    /// `dest_host:dest_port`, as handed to the outbound dial.
    pub fn destination(&self) -> String {
        format!("{}:{}", self.dest_host, self.dest_port)
    }

    /// `bind_interface:bind_port`, as handed to the listener.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_interface, self.bind_port)
    }
}
