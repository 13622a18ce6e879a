//! Per-connection session state

use std::fmt;

use crate::notify::SubscriberId;

/// Dispatcher state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the next request frame
    AwaitingCommand,
    /// Turning a frame into a typed command
    Parsing,
    /// Handler running inside its transaction
    Executing,
    /// Final tagged response queued
    RespondingDone,
}

/// Context a connection carries between commands
#[derive(Debug)]
pub struct Session {
    connection_id: u64,
    name: Option<String>,
    /// Resource remote-id scopes resolve against
    pub selected_resource: Option<String>,
    pub state: ConnectionState,
    /// Live monitor subscription, if MONITOR is on
    pub monitor: Option<SubscriberId>,
    /// Resource this connection serves as adapter for
    pub adapter_for: Option<String>,
    pub logged_out: bool,
}

impl Session {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            name: None,
            selected_resource: None,
            state: ConnectionState::AwaitingCommand,
            monitor: None,
            adapter_for: None,
            logged_out: false,
        }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.name.is_some()
    }

    pub fn login(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    /// Session id stamped on the notifications this connection causes
    pub fn name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("conn-{}", self.connection_id),
        }
    }

    /// Whether changes made here come from the resource owning them
    pub fn speaks_for(&self, resource: &str) -> bool {
        self.adapter_for.as_deref() == Some(resource)
            || self.selected_resource.as_deref() == Some(resource)
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} (conn-{})", name, self.connection_id),
            None => write!(f, "conn-{}", self.connection_id),
        }
    }
}
