//! Protocol server
//!
//! [`Server`] accepts TCP connections; each runs a [`Dispatcher`] holding
//! its [`Session`]. Clients and resource adapters speak the same protocol.

mod dispatcher;
mod listener;
mod session;

pub use dispatcher::{Dispatcher, Outbox};
pub use listener::Server;
pub use session::{ConnectionState, Session};
