//! Replica process for the Meridian replicated WAL: fjall-backed log
//! storage, the replication server and TCP transports to other replicas.

#![warn(clippy::pedantic)]

pub mod connector;
pub mod node;
pub mod server;
pub mod state_store;

pub use connector::{Dialer, TcpTransport, TokioDialer};
pub use node::Node;
pub use server::{ServerError, serve, serve_connection};
pub use state_store::FjallCasStore;
