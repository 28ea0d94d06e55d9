//! Shared vocabulary of the Meridian replicated write-ahead log.
//!
//! - [`Slot`] and [`WalEntry`]: the addressable log positions and the Paxos
//!   state stored in each one
//! - [`Topology`]: the replica set and quorum arithmetic
//! - [`ReplicationRequest`] / [`ReplicationResponse`]: the wire protocol spoken
//!   between replicas, framed by [`WireCodec`]

#![warn(clippy::pedantic)]

pub mod codec;
pub mod entry;
pub mod error;
pub mod message;
pub mod topology;

pub use codec::WireCodec;
pub use entry::{EntityGroup, EntryStatus, Slot, WalEntry};
pub use error::{DecodeError, HostContext, ReplicaContext, SlotContext, TopologyError};
pub use message::{Envelope, ReplicationRequest, ReplicationResponse, WireFormat};
pub use topology::{Host, ReplicaDesc, Topology, quorum, quorum_impossible};
