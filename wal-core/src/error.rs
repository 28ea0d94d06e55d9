//! Error types and structured `error_stack` context types.

use std::fmt;

use crate::{Host, Slot};

/// Marker error for malformed frames or stored entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeError;

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode binary record")
    }
}

impl core::error::Error for DecodeError {}

/// Marker error for an invalid replica topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyError;

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid replica topology")
    }
}

impl core::error::Error for TopologyError {}

/// Error context: slot.
#[derive(Debug, Clone)]
pub struct SlotContext {
    pub slot: Slot,
}

impl SlotContext {
    #[must_use]
    pub fn new(slot: &Slot) -> Self {
        Self { slot: slot.clone() }
    }
}

impl fmt::Display for SlotContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot: {}", self.slot)
    }
}

/// Error context: remote host.
#[derive(Debug, Clone)]
pub struct HostContext {
    pub host: Host,
}

impl HostContext {
    #[must_use]
    pub fn new(host: &Host) -> Self {
        Self { host: host.clone() }
    }
}

impl fmt::Display for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host: {}", self.host)
    }
}

/// Error context: replica (datacenter).
#[derive(Debug, Clone)]
pub struct ReplicaContext {
    pub replica: String,
}

impl ReplicaContext {
    #[must_use]
    pub fn new(replica: impl Into<String>) -> Self {
        Self {
            replica: replica.into(),
        }
    }
}

impl fmt::Display for ReplicaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica: {}", self.replica)
    }
}
