//! Replication wire messages.
//!
//! Every frame starts with a one-byte tag and the request's correlation id,
//! followed by a tag-specific payload. Integers are big-endian; byte strings
//! are prefixed with a `u32` length.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use error_stack::Report;

use crate::entry::{EntityGroup, EntryStatus, Slot, WalEntry};
use crate::error::DecodeError;

pub const TAG_PREPARE: u8 = 0x01;
pub const TAG_ACCEPT: u8 = 0x02;
pub const TAG_PREPARE_ACK: u8 = 0x11;
pub const TAG_PREPARE_NACK: u8 = 0x12;
pub const TAG_ACCEPT_ACK: u8 = 0x21;
pub const TAG_ACCEPT_NACK: u8 = 0x22;
pub const TAG_FAILED: u8 = 0x7f;

/// Binary encoding shared by requests and responses.
pub trait WireFormat: Sized {
    fn encode(&self, dst: &mut BytesMut);

    /// # Errors
    /// Returns [`DecodeError`] on an unknown tag or a truncated payload.
    fn decode(src: &mut Bytes) -> Result<Self, Report<DecodeError>>;
}

/// A message tagged with the id that pairs a response to its request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope<T> {
    pub correlation: u64,
    pub message: T,
}

impl<T> Envelope<T> {
    pub fn new(correlation: u64, message: T) -> Self {
        Self {
            correlation,
            message,
        }
    }
}

/// Phase requests sent from a coordinator to a remote replica.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationRequest {
    Prepare { slot: Slot, n: u64 },
    Accept { slot: Slot, entry: WalEntry },
}

impl ReplicationRequest {
    #[must_use]
    pub fn slot(&self) -> &Slot {
        match self {
            Self::Prepare { slot, .. } | Self::Accept { slot, .. } => slot,
        }
    }

    #[must_use]
    pub fn n(&self) -> u64 {
        match self {
            Self::Prepare { n, .. } => *n,
            Self::Accept { entry, .. } => entry.n,
        }
    }
}

/// A remote replica's answer to a [`ReplicationRequest`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplicationResponse {
    /// The promise was recorded. Carries the replica's accepted entry, if any.
    PrepareAck {
        wal_index: u64,
        n: u64,
        accepted: Option<WalEntry>,
    },
    /// The replica already promised a proposal at least as high.
    PrepareNack { wal_index: u64, promised: u64 },
    AcceptAck { wal_index: u64, n: u64 },
    /// The replica holds a higher proposal number.
    AcceptNack { wal_index: u64, n: u64 },
    /// The replica could not run the local operation (storage trouble or contention).
    Failed { wal_index: u64 },
}

impl ReplicationResponse {
    #[must_use]
    pub fn wal_index(&self) -> u64 {
        match self {
            Self::PrepareAck { wal_index, .. }
            | Self::PrepareNack { wal_index, .. }
            | Self::AcceptAck { wal_index, .. }
            | Self::AcceptNack { wal_index, .. }
            | Self::Failed { wal_index } => *wal_index,
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::PrepareAck { .. } | Self::AcceptAck { .. })
    }
}

fn need(src: &Bytes, len: usize, what: &'static str) -> Result<(), Report<DecodeError>> {
    if src.remaining() < len {
        return Err(Report::new(DecodeError).attach(format!("truncated {what}")));
    }
    Ok(())
}

fn get_u8(src: &mut Bytes, what: &'static str) -> Result<u8, Report<DecodeError>> {
    need(src, 1, what)?;
    Ok(src.get_u8())
}

fn get_u64(src: &mut Bytes, what: &'static str) -> Result<u64, Report<DecodeError>> {
    need(src, 8, what)?;
    Ok(src.get_u64())
}

fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    dst.put_u32(len);
    dst.put_slice(&bytes[..len as usize]);
}

fn get_bytes(src: &mut Bytes, what: &'static str) -> Result<Bytes, Report<DecodeError>> {
    need(src, 4, what)?;
    let len = src.get_u32() as usize;
    need(src, len, what)?;
    Ok(src.split_to(len))
}

fn put_slot(dst: &mut BytesMut, slot: &Slot, n: u64) {
    dst.put_u64(slot.wal_index);
    dst.put_u64(n);
    put_bytes(dst, slot.entity_group.as_bytes());
}

fn get_slot(src: &mut Bytes) -> Result<(Slot, u64), Report<DecodeError>> {
    let wal_index = get_u64(src, "wal index")?;
    let n = get_u64(src, "proposal number")?;
    let group = get_bytes(src, "entity group")?;
    Ok((
        Slot {
            entity_group: EntityGroup(group),
            wal_index,
        },
        n,
    ))
}

fn put_value(dst: &mut BytesMut, value: Option<&Bytes>) {
    match value {
        Some(value) => {
            dst.put_u8(1);
            put_bytes(dst, value);
        }
        None => dst.put_u8(0),
    }
}

fn get_value(src: &mut Bytes) -> Result<Option<Bytes>, Report<DecodeError>> {
    match get_u8(src, "value flag")? {
        0 => Ok(None),
        1 => get_bytes(src, "value").map(Some),
        other => Err(Report::new(DecodeError).attach(format!("bad value flag {other:#x}"))),
    }
}

fn put_entry(dst: &mut BytesMut, entry: &WalEntry) {
    dst.put_u64(entry.n);
    dst.put_u8(u8::from(entry.is_accepted()));
    put_value(dst, entry.value.as_ref());
}

fn get_entry(src: &mut Bytes) -> Result<WalEntry, Report<DecodeError>> {
    let n = get_u64(src, "entry proposal number")?;
    let status = match get_u8(src, "entry status")? {
        0 => EntryStatus::Prepared,
        1 => EntryStatus::Accepted,
        other => {
            return Err(Report::new(DecodeError).attach(format!("bad entry status {other:#x}")));
        }
    };
    let value = get_value(src)?;
    Ok(WalEntry { n, value, status })
}

fn decode_header(src: &mut Bytes) -> Result<(u8, u64), Report<DecodeError>> {
    let tag = get_u8(src, "tag")?;
    let correlation = get_u64(src, "correlation id")?;
    Ok((tag, correlation))
}

impl WireFormat for Envelope<ReplicationRequest> {
    fn encode(&self, dst: &mut BytesMut) {
        match &self.message {
            ReplicationRequest::Prepare { slot, n } => {
                dst.put_u8(TAG_PREPARE);
                dst.put_u64(self.correlation);
                put_slot(dst, slot, *n);
            }
            ReplicationRequest::Accept { slot, entry } => {
                dst.put_u8(TAG_ACCEPT);
                dst.put_u64(self.correlation);
                put_slot(dst, slot, entry.n);
                put_value(dst, entry.value.as_ref());
            }
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, Report<DecodeError>> {
        let (tag, correlation) = decode_header(src)?;
        let message = match tag {
            TAG_PREPARE => {
                let (slot, n) = get_slot(src)?;
                ReplicationRequest::Prepare { slot, n }
            }
            TAG_ACCEPT => {
                let (slot, n) = get_slot(src)?;
                let value = get_value(src)?;
                ReplicationRequest::Accept {
                    slot,
                    entry: WalEntry::accepted(n, value),
                }
            }
            other => {
                return Err(Report::new(DecodeError).attach(format!("unknown request tag {other:#x}")));
            }
        };
        Ok(Self::new(correlation, message))
    }
}

impl WireFormat for Envelope<ReplicationResponse> {
    fn encode(&self, dst: &mut BytesMut) {
        match &self.message {
            ReplicationResponse::PrepareAck {
                wal_index,
                n,
                accepted,
            } => {
                dst.put_u8(TAG_PREPARE_ACK);
                dst.put_u64(self.correlation);
                dst.put_u64(*wal_index);
                dst.put_u64(*n);
                match accepted {
                    Some(entry) => {
                        dst.put_u8(1);
                        put_entry(dst, entry);
                    }
                    None => dst.put_u8(0),
                }
            }
            ReplicationResponse::PrepareNack {
                wal_index,
                promised,
            } => {
                dst.put_u8(TAG_PREPARE_NACK);
                dst.put_u64(self.correlation);
                dst.put_u64(*wal_index);
                dst.put_u64(*promised);
            }
            ReplicationResponse::AcceptAck { wal_index, n } => {
                dst.put_u8(TAG_ACCEPT_ACK);
                dst.put_u64(self.correlation);
                dst.put_u64(*wal_index);
                dst.put_u64(*n);
            }
            ReplicationResponse::AcceptNack { wal_index, n } => {
                dst.put_u8(TAG_ACCEPT_NACK);
                dst.put_u64(self.correlation);
                dst.put_u64(*wal_index);
                dst.put_u64(*n);
            }
            ReplicationResponse::Failed { wal_index } => {
                dst.put_u8(TAG_FAILED);
                dst.put_u64(self.correlation);
                dst.put_u64(*wal_index);
            }
        }
    }

    fn decode(src: &mut Bytes) -> Result<Self, Report<DecodeError>> {
        let (tag, correlation) = decode_header(src)?;
        let wal_index = get_u64(src, "wal index")?;
        let message = match tag {
            TAG_PREPARE_ACK => {
                let n = get_u64(src, "proposal number")?;
                let accepted = match get_u8(src, "accepted flag")? {
                    0 => None,
                    _ => Some(get_entry(src)?),
                };
                ReplicationResponse::PrepareAck {
                    wal_index,
                    n,
                    accepted,
                }
            }
            TAG_PREPARE_NACK => ReplicationResponse::PrepareNack {
                wal_index,
                promised: get_u64(src, "promised number")?,
            },
            TAG_ACCEPT_ACK => ReplicationResponse::AcceptAck {
                wal_index,
                n: get_u64(src, "proposal number")?,
            },
            TAG_ACCEPT_NACK => ReplicationResponse::AcceptNack {
                wal_index,
                n: get_u64(src, "proposal number")?,
            },
            TAG_FAILED => ReplicationResponse::Failed { wal_index },
            other => {
                return Err(Report::new(DecodeError).attach(format!("unknown response tag {other:#x}")));
            }
        };
        Ok(Self::new(correlation, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<T>(msg: &T) -> Bytes
    where
        T: WireFormat,
    {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        buf.freeze()
    }

    #[test]
    fn prepare_frame_layout() {
        let env = Envelope::new(
            9,
            ReplicationRequest::Prepare {
                slot: Slot::new("eg", 4),
                n: 2,
            },
        );
        let bytes = encode(&env);
        assert_eq!(bytes[0], TAG_PREPARE);
        assert_eq!(&bytes[1..9], &9u64.to_be_bytes());
        assert_eq!(&bytes[9..17], &4u64.to_be_bytes());
        assert_eq!(&bytes[17..25], &2u64.to_be_bytes());
        assert_eq!(&bytes[25..29], &2u32.to_be_bytes());
        assert_eq!(&bytes[29..], b"eg");
    }

    #[test]
    fn accept_with_empty_value_decodes() {
        let env = Envelope::new(
            1,
            ReplicationRequest::Accept {
                slot: Slot::new("eg", 0),
                entry: WalEntry::accepted(3, None),
            },
        );
        let decoded = Envelope::<ReplicationRequest>::decode(&mut encode(&env)).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn prepare_ack_carries_accepted_entry() {
        let env = Envelope::new(
            77,
            ReplicationResponse::PrepareAck {
                wal_index: 5,
                n: 8,
                accepted: Some(WalEntry::accepted(6, Some(Bytes::from_static(b"v")))),
            },
        );
        let decoded = Envelope::<ReplicationResponse>::decode(&mut encode(&env)).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut bytes = Bytes::from_static(&[0x55, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(Envelope::<ReplicationRequest>::decode(&mut bytes).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let env = Envelope::new(
            1,
            ReplicationRequest::Accept {
                slot: Slot::new("group", 0),
                entry: WalEntry::accepted(1, Some(Bytes::from_static(b"hello"))),
            },
        );
        let bytes = encode(&env);
        let mut short = bytes.slice(..bytes.len() - 2);
        assert!(Envelope::<ReplicationRequest>::decode(&mut short).is_err());
    }

    #[test]
    fn failed_response_decodes() {
        let env = Envelope::new(3, ReplicationResponse::Failed { wal_index: 12 });
        let decoded = Envelope::<ReplicationResponse>::decode(&mut encode(&env)).unwrap();
        assert!(!decoded.message.is_ack());
        assert_eq!(decoded.message.wal_index(), 12);
    }
}
