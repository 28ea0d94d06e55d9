//! Length-delimited framing for [`WireFormat`] messages.

use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::message::WireFormat;

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Frames `T` with a length prefix and encodes the body with [`WireFormat`].
///
/// ```ignore
/// let reader = FramedRead::new(read_half, WireCodec::<Envelope<ReplicationRequest>>::new());
/// let writer = FramedWrite::new(write_half, WireCodec::<Envelope<ReplicationResponse>>::new());
/// ```
#[derive(Debug)]
pub struct WireCodec<T> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<T>,
}

impl<T> Clone for WireCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Default for WireCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WireCodec<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<T: WireFormat> Decoder for WireCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(frame) => {
                let mut frame = frame.freeze();
                let item = T::decode(&mut frame)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}")))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: WireFormat> Encoder<T> for WireCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.encode(&mut body);
        self.inner.encode(body.freeze(), dst)
    }
}
