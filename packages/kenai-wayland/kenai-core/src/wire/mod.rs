//! Encoding and decoding of Wayland wire messages.

use std::io::Cursor;

use serde::CompileTimeMessageSize;

pub mod fixed;
pub mod message;
pub mod serde;

pub use fixed::Fixed;
pub use serde::ObjectId;

/// The size of the header every message starts with.
pub const HEADER_SIZE: usize = serde::MessageHeader::SIZE;

/// The largest message, header included, that may be sent over the wire.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Pads the given position to the next multiple of 4 bytes (32 bits).
#[must_use]
pub const fn pad_to_32_bits(pos: usize) -> usize {
    (pos + 3) & !3
}

/// A helper for decoding byte buffers from the Wayland wire protocol.
pub struct MessageDecoder<'a> {
    data: Cursor<&'a [u8]>,
}

impl<'a> MessageDecoder<'a> {
    /// Creates a new `MessageDecoder` for the given byte slice.
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
        }
    }

    /// Reads a value of type `T` and advances past its padding.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails. See [`Decode::decode`](serde::Decode::decode) for more details.
    pub fn read<T: serde::Decode>(&mut self) -> Result<T, serde::SerdeError> {
        let data = self.remaining();
        let value = T::decode(data)?;
        let next = pad_to_32_bits(self.data.position() as usize + value.size());
        self.data.set_position(next as u64);
        Ok(value)
    }

    /// Returns the bytes that have not been consumed yet.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        let data: &'a [u8] = *self.data.get_ref();
        let pos = (self.data.position() as usize).min(data.len());
        &data[pos..]
    }

    /// Returns `true` once every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining().is_empty()
    }

    /// Returns the current position in the byte buffer.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.data.position()
    }
}

/// A helper for encoding byte buffers for the Wayland wire protocol.
///
/// The target slice must already have room for every value written; padding bytes
/// are zeroed as the cursor moves over them.
pub struct MessageEncoder<'a> {
    data: Cursor<&'a mut [u8]>,
}

impl<'a> MessageEncoder<'a> {
    /// Creates a new `MessageEncoder` for the given mutable byte slice.
    pub const fn new(data: &'a mut [u8]) -> Self {
        Self {
            data: Cursor::new(data),
        }
    }

    /// Writes a value of type `T` at the current position and zero-fills its padding.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails. See [`Encode::encode`](serde::Encode::encode) for more details.
    pub fn write<T: serde::Encode>(&mut self, value: &T) -> Result<(), serde::SerdeError> {
        let pos = self.data.position() as usize;
        let data = self
            .data
            .get_mut()
            .get_mut(pos..)
            .ok_or(serde::SerdeError::InvalidSize)?;

        let written = value.encode(data)?;
        let end = pad_to_32_bits(written).min(data.len());
        data[written..end].fill(0);

        self.data.set_position((pos + pad_to_32_bits(written)) as u64);
        Ok(())
    }

    /// Returns the current position in the byte buffer.
    #[inline]
    #[must_use]
    pub const fn position(&self) -> u64 {
        self.data.position()
    }
}

/// Encodes a message with the given object ID and opcode into the provided byte buffer.
///
/// Returns the number of bytes written, header included.
///
/// # Errors
///
/// Returns an error if the buffer is too small or the message does not fit the
/// 16 bit size field. See [`Encode::encode`](serde::Encode::encode) for more details.
pub fn encode_message<T: serde::Encode>(
    message: &T,
    object_id: ObjectId,
    opcode: u16,
    data: &mut [u8],
) -> Result<usize, serde::SerdeError> {
    let size = HEADER_SIZE + pad_to_32_bits(message.size());
    let header = serde::MessageHeader {
        object_id,
        opcode,
        size: u16::try_from(size).map_err(|_| serde::SerdeError::InvalidSize)?,
    };

    let mut encoder = MessageEncoder::new(data);
    encoder.write(&header)?;
    encoder.write(message)?;

    Ok(encoder.position() as usize)
}
