//! Primitive encodings of the Wayland wire format.
//!
//! Every value is made of 32 bit words in host byte order. Variable length values
//! (strings and arrays) carry a length word and are padded to the next word
//! boundary by [`MessageEncoder`](super::MessageEncoder).

use std::{
    borrow::Cow,
    io::{Cursor, Write},
};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use paste::paste;
use thiserror::Error;

use super::fixed::Fixed;

/// The size of a message/type in bytes when encoded for the Wayland wire protocol.
/// Types implementing this trait have a encoded size that is known at compile time.
///
/// For types that have an encoded size that can only be determined at runtime, implement only [`MessageSize`].
pub trait CompileTimeMessageSize: MessageSize {
    /// The size of this type when encoded for the Wayland wire protocol, in bytes.
    const SIZE: usize;
}

/// The size of a value in bytes when encoded, excluding trailing padding.
pub trait MessageSize: Sized {
    /// Returns the encoded size of this value, in bytes.
    fn size(&self) -> usize;
}

/// Ensures that the provided data slice is at least as large as the size of the type `$t`.
///
/// # Note
///
/// `$t` must implement [`CompileTimeMessageSize`].
#[macro_export]
macro_rules! ensure_size {
    ($data:expr, $t:ty) => {
        if $data.len() < <$t as $crate::wire::serde::CompileTimeMessageSize>::SIZE {
            return Err($crate::wire::serde::SerdeError::InvalidSize);
        }
    };
}
pub use crate::ensure_size;

macro_rules! impl_serde {
    ($($type:ty),*) => {
        $(
            impl CompileTimeMessageSize for $type {
                const SIZE: usize = size_of::<$type>();
            }
            impl MessageSize for $type {
                fn size(&self) -> usize {
                    Self::SIZE
                }
            }
            impl Decode for $type {
                fn decode(data: &[u8]) -> Result<Self, SerdeError> {
                    ensure_size!(data, $type);
                    let mut data = Cursor::new(data);
                    paste! {
                        Ok(data.[<read_ $type>]::<NativeEndian>()?)
                    }
                }
            }
            impl Encode for $type {
                fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError> {
                    ensure_size!(data, $type);
                    let mut data = Cursor::new(data);
                    paste! {
                        data.[<write_ $type>]::<NativeEndian>(*self)?;
                    }
                    Ok(Self::SIZE)
                }
            }
        )*
    };
}

/// A type that can be decoded from the Wayland wire protocol.
pub trait Decode: MessageSize {
    /// Decodes an instance of this type from the start of the provided byte slice.
    ///
    /// # Errors
    ///
    /// This function returns errors if:
    /// - The provided data slice is not large enough to contain the expected type.
    /// - A string is not NUL terminated or is not valid UTF-8.
    /// - A non nullable string was encoded as null.
    fn decode(data: &[u8]) -> Result<Self, SerdeError>;
}

/// A type that can be encoded to the Wayland wire protocol.
pub trait Encode: MessageSize {
    /// Encodes this instance into the start of the provided byte slice and returns
    /// the number of bytes written, excluding padding.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the slice cannot hold the encoded value.
    fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError>;
}

/// A unique object ID. `0` stands for the null object.
pub type ObjectId = u32;

/// The header of a Wayland message.
///
/// On the wire the opcode and size share the second word: the size occupies the
/// upper 16 bits and the opcode the lower 16 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// The ID of the object the message is for.
    pub object_id: ObjectId,
    /// The opcode of the request/event.
    pub opcode: u16,
    /// The size of the message in bytes, including the header.
    pub size: u16,
}

impl MessageSize for MessageHeader {
    fn size(&self) -> usize {
        Self::SIZE
    }
}
impl CompileTimeMessageSize for MessageHeader {
    const SIZE: usize = 8;
}
impl Decode for MessageHeader {
    fn decode(data: &[u8]) -> Result<Self, SerdeError> {
        ensure_size!(data, MessageHeader);
        let mut cursor = Cursor::new(data);
        let object_id = cursor.read_u32::<NativeEndian>()?;
        let word = cursor.read_u32::<NativeEndian>()?;
        Ok(Self {
            object_id,
            opcode: (word & 0xffff) as u16,
            size: (word >> 16) as u16,
        })
    }
}
impl Encode for MessageHeader {
    fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError> {
        ensure_size!(data, MessageHeader);
        let mut cursor = Cursor::new(data);
        cursor.write_u32::<NativeEndian>(self.object_id)?;
        cursor.write_u32::<NativeEndian>((u32::from(self.size) << 16) | u32::from(self.opcode))?;
        Ok(Self::SIZE)
    }
}

impl_serde!(u32, i32);

impl MessageSize for Fixed {
    fn size(&self) -> usize {
        Self::SIZE
    }
}
impl CompileTimeMessageSize for Fixed {
    const SIZE: usize = 4;
}
impl Decode for Fixed {
    fn decode(data: &[u8]) -> Result<Self, SerdeError> {
        i32::decode(data).map(Fixed::from_raw)
    }
}
impl Encode for Fixed {
    fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError> {
        self.to_raw().encode(data)
    }
}

/// Reads the length word that prefixes strings and arrays and checks that the
/// payload it announces is present.
fn read_length_prefix(data: &[u8]) -> Result<usize, SerdeError> {
    let len = u32::decode(data)? as usize;
    if data.len() - u32::SIZE < len {
        return Err(SerdeError::InvalidSize);
    }
    Ok(len)
}

/// A dynamically sized array of bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Array<'a> {
    /// The raw byte data of the array.
    pub data: Cow<'a, [u8]>,
}
impl From<Vec<u8>> for Array<'_> {
    fn from(value: Vec<u8>) -> Self {
        Self { data: value.into() }
    }
}
impl<'a> From<&'a [u8]> for Array<'a> {
    fn from(value: &'a [u8]) -> Self {
        Self { data: value.into() }
    }
}
impl<const N: usize> From<[u8; N]> for Array<'_> {
    fn from(value: [u8; N]) -> Self {
        Self {
            data: value.to_vec().into(),
        }
    }
}

impl MessageSize for Array<'_> {
    fn size(&self) -> usize {
        u32::SIZE + self.data.len()
    }
}
impl<'a> Array<'a> {
    /// Decodes an array that borrows its contents from `data`.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::InvalidSize`] if the announced length overruns `data`.
    pub fn decode_borrowed(data: &'a [u8]) -> Result<Self, SerdeError> {
        let len = read_length_prefix(data)?;
        Ok(Self {
            data: Cow::Borrowed(&data[u32::SIZE..u32::SIZE + len]),
        })
    }
}
impl Decode for Array<'_> {
    fn decode(data: &[u8]) -> Result<Self, SerdeError> {
        let Array { data } = Array::decode_borrowed(data)?;
        Ok(Self {
            data: Cow::Owned(data.into_owned()),
        })
    }
}
impl Encode for Array<'_> {
    fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError> {
        let size = self.size();
        if data.len() < size {
            return Err(SerdeError::InvalidSize);
        }

        let len = u32::try_from(self.data.len()).map_err(|_| SerdeError::InvalidSize)?;
        let mut cursor = Cursor::new(data);
        cursor.write_u32::<NativeEndian>(len)?;
        cursor.write_all(&self.data)?;

        Ok(size)
    }
}

/// A dynamically sized UTF-8 string.
///
/// The encoded length word counts the terminating NUL byte, so `"abc"` is sent as
/// the length `4` followed by `abc\0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct String<'a> {
    /// The UTF-8 string data, without the terminator.
    pub data: Cow<'a, str>,
}
impl<'a> String<'a> {
    /// Creates a new `String` from the provided data.
    #[must_use]
    pub fn new(data: impl Into<Cow<'a, str>>) -> Self {
        Self { data: data.into() }
    }
}
impl From<std::string::String> for String<'_> {
    fn from(value: std::string::String) -> Self {
        Self { data: value.into() }
    }
}
impl<'a> From<&'a str> for String<'a> {
    fn from(value: &'a str) -> Self {
        Self { data: value.into() }
    }
}

impl MessageSize for String<'_> {
    fn size(&self) -> usize {
        u32::SIZE + self.data.len() + 1
    }
}
impl Decode for String<'_> {
    fn decode(data: &[u8]) -> Result<Self, SerdeError> {
        let len = read_length_prefix(data)?;
        if len == 0 {
            return Err(SerdeError::UnexpectedNull);
        }

        let Some((&0, text)) = data[u32::SIZE..u32::SIZE + len].split_last() else {
            return Err(SerdeError::MissingNulTerminator);
        };
        let text = std::str::from_utf8(text).map_err(|_| SerdeError::InvalidUtf8)?;

        Ok(Self {
            data: Cow::Owned(text.to_owned()),
        })
    }
}
impl Encode for String<'_> {
    fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError> {
        let size = self.size();
        if data.len() < size {
            return Err(SerdeError::InvalidSize);
        }

        let len = u32::try_from(self.data.len() + 1).map_err(|_| SerdeError::InvalidSize)?;
        let mut cursor = Cursor::new(data);
        cursor.write_u32::<NativeEndian>(len)?;
        cursor.write_all(self.data.as_bytes())?;
        cursor.write_u8(0)?;

        Ok(size)
    }
}

/// A nullable string is sent as a zero length word when absent.
impl MessageSize for Option<String<'_>> {
    fn size(&self) -> usize {
        self.as_ref().map_or(u32::SIZE, MessageSize::size)
    }
}
impl Decode for Option<String<'_>> {
    fn decode(data: &[u8]) -> Result<Self, SerdeError> {
        match u32::decode(data)? {
            0 => Ok(None),
            _ => String::decode(data).map(Some),
        }
    }
}
impl Encode for Option<String<'_>> {
    fn encode(&self, data: &mut [u8]) -> Result<usize, SerdeError> {
        match self {
            Some(string) => string.encode(data),
            None => 0u32.encode(data),
        }
    }
}

/// Errors that can occur during serialization/deserialization of Wayland wire protocol messages.
#[derive(Debug, Error)]
pub enum SerdeError {
    /// The buffer provided is not long enough to encode/decode the expected type.
    #[error("The data provided is not long enough to encode/decode the expected type.")]
    InvalidSize,
    /// An IO error occurred while encoding/decoding.
    #[error("IO error occurred while encoding/decoding: {0}")]
    IoError(#[from] std::io::Error),
    /// A string payload did not end with a NUL byte.
    #[error("String data must end with a NUL terminator")]
    MissingNulTerminator,
    /// A string payload was not valid UTF-8.
    #[error("String data is not valid UTF-8")]
    InvalidUtf8,
    /// A null string was found where the protocol does not allow one.
    #[error("Unexpected null string")]
    UnexpectedNull,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn encode_to_vec<T: Encode>(value: &T) -> Vec<u8> {
        let mut buffer = vec![0u8; value.size()];
        let written = value.encode(&mut buffer).unwrap();
        assert_eq!(written, buffer.len());
        buffer
    }

    #[test]
    fn header_packs_size_above_opcode() {
        let header = MessageHeader {
            object_id: 3,
            opcode: 1,
            size: 12,
        };
        let bytes = encode_to_vec(&header);
        assert_eq!(&bytes[4..8], &(12u32 << 16 | 1).to_ne_bytes());
        assert_eq!(MessageHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn string_length_counts_the_terminator() {
        let bytes = encode_to_vec(&String::from("wl_compositor"));
        assert_eq!(&bytes[..4], &14u32.to_ne_bytes());
        assert_eq!(bytes.last(), Some(&0));
        assert_eq!(bytes.len(), 4 + 14);
    }

    #[test]
    fn empty_string_is_not_null() {
        let bytes = encode_to_vec(&String::from(""));
        let mut expected = 1u32.to_ne_bytes().to_vec();
        expected.push(0);
        assert_eq!(bytes, expected);
        assert_eq!(String::decode(&bytes).unwrap().data, "");
    }

    #[test]
    fn null_string() {
        let bytes = encode_to_vec(&None::<String<'_>>);
        assert_eq!(bytes, vec![0; 4]);
        assert_eq!(Option::<String<'_>>::decode(&bytes).unwrap(), None);
        assert!(matches!(
            String::decode(&bytes),
            Err(SerdeError::UnexpectedNull)
        ));
    }

    #[test]
    fn string_without_terminator_is_rejected() {
        let mut bytes = encode_to_vec(&String::from("abc"));
        *bytes.last_mut().unwrap() = b'd';
        assert!(matches!(
            String::decode(&bytes),
            Err(SerdeError::MissingNulTerminator)
        ));
    }

    #[test]
    fn truncated_array_is_rejected() {
        let bytes = encode_to_vec(&Array::from(vec![1, 2, 3, 4, 5]));
        assert!(matches!(
            Array::decode(&bytes[..7]),
            Err(SerdeError::InvalidSize)
        ));
        assert_eq!(&*Array::decode_borrowed(&bytes).unwrap().data, &[1, 2, 3, 4, 5]);
    }

    proptest! {
        #[test]
        fn strings_survive_the_wire(text in "\\PC{0,64}") {
            let bytes = encode_to_vec(&String::from(text.as_str()));
            prop_assert_eq!(String::decode(&bytes).unwrap().data, text);
        }

        #[test]
        fn arrays_survive_the_wire(data in proptest::collection::vec(any::<u8>(), 0..64)) {
            let bytes = encode_to_vec(&Array::from(data.clone()));
            prop_assert_eq!(Array::decode(&bytes).unwrap().data.into_owned(), data);
        }
    }
}
