//! Conversion between dynamically typed argument lists and wire messages.
//!
//! The [`MessageDesc`] of a request or event decides how each [`Argument`] is
//! laid out. File descriptors never enter the byte stream; they travel in a
//! separate list that the transport sends as ancillary data.

use std::{collections::VecDeque, fmt, os::fd::OwnedFd};

use thiserror::Error;

use super::{
    HEADER_SIZE, MAX_MESSAGE_SIZE, MessageDecoder, MessageEncoder,
    fixed::Fixed,
    pad_to_32_bits,
    serde::{self, MessageHeader, MessageSize, ObjectId, SerdeError},
};
use crate::protocol::{ArgDesc, ArgKind, MessageDesc, SignatureError};

/// One decoded argument of a request or event.
#[derive(Debug)]
pub enum Argument {
    /// `u`
    Uint(u32),
    /// `i`
    Int(i32),
    /// `f`
    Fixed(Fixed),
    /// `s`, `None` only for nullable strings.
    Str(Option<String>),
    /// `o`, `None` encodes the null object.
    Object(Option<ObjectId>),
    /// `n`
    NewId(ObjectId),
    /// `a`
    Array(Vec<u8>),
    /// `h`
    Fd(OwnedFd),
}

impl Argument {
    /// The primitive kind of this argument.
    #[must_use]
    pub const fn kind(&self) -> ArgKind {
        match self {
            Self::Uint(_) => ArgKind::Uint,
            Self::Int(_) => ArgKind::Int,
            Self::Fixed(_) => ArgKind::Fixed,
            Self::Str(_) => ArgKind::Str,
            Self::Object(_) => ArgKind::Object,
            Self::NewId(_) => ArgKind::NewId,
            Self::Array(_) => ArgKind::Array,
            Self::Fd(_) => ArgKind::Fd,
        }
    }

    /// Whether this argument is a null string, null object or a new id of `0`.
    const fn is_null(&self) -> bool {
        matches!(
            self,
            Self::Str(None) | Self::Object(None | Some(0)) | Self::NewId(0)
        )
    }

    fn encoded_size(&self) -> usize {
        match self {
            Self::Str(text) => text.as_deref().map(serde::String::from).size(),
            Self::Array(data) => serde::Array::from(data.as_slice()).size(),
            Self::Fd(_) => 0,
            _ => 4,
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Fixed(value) => write!(f, "{value}"),
            Self::Str(Some(text)) => write!(f, "{text:?}"),
            Self::Str(None) | Self::Object(None) => f.write_str("nil"),
            Self::Object(Some(id)) => write!(f, "object {id}"),
            Self::NewId(id) => write!(f, "new id {id}"),
            Self::Array(data) => write!(f, "array[{}]", data.len()),
            Self::Fd(fd) => write!(f, "fd {fd:?}"),
        }
    }
}

/// Formats an argument list as `a, b, c` for logging.
pub struct DisplayArgs<'a>(pub &'a [Argument]);

impl fmt::Display for DisplayArgs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, arg) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        Ok(())
    }
}

/// Checks `args` against the signature of `desc` without encoding anything.
///
/// # Errors
///
/// Returns an error if the argument count, kinds or nullability do not match.
pub fn check_arguments(desc: &MessageDesc, args: &[Argument]) -> Result<(), MessageError> {
    let signature = desc.parse_signature()?;
    if signature.len() != args.len() {
        return Err(MessageError::ArgumentCount {
            message: desc.name,
            expected: signature.len(),
            found: args.len(),
        });
    }

    for (index, (expected, arg)) in signature.args().zip(args).enumerate() {
        if expected.kind != arg.kind() {
            return Err(MessageError::ArgumentMismatch {
                message: desc.name,
                index,
                expected: expected.kind,
                found: arg.kind(),
            });
        }
        if arg.is_null() && !(expected.nullable && expected.kind != ArgKind::NewId) {
            return Err(MessageError::NullArgument {
                message: desc.name,
                index,
            });
        }
    }
    Ok(())
}

/// Encodes a message for `object_id`, appending its bytes to `bytes` and its file
/// descriptors to `fds`.
///
/// Nothing is appended when an error is returned. Returns the encoded size.
///
/// # Errors
///
/// Returns an error if the arguments do not match the signature or the message
/// exceeds [`MAX_MESSAGE_SIZE`].
pub fn marshal(
    object_id: ObjectId,
    opcode: u16,
    desc: &MessageDesc,
    args: Vec<Argument>,
    bytes: &mut Vec<u8>,
    fds: &mut Vec<OwnedFd>,
) -> Result<usize, MessageError> {
    check_arguments(desc, &args)?;

    let size = HEADER_SIZE
        + args
            .iter()
            .map(|arg| pad_to_32_bits(arg.encoded_size()))
            .sum::<usize>();
    if size > MAX_MESSAGE_SIZE {
        return Err(MessageError::TooLarge(size));
    }

    let mut buffer = vec![0u8; size];
    let mut encoder = MessageEncoder::new(&mut buffer);
    encoder.write(&MessageHeader {
        object_id,
        opcode,
        size: size as u16,
    })?;

    let mut new_fds = Vec::new();
    for arg in args {
        match arg {
            Argument::Uint(value) => encoder.write(&value)?,
            Argument::Int(value) => encoder.write(&value)?,
            Argument::Fixed(value) => encoder.write(&value)?,
            Argument::Str(text) => encoder.write(&text.as_deref().map(serde::String::from))?,
            Argument::Object(id) => encoder.write(&id.unwrap_or(0))?,
            Argument::NewId(id) => encoder.write(&id)?,
            Argument::Array(data) => encoder.write(&serde::Array::from(data))?,
            Argument::Fd(fd) => new_fds.push(fd),
        }
    }

    bytes.extend_from_slice(&buffer);
    fds.append(&mut new_fds);
    Ok(size)
}

/// Decodes the body of a message (everything after the header) according to
/// `desc`, taking file descriptors from the front of `fds`.
///
/// # Errors
///
/// Returns an error if the body is truncated, carries trailing bytes, has a null
/// where none is allowed or needs more descriptors than were received.
pub fn demarshal(
    desc: &MessageDesc,
    body: &[u8],
    fds: &mut VecDeque<OwnedFd>,
) -> Result<Vec<Argument>, MessageError> {
    let signature = desc.parse_signature()?;
    let mut decoder = MessageDecoder::new(body);
    let mut args = Vec::with_capacity(signature.len());

    for (index, ArgDesc { kind, nullable }) in signature.args().enumerate() {
        let arg = match kind {
            ArgKind::Uint => Argument::Uint(decoder.read()?),
            ArgKind::Int => Argument::Int(decoder.read()?),
            ArgKind::Fixed => Argument::Fixed(decoder.read()?),
            ArgKind::Str => Argument::Str(
                decoder
                    .read::<Option<serde::String<'_>>>()?
                    .map(|text| text.data.into_owned()),
            ),
            ArgKind::Object => Argument::Object(Some(decoder.read()?).filter(|&id| id != 0)),
            ArgKind::NewId => Argument::NewId(decoder.read()?),
            ArgKind::Array => Argument::Array(decoder.read::<serde::Array<'_>>()?.data.into_owned()),
            ArgKind::Fd => Argument::Fd(fds.pop_front().ok_or(MessageError::MissingFd {
                message: desc.name,
            })?),
        };

        if arg.is_null() && !(nullable && kind != ArgKind::NewId) {
            return Err(MessageError::NullArgument {
                message: desc.name,
                index,
            });
        }
        args.push(arg);
    }

    if !decoder.is_empty() {
        return Err(MessageError::TrailingBytes {
            message: desc.name,
            count: decoder.remaining().len(),
        });
    }
    Ok(args)
}

/// Errors raised while turning arguments into messages or back.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The message signature is malformed.
    #[error(transparent)]
    Signature(#[from] SignatureError),
    /// The number of arguments does not match the signature.
    #[error("{message} expects {expected} arguments but {found} were given")]
    ArgumentCount {
        /// The message name.
        message: &'static str,
        /// Arguments in the signature.
        expected: usize,
        /// Arguments given.
        found: usize,
    },
    /// An argument has the wrong kind.
    #[error("Argument {index} of {message} must be {expected:?} but {found:?} was given")]
    ArgumentMismatch {
        /// The message name.
        message: &'static str,
        /// The position of the argument.
        index: usize,
        /// The kind from the signature.
        expected: ArgKind,
        /// The kind that was given.
        found: ArgKind,
    },
    /// A null was given or received for an argument that does not allow it.
    #[error("Argument {index} of {message} is not nullable")]
    NullArgument {
        /// The message name.
        message: &'static str,
        /// The position of the argument.
        index: usize,
    },
    /// The message needs a file descriptor that never arrived.
    #[error("{message} needs a file descriptor that was not received")]
    MissingFd {
        /// The message name.
        message: &'static str,
    },
    /// The encoded message would not fit the protocol limit.
    #[error("Message of {0} bytes exceeds the maximum of {MAX_MESSAGE_SIZE} bytes")]
    TooLarge(usize),
    /// The body is longer than its arguments.
    #[error("{message} carries {count} unexpected trailing bytes")]
    TrailingBytes {
        /// The message name.
        message: &'static str,
        /// The number of unread bytes.
        count: usize,
    },
    /// A primitive could not be encoded or decoded.
    #[error(transparent)]
    Serde(#[from] SerdeError),
}

#[cfg(test)]
mod tests {
    use std::os::{fd::AsRawFd, unix::net::UnixStream};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::core_interfaces::{DISPLAY_INTERFACE, REGISTRY_INTERFACE};

    static NULLABLE: MessageDesc = MessageDesc {
        name: "set_parent",
        signature: "?o",
        types: &[None],
    };

    static EVERYTHING: MessageDesc = MessageDesc {
        name: "everything",
        signature: "uifs?oah",
        types: &[None; 7],
    };

    fn encode(desc: &MessageDesc, args: Vec<Argument>) -> (Vec<u8>, Vec<OwnedFd>) {
        let mut bytes = Vec::new();
        let mut fds = Vec::new();
        marshal(9, 0, desc, args, &mut bytes, &mut fds).unwrap();
        (bytes, fds)
    }

    fn words(bytes: &[u8]) -> Vec<u32> {
        bytes
            .chunks_exact(4)
            .map(|word| u32::from_ne_bytes(word.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn bind_layout() {
        let (bytes, _) = encode(
            REGISTRY_INTERFACE.request(0).unwrap(),
            vec![
                Argument::Uint(3),
                Argument::Str(Some("wl_compositor".into())),
                Argument::Uint(3),
                Argument::NewId(4),
            ],
        );

        let words = words(&bytes);
        assert_eq!(words[0], 9);
        assert_eq!(words[1], 40 << 16);
        assert_eq!(words[2], 3);
        assert_eq!(words[3], 14);
        assert_eq!(&bytes[16..30], b"wl_compositor\0");
        assert_eq!(words[8], 3);
        assert_eq!(words[9], 4);
    }

    #[test]
    fn null_object_is_encoded_as_zero() {
        let (bytes, _) = encode(&NULLABLE, vec![Argument::Object(None)]);
        assert_eq!(words(&bytes)[2], 0);
    }

    #[test]
    fn null_rejected_where_not_allowed() {
        let mut bytes = Vec::new();
        let mut fds = Vec::new();
        let result = marshal(
            1,
            0,
            DISPLAY_INTERFACE.request(0).unwrap(),
            vec![Argument::NewId(0)],
            &mut bytes,
            &mut fds,
        );
        assert!(matches!(result, Err(MessageError::NullArgument { index: 0, .. })));
        assert!(bytes.is_empty());
    }

    #[test]
    fn wrong_kind_or_count() {
        let mut bytes = Vec::new();
        let mut fds = Vec::new();
        let desc = REGISTRY_INTERFACE.request(0).unwrap();

        let result = marshal(2, 0, desc, vec![Argument::Uint(1)], &mut bytes, &mut fds);
        assert!(matches!(result, Err(MessageError::ArgumentCount { expected: 4, found: 1, .. })));

        let result = marshal(
            2,
            0,
            desc,
            vec![
                Argument::Uint(3),
                Argument::Int(3),
                Argument::Uint(3),
                Argument::NewId(4),
            ],
            &mut bytes,
            &mut fds,
        );
        assert!(matches!(
            result,
            Err(MessageError::ArgumentMismatch {
                index: 1,
                expected: ArgKind::Str,
                found: ArgKind::Int,
                ..
            })
        ));
        assert!(bytes.is_empty());
    }

    #[test]
    fn every_kind_survives_the_wire() {
        let (sent, _) = UnixStream::pair().unwrap();
        let raw = sent.as_raw_fd();
        let (bytes, fds) = encode(
            &EVERYTHING,
            vec![
                Argument::Uint(u32::MAX),
                Argument::Int(-7),
                Argument::Fixed(Fixed::from(-3.25)),
                Argument::Str(Some("héllo".into())),
                Argument::Object(None),
                Argument::Array(vec![1, 2, 3, 4, 5]),
                Argument::Fd(OwnedFd::from(sent)),
            ],
        );
        assert_eq!(fds.len(), 1);

        let mut fds: VecDeque<_> = fds.into();
        let args = demarshal(&EVERYTHING, &bytes[HEADER_SIZE..], &mut fds).unwrap();
        assert!(fds.is_empty());

        assert!(matches!(args[0], Argument::Uint(u32::MAX)));
        assert!(matches!(args[1], Argument::Int(-7)));
        let Argument::Fixed(value) = args[2] else {
            panic!("expected a fixed argument");
        };
        assert!((value.to_f64() + 3.25).abs() < 1.0 / 256.0);
        assert!(matches!(&args[3], Argument::Str(Some(text)) if text == "héllo"));
        assert!(matches!(args[4], Argument::Object(None)));
        assert!(matches!(&args[5], Argument::Array(data) if data == &[1, 2, 3, 4, 5]));
        assert!(matches!(&args[6], Argument::Fd(fd) if fd.as_raw_fd() == raw));
    }

    #[test]
    fn truncated_and_padded_bodies() {
        let desc = REGISTRY_INTERFACE.event(0).unwrap();
        let (bytes, _) = encode(
            desc,
            vec![
                Argument::Uint(1),
                Argument::Str(Some("wl_seat".into())),
                Argument::Uint(7),
            ],
        );
        let body = &bytes[HEADER_SIZE..];

        assert!(demarshal(desc, &body[..body.len() - 4], &mut VecDeque::new()).is_err());

        let mut padded = body.to_vec();
        padded.extend_from_slice(&[0; 4]);
        assert!(matches!(
            demarshal(desc, &padded, &mut VecDeque::new()),
            Err(MessageError::TrailingBytes { count: 4, .. })
        ));
    }

    #[test]
    fn missing_fd_is_reported() {
        static TAKES_FD: MessageDesc = MessageDesc {
            name: "keymap",
            signature: "uhu",
            types: &[None; 3],
        };
        let body = [1u32, 64].map(u32::to_ne_bytes).concat();
        assert!(matches!(
            demarshal(&TAKES_FD, &body, &mut VecDeque::new()),
            Err(MessageError::MissingFd { message: "keymap" })
        ));
    }
}
