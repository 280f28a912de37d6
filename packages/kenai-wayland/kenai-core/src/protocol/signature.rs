//! Parsing of message signature strings.
//!
//! A signature is an optional decimal `since` version followed by one tag per
//! argument. A `?` marks the following argument as nullable.
//!
//! | Tag | Argument |
//! |-----|----------|
//! | `u` | unsigned 32 bit integer |
//! | `i` | signed 32 bit integer |
//! | `f` | 24.8 fixed point number |
//! | `s` | string |
//! | `o` | object id |
//! | `n` | new object id |
//! | `a` | byte array |
//! | `h` | file descriptor |

use thiserror::Error;

/// The primitive kind of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// `u`
    Uint,
    /// `i`
    Int,
    /// `f`
    Fixed,
    /// `s`
    Str,
    /// `o`
    Object,
    /// `n`
    NewId,
    /// `a`
    Array,
    /// `h`
    Fd,
}

impl ArgKind {
    /// Maps a signature tag to its kind.
    #[must_use]
    pub const fn from_tag(tag: char) -> Option<Self> {
        Some(match tag {
            'u' => Self::Uint,
            'i' => Self::Int,
            'f' => Self::Fixed,
            's' => Self::Str,
            'o' => Self::Object,
            'n' => Self::NewId,
            'a' => Self::Array,
            'h' => Self::Fd,
            _ => return None,
        })
    }
}

/// One argument of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgDesc {
    /// The primitive kind.
    pub kind: ArgKind,
    /// Whether the argument may be null.
    pub nullable: bool,
}

/// A validated signature string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature<'a> {
    since: u32,
    tags: &'a str,
}

impl<'a> Signature<'a> {
    /// Parses and validates a signature string.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown tags, a trailing `?` or an unparsable version.
    pub fn parse(text: &'a str) -> Result<Self, SignatureError> {
        let digits = text.bytes().take_while(u8::is_ascii_digit).count();
        let since = match digits {
            0 => 1,
            _ => text[..digits]
                .parse()
                .map_err(|_| SignatureError::InvalidSince(text.to_owned()))?,
        };

        let tags = &text[digits..];
        let mut pending_nullable = false;
        for tag in tags.chars() {
            match tag {
                '?' if !pending_nullable => pending_nullable = true,
                tag if ArgKind::from_tag(tag).is_some() => pending_nullable = false,
                tag => {
                    return Err(SignatureError::UnknownTag {
                        tag,
                        signature: text.to_owned(),
                    });
                }
            }
        }
        if pending_nullable {
            return Err(SignatureError::DanglingNullable(text.to_owned()));
        }

        Ok(Self { since, tags })
    }

    /// The first interface version in which the message exists.
    #[must_use]
    pub const fn since(&self) -> u32 {
        self.since
    }

    /// Iterates over the arguments in order.
    pub fn args(&self) -> impl Iterator<Item = ArgDesc> + use<'a> {
        let tags = self.tags;
        let mut nullable = false;
        tags.chars().filter_map(move |tag| {
            if tag == '?' {
                nullable = true;
                return None;
            }
            let kind = ArgKind::from_tag(tag)?;
            Some(ArgDesc {
                kind,
                nullable: std::mem::take(&mut nullable),
            })
        })
    }

    /// The number of arguments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.chars().filter(|&tag| tag != '?').count()
    }

    /// Returns `true` if the message carries no arguments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of file descriptors the message carries out of band.
    #[must_use]
    pub fn fd_count(&self) -> usize {
        self.args().filter(|arg| arg.kind == ArgKind::Fd).count()
    }
}

/// Errors found while parsing a signature string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// The signature contains a character that is not an argument tag.
    #[error("Unknown argument tag {tag:?} in signature {signature:?}")]
    UnknownTag {
        /// The offending character.
        tag: char,
        /// The full signature.
        signature: String,
    },
    /// The signature ends with a `?` that applies to nothing.
    #[error("Signature {0:?} ends with a nullable marker")]
    DanglingNullable(String),
    /// The leading version number does not fit a `u32`.
    #[error("Signature {0:?} has an invalid since version")]
    InvalidSince(String),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn plain_signature() {
        let signature = Signature::parse("usun").unwrap();
        assert_eq!(signature.since(), 1);
        assert_eq!(signature.len(), 4);
        let kinds: Vec<_> = signature.args().map(|arg| arg.kind).collect();
        assert_eq!(
            kinds,
            vec![ArgKind::Uint, ArgKind::Str, ArgKind::Uint, ArgKind::NewId]
        );
    }

    #[test]
    fn since_and_nullable() {
        let signature = Signature::parse("3?oi?s").unwrap();
        assert_eq!(signature.since(), 3);
        let args: Vec<_> = signature.args().collect();
        assert_eq!(
            args,
            vec![
                ArgDesc {
                    kind: ArgKind::Object,
                    nullable: true
                },
                ArgDesc {
                    kind: ArgKind::Int,
                    nullable: false
                },
                ArgDesc {
                    kind: ArgKind::Str,
                    nullable: true
                },
            ]
        );
    }

    #[test]
    fn empty_signature() {
        let signature = Signature::parse("").unwrap();
        assert!(signature.is_empty());
        assert_eq!(signature.fd_count(), 0);
    }

    #[test]
    fn fds_are_counted() {
        assert_eq!(Signature::parse("hsuh").unwrap().fd_count(), 2);
    }

    #[test]
    fn malformed_signatures() {
        assert!(matches!(
            Signature::parse("ux"),
            Err(SignatureError::UnknownTag { tag: 'x', .. })
        ));
        assert!(matches!(
            Signature::parse("u?"),
            Err(SignatureError::DanglingNullable(_))
        ));
        assert!(matches!(
            Signature::parse("??o"),
            Err(SignatureError::UnknownTag { tag: '?', .. })
        ));
        assert!(matches!(
            Signature::parse("99999999999u"),
            Err(SignatureError::InvalidSince(_))
        ));
    }
}
