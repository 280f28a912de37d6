//! Static descriptions of protocol interfaces.
//!
//! An [`Interface`] lists the requests a client may send to an object and the
//! events the object may send back. Descriptors are `'static` tables shared by
//! every object of that interface; they are produced by protocol code generators
//! or written by hand as in [`core_interfaces`].

use std::fmt;

pub mod core_interfaces;
pub mod signature;

pub use signature::{ArgDesc, ArgKind, Signature, SignatureError};

/// The description of an interface.
pub struct Interface {
    /// The name of the interface, for example `wl_compositor`.
    pub name: &'static str,
    /// The highest version of the interface that these tables describe.
    pub version: u32,
    /// Request descriptions, indexed by opcode.
    pub requests: &'static [MessageDesc],
    /// Event descriptions, indexed by opcode.
    pub events: &'static [MessageDesc],
}

impl Interface {
    /// Returns the request with the given opcode.
    #[must_use]
    pub fn request(&self, opcode: u16) -> Option<&'static MessageDesc> {
        self.requests.get(usize::from(opcode))
    }

    /// Returns the event with the given opcode.
    #[must_use]
    pub fn event(&self, opcode: u16) -> Option<&'static MessageDesc> {
        self.events.get(usize::from(opcode))
    }
}

// Interfaces may reference each other in cycles, so only the header is printed.
impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || self.name == other.name
    }
}
impl Eq for Interface {}

/// The description of one request or event.
#[derive(Debug)]
pub struct MessageDesc {
    /// The name of the message, for example `bind`.
    pub name: &'static str,
    /// The argument signature, see [`Signature`].
    pub signature: &'static str,
    /// The interface expected for each argument, `None` for arguments that are not
    /// objects or whose interface is chosen at runtime.
    pub types: &'static [Option<&'static Interface>],
}

impl MessageDesc {
    /// Parses the signature of this message.
    ///
    /// # Errors
    ///
    /// Returns an error if the signature string is malformed.
    pub fn parse_signature(&self) -> Result<Signature<'static>, SignatureError> {
        Signature::parse(self.signature)
    }

    /// The interface referenced by the argument at `index`, if any.
    #[must_use]
    pub fn arg_interface(&self, index: usize) -> Option<&'static Interface> {
        self.types.get(index).copied().flatten()
    }
}
