//! The interfaces every client needs before any global is bound.
//!
//! `wl_display`, `wl_registry` and `wl_callback` are frozen in the protocol, so
//! their tables are written out here instead of being generated.

use super::{Interface, MessageDesc};

/// Interface `wl_display`, always object `1`.
pub static DISPLAY_INTERFACE: Interface = Interface {
    name: "wl_display",
    version: 1,
    requests: &[
        MessageDesc {
            name: "sync",
            signature: "n",
            types: &[Some(&CALLBACK_INTERFACE)],
        },
        MessageDesc {
            name: "get_registry",
            signature: "n",
            types: &[Some(&REGISTRY_INTERFACE)],
        },
    ],
    events: &[
        MessageDesc {
            name: "error",
            signature: "ous",
            types: &[None, None, None],
        },
        MessageDesc {
            name: "delete_id",
            signature: "u",
            types: &[None],
        },
    ],
};

/// Interface `wl_registry`.
pub static REGISTRY_INTERFACE: Interface = Interface {
    name: "wl_registry",
    version: 1,
    requests: &[MessageDesc {
        name: "bind",
        signature: "usun",
        types: &[None, None, None, None],
    }],
    events: &[
        MessageDesc {
            name: "global",
            signature: "usu",
            types: &[None, None, None],
        },
        MessageDesc {
            name: "global_remove",
            signature: "u",
            types: &[None],
        },
    ],
};

/// Interface `wl_callback`.
pub static CALLBACK_INTERFACE: Interface = Interface {
    name: "wl_callback",
    version: 1,
    requests: &[],
    events: &[MessageDesc {
        name: "done",
        signature: "u",
        types: &[None],
    }],
};

/// Request opcodes of `wl_display`.
pub mod display_request {
    /// `sync(callback: new_id<wl_callback>)`
    pub const SYNC: u16 = 0;
    /// `get_registry(registry: new_id<wl_registry>)`
    pub const GET_REGISTRY: u16 = 1;
}

/// Event opcodes of `wl_display`.
pub mod display_event {
    /// `error(object_id: object, code: uint, message: string)`
    pub const ERROR: u16 = 0;
    /// `delete_id(id: uint)`
    pub const DELETE_ID: u16 = 1;
}

/// Global error codes carried by `wl_display.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayErrorCode {
    /// The server could not find the object.
    InvalidObject,
    /// The method does not exist on the interface or had malformed arguments.
    InvalidMethod,
    /// The server ran out of memory.
    NoMemory,
    /// An implementation error in the compositor.
    Implementation,
}

impl DisplayErrorCode {
    /// Maps the raw code to a known error, if it is one.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::InvalidObject,
            1 => Self::InvalidMethod,
            2 => Self::NoMemory,
            3 => Self::Implementation,
            _ => return None,
        })
    }
}
