//! A handful of core protocol interfaces, written out the way generated code
//! would provide them.

use kenai_core::protocol::{Interface, MessageDesc};

macro_rules! msg {
    ($name:literal, $signature:literal, [$($ty:expr),* $(,)?]) => {
        MessageDesc {
            name: $name,
            signature: $signature,
            types: &[$($ty),*],
        }
    };
}

pub static COMPOSITOR_INTERFACE: Interface = Interface {
    name: "wl_compositor",
    version: 6,
    requests: &[
        msg!("create_surface", "n", [Some(&SURFACE_INTERFACE)]),
        msg!("create_region", "n", [Some(&REGION_INTERFACE)]),
    ],
    events: &[],
};

pub static SURFACE_INTERFACE: Interface = Interface {
    name: "wl_surface",
    version: 6,
    requests: &[
        msg!("destroy", "", []),
        msg!("attach", "?oii", [Some(&BUFFER_INTERFACE), None, None]),
        msg!("commit", "", []),
        msg!("offset", "5ii", [None, None]),
    ],
    events: &[
        msg!("enter", "o", [Some(&OUTPUT_INTERFACE)]),
        msg!("leave", "o", [Some(&OUTPUT_INTERFACE)]),
    ],
};

pub static REGION_INTERFACE: Interface = Interface {
    name: "wl_region",
    version: 1,
    requests: &[
        msg!("destroy", "", []),
        msg!("add", "iiii", [None, None, None, None]),
        msg!("subtract", "iiii", [None, None, None, None]),
    ],
    events: &[],
};

pub static BUFFER_INTERFACE: Interface = Interface {
    name: "wl_buffer",
    version: 1,
    requests: &[msg!("destroy", "", [])],
    events: &[msg!("release", "", [])],
};

pub static OUTPUT_INTERFACE: Interface = Interface {
    name: "wl_output",
    version: 4,
    requests: &[msg!("release", "3", [])],
    events: &[
        msg!("scale", "2i", [None]),
        msg!("name", "4s", [None]),
    ],
};

pub static SHM_INTERFACE: Interface = Interface {
    name: "wl_shm",
    version: 1,
    requests: &[msg!("create_pool", "nhi", [Some(&SHM_POOL_INTERFACE), None, None])],
    events: &[msg!("format", "u", [None])],
};

pub static SHM_POOL_INTERFACE: Interface = Interface {
    name: "wl_shm_pool",
    version: 1,
    requests: &[msg!("destroy", "", [])],
    events: &[],
};

pub static KEYBOARD_INTERFACE: Interface = Interface {
    name: "wl_keyboard",
    version: 1,
    requests: &[],
    events: &[msg!("keymap", "uhu", [None, None, None])],
};

pub static DATA_DEVICE_INTERFACE: Interface = Interface {
    name: "wl_data_device",
    version: 1,
    requests: &[],
    events: &[msg!("data_offer", "n", [Some(&DATA_OFFER_INTERFACE)])],
};

pub static DATA_OFFER_INTERFACE: Interface = Interface {
    name: "wl_data_offer",
    version: 1,
    requests: &[msg!("destroy", "", [])],
    events: &[msg!("offer", "s", [None])],
};
