//! A Wayland client: proxies for remote objects, event queues and the display
//! connection that carries them.
//!
//! ```no_run
//! use kenai_client::display::Display;
//!
//! let display = Display::connect()?;
//! let registry = display.get_registry()?;
//! registry.set_global_handler(|global| {
//!     println!("{} {} v{}", global.name, global.interface, global.version);
//! });
//! display.roundtrip()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod callback;
pub mod connection;
pub mod display;
pub mod event_queue;
mod object_map;
pub mod proxy;
#[cfg(feature = "tokio")]
pub mod readiness;
pub mod registry;

pub use kenai_core::{
    ObjectId, protocol,
    wire::{fixed::Fixed, message::Argument},
};
