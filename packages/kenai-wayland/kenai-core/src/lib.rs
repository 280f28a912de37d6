//! Core building blocks for Kenai Wayland clients.
//!
//! This crate holds everything that can be expressed without touching a socket:
//! the wire codec, the static interface descriptors that drive it, and the
//! allocator for client object ids. The `kenai-client` crate layers the
//! connection, proxies and event queues on top of it.

pub mod id_manager;
pub mod protocol;
pub mod wire;

pub use wire::ObjectId;
