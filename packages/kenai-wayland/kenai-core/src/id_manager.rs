//! Allocation and recycling of client object ids.
//!
//! The protocol splits the id space in two: the client allocates ids from
//! [`CLIENT_MIN_ID`] to [`CLIENT_MAX_ID`], the server from [`SERVER_MIN_ID`]
//! upwards. A client id may only be handed out again once the server has
//! confirmed with `wl_display.delete_id` that it forgot about it; reusing an id
//! earlier makes the server terminate the connection.
//!
//! # Example
//!
//! ```
//! use kenai_core::id_manager::IdManager;
//!
//! let mut ids = IdManager::new();
//! let first = ids.alloc_id().unwrap();
//! let second = ids.alloc_id().unwrap();
//! assert_ne!(first, second);
//! ids.recycle_id(first);
//! assert_eq!(ids.alloc_id().unwrap(), first); // the lowest free id is reused
//! ```

use std::collections::BTreeSet;

use thiserror::Error;

use crate::wire::ObjectId;

/// The first id a client may allocate. `1` always belongs to `wl_display`.
pub const CLIENT_MIN_ID: ObjectId = 0x0000_0001;
/// The last id a client may allocate.
pub const CLIENT_MAX_ID: ObjectId = 0xfeff_ffff;
/// The first id reserved for objects created by the server.
pub const SERVER_MIN_ID: ObjectId = 0xff00_0000;

/// Returns `true` if `id` lies in the range the client allocates from.
#[must_use]
pub const fn is_client_id(id: ObjectId) -> bool {
    id >= CLIENT_MIN_ID && id <= CLIENT_MAX_ID
}

/// Hands out the lowest free client id.
#[derive(Debug, Clone)]
pub struct IdManager {
    next: ObjectId,
    free: BTreeSet<ObjectId>,
}

impl IdManager {
    /// Creates a new `IdManager`. The first id allocated is [`CLIENT_MIN_ID`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: CLIENT_MIN_ID,
            free: BTreeSet::new(),
        }
    }

    /// Creates an `IdManager` whose first id is `first`, treating everything
    /// below it as permanently in use.
    #[must_use]
    pub const fn starting_at(first: ObjectId) -> Self {
        Self {
            next: first,
            free: BTreeSet::new(),
        }
    }

    /// Returns the id the next call to [`alloc_id`](Self::alloc_id) would return.
    ///
    /// # Errors
    ///
    /// This function will return an error if all client IDs have been exhausted.
    pub fn peek_next_id(&self) -> Result<ObjectId, IdManagerError> {
        match self.free.first() {
            Some(&id) => Ok(id),
            None if self.next <= CLIENT_MAX_ID => Ok(self.next),
            None => Err(IdManagerError::OutOfClientIds(self.next)),
        }
    }

    /// Allocates the lowest free id.
    ///
    /// # Errors
    ///
    /// This function will return an error if all client IDs have been exhausted.
    pub fn alloc_id(&mut self) -> Result<ObjectId, IdManagerError> {
        if let Some(id) = self.free.pop_first() {
            return Ok(id);
        }
        if self.next > CLIENT_MAX_ID {
            return Err(IdManagerError::OutOfClientIds(self.next));
        }

        let id = self.next;
        self.next += 1;
        Ok(id)
    }

    /// Returns an id the server has deleted to the pool of available ids.
    ///
    /// Ids outside the client range, or ids that were never handed out, are ignored.
    pub fn recycle_id(&mut self, id: ObjectId) {
        if !is_client_id(id) || id >= self.next {
            return;
        }
        self.free.insert(id);

        // Fold a free tail back into `next` so the set stays small.
        while let Some(&last) = self.free.last() {
            if last + 1 != self.next {
                break;
            }
            self.free.pop_last();
            self.next = last;
        }
    }

    /// The number of ids currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        (self.next - CLIENT_MIN_ID) as usize - self.free.len()
    }
}

impl Default for IdManager {
    fn default() -> Self {
        Self::new()
    }
}

/// An error that may occur when allocating a new client ID.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdManagerError {
    /// All client IDs have been exhausted
    #[error(
        "All client IDs have been exhausted (ID {0} is out of the range of {CLIENT_MIN_ID} - {CLIENT_MAX_ID})"
    )]
    OutOfClientIds(ObjectId),
}
