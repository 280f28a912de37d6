//! The client's view of which object ids exist and what they are.
//!
//! Destroying an object the compositor knows about does not free its id: the
//! entry turns into a zombie that swallows late events until the compositor
//! confirms with `wl_display.delete_id`. Only then is the id handed out again.

use std::{collections::BTreeMap, sync::Arc};

use kenai_core::{
    ObjectId,
    id_manager::{IdManager, IdManagerError, is_client_id},
    protocol::Interface,
};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{event_queue::QueueId, proxy::ObjectData};

/// The id of `wl_display`, present for the whole life of a connection.
pub(crate) const DISPLAY_ID: ObjectId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectState {
    Live,
    /// Destroyed locally, waiting for `delete_id`.
    Zombie,
}

pub(crate) struct ObjectEntry {
    pub(crate) interface: &'static Interface,
    pub(crate) version: u32,
    /// Distinguishes successive objects that reuse the same id.
    pub(crate) generation: u64,
    pub(crate) queue: QueueId,
    pub(crate) data: Option<Arc<dyn ObjectData>>,
    /// Whether a proxy with ownership exists.
    pub(crate) owned: bool,
    state: ObjectState,
    /// Whether the compositor has been told about the object.
    announced: bool,
    /// Whether `delete_id` arrived while the object was still alive.
    id_deleted: bool,
}

impl ObjectEntry {
    pub(crate) fn is_zombie(&self) -> bool {
        self.state == ObjectState::Zombie
    }
}

pub(crate) struct ObjectMap {
    objects: BTreeMap<ObjectId, ObjectEntry>,
    ids: IdManager,
    next_generation: u64,
}

impl ObjectMap {
    pub(crate) fn with_display(interface: &'static Interface) -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            DISPLAY_ID,
            ObjectEntry {
                interface,
                version: interface.version,
                generation: 0,
                queue: QueueId::DEFAULT,
                data: None,
                owned: true,
                state: ObjectState::Live,
                announced: true,
                id_deleted: false,
            },
        );

        Self {
            objects,
            ids: IdManager::starting_at(DISPLAY_ID + 1),
            next_generation: 1,
        }
    }

    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Allocates an id for an object the client is about to create.
    ///
    /// The object counts as unannounced until the request carrying its id is queued.
    pub(crate) fn insert_client(
        &mut self,
        interface: &'static Interface,
        version: u32,
        queue: QueueId,
    ) -> Result<(ObjectId, u64), IdManagerError> {
        let id = self.ids.alloc_id()?;
        let generation = self.next_generation();
        self.objects.insert(
            id,
            ObjectEntry {
                interface,
                version,
                generation,
                queue,
                data: None,
                owned: true,
                state: ObjectState::Live,
                announced: false,
                id_deleted: false,
            },
        );
        Ok((id, generation))
    }

    /// Records an object the compositor created through a `new_id` event argument.
    pub(crate) fn insert_server(
        &mut self,
        id: ObjectId,
        interface: &'static Interface,
        version: u32,
        queue: QueueId,
    ) -> Result<u64, ObjectMapError> {
        if is_client_id(id) {
            return Err(ObjectMapError::ClientRange(id));
        }
        if self.objects.get(&id).is_some_and(|entry| !entry.is_zombie()) {
            return Err(ObjectMapError::InUse(id));
        }

        let generation = self.next_generation();
        trace!("Compositor created {}@{id}", interface.name);
        self.objects.insert(
            id,
            ObjectEntry {
                interface,
                version,
                generation,
                queue,
                data: None,
                owned: false,
                state: ObjectState::Live,
                announced: true,
                id_deleted: false,
            },
        );
        Ok(generation)
    }

    /// Any entry, zombies included.
    pub(crate) fn get(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(&id)
    }

    pub(crate) fn get_live(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(&id).filter(|entry| !entry.is_zombie())
    }

    /// The live entry `id` if it still belongs to `generation`.
    pub(crate) fn live_mut(&mut self, id: ObjectId, generation: u64) -> Option<&mut ObjectEntry> {
        self.objects
            .get_mut(&id)
            .filter(|entry| !entry.is_zombie() && entry.generation == generation)
    }

    pub(crate) fn mark_announced(&mut self, id: ObjectId) {
        if let Some(entry) = self.objects.get_mut(&id) {
            entry.announced = true;
        }
    }

    /// Releases the object after its proxy was destroyed.
    ///
    /// Returns the dispatch data so the caller can drop it outside the lock.
    pub(crate) fn release(&mut self, id: ObjectId, generation: u64) -> Option<Arc<dyn ObjectData>> {
        if id == DISPLAY_ID {
            return None;
        }
        let entry = self.live_mut(id, generation)?;
        let data = entry.data.take();

        if is_client_id(id) && entry.announced && !entry.id_deleted {
            entry.state = ObjectState::Zombie;
            trace!("{}@{id} is now a zombie", entry.interface.name);
        } else {
            self.objects.remove(&id);
            self.ids.recycle_id(id);
        }
        data
    }

    /// Handles `wl_display.delete_id`.
    pub(crate) fn delete_id(&mut self, id: ObjectId) {
        let Some(entry) = self.objects.get_mut(&id) else {
            warn!("delete_id for unknown object {id}");
            return;
        };
        if entry.is_zombie() {
            self.objects.remove(&id);
            self.ids.recycle_id(id);
        } else {
            // The proxy is still around; its id is freed when it is destroyed.
            entry.id_deleted = true;
        }
    }

    /// Moves every live object dispatched on `from` to `to`.
    pub(crate) fn reassign_queue(&mut self, from: QueueId, to: QueueId) -> usize {
        let mut moved = 0;
        for entry in self.objects.values_mut() {
            if entry.queue == from && !entry.is_zombie() {
                entry.queue = to;
                moved += 1;
            }
        }
        moved
    }

    /// Forgets every object, returning their dispatch data.
    pub(crate) fn drain_data(&mut self) -> Vec<Arc<dyn ObjectData>> {
        let data = self
            .objects
            .values_mut()
            .filter_map(|entry| entry.data.take())
            .collect();
        self.objects.clear();
        data
    }

    #[cfg(test)]
    fn zombies(&self) -> usize {
        self.objects.values().filter(|entry| entry.is_zombie()).count()
    }
}

/// Inconsistencies in the object ids sent by the compositor.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ObjectMapError {
    #[error("Object id {0} is already in use")]
    InUse(ObjectId),
    #[error("The compositor created object {0} in the client id range")]
    ClientRange(ObjectId),
}
