//! Event queues.
//!
//! Every object dispatches its events through exactly one queue. Events are
//! sorted into queues while reading and only delivered when that queue is
//! dispatched, which lets a thread wait for the events of its own objects
//! without running anyone else's handlers.

use std::{
    collections::{HashMap, VecDeque},
    sync::Weak,
};

use kenai_core::{ObjectId, wire::message::Argument};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError, ConnectionInner};

/// Identifies an event queue within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(u32);

impl QueueId {
    /// The queue owned by the display. It lives as long as the connection.
    pub const DEFAULT: Self = Self(0);

    pub(crate) const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

/// An event waiting to be dispatched.
#[derive(Debug)]
pub(crate) struct QueuedEvent {
    pub(crate) sender: ObjectId,
    /// The generation of the sender when the event was read.
    pub(crate) generation: u64,
    pub(crate) opcode: u16,
    pub(crate) args: Vec<Argument>,
}

pub(crate) struct QueueMap {
    queues: HashMap<QueueId, VecDeque<QueuedEvent>>,
    next: u32,
}

impl QueueMap {
    pub(crate) fn new() -> Self {
        let mut queues = HashMap::new();
        queues.insert(QueueId::DEFAULT, VecDeque::new());
        Self { queues, next: 1 }
    }

    pub(crate) fn create(&mut self) -> QueueId {
        let id = QueueId(self.next);
        self.next += 1;
        self.queues.insert(id, VecDeque::new());
        id
    }

    pub(crate) fn remove(&mut self, id: QueueId) -> Option<VecDeque<QueuedEvent>> {
        if id == QueueId::DEFAULT {
            return None;
        }
        self.queues.remove(&id)
    }

    pub(crate) fn contains(&self, id: QueueId) -> bool {
        self.queues.contains_key(&id)
    }

    pub(crate) fn push(&mut self, id: QueueId, event: QueuedEvent) {
        match self.queues.get_mut(&id) {
            Some(queue) => queue.push_back(event),
            None => warn!("Dropping event {} for missing queue {id:?}", event.opcode),
        }
    }

    pub(crate) fn pop(&mut self, id: QueueId) -> Result<Option<QueuedEvent>, ConnectionError> {
        self.queues
            .get_mut(&id)
            .map(VecDeque::pop_front)
            .ok_or(ConnectionError::InvalidQueue)
    }

    pub(crate) fn is_empty(&self, id: QueueId) -> bool {
        self.len(id) == 0
    }

    pub(crate) fn len(&self, id: QueueId) -> usize {
        self.queues.get(&id).map_or(0, VecDeque::len)
    }

    /// Removes every queue, returning how many there were.
    pub(crate) fn drain(&mut self) -> usize {
        let count = self.queues.len();
        self.queues.clear();
        count
    }
}

/// A separate event queue, created with [`Display::create_queue`](crate::display::Display::create_queue).
///
/// Objects are moved onto it with [`Proxy::set_queue`](crate::proxy::Proxy::set_queue)
/// and its events are delivered by
/// [`Display::dispatch_queue`](crate::display::Display::dispatch_queue). Destroying
/// the queue drops its pending events and moves any object still using it back to
/// the default queue.
#[derive(Debug)]
pub struct EventQueue {
    connection: Weak<ConnectionInner>,
    id: Option<QueueId>,
}

impl EventQueue {
    pub(crate) fn new(connection: &Connection) -> Result<Self, ConnectionError> {
        let mut state = connection.lock();
        state.check()?;
        let id = state.queues.create();
        debug!("Created event queue {id:?}");
        Ok(Self {
            connection: connection.downgrade(),
            id: Some(id),
        })
    }

    /// The id of the queue, `None` once destroyed.
    #[must_use]
    pub const fn id(&self) -> Option<QueueId> {
        self.id
    }

    pub(crate) fn weak_connection(&self) -> &Weak<ConnectionInner> {
        &self.connection
    }

    /// Returns `true` while the queue and its connection exist.
    #[must_use]
    pub fn valid(&self) -> bool {
        let (Some(id), Some(inner)) = (self.id, self.connection.upgrade()) else {
            return false;
        };
        let connection = Connection(inner);
        connection.lock().queues.contains(id)
    }

    /// The number of events waiting to be dispatched.
    #[must_use]
    pub fn pending(&self) -> usize {
        let (Some(id), Some(inner)) = (self.id, self.connection.upgrade()) else {
            return 0;
        };
        let connection = Connection(inner);
        connection.lock().queues.len(id)
    }

    /// Destroys the queue. Calling it again does nothing.
    pub fn destroy(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let Some(inner) = self.connection.upgrade() else {
            return;
        };
        let connection = Connection(inner);

        let events = {
            let mut state = connection.lock();
            let moved = state.objects.reassign_queue(id, QueueId::DEFAULT);
            if moved > 0 {
                warn!("{moved} objects still used destroyed queue {id:?}, moved to the default queue");
            }
            state.queues.remove(id)
        };
        if let Some(events) = events.filter(|events| !events.is_empty()) {
            debug!("Dropping {} undispatched events of queue {id:?}", events.len());
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl PartialEq for EventQueue {
    fn eq(&self, other: &Self) -> bool {
        self.id.is_some() && self.id == other.id && Weak::ptr_eq(&self.connection, &other.connection)
    }
}
