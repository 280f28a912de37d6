//! Client-side handles to remote objects.
//!
//! A [`Proxy`] names one object on one connection. Owning proxies
//! ([`Proxy<Owned>`]) release the object when they are destroyed or dropped;
//! borrowing proxies ([`Proxy<Borrowed>`]) only observe it. Proxies are never
//! cloned: moving one moves the responsibility for its destruction with it.

use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    mem,
    sync::{Arc, Weak},
};

use kenai_core::{ObjectId, protocol::Interface, wire::message::Argument};
use tracing::warn;

use crate::{
    connection::{Connection, ConnectionError, ConnectionInner},
    event_queue::{EventQueue, QueueId},
};

mod private {
    pub trait Sealed {}
}

/// Whether a proxy is responsible for releasing its object.
pub trait Ownership: private::Sealed + 'static {
    /// `true` for [`Owned`].
    const OWNING: bool;
}

/// Marker for proxies that release their object.
#[derive(Debug)]
pub enum Owned {}

/// Marker for proxies that only observe an object owned elsewhere.
#[derive(Debug)]
pub enum Borrowed {}

impl private::Sealed for Owned {}
impl private::Sealed for Borrowed {}

impl Ownership for Owned {
    const OWNING: bool = true;
}
impl Ownership for Borrowed {
    const OWNING: bool = false;
}

/// Everything needed to reach an object without holding the connection alive.
#[derive(Clone)]
pub(crate) struct Handle {
    pub(crate) connection: Weak<ConnectionInner>,
    pub(crate) id: ObjectId,
    pub(crate) generation: u64,
    pub(crate) interface: &'static Interface,
    pub(crate) version: u32,
}

/// A handler for one event, called with the context given to
/// [`Proxy::add_listener`].
pub type Handler<C> = fn(&C, Event<'_>);

/// The handlers of an interface, one per event, indexed by opcode.
///
/// Listener tables are `static`:
///
/// ```ignore
/// static LISTENER: Listener<Seat> = Listener {
///     interface: &SEAT_INTERFACE,
///     handlers: &[Seat::capabilities, Seat::name],
/// };
/// ```
pub struct Listener<C: 'static> {
    /// The interface the table was written for.
    pub interface: &'static Interface,
    /// One handler per event of `interface`.
    pub handlers: &'static [Handler<C>],
}

impl<C: 'static> fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("interface", &self.interface.name)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// An event delivered to a handler.
#[derive(Debug)]
pub struct Event<'a> {
    /// The connection the event arrived on, used to resolve object arguments.
    pub connection: &'a Connection,
    /// The object that sent the event.
    pub sender: ObjectId,
    /// The event opcode.
    pub opcode: u16,
    /// The decoded arguments, in signature order.
    pub args: Vec<Argument>,
}

/// What the connection keeps per object to dispatch its events.
pub(crate) trait ObjectData: Send + Sync {
    fn event(&self, event: Event<'_>);
    fn context(&self) -> Arc<dyn Any + Send + Sync>;
}

struct Registered<C: 'static> {
    listener: &'static Listener<C>,
    context: Arc<C>,
}

impl<C: Send + Sync + 'static> ObjectData for Registered<C> {
    fn event(&self, event: Event<'_>) {
        match self.listener.handlers.get(usize::from(event.opcode)) {
            Some(handler) => handler(self.context.as_ref(), event),
            None => warn!(
                "No handler for event {} of {}",
                event.opcode, self.listener.interface.name
            ),
        }
    }

    fn context(&self) -> Arc<dyn Any + Send + Sync> {
        self.context.clone()
    }
}

/// A typed wrapper around an owning proxy, such as [`Registry`](crate::registry::Registry).
///
/// `From<Proxy>` is where a wrapper installs its listener, so that it is in place
/// before the request creating the object is sent.
pub trait Object: From<Proxy> {
    /// The interface of the wrapped object.
    const INTERFACE: &'static Interface;

    /// The underlying proxy.
    fn proxy(&self) -> &Proxy;
}

/// A handle to a remote object.
pub struct Proxy<O: Ownership = Owned> {
    handle: Option<Handle>,
    _ownership: PhantomData<O>,
}

impl<O: Ownership> Proxy<O> {
    fn from_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
            _ownership: PhantomData,
        }
    }

    pub(crate) fn handle(&self) -> Result<(Connection, &Handle), ConnectionError> {
        let handle = self.handle.as_ref().ok_or(ConnectionError::InvalidProxy)?;
        let inner = handle
            .connection
            .upgrade()
            .ok_or(ConnectionError::Disconnected)?;
        Ok((Connection(inner), handle))
    }

    /// Returns `true` while the proxy refers to a live object on an open connection.
    #[must_use]
    pub fn valid(&self) -> bool {
        let Ok((connection, handle)) = self.handle() else {
            return false;
        };
        let state = connection.lock();
        !state.closed
            && state
                .objects
                .get_live(handle.id)
                .is_some_and(|entry| entry.generation == handle.generation)
    }

    fn live_handle(&self) -> Option<&Handle> {
        self.handle.as_ref().filter(|_| self.valid())
    }

    /// The object id, or `0` when the proxy is not valid.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.live_handle().map_or(0, |handle| handle.id)
    }

    /// The interface name, such as `"wl_compositor"`.
    #[must_use]
    pub fn class(&self) -> Option<&'static str> {
        self.interface().map(|interface| interface.name)
    }

    /// The interface descriptor of the object.
    #[must_use]
    pub fn interface(&self) -> Option<&'static Interface> {
        self.live_handle().map(|handle| handle.interface)
    }

    /// The version the object was created or bound with.
    #[must_use]
    pub fn version(&self) -> Option<u32> {
        self.live_handle().map(|handle| handle.version)
    }

    /// The connection the object lives on.
    #[must_use]
    pub fn connection(&self) -> Option<Connection> {
        self.handle().ok().map(|(connection, _)| connection)
    }

    /// Sends the request `opcode` with `args`.
    ///
    /// The request is buffered; it reaches the compositor on the next flush.
    ///
    /// # Errors
    ///
    /// Fails without touching the connection if the proxy is not valid, the
    /// opcode is unknown, the request is newer than the object or the
    /// arguments do not match its signature.
    pub fn marshal(&self, opcode: u16, args: Vec<Argument>) -> Result<(), ConnectionError> {
        let (connection, handle) = self.handle()?;
        connection.send_request(handle, opcode, args, false)
    }

    /// Attaches the listener and the context its handlers receive.
    ///
    /// Returns `false` without changing anything if a listener is already attached.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::ListenerMismatch`] if the table was written for
    /// another interface or has not exactly one handler per event.
    pub fn add_listener<C: Send + Sync + 'static>(
        &self,
        listener: &'static Listener<C>,
        context: Arc<C>,
    ) -> Result<bool, ConnectionError> {
        let (connection, handle) = self.handle()?;
        let interface = handle.interface;
        if listener.interface != interface || listener.handlers.len() != interface.events.len() {
            return Err(ConnectionError::ListenerMismatch {
                listener: listener.interface.name,
                interface: interface.name,
            });
        }

        let data: Arc<dyn ObjectData> = Arc::new(Registered { listener, context });
        let mut state = connection.lock();
        state.check()?;
        let entry = state
            .objects
            .live_mut(handle.id, handle.generation)
            .ok_or(ConnectionError::InvalidProxy)?;
        if entry.data.is_some() {
            drop(state);
            warn!("{}@{} already has a listener", interface.name, handle.id);
            return Ok(false);
        }
        entry.data = Some(data);
        Ok(true)
    }

    /// The context attached with [`Self::add_listener`], if it is a `C`.
    #[must_use]
    pub fn context<C: Any + Send + Sync>(&self) -> Option<Arc<C>> {
        let (connection, handle) = self.handle().ok()?;
        let context = {
            let state = connection.lock();
            let entry = state.objects.get_live(handle.id)?;
            if entry.generation != handle.generation {
                return None;
            }
            entry.data.as_ref()?.context()
        };
        context.downcast().ok()
    }

    /// Routes the future events of the object to `queue`.
    ///
    /// # Errors
    ///
    /// Fails if the proxy is not valid or the queue belongs to another
    /// connection or was destroyed.
    pub fn set_queue(&self, queue: &EventQueue) -> Result<(), ConnectionError> {
        let id = queue.id().ok_or(ConnectionError::InvalidQueue)?;
        let (connection, _) = self.handle()?;
        if !connection.owns(queue.weak_connection()) {
            return Err(ConnectionError::InvalidQueue);
        }
        self.set_queue_id(id)
    }

    /// Routes the future events of the object back to the default queue.
    ///
    /// # Errors
    ///
    /// Fails if the proxy is not valid.
    pub fn reset_queue(&self) -> Result<(), ConnectionError> {
        self.set_queue_id(QueueId::DEFAULT)
    }

    pub(crate) fn set_queue_id(&self, queue: QueueId) -> Result<(), ConnectionError> {
        let (connection, handle) = self.handle()?;
        let mut state = connection.lock();
        state.check()?;
        if !state.queues.contains(queue) {
            return Err(ConnectionError::InvalidQueue);
        }
        let entry = state
            .objects
            .live_mut(handle.id, handle.generation)
            .ok_or(ConnectionError::InvalidProxy)?;
        entry.queue = queue;
        Ok(())
    }

    /// Releases the object without sending anything.
    ///
    /// An owning proxy frees the object locally; the compositor is expected to
    /// have destroyed it already or to destroy it on its own. A borrowing proxy
    /// only forgets the object. Calling this again does nothing.
    pub fn destroy(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !O::OWNING {
            return;
        }
        let Some(inner) = handle.connection.upgrade() else {
            return;
        };

        let retired = Connection(inner)
            .lock()
            .objects
            .release(handle.id, handle.generation);
        drop(retired);
    }

    /// Moves the handle out, leaving an invalid proxy behind.
    #[must_use]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }
}

impl Proxy<Owned> {
    /// Allocates a new object on the connection of `factory`, with the factory's
    /// version and queue.
    ///
    /// The compositor learns about the object through the request that carries its
    /// id as a `new_id` argument.
    ///
    /// # Errors
    ///
    /// Fails if the factory is not valid or no id is left.
    pub fn create<F: Ownership>(
        factory: &Proxy<F>,
        interface: &'static Interface,
    ) -> Result<Self, ConnectionError> {
        let version = factory.version().ok_or(ConnectionError::InvalidProxy)?;
        Self::create_versioned(factory, interface, version)
    }

    /// Like [`Self::create`], with an explicit version. Used when binding globals.
    ///
    /// # Errors
    ///
    /// Fails if the factory is not valid or no id is left.
    pub fn create_versioned<F: Ownership>(
        factory: &Proxy<F>,
        interface: &'static Interface,
        version: u32,
    ) -> Result<Self, ConnectionError> {
        let (connection, factory) = factory.handle()?;
        let mut state = connection.lock();
        state.check()?;
        let queue = state
            .objects
            .live_mut(factory.id, factory.generation)
            .ok_or(ConnectionError::InvalidProxy)?
            .queue;
        let (id, generation) = state.objects.insert_client(interface, version, queue)?;

        Ok(Self::from_handle(Handle {
            connection: connection.downgrade(),
            id,
            generation,
            interface,
            version,
        }))
    }

    /// Takes ownership of an object the compositor created through a `new_id`
    /// event argument.
    ///
    /// # Errors
    ///
    /// Fails if `id` is not a live object of `interface` or already has an owner.
    pub fn from_new_id(
        connection: &Connection,
        id: ObjectId,
        interface: &'static Interface,
    ) -> Result<Self, ConnectionError> {
        let mut state = connection.lock();
        state.check()?;
        let Some(entry) = state.objects.get_live(id) else {
            return Err(ConnectionError::InvalidProxy);
        };
        if entry.interface != interface {
            return Err(ConnectionError::WrongInterface {
                expected: interface.name,
                found: entry.interface.name.to_owned(),
            });
        }
        let generation = entry.generation;
        let entry = state
            .objects
            .live_mut(id, generation)
            .ok_or(ConnectionError::InvalidProxy)?;
        if mem::replace(&mut entry.owned, true) {
            return Err(ConnectionError::AlreadyOwned(id));
        }

        Ok(Self::from_handle(Handle {
            connection: connection.downgrade(),
            id,
            generation,
            interface,
            version: entry.version,
        }))
    }

    /// Sends the destructor request `opcode`, then releases the object.
    ///
    /// The object is released even if sending fails. Calling this on a destroyed
    /// proxy does nothing.
    ///
    /// # Errors
    ///
    /// Returns the error of sending the request.
    pub fn destroy_with_request(
        &mut self,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<(), ConnectionError> {
        let sent = match self.handle() {
            Ok((connection, handle)) => Some(connection.send_request(handle, opcode, args, true)),
            Err(_) => None,
        };
        match sent {
            Some(Ok(())) => {
                self.handle = None;
                Ok(())
            }
            Some(Err(err)) => {
                self.destroy();
                Err(err)
            }
            None => {
                self.destroy();
                Ok(())
            }
        }
    }
}

impl Proxy<Borrowed> {
    /// Wraps the object `id` without taking ownership.
    ///
    /// A null or unknown id gives an invalid proxy.
    #[must_use]
    pub fn from_id(connection: &Connection, id: Option<ObjectId>) -> Self {
        let Some(id) = id else {
            return Self::default();
        };
        let handle = {
            let state = connection.lock();
            state.objects.get_live(id).map(|entry| Handle {
                connection: connection.downgrade(),
                id,
                generation: entry.generation,
                interface: entry.interface,
                version: entry.version,
            })
        };
        handle.map_or_else(Self::default, Self::from_handle)
    }
}

impl<O: Ownership> Default for Proxy<O> {
    fn default() -> Self {
        Self {
            handle: None,
            _ownership: PhantomData,
        }
    }
}

impl<O: Ownership> Drop for Proxy<O> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<O: Ownership, P: Ownership> PartialEq<Proxy<P>> for Proxy<O> {
    fn eq(&self, other: &Proxy<P>) -> bool {
        match (&self.handle, &other.handle) {
            (Some(a), Some(b)) => {
                Weak::ptr_eq(&a.connection, &b.connection)
                    && a.id == b.id
                    && a.generation == b.generation
            }
            _ => false,
        }
    }
}

impl<O: Ownership> fmt::Debug for Proxy<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handle {
            Some(handle) => write!(
                f,
                "Proxy({}@{}, owning: {})",
                handle.interface.name,
                handle.id,
                O::OWNING
            ),
            None => f.write_str("Proxy(<invalid>)"),
        }
    }
}
