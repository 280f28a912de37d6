//! The shared state behind a display connection.
//!
//! A [`Connection`] is a cheap handle to the socket, the object map, the event
//! queues and the outgoing buffer. All of it lives behind one mutex; event
//! handlers always run with that mutex released so they are free to send
//! requests, create objects or dispatch again.

use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    io::{self, ErrorKind},
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    sync::{Arc, Weak},
};

use kenai_core::{
    ObjectId,
    id_manager::IdManagerError,
    protocol::{
        Interface,
        core_interfaces::{DISPLAY_INTERFACE, DisplayErrorCode, display_event},
    },
    wire::{
        HEADER_SIZE,
        message::{Argument, DisplayArgs, MessageError, demarshal, marshal},
        serde::{Decode, MessageHeader},
    },
};
use nix::poll::PollFlags;
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::{
    event_queue::{QueueId, QueueMap, QueuedEvent},
    object_map::{DISPLAY_ID, ObjectMap},
    proxy::{Event, Handle, ObjectData},
};

mod read;
mod socket;

pub use read::ReadIntent;
pub(crate) use read::ReadGate;
use socket::{MAX_FDS_OUT, Socket};

/// Outgoing data is written to the socket once this much has been buffered.
const FLUSH_THRESHOLD: usize = 4096;
/// The size of one read from the socket.
const READ_CHUNK: usize = 4096;
/// The most bytes one round takes off the socket while holding the lock.
pub(crate) const READ_BUDGET: usize = 16 * READ_CHUNK;

/// A thread-safe handle to a connection with a Wayland compositor.
///
/// Cloning the handle does not open a new connection. Event handlers receive one
/// through [`Event::connection`] to look up the objects named in their arguments.
#[derive(Clone)]
pub struct Connection(pub(crate) Arc<ConnectionInner>);

pub(crate) struct ConnectionInner {
    socket: Socket,
    state: Mutex<ConnectionState>,
    read_done: Condvar,
    #[cfg(feature = "tokio")]
    round_done: tokio::sync::Notify,
}

impl Connection {
    pub(crate) fn new(stream: UnixStream) -> io::Result<Self> {
        let socket = Socket::new(stream)?;
        let objects = ObjectMap::with_display(&DISPLAY_INTERFACE);

        let state = ConnectionState {
            objects,
            queues: QueueMap::new(),
            out_bytes: Vec::new(),
            out_fds: Vec::new(),
            in_bytes: Vec::new(),
            in_fds: VecDeque::new(),
            read: ReadGate::default(),
            error: None,
            closed: false,
        };

        Ok(Self(Arc::new(ConnectionInner {
            socket,
            state: Mutex::new(state),
            read_done: Condvar::new(),
            #[cfg(feature = "tokio")]
            round_done: tokio::sync::Notify::new(),
        })))
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.0)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.0.state.lock()
    }

    pub(crate) fn socket(&self) -> &Socket {
        &self.0.socket
    }

    /// Wakes every reader waiting for the current read round to end.
    pub(crate) fn round_finished(&self) {
        self.0.read_done.notify_all();
        #[cfg(feature = "tokio")]
        self.0.round_done.notify_waiters();
    }

    /// Returns `true` if both handles refer to the same connection.
    #[must_use]
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn owns(&self, weak: &Weak<ConnectionInner>) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.0), weak.as_ptr())
    }

    /// Returns `true` once the connection has been closed locally.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// The fatal error that ended the connection, if any.
    ///
    /// Once an error is recorded every later operation on the connection fails with it.
    #[must_use]
    pub fn get_error(&self) -> Option<FatalError> {
        self.lock().error.clone()
    }

    /// Looks up the dispatch context registered for the object `id`.
    ///
    /// Returns `None` for the null object, for ids that are unknown or destroyed and
    /// when the registered context is not a `C`. This is how an event argument that
    /// names an object is turned back into the state its owner attached to it.
    #[must_use]
    pub fn object_context<C: Any + Send + Sync>(&self, id: Option<ObjectId>) -> Option<Arc<C>> {
        let context = {
            let state = self.lock();
            state.objects.get_live(id?)?.data.as_ref()?.context()
        };
        context.downcast::<C>().ok()
    }

    /// The interface and version of the live object `id`.
    #[must_use]
    pub fn object_info(&self, id: ObjectId) -> Option<(&'static Interface, u32)> {
        let state = self.lock();
        state
            .objects
            .get_live(id)
            .map(|entry| (entry.interface, entry.version))
    }

    /// Writes buffered requests to the socket.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::WouldBlock`] if the socket could not take
    /// everything; the rest stays buffered for the next flush.
    pub fn flush(&self) -> Result<usize, ConnectionError> {
        let mut state = self.lock();
        state.check()?;
        state.flush_to(&self.0.socket)
    }

    /// Flushes, waiting for the socket to become writable while it is full.
    pub(crate) fn flush_blocking(&self) -> Result<(), ConnectionError> {
        loop {
            match self.flush() {
                Ok(_) => return Ok(()),
                Err(ConnectionError::WouldBlock) => {
                    self.0.socket.wait(PollFlags::POLLOUT)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Encodes a request for the object behind `handle` into the outgoing buffer.
    ///
    /// With `destroy` set the object is released in the same critical section, so
    /// no other thread can observe it between the destructor request and the release.
    pub(crate) fn send_request(
        &self,
        handle: &Handle,
        opcode: u16,
        args: Vec<Argument>,
        destroy: bool,
    ) -> Result<(), ConnectionError> {
        let retired = {
            let mut state = self.lock();
            state.check()?;
            state.queue_request(handle, opcode, args)?;
            let retired = if destroy {
                state.objects.release(handle.id, handle.generation)
            } else {
                None
            };

            if state.out_bytes.len() >= FLUSH_THRESHOLD {
                match state.flush_to(&self.0.socket) {
                    Ok(_) | Err(ConnectionError::WouldBlock) => {}
                    Err(err) => debug!("Opportunistic flush failed: {err}"),
                }
            }
            retired
        };
        drop(retired);
        Ok(())
    }

    /// Invokes the handlers of every event buffered in `queue`.
    ///
    /// Returns the number of events dispatched.
    pub(crate) fn dispatch_queue_pending(&self, queue: QueueId) -> Result<usize, ConnectionError> {
        let mut dispatched = 0;
        loop {
            let next = self.lock().next_event(queue)?;
            let Some((data, interface, event)) = next else {
                break;
            };

            let QueuedEvent {
                sender,
                opcode,
                args,
                ..
            } = event;
            trace!(
                "{}@{}.{}({})",
                interface.name,
                sender,
                interface.event(opcode).map_or("?", |desc| desc.name),
                DisplayArgs(&args)
            );

            data.event(Event {
                connection: self,
                sender,
                opcode,
                args,
            });
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Reads from the socket and dispatches `queue`, blocking until the compositor
    /// sends something.
    ///
    /// When events are already buffered they are dispatched without reading. The
    /// read goes through the same intent protocol as every other reader, so this is
    /// safe to call while other threads wait on their own queues.
    pub(crate) fn dispatch_queue(&self, queue: QueueId) -> Result<usize, ConnectionError> {
        let intent = match self.prepare_read_queue(queue) {
            Ok(intent) => intent,
            Err(ConnectionError::EventsPending) => return self.dispatch_queue_pending(queue),
            Err(err) => return Err(err),
        };

        // A broken pipe is not final yet: the compositor may have sent an error
        // before hanging up, and only reading will tell.
        match self.flush_blocking() {
            Ok(()) => {}
            Err(ConnectionError::Io(err)) if err.kind() == ErrorKind::BrokenPipe => {}
            Err(err) => {
                intent.cancel_read();
                return Err(err);
            }
        }

        if let Err(err) = self.0.socket.wait(PollFlags::POLLIN) {
            intent.cancel_read();
            return Err(err.into());
        }
        intent.read_events()?;
        self.dispatch_queue_pending(queue)
    }

    /// Closes the connection. Every proxy and queue created from it becomes invalid.
    pub(crate) fn close(&self) {
        let (objects, queues) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            if let Err(err) = state.flush_to(&self.0.socket) {
                debug!("Could not flush before closing: {err}");
            }
            state.closed = true;
            (state.objects.drain_data(), state.queues.drain())
        };
        self.round_finished();

        if let Err(err) = self.0.socket.shutdown() {
            debug!("Socket shutdown failed: {err}");
        }
        debug!(
            "Connection closed, {} objects and {} queues released",
            objects.len(),
            queues
        );
        drop(objects);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection")
            .field(&Arc::as_ptr(&self.0))
            .finish()
    }
}

/// Everything guarded by the connection mutex.
pub(crate) struct ConnectionState {
    pub(crate) objects: ObjectMap,
    pub(crate) queues: QueueMap,
    out_bytes: Vec<u8>,
    out_fds: Vec<OwnedFd>,
    in_bytes: Vec<u8>,
    in_fds: VecDeque<OwnedFd>,
    pub(crate) read: ReadGate,
    error: Option<FatalError>,
    pub(crate) closed: bool,
}

impl ConnectionState {
    /// Fails if the connection can no longer be used.
    pub(crate) fn check(&self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Disconnected);
        }
        match &self.error {
            Some(err) => Err(ConnectionError::Fatal(err.clone())),
            None => Ok(()),
        }
    }

    /// Records a fatal error. A protocol error replaces a transport error, since
    /// the compositor usually hangs up right after sending one.
    fn fail(&mut self, err: FatalError) {
        let replace = match (&self.error, &err) {
            (None, _) => true,
            (Some(FatalError::Protocol(_)), _) => false,
            (Some(_), FatalError::Protocol(_)) => true,
            (Some(_), _) => false,
        };
        if replace {
            error!("Fatal connection error: {err}");
            self.error = Some(err);
        }
    }

    fn queue_request(
        &mut self,
        handle: &Handle,
        opcode: u16,
        args: Vec<Argument>,
    ) -> Result<(), ConnectionError> {
        let Some(entry) = self.objects.get_live(handle.id) else {
            return Err(ConnectionError::InvalidProxy);
        };
        if entry.generation != handle.generation {
            return Err(ConnectionError::InvalidProxy);
        }
        let version = entry.version;

        let interface = handle.interface;
        let Some(desc) = interface.request(opcode) else {
            return Err(ConnectionError::UnknownRequest {
                interface: interface.name,
                opcode,
            });
        };
        let since = desc.parse_signature().map_err(MessageError::from)?.since();
        if since > version {
            return Err(ConnectionError::VersionTooLow {
                interface: interface.name,
                request: desc.name,
                since,
                version,
            });
        }

        trace!(
            "-> {}@{}.{}({})",
            interface.name,
            handle.id,
            desc.name,
            DisplayArgs(&args)
        );

        let new_ids: Vec<ObjectId> = args
            .iter()
            .filter_map(|arg| match arg {
                Argument::NewId(id) => Some(*id),
                _ => None,
            })
            .collect();
        marshal(
            handle.id,
            opcode,
            desc,
            args,
            &mut self.out_bytes,
            &mut self.out_fds,
        )?;
        for id in new_ids {
            self.objects.mark_announced(id);
        }
        Ok(())
    }

    fn flush_to(&mut self, socket: &Socket) -> Result<usize, ConnectionError> {
        let mut written = 0;
        while !self.out_bytes.is_empty() {
            let fd_count = self.out_fds.len().min(MAX_FDS_OUT);
            let fds: Vec<RawFd> = self.out_fds[..fd_count]
                .iter()
                .map(AsRawFd::as_raw_fd)
                .collect();

            match socket.send_with_fds(&self.out_bytes, &fds) {
                Ok(sent) => {
                    self.out_bytes.drain(..sent);
                    // Sent descriptors are duplicated into the compositor, ours can close.
                    self.out_fds.drain(..fd_count);
                    written += sent;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return Err(ConnectionError::WouldBlock);
                }
                Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                    return Err(ConnectionError::Io(err));
                }
                Err(err) => {
                    let fatal = FatalError::Io(err.kind());
                    self.fail(fatal.clone());
                    return Err(ConnectionError::Fatal(fatal));
                }
            }
        }
        Ok(written)
    }

    /// Reads up to [`READ_BUDGET`] bytes into the incoming buffer and sorts
    /// complete messages into their queues. Whatever is left on the socket waits
    /// for the next round.
    pub(crate) fn read_from(&mut self, socket: &Socket) -> Result<usize, ConnectionError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut total = 0;
        let mut hung_up = false;

        while total < READ_BUDGET {
            match socket.recv_with_fds(&mut chunk, &mut self.in_fds) {
                Ok(0) => {
                    hung_up = true;
                    break;
                }
                Ok(read) => {
                    self.in_bytes.extend_from_slice(&chunk[..read]);
                    total += read;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.fail(FatalError::Io(err.kind()));
                    break;
                }
            }
        }

        self.process_incoming();
        if hung_up {
            self.fail(FatalError::Disconnected);
        }
        self.check()?;
        Ok(total)
    }

    fn process_incoming(&mut self) {
        let mut offset = 0;
        while self.in_bytes.len() - offset >= HEADER_SIZE {
            let pending = &self.in_bytes[offset..];
            let header = match MessageHeader::decode(pending) {
                Ok(header) => header,
                Err(err) => {
                    self.fail(FatalError::Malformed(err.to_string()));
                    break;
                }
            };

            let size = usize::from(header.size);
            if size < HEADER_SIZE || size % 4 != 0 {
                self.fail(FatalError::Malformed(format!(
                    "message for object {} has invalid size {size}",
                    header.object_id
                )));
                break;
            }
            if pending.len() < size {
                break;
            }

            let body = pending[HEADER_SIZE..size].to_vec();
            offset += size;
            if let Err(err) = self.handle_message(header, &body) {
                self.fail(err);
                break;
            }
        }
        self.in_bytes.drain(..offset);
    }

    fn handle_message(&mut self, header: MessageHeader, body: &[u8]) -> Result<(), FatalError> {
        let MessageHeader {
            object_id: id,
            opcode,
            ..
        } = header;
        if id == DISPLAY_ID {
            return self.handle_display_event(opcode, body);
        }

        let Some(entry) = self.objects.get(id) else {
            warn!("Discarding event {opcode} for unknown object {id}");
            return Ok(());
        };
        let interface = entry.interface;
        let Some(desc) = interface.event(opcode) else {
            return Err(FatalError::Malformed(format!(
                "{}@{id} has no event {opcode}",
                interface.name
            )));
        };

        if entry.is_zombie() {
            // The descriptors still arrived and must not be taken for the next message.
            let fd_count = desc.parse_signature().map_or(0, |sig| sig.fd_count());
            self.in_fds.drain(..fd_count.min(self.in_fds.len()));
            trace!(
                "Discarding {}@{id}.{} for a destroyed object",
                interface.name, desc.name
            );
            return Ok(());
        }

        let (generation, version, queue) = (entry.generation, entry.version, entry.queue);
        let args = demarshal(desc, body, &mut self.in_fds).map_err(|err| {
            FatalError::Malformed(format!("{}@{id}.{}: {err}", interface.name, desc.name))
        })?;

        for (index, arg) in args.iter().enumerate() {
            let Argument::NewId(new_id) = arg else {
                continue;
            };
            let Some(child) = desc.arg_interface(index) else {
                warn!(
                    "{}@{id}.{} creates object {new_id} of unknown interface",
                    interface.name, desc.name
                );
                continue;
            };
            self.objects
                .insert_server(*new_id, child, version, queue)
                .map_err(|err| FatalError::Malformed(err.to_string()))?;
        }

        let queue = if self.queues.contains(queue) {
            queue
        } else {
            QueueId::DEFAULT
        };
        self.queues.push(
            queue,
            QueuedEvent {
                sender: id,
                generation,
                opcode,
                args,
            },
        );
        Ok(())
    }

    fn handle_display_event(&mut self, opcode: u16, body: &[u8]) -> Result<(), FatalError> {
        let Some(desc) = DISPLAY_INTERFACE.event(opcode) else {
            return Err(FatalError::Malformed(format!("wl_display has no event {opcode}")));
        };
        let args = demarshal(desc, body, &mut self.in_fds)
            .map_err(|err| FatalError::Malformed(format!("wl_display.{}: {err}", desc.name)))?;
        trace!("wl_display@1.{}({})", desc.name, DisplayArgs(&args));

        match (opcode, args.as_slice()) {
            (
                display_event::ERROR,
                [
                    Argument::Object(object),
                    Argument::Uint(code),
                    Argument::Str(Some(message)),
                ],
            ) => {
                let object_id = object.unwrap_or_default();
                let interface = self
                    .objects
                    .get(object_id)
                    .map_or("unknown", |entry| entry.interface.name);
                self.fail(FatalError::Protocol(ProtocolError {
                    object_id,
                    interface,
                    code: *code,
                    message: message.clone(),
                }));
            }
            (display_event::DELETE_ID, [Argument::Uint(id)]) => self.objects.delete_id(*id),
            _ => {}
        }
        Ok(())
    }

    /// Pops the next event of `queue` whose object is still alive and listening.
    fn next_event(
        &mut self,
        queue: QueueId,
    ) -> Result<Option<(Arc<dyn ObjectData>, &'static Interface, QueuedEvent)>, ConnectionError> {
        self.check()?;
        while let Some(event) = self.queues.pop(queue)? {
            let Some(entry) = self.objects.get_live(event.sender) else {
                trace!("Dropping event {} for destroyed object {}", event.opcode, event.sender);
                continue;
            };
            if entry.generation != event.generation {
                trace!("Dropping event {} for a previous object {}", event.opcode, event.sender);
                continue;
            }
            let Some(data) = entry.data.clone() else {
                trace!("Object {} has no listener, dropping event {}", event.sender, event.opcode);
                continue;
            };
            return Ok(Some((data, entry.interface, event)));
        }
        Ok(None)
    }
}

/// The error sent by the compositor through `wl_display.error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{interface}@{object_id}: error {code}: {message}")]
pub struct ProtocolError {
    /// The object the error is about.
    pub object_id: ObjectId,
    /// The interface of that object, `"unknown"` if the client did not know it.
    pub interface: &'static str,
    /// The interface specific error code.
    pub code: u32,
    /// A human readable description.
    pub message: String,
}

impl ProtocolError {
    /// The global error, when the code comes from `wl_display` itself.
    #[must_use]
    pub fn display_error(&self) -> Option<DisplayErrorCode> {
        match self.interface {
            "wl_display" => DisplayErrorCode::from_code(self.code),
            _ => None,
        }
    }
}

/// An error after which the connection cannot be used anymore.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FatalError {
    /// The compositor reported a protocol violation.
    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),
    /// The compositor closed the connection.
    #[error("The compositor closed the connection")]
    Disconnected,
    /// Reading from or writing to the socket failed.
    #[error("Socket error: {0}")]
    Io(ErrorKind),
    /// The compositor sent something that could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Errors returned by operations on a connection and its proxies.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection was closed locally.
    #[error("The connection has been closed")]
    Disconnected,
    /// The connection ended with a fatal error.
    #[error(transparent)]
    Fatal(#[from] FatalError),
    /// The proxy does not refer to a live object.
    #[error("The proxy is not valid")]
    InvalidProxy,
    /// The event queue does not exist on this connection.
    #[error("The event queue is not valid for this connection")]
    InvalidQueue,
    /// Events are buffered in the queue and must be dispatched before reading.
    #[error("Events are pending in the queue, dispatch them before reading")]
    EventsPending,
    /// The socket cannot take more data right now.
    #[error("The socket would block")]
    WouldBlock,
    /// The interface has no request with this opcode.
    #[error("{interface} has no request with opcode {opcode}")]
    UnknownRequest {
        /// The interface name.
        interface: &'static str,
        /// The requested opcode.
        opcode: u16,
    },
    /// The request is newer than the version the object was created with.
    #[error("{interface}.{request} needs version {since} but the object has version {version}")]
    VersionTooLow {
        /// The interface name.
        interface: &'static str,
        /// The request name.
        request: &'static str,
        /// The version the request was introduced in.
        since: u32,
        /// The version of the object.
        version: u32,
    },
    /// The listener table was built for another interface or has the wrong length.
    #[error("Listener for {listener} cannot be attached to {interface}")]
    ListenerMismatch {
        /// The interface the listener was written for.
        listener: &'static str,
        /// The interface of the object.
        interface: &'static str,
    },
    /// The object implements another interface than the one asked for.
    #[error("Expected an object of {expected}, found {found}")]
    WrongInterface {
        /// The interface asked for.
        expected: &'static str,
        /// The interface of the object.
        found: String,
    },
    /// A server created object already has an owning proxy.
    #[error("Object {0} is already owned by another proxy")]
    AlreadyOwned(ObjectId),
    /// The arguments did not match the request.
    #[error(transparent)]
    Marshal(#[from] MessageError),
    /// No client object id is left.
    #[error(transparent)]
    IdExhausted(#[from] IdManagerError),
    /// An I/O operation on the socket failed.
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
}
